//! `twinsync odte`: offline ODTE estimation for a list of delays.

use twinsync_core::{ConstantAvailability, OdteEstimator, OdteParams};

fn parse_samples(s: &str) -> Result<Vec<f64>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<f64>()
                .map_err(|_| format!("invalid sample '{t}'"))
        })
        .collect()
}

pub fn run(samples: &str, desired: f64, rate: f64, window: f64, availability: f64, json: bool) {
    let samples = parse_samples(samples).unwrap_or_else(|e| super::fail(e));
    let params = OdteParams {
        desired_timeliness_sec: desired,
        expected_msg_per_sec: rate,
        window_sec: window,
    };
    let estimator = OdteEstimator::new(Box::new(ConstantAvailability(availability)));
    let result = estimator
        .estimate(&samples, &params)
        .unwrap_or_else(|e| super::fail(e));

    if json {
        match serde_json::to_string_pretty(&result) {
            Ok(s) => println!("{s}"),
            Err(e) => super::fail(e),
        }
        return;
    }

    println!("ODTE over {} sample(s)", result.samples);
    println!(
        "  desired {desired}s, {rate} msg/s, {window}s window ({} expected)",
        params.expected_samples()
    );
    println!();
    println!("  {:<14} {:>8.4}", "timeliness", result.timeliness);
    println!("  {:<14} {:>8.4}", "reliability", result.reliability);
    println!("  {:<14} {:>8.4}", "availability", result.availability);
    println!("  {}", "-".repeat(23));
    println!("  {:<14} {:>8.4}", "odte", result.odte);
}
