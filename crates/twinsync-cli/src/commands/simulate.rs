//! `twinsync simulate`: a random-walk device feeding an in-process twin.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::json;

use twinsync_core::{CompositionMode, DigitalTwin, InboundMessage, TwinConfig};
use twinsync_server::AppState;

use super::TwinSinks;

/// Simulated industrial device: temperature (°C) and power draw (kW).
struct SimDevice {
    temperature: f64,
    energy: f64,
}

impl SimDevice {
    fn new() -> Self {
        Self {
            temperature: 20.0,
            energy: 2.0,
        }
    }

    fn step(&mut self, rng: &mut impl Rng) {
        self.temperature += rng.random_range(-0.5..=0.5);
        self.energy = (self.energy + rng.random_range(-0.1..=0.1)).max(0.0);
    }

    /// Messages for one publish at physical time `ts`.
    fn messages(&self, config: &TwinConfig, ts: i64) -> Vec<(String, String)> {
        let comp = &config.composition;
        match comp.mode {
            CompositionMode::Composite => {
                let payload = json!({
                    "type": comp.state_topic,
                    "timestamp": ts,
                    "value": { "temperature": self.temperature, "energy": self.energy },
                });
                vec![(comp.state_topic.clone(), payload.to_string())]
            }
            CompositionMode::SingleValue => [("temperature", self.temperature), ("energy", self.energy)]
                .into_iter()
                .map(|(key, v)| {
                    let payload = json!({ "type": key, "timestamp": ts, "value": v });
                    (key.to_string(), payload.to_string())
                })
                .collect(),
        }
    }
}

#[allow(clippy::too_many_arguments, clippy::too_many_lines)]
pub fn run(
    config_path: Option<&str>,
    mode: Option<&str>,
    rate: f64,
    delay_ms: u64,
    jitter_ms: u64,
    drop: f64,
    duration: Option<&str>,
    serve: bool,
) {
    if !(rate.is_finite() && rate > 0.0) {
        super::fail("--rate must be > 0");
    }
    if !(0.0..=1.0).contains(&drop) {
        super::fail("--drop must be within [0, 1]");
    }

    let mut config = super::load_config(config_path);
    match mode {
        Some("single_value") => config.composition.mode = CompositionMode::SingleValue,
        Some("composite") => config.composition.mode = CompositionMode::Composite,
        _ => {}
    }
    let max_duration = duration.map(super::parse_duration);

    let sinks = TwinSinks::build(&config, config.recording.enabled, Default::default(), None);
    let twin = DigitalTwin::builder(config.clone())
        .sink(sinks.fanout.clone())
        .build()
        .unwrap_or_else(|e| super::fail(e));
    let twin = Arc::new(twin);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        super::fail(format!("setting Ctrl+C handler: {e}"));
    }

    let rt = super::runtime();
    let _guard = rt.enter();
    twin.start();
    let monitor = twin.spawn_monitor();

    let server = serve.then(|| {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let state = AppState::new(twin.clone(), Some(sinks.prometheus.clone()));
        let host = config.http.host.clone();
        let port = config.http.port;
        let handle = rt.spawn(async move {
            twinsync_server::run_server(state, &host, port, async move {
                let _ = rx.await;
            })
            .await
        });
        (tx, handle)
    });

    println!("Simulating device {}", config.target_device_id);
    println!("  Mode:      {:?}", config.composition.mode);
    println!("  Rate:      {rate} msg/s");
    println!("  Link:      {delay_ms}ms + [0, {jitter_ms}]ms, drop {drop}");
    match max_duration {
        Some(d) => println!("  Duration:  {}s", d.as_secs()),
        None => println!("  Duration:  until Ctrl+C"),
    }
    if serve {
        println!(
            "  HTTP:      http://{}:{}",
            config.http.host, config.http.port
        );
    }
    println!();

    let interval = Duration::from_secs_f64(1.0 / rate);
    let mut rng = rand::rng();
    let mut device = SimDevice::new();
    let start = Instant::now();
    let (mut sent, mut dropped) = (0u64, 0u64);

    while running.load(Ordering::SeqCst) {
        if max_duration.is_some_and(|max| start.elapsed() >= max) {
            break;
        }

        device.step(&mut rng);
        let now = twin.now_ms();
        if rng.random_bool(drop) {
            dropped += 1;
        } else {
            let link = delay_ms + rng.random_range(0..=jitter_ms);
            let ts = now - link as i64;
            for (topic, payload) in device.messages(&config, ts) {
                if let Err(e) = twin.handle_message(&InboundMessage::new(topic, payload, now)) {
                    log::warn!("simulated message rejected: {e}");
                }
            }
            sent += 1;
        }

        let odte = twin
            .last_odte()
            .map_or_else(|| "-".to_string(), |r| format!("{:.3}", r.odte));
        print!(
            "\r  Sent: {sent:<7} Dropped: {dropped:<5} State: {:<9} ODTE: {odte:<6}",
            twin.state().to_string()
        );
        let _ = std::io::stdout().flush();

        let deadline = Instant::now() + interval;
        while Instant::now() < deadline && running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
    println!();
    println!();

    rt.block_on(monitor.stop());
    if let Some((tx, handle)) = server {
        let _ = tx.send(());
        match rt.block_on(handle) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => eprintln!("HTTP server error: {e}"),
            Err(e) => eprintln!("HTTP server task failed: {e}"),
        }
    }

    let status = twin.status();
    println!(
        "Final state {} after {} message(s), {} emitted, {} cycle(s) ({} skipped)",
        status.state, status.messages, status.emitted, status.cycles, status.skipped_cycles
    );
    if let Some(r) = status.odte {
        println!(
            "Last ODTE {:.3} (timeliness {:.3}, reliability {:.3}, availability {:.3})",
            r.odte, r.timeliness, r.reliability, r.availability
        );
    }
    sinks.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_device_publishes_one_state_message() {
        let config = TwinConfig::default();
        let msgs = SimDevice::new().messages(&config, 1_000);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0, "device_state");
        let v: serde_json::Value = serde_json::from_str(&msgs[0].1).unwrap();
        assert_eq!(v["timestamp"], 1_000);
        assert_eq!(v["value"]["temperature"], 20.0);
    }

    #[test]
    fn single_value_device_publishes_per_resource() {
        let mut config = TwinConfig::default();
        config.composition.mode = CompositionMode::SingleValue;
        let msgs = SimDevice::new().messages(&config, 5);
        let topics: Vec<&str> = msgs.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(topics, ["temperature", "energy"]);
    }

    #[test]
    fn random_walk_keeps_energy_non_negative() {
        let mut rng = rand::rng();
        let mut device = SimDevice::new();
        for _ in 0..1_000 {
            device.step(&mut rng);
            assert!(device.energy >= 0.0);
        }
    }

    #[test]
    fn simulated_stream_binds_the_twin() {
        let twin = DigitalTwin::new(TwinConfig::default(), Arc::new(twinsync_core::NoopSink))
            .unwrap();
        twin.start();
        let device = SimDevice::new();
        let config = twin.config();
        for _ in 0..config.composition.aggregation_window {
            let now = twin.now_ms();
            for (topic, payload) in device.messages(&config, now - 100) {
                twin.handle_message(&InboundMessage::new(topic, payload, now))
                    .unwrap();
            }
        }
        assert_eq!(twin.state(), twinsync_core::LifecycleState::Bound);
    }
}
