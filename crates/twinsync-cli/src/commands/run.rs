//! `twinsync run`: a twin behind the HTTP surface.

use std::sync::Arc;

use twinsync_core::DigitalTwin;
use twinsync_server::AppState;

use super::TwinSinks;

#[allow(clippy::too_many_arguments)]
pub fn run(
    config_path: Option<&str>,
    host: Option<&str>,
    port: Option<u16>,
    record: bool,
    sessions_dir: Option<&str>,
    tags: &[String],
    note: Option<&str>,
) {
    let mut config = super::load_config(config_path);
    if let Some(h) = host {
        config.http.host = h.to_string();
    }
    if let Some(p) = port {
        config.http.port = p;
    }
    if let Some(dir) = sessions_dir {
        config.recording.output_dir = dir.to_string();
    }
    let record = record || config.recording.enabled;

    let sinks = TwinSinks::build(&config, record, super::parse_tags(tags), note);
    let twin = DigitalTwin::builder(config.clone())
        .sink(sinks.fanout.clone())
        .build()
        .unwrap_or_else(|e| super::fail(e));
    let twin = Arc::new(twin);

    let host = config.http.host.clone();
    let port = config.http.port;
    let base = format!("http://{host}:{port}");

    println!("twinsync v{}", twinsync_core::VERSION);
    println!("   {base}");
    println!(
        "   twin {} ← device {}",
        config.digital_twin_id, config.target_device_id
    );
    println!(
        "   ODTE target {} over {}s at {} msg/s (desired delay {}s)",
        config.odte.target_percentile,
        config.odte.sliding_window_sec,
        config.odte.expected_msg_sec,
        config.odte.desired_timeliness_sec
    );
    if let Some(dir) = sinks.session.as_ref().and_then(|s| s.session_dir()) {
        println!("   Recording to {}", dir.display());
    }
    println!();
    println!("   Endpoints:");
    println!("     POST /telemetry/{{resource}}  Deliver a {{type, timestamp, value}} payload");
    println!("     GET  /state                 Latest composed records");
    println!("     GET  /odte                  Latest ODTE evaluation");
    println!("     GET  /health                Lifecycle-based health");
    println!("     GET  /conf  PUT /conf       Read or update configuration");
    println!("     GET  /metrics               Prometheus exposition");
    println!();
    println!("   Example:");
    println!(
        "     curl -X POST {base}/telemetry/{} -d '{{\"type\":\"{}\",\"timestamp\":'$(date +%s000)',\"value\":{{\"temperature\":21.5,\"energy\":2.0}}}}'",
        config.composition.state_topic, config.composition.state_topic
    );
    println!();

    let rt = super::runtime();
    let result = rt.block_on(async {
        twin.start();
        let monitor = twin.spawn_monitor();
        let state = AppState::new(twin.clone(), Some(sinks.prometheus.clone()));
        let served = twinsync_server::run_server(state, &host, port, async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutdown requested");
        })
        .await;
        monitor.stop().await;
        served
    });

    let status = twin.status();
    println!();
    println!(
        "Final state {} after {} message(s), {} cycle(s)",
        status.state, status.messages, status.cycles
    );
    sinks.finish();

    if let Err(e) = result {
        super::fail(format!("server on {host}:{port}: {e}"));
    }
}
