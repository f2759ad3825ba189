//! HTTP surface for a twinsync digital twin.
//!
//! Accepts device telemetry over HTTP in place of a message-bus bridge,
//! serves the latest composed state, exposes the ODTE evaluation and lifecycle
//! status, allows runtime reconfiguration, and serves Prometheus metrics.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::Json,
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};

use twinsync_core::{
    ComposeOutcome, ConfigUpdate, DigitalTwin, InboundMessage, LifecycleState, PrometheusSink,
    TwinError,
};

/// Shared server state.
pub struct AppState {
    pub twin: Arc<DigitalTwin>,
    pub prometheus: Option<Arc<PrometheusSink>>,
}

impl AppState {
    pub fn new(twin: Arc<DigitalTwin>, prometheus: Option<Arc<PrometheusSink>>) -> Arc<Self> {
        Arc::new(Self { twin, prometheus })
    }
}

type Reply = (StatusCode, Json<Value>);

fn error_reply(status: StatusCode, msg: impl Into<String>) -> Reply {
    (status, Json(json!({ "success": false, "error": msg.into() })))
}

fn status_for(err: &TwinError) -> StatusCode {
    match err {
        TwinError::Parse(_) | TwinError::InvalidParameters(_) | TwinError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        TwinError::InsufficientData(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    digital_twin_id: String,
    state: LifecycleState,
    odte: Option<f64>,
    target_percentile: f64,
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let s = state.twin.status();
    let status = match s.state {
        LifecycleState::Shadowed => "synchronized",
        LifecycleState::Bound | LifecycleState::UnSync => "degraded",
        LifecycleState::Started | LifecycleState::Unbound => "unbound",
    };
    Json(HealthResponse {
        status,
        digital_twin_id: s.digital_twin_id,
        state: s.state,
        odte: s.odte.map(|r| r.odte),
        target_percentile: s.target_percentile,
    })
}

async fn handle_odte(State(state): State<Arc<AppState>>) -> Reply {
    match state.twin.last_odte() {
        Some(r) => (
            StatusCode::OK,
            Json(json!({
                "timeliness": r.timeliness,
                "reliability": r.reliability,
                "availability": r.availability,
                "odte": r.odte,
                "samples": r.samples,
                "state": state.twin.state(),
            })),
        ),
        None => error_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            "no ODTE evaluation yet",
        ),
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(state.twin.status()).unwrap_or(Value::Null))
}

/// Latest composed record per output topic.
async fn handle_state(State(state): State<Arc<AppState>>) -> Json<Value> {
    let records: Vec<Value> = state
        .twin
        .outbound_all()
        .into_iter()
        .map(|m| {
            let payload = serde_json::from_slice::<Value>(&m.payload)
                .unwrap_or_else(|_| Value::String(m.payload_str().to_string()));
            json!({ "topic": m.topic, "retained": m.retained, "payload": payload })
        })
        .collect();
    Json(json!({ "records": records, "total": records.len() }))
}

/// Latest record for one resource key or output topic.
async fn handle_state_resource(
    State(state): State<Arc<AppState>>,
    Path(resource): Path<String>,
) -> Reply {
    let output_topic = state.twin.config().composition.output_topic;
    let found = state
        .twin
        .outbound(&resource)
        .or_else(|| state.twin.outbound(&format!("{output_topic}/{resource}")));
    match found {
        Some(m) => {
            let payload = serde_json::from_slice::<Value>(&m.payload)
                .unwrap_or_else(|_| Value::String(m.payload_str().to_string()));
            (
                StatusCode::OK,
                Json(json!({ "topic": m.topic, "retained": m.retained, "payload": payload })),
            )
        }
        None => error_reply(
            StatusCode::NOT_FOUND,
            format!("no composed record for '{resource}'"),
        ),
    }
}

async fn handle_telemetry(
    State(state): State<Arc<AppState>>,
    Path(resource): Path<String>,
    body: Bytes,
) -> Reply {
    let msg = InboundMessage::new(resource, body.to_vec(), state.twin.now_ms());
    match state.twin.handle_message(&msg) {
        Ok(ComposeOutcome::Emitted(out)) => (
            StatusCode::OK,
            Json(json!({ "success": true, "outcome": "emitted", "topic": out.topic })),
        ),
        Ok(ComposeOutcome::Pending {
            collected,
            required,
        }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "outcome": "pending",
                "collected": collected,
                "required": required,
            })),
        ),
        Err(e) => error_reply(status_for(&e), e.to_string()),
    }
}

async fn handle_get_conf(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(state.twin.config()).unwrap_or(Value::Null))
}

async fn handle_put_conf(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> Reply {
    let applied = state.twin.update_config(&update);
    if applied.is_empty() {
        return error_reply(
            StatusCode::BAD_REQUEST,
            "no valid fields: expected_msg_sec, desired_timeliness_sec, target_percentile and unbound_threshold_ms must be > 0",
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "success": true, "applied": applied })),
    )
}

async fn handle_metrics(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, [(header::HeaderName, String); 1], String) {
    let text_plain = || [(header::CONTENT_TYPE, "text/plain".to_string())];
    let Some(prom) = &state.prometheus else {
        return (
            StatusCode::NOT_FOUND,
            text_plain(),
            "prometheus export disabled\n".to_string(),
        );
    };
    match prom.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prom.content_type())],
            body,
        ),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, text_plain(), format!("{e}\n")),
    }
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cfg = state.twin.config();
    Json(json!({
        "name": "twinsync",
        "version": twinsync_core::VERSION,
        "digital_twin_id": cfg.digital_twin_id,
        "target_device_id": cfg.target_device_id,
        "endpoints": {
            "/": "This API index",
            "/health": "Lifecycle-based health check",
            "/status": "Full twin status",
            "/odte": "Latest ODTE evaluation",
            "/state": "Latest composed record per output topic",
            "/state/{resource}": "Latest composed record for one resource key",
            "/telemetry/{resource}": {
                "method": "POST",
                "description": "Deliver one telemetry payload {type, timestamp, value}",
            },
            "/conf": {
                "GET": "Current configuration",
                "PUT": "Update expected_msg_sec, desired_timeliness_sec, target_percentile, unbound_threshold_ms",
            },
            "/metrics": "Prometheus exposition",
        },
    }))
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/odte", get(handle_odte))
        .route("/state", get(handle_state))
        .route("/state/{resource}", get(handle_state_resource))
        .route("/telemetry/{resource}", post(handle_telemetry))
        .route("/conf", get(handle_get_conf).put(handle_put_conf))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn run_server<F>(
    state: Arc<AppState>,
    host: &str,
    port: u16,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("twinsync HTTP listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinsync_core::{ManualClock, MetricsConfig, TwinConfig};

    const T0: i64 = 1_700_000_000_000;

    fn app(prometheus: bool) -> (Arc<AppState>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let mut cfg = TwinConfig::default();
        cfg.composition.aggregation_window = 2;
        let prom = prometheus.then(|| {
            Arc::new(PrometheusSink::new(&cfg.digital_twin_id, &MetricsConfig::default()).unwrap())
        });
        let mut builder = DigitalTwin::builder(cfg).clock(clock.clone());
        if let Some(p) = &prom {
            builder = builder.sink(p.clone());
        }
        let twin = Arc::new(builder.build().unwrap());
        twin.start();
        (AppState::new(twin, prom), clock)
    }

    fn body(ts: i64) -> Bytes {
        Bytes::from(format!(
            r#"{{"type":"device_state","timestamp":{ts},"value":{{"temperature":20.0,"energy":1.0}}}}"#
        ))
    }

    async fn post(state: &Arc<AppState>, ts: i64) -> Reply {
        handle_telemetry(State(state.clone()), Path("device_state".to_string()), body(ts)).await
    }

    // -----------------------------------------------------------------------
    // Telemetry ingress
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn telemetry_pending_then_emitted() {
        let (state, clock) = app(false);
        clock.advance(1_000);
        let (status, Json(v)) = post(&state, T0 + 900).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(v["outcome"], "pending");
        assert_eq!(v["collected"], 1);

        clock.advance(1_000);
        let (status, Json(v)) = post(&state, T0 + 1_900).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["topic"], "device/average");

        let Json(v) = handle_state(State(state.clone())).await;
        assert_eq!(v["total"], 1);
        assert_eq!(v["records"][0]["payload"]["value"]["temperature"]["mean"], 20.0);
        assert_eq!(state.twin.state(), LifecycleState::Bound);

        let (status, _) =
            handle_state_resource(State(state.clone()), Path("average".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn state_resource_resolves_single_value_topics() {
        let clock = Arc::new(ManualClock::new(T0));
        let mut cfg = TwinConfig::default();
        cfg.composition.mode = twinsync_core::CompositionMode::SingleValue;
        cfg.composition.single_value_window = 1;
        let twin = Arc::new(DigitalTwin::builder(cfg).clock(clock.clone()).build().unwrap());
        let state = AppState::new(twin, None);

        let now = clock.advance(1_000);
        let payload = format!(r#"{{"type":"temperature","timestamp":{},"value":21.5}}"#, now - 50);
        let (status, _) = handle_telemetry(
            State(state.clone()),
            Path("temperature".to_string()),
            Bytes::from(payload),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, Json(v)) =
            handle_state_resource(State(state.clone()), Path("temperature".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["topic"], "device/average/temperature");
        assert_eq!(v["payload"]["value"]["mean"], 21.5);
        assert_eq!(v["payload"]["value"]["unit"], "Cel");

        let (status, _) =
            handle_state_resource(State(state), Path("pressure".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn telemetry_parse_error_is_bad_request() {
        let (state, _) = app(false);
        let (status, Json(v)) = handle_telemetry(
            State(state.clone()),
            Path("device_state".to_string()),
            Bytes::from_static(b"{\"timestamp\":0}"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(v["success"], false);
    }

    #[tokio::test]
    async fn composite_payload_off_state_topic_is_bad_request() {
        let (state, clock) = app(false);
        clock.advance(1_000);
        let (status, _) = handle_telemetry(
            State(state.clone()),
            Path("temperature".to_string()),
            body(T0 + 900),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let s = state.twin.status();
        assert_eq!((s.messages, s.rejected), (1, 1));
        assert_eq!(s.composer.pending_composite, 0);
    }

    // -----------------------------------------------------------------------
    // ODTE and health
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn odte_unavailable_before_first_cycle() {
        let (state, clock) = app(false);
        let (status, _) = handle_odte(State(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        for i in 1..=10 {
            clock.advance(1_000);
            post(&state, T0 + i * 1_000 - 100).await;
        }
        state.twin.run_cycle();
        let (status, Json(v)) = handle_odte(State(state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["odte"], 1.0);
        assert_eq!(v["state"], "shadowed");

        let Json(h) = handle_health(State(state.clone())).await;
        assert_eq!(h.status, "synchronized");
        assert_eq!(h.odte, Some(1.0));
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn put_conf_applies_positive_values() {
        let (state, _) = app(false);
        let update = ConfigUpdate {
            expected_msg_sec: Some(2.0),
            target_percentile: Some(-1.0),
            ..Default::default()
        };
        let (status, Json(v)) = handle_put_conf(State(state.clone()), Json(update)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["applied"], json!(["expected_msg_sec"]));

        let Json(conf) = handle_get_conf(State(state.clone())).await;
        assert_eq!(conf["odte"]["expected_msg_sec"], 2.0);
        assert_eq!(conf["odte"]["target_percentile"], 0.9);
    }

    #[tokio::test]
    async fn put_conf_with_nothing_valid_is_rejected() {
        let (state, _) = app(false);
        let (status, _) =
            handle_put_conf(State(state.clone()), Json(ConfigUpdate::default())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn metrics_disabled_is_not_found() {
        let (state, _) = app(false);
        let (status, _, _) = handle_metrics(State(state)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_exposes_lifecycle_gauge() {
        let (state, _) = app(true);
        let (status, _, text) = handle_metrics(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("dt_life_cycle_state{digital_twin_id=\"twin-001\"} 2"));
        assert!(text.contains("dt_entanglement_msg_rate_sec 1"));
    }

    #[tokio::test]
    async fn index_lists_endpoints() {
        let (state, _) = app(false);
        let Json(v) = handle_index(State(state)).await;
        assert_eq!(v["name"], "twinsync");
        assert!(v["endpoints"]["/metrics"].is_string());
    }

    #[test]
    fn router_builds() {
        let (state, _) = app(false);
        let _router = build_router(state);
    }
}
