//! Common test infrastructure
//!
//! Upstream root servers are real axum servers on `127.0.0.1:0` whose
//! payloads, status codes and latency each test controls. The aggregator side
//! is wired the same way `main` wires it, against a temporary database.

#![allow(dead_code)]

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use meeting_aggregator::config::SyncSettings;
use meeting_aggregator::model::Source;
use meeting_aggregator::server::{make_app, RequestsLoggingLevel, ServerConfig};
use meeting_aggregator::store::{MeetingStore, SqliteMeetingStore};
use meeting_aggregator::sync::{SyncOrchestrator, SystemClock, TickReport};
use meeting_aggregator::HttpSourceClient;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct StubState {
    service_bodies: Mutex<Value>,
    meetings: Mutex<Value>,
    formats: Mutex<Value>,
    /// Served instead of the meetings payload when set.
    raw_meetings: Mutex<Option<String>>,
    status: Mutex<Option<u16>>,
    delay: Mutex<Duration>,
    hits: AtomicUsize,
}

#[derive(Deserialize)]
struct StubParams {
    switcher: String,
}

async fn client_interface(
    State(state): State<Arc<StubState>>,
    Query(params): Query<StubParams>,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let delay = *state.delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if let Some(status) = *state.status.lock().unwrap() {
        return StatusCode::from_u16(status).unwrap().into_response();
    }
    match params.switcher.as_str() {
        "GetServiceBodies" => Json(state.service_bodies.lock().unwrap().clone()).into_response(),
        "GetFormats" => Json(state.formats.lock().unwrap().clone()).into_response(),
        "GetSearchResults" => match state.raw_meetings.lock().unwrap().clone() {
            Some(raw) => raw.into_response(),
            None => Json(state.meetings.lock().unwrap().clone()).into_response(),
        },
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// A fake BMLT root server.
pub struct UpstreamStub {
    pub base_url: String,
    state: Arc<StubState>,
    shutdown: CancellationToken,
}

impl UpstreamStub {
    pub async fn spawn() -> Self {
        let state = Arc::new(StubState::default());
        *state.service_bodies.lock().unwrap() = json!([]);
        *state.meetings.lock().unwrap() = json!([]);
        *state.formats.lock().unwrap() = json!([]);

        let app = Router::new()
            .route("/main_server/client_interface/json/", get(client_interface))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener.local_addr().unwrap().port();

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            base_url: format!("http://127.0.0.1:{}/main_server", port),
            state,
            shutdown,
        }
    }

    pub fn set_service_bodies(&self, bodies: Value) {
        *self.state.service_bodies.lock().unwrap() = bodies;
    }

    pub fn set_meetings(&self, meetings: Value) {
        *self.state.meetings.lock().unwrap() = meetings;
        *self.state.raw_meetings.lock().unwrap() = None;
    }

    pub fn set_formats(&self, formats: Value) {
        *self.state.formats.lock().unwrap() = formats;
    }

    pub fn set_raw_meetings(&self, raw: &str) {
        *self.state.raw_meetings.lock().unwrap() = Some(raw.to_string());
    }

    pub fn fail_with(&self, status: Option<u16>) {
        *self.state.status.lock().unwrap() = status;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

impl Drop for UpstreamStub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn service_body(id: i64, parent: i64, name: &str) -> Value {
    json!({
        "id": id.to_string(),
        "parent_id": parent.to_string(),
        "name": name,
        "type": if parent == 0 { "RS" } else { "AS" },
    })
}

/// One translation of a format, as `GetFormats` lists it.
pub fn format(id: i64, lang: &str, key: &str, name: &str) -> Value {
    json!({
        "id": id.to_string(),
        "lang": lang,
        "key_string": key,
        "name_string": name,
        "description_string": "",
        "format_type_enum": "FC3",
    })
}

pub fn meeting(id: i64, service_body: i64, name: &str, weekday: u8, start_time: &str) -> Value {
    json!({
        "id_bigint": id.to_string(),
        "service_body_bigint": service_body.to_string(),
        "meeting_name": name,
        "weekday_tinyint": weekday.to_string(),
        "start_time": start_time,
        "duration_time": "01:00:00",
        "latitude": "40.7128",
        "longitude": "-74.0060",
        "formats": "O,D",
        "published": "1",
    })
}

pub fn meeting_at(id: i64, service_body: i64, name: &str, latitude: f64, longitude: f64) -> Value {
    let mut m = meeting(id, service_body, name, 2, "19:00:00");
    m["latitude"] = json!(latitude.to_string());
    m["longitude"] = json!(longitude.to_string());
    m
}

/// Settings that let every tick attempt every source.
pub fn test_settings() -> SyncSettings {
    SyncSettings {
        interval_secs: 3600,
        request_timeout_secs: 1,
        cycle_timeout_secs: 10,
        backoff_initial_secs: 0,
        ..SyncSettings::default()
    }
}

/// The aggregator wired against a temporary database.
pub struct Aggregator {
    pub store: Arc<SqliteMeetingStore>,
    pub orchestrator: SyncOrchestrator,
    _temp_dir: TempDir,
}

impl Aggregator {
    pub fn new(stubs: &[&UpstreamStub]) -> Self {
        Self::with_settings(stubs, test_settings())
    }

    /// Source ids are 1-based positions in `stubs`.
    pub fn with_settings(stubs: &[&UpstreamStub], settings: SyncSettings) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            SqliteMeetingStore::new(temp_dir.path().join("meetings.db"), 2)
                .expect("Failed to open meeting store"),
        );
        let sources = stubs
            .iter()
            .enumerate()
            .map(|(i, stub)| Source::new(i as i64 + 1, stub.base_url.clone()))
            .collect();
        let client = Arc::new(
            HttpSourceClient::new(settings.request_timeout(), &settings.user_agent)
                .expect("Failed to create HTTP client"),
        );
        let orchestrator = SyncOrchestrator::new(
            sources,
            client,
            store.clone() as Arc<dyn MeetingStore>,
            Arc::new(SystemClock),
            settings,
        );
        Self {
            store,
            orchestrator,
            _temp_dir: temp_dir,
        }
    }

    pub async fn tick(&self) -> TickReport {
        self.orchestrator.run_once(&CancellationToken::new()).await
    }

    /// Serves the query API on a random port and returns its base URL.
    pub async fn serve(&self) -> String {
        let config = ServerConfig {
            requests_logging_level: RequestsLoggingLevel::None,
            port: 0,
        };
        let app = make_app(config, self.store.clone() as Arc<dyn MeetingStore>, None);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://127.0.0.1:{}", port)
    }
}
