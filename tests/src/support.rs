//! Test harness: a running gateway over in-memory adapters, and a scriptable
//! webhook receiver.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use tea_events::adapters::{InMemoryStore, MemoryLedger};
use tea_events::domain::{Backoff, RawChaincodeEvent, RawLedgerRecord};
use tea_events::{EventPipeline, GatewayConfig, PipelineDeps, ServerHandle};

pub const WAIT: Duration = Duration::from_secs(5);
pub const CHANNEL: &str = "teach1";
pub const CHAINCODE: &str = "teaTraceCC";

fn fast_backoff() -> Backoff {
    Backoff {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(50),
        multiplier: 2.0,
        jitter_fraction: 0.0,
    }
}

/// Defaults with millisecond retry schedules
pub fn fast_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.backoff = fast_backoff();
    config.webhook.backoff = fast_backoff();
    config.webhook.max_attempts = 3;
    config.webhook.request_timeout = Duration::from_secs(2);
    // polling loops would trip the REST limiter
    config.rate_limit.enabled = false;
    config
}

/// One ledger block with a single chaincode event
pub fn ledger_record(block: u64, event_name: &str, payload: Value) -> RawLedgerRecord {
    RawLedgerRecord {
        block_number: block,
        events: vec![RawChaincodeEvent {
            chaincode_name: CHAINCODE.into(),
            event_name: event_name.into(),
            transaction_id: format!("tx-{block}"),
            payload: serde_json::to_vec(&payload).unwrap_or_default(),
        }],
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A gateway listening on an ephemeral port
pub struct TestGateway {
    pub pipeline: Arc<EventPipeline>,
    pub store: Arc<InMemoryStore>,
    pub ledger: Arc<MemoryLedger>,
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    server: Option<ServerHandle>,
}

impl TestGateway {
    pub async fn start() -> Self {
        Self::with_config(fast_config()).await
    }

    pub async fn with_config(config: GatewayConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let pipeline = EventPipeline::new(config, PipelineDeps::new(store.clone(), ledger.clone()))
            .expect("pipeline");
        pipeline.start().await.expect("start");
        let server = pipeline
            .spawn_server("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("server");

        Self {
            pipeline,
            store,
            ledger,
            addr: server.local_addr(),
            client: reqwest::Client::new(),
            server: Some(server),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, id: &str) -> String {
        format!("ws://{}/events/ws/{}", self.addr, id)
    }

    /// POST a subscription as user `owner`
    pub async fn create(&self, owner: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url("/events/subscriptions"))
            .header("x-user-id", owner)
            .json(&body)
            .send()
            .await
            .expect("create request")
    }

    /// Create and return the subscription JSON, asserting 201
    pub async fn create_ok(&self, body: Value) -> Value {
        let response = self.create("u1", body).await;
        assert_eq!(response.status(), 201, "create failed");
        response.json().await.expect("subscription json")
    }

    pub async fn get(&self, owner: &str, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("x-user-id", owner)
            .send()
            .await
            .expect("get request")
    }

    pub async fn patch(&self, owner: &str, path: &str, body: Value) -> reqwest::Response {
        self.client
            .patch(self.url(path))
            .header("x-user-id", owner)
            .json(&body)
            .send()
            .await
            .expect("patch request")
    }

    pub async fn delete(&self, owner: &str, path: &str) -> reqwest::Response {
        self.client
            .delete(self.url(path))
            .header("x-user-id", owner)
            .send()
            .await
            .expect("delete request")
    }

    /// Wait for `count` live ledger watchers on `channel`
    pub async fn listening(&self, channel: &str, count: usize) -> bool {
        self.ledger.wait_for_watchers(channel, count, WAIT).await
    }

    pub async fn stop(mut self) {
        if let Some(server) = self.server.take() {
            let _ = server.stop().await;
        }
    }
}

/// A request the webhook receiver saw
#[derive(Debug, Clone)]
pub struct ReceivedHook {
    pub headers: HeaderMap,
    pub body: String,
}

impl ReceivedHook {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).expect("webhook body json")
    }
}

#[derive(Clone)]
struct ReceiverState {
    hits: Arc<Mutex<Vec<ReceivedHook>>>,
    script: Arc<Vec<u16>>,
    fallback: u16,
    calls: Arc<AtomicUsize>,
}

async fn receive(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, &'static str) {
    let call = state.calls.fetch_add(1, Ordering::SeqCst);
    state.hits.lock().push(ReceivedHook { headers, body });
    let status = state.script.get(call).copied().unwrap_or(state.fallback);
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        "ack",
    )
}

/// HTTP endpoint answering with scripted statuses, then `fallback`
pub struct WebhookReceiver {
    pub url: String,
    hits: Arc<Mutex<Vec<ReceivedHook>>>,
    task: JoinHandle<()>,
}

impl WebhookReceiver {
    pub async fn start(script: Vec<u16>, fallback: u16) -> Self {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let state = ReceiverState {
            hits: Arc::clone(&hits),
            script: Arc::new(script),
            fallback,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new().route("/hook", post(receive)).with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind receiver");
        let addr = listener.local_addr().expect("receiver addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            url: format!("http://{addr}/hook"),
            hits,
            task,
        }
    }

    /// Always answers 200
    pub async fn ok() -> Self {
        Self::start(Vec::new(), 200).await
    }

    pub fn hits(&self) -> Vec<ReceivedHook> {
        self.hits.lock().clone()
    }

    pub async fn wait_for(&self, count: usize) -> bool {
        let hits = Arc::clone(&self.hits);
        eventually(WAIT, move || hits.lock().len() >= count).await
    }
}

impl Drop for WebhookReceiver {
    fn drop(&mut self) {
        self.task.abort();
    }
}
