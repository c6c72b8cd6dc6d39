//! In-process OpenAI-compatible server used by the unit tests.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warp::http::StatusCode;
use warp::hyper::Body;
use warp::hyper::body::Bytes;
use warp::{Filter, Reply};

use crate::client::ClientConfig;

/// Malformed or unusual completion replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockReply {
    /// `choices: []`
    EmptyChoices,
    /// One choice whose `content` is `null`
    NullContent,
    /// HTTP 200 with a body that is not JSON
    Garbage,
    /// Headers and half the body go out at once, the rest after `stall`
    SlowBody,
}

#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Reported as `owned_by` for every model
    pub owned_by: String,
    pub models: Vec<String>,
    /// Time spent on every completion
    pub delay: Duration,
    /// Prompt -> number of leading attempts that stall for `stall`
    pub stalls: HashMap<String, usize>,
    pub stall: Duration,
    /// Prompt -> HTTP status returned instead of a completion
    pub failures: HashMap<String, u16>,
    /// Prompt -> reply sent instead of a well-formed completion
    pub replies: HashMap<String, MockReply>,
    /// The models list stays empty for this many polls
    pub empty_model_polls: usize,
    pub completion_tokens: u32,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            owned_by: "vllm".to_string(),
            models: vec!["mock-model".to_string()],
            delay: Duration::from_millis(10),
            stalls: HashMap::new(),
            stall: Duration::from_secs(2),
            failures: HashMap::new(),
            replies: HashMap::new(),
            empty_model_polls: 0,
            completion_tokens: 7,
        }
    }
}

#[derive(Debug, Default)]
pub struct MockState {
    inflight: AtomicUsize,
    max_inflight: AtomicUsize,
    model_polls: AtomicUsize,
    attempts: Mutex<HashMap<String, usize>>,
    bodies: Mutex<Vec<Value>>,
}

/// Decrements the in-flight count even if the handler future is dropped.
struct InflightGuard(Arc<MockState>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockServer {
    /// Bind on an ephemeral port and serve in the background. Must be called
    /// from within a tokio runtime.
    pub fn start(options: MockOptions) -> Self {
        let state = Arc::new(MockState::default());
        let options = Arc::new(options);

        let with_state = {
            let state = Arc::clone(&state);
            let options = Arc::clone(&options);
            warp::any().map(move || (Arc::clone(&state), Arc::clone(&options)))
        };

        let models = warp::path!("v1" / "models")
            .and(warp::get())
            .and(with_state.clone())
            .map(|(state, options): (Arc<MockState>, Arc<MockOptions>)| {
                let poll = state.model_polls.fetch_add(1, Ordering::SeqCst) + 1;
                let data: Vec<Value> = if poll <= options.empty_model_polls {
                    Vec::new()
                } else {
                    options
                        .models
                        .iter()
                        .map(|id| json!({ "id": id, "object": "model", "owned_by": options.owned_by }))
                        .collect()
                };
                warp::reply::json(&json!({ "object": "list", "data": data }))
            });

        let completions = warp::path!("v1" / "chat" / "completions")
            .and(warp::post())
            .and(warp::body::json())
            .and(with_state)
            .then(|body: Value, (state, options): (Arc<MockState>, Arc<MockOptions>)| {
                complete(body, state, options)
            });

        let (addr, server) =
            warp::serve(models.or(completions)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url(),
            model: None,
            timeout: Duration::from_secs(5),
            timeout_increment: Duration::from_secs(1),
            pool_size: 4,
        }
    }

    /// Highest number of completions observed in flight at once.
    pub fn max_inflight(&self) -> usize {
        self.state.max_inflight.load(Ordering::SeqCst)
    }

    /// Completion request bodies in arrival order.
    pub fn bodies(&self) -> Vec<Value> {
        self.state.bodies.lock().unwrap().clone()
    }

    /// Number of `/v1/models` requests served.
    pub fn model_polls(&self) -> usize {
        self.state.model_polls.load(Ordering::SeqCst)
    }

    pub fn attempts(&self, prompt: &str) -> usize {
        self.state
            .attempts
            .lock()
            .unwrap()
            .get(prompt)
            .copied()
            .unwrap_or(0)
    }
}

async fn complete(
    body: Value,
    state: Arc<MockState>,
    options: Arc<MockOptions>,
) -> warp::reply::Response {
    let prompt = body["messages"][0]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    state.bodies.lock().unwrap().push(body.clone());

    let attempt = {
        let mut attempts = state.attempts.lock().unwrap();
        let count = attempts.entry(prompt.clone()).or_insert(0);
        *count += 1;
        *count
    };

    if let Some(status) = options.failures.get(&prompt) {
        return warp::reply::with_status(
            warp::reply::json(&json!({ "error": { "message": "mock failure" } })),
            StatusCode::from_u16(*status).unwrap(),
        )
        .into_response();
    }

    let current = state.inflight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_inflight.fetch_max(current, Ordering::SeqCst);
    let _guard = InflightGuard(Arc::clone(&state));

    let stalled = options
        .stalls
        .get(&prompt)
        .is_some_and(|stalled_attempts| attempt <= *stalled_attempts);
    tokio::time::sleep(if stalled { options.stall } else { options.delay }).await;

    let kind = options.replies.get(&prompt).copied();
    if kind == Some(MockReply::Garbage) {
        return warp::reply::with_status("<html>upstream hiccup</html>", StatusCode::OK)
            .into_response();
    }

    let content = match kind {
        // Echo the prompt the way some servers do
        None | Some(MockReply::SlowBody) => json!(format!("{} Answer number {}.", prompt, attempt)),
        _ => Value::Null,
    };
    let choices = match kind {
        Some(MockReply::EmptyChoices) => json!([]),
        _ => json!([{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]),
    };

    let prompt_tokens = prompt.split_whitespace().count() as u32;
    let reply = json!({
        "id": format!("chatcmpl-{}", attempt),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": options.models.first().cloned().unwrap_or_default(),
        "choices": choices,
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": options.completion_tokens,
            "total_tokens": prompt_tokens + options.completion_tokens
        }
    });

    if kind == Some(MockReply::SlowBody) {
        let mut bytes = serde_json::to_vec(&reply).unwrap();
        let rest = bytes.split_off(bytes.len() / 2);
        let (mut sender, body) = Body::channel();
        let stall = options.stall;
        tokio::spawn(async move {
            if sender.send_data(Bytes::from(bytes)).await.is_ok() {
                tokio::time::sleep(stall).await;
                let _ = sender.send_data(Bytes::from(rest)).await;
            }
        });
        return warp::http::Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
    }

    warp::reply::with_status(warp::reply::json(&reply), StatusCode::OK).into_response()
}
