use anyhow::Result;
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::backend::Backend;
use crate::config::{Config, GenerationConfig};
use crate::metrics::{Metrics, RequestStatus};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to generate response: HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("No models available from server at {0}/models")]
    NoModels(String),

    #[error("Model {model} is not served at {base_url}")]
    ModelNotFound { model: String, base_url: String },

    #[error("Response contained no choices")]
    EmptyChoices,
}

/// Fields owned by the client; extra options may not override them.
const RESERVED_KEYS: [&str; 4] = ["model", "messages", "temperature", "stop"];

// Request types for the Chat Completions API
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

// Response types
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// Models list response
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsResponse {
    pub data: Vec<Model>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub owned_by: String,
}

/// Sampling parameters for one chat completion.
///
/// `max_tokens` and `regex` are emitted under whatever name the hosting
/// backend expects. `extra` is passed through after the same renaming, so
/// callers may spell options for either backend.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub temperature: f32,
    pub stop: Option<Vec<String>>,
    pub max_tokens: Option<u32>,
    pub regex: Option<String>,
    pub extra: Map<String, Value>,
}

impl GenerationParams {
    /// Backend-specific request options, excluding the core body fields.
    pub fn options_for(&self, backend: &Backend) -> Map<String, Value> {
        let mut options = backend.translate_options(self.extra.clone());

        options.retain(|key, _| {
            let reserved = RESERVED_KEYS.contains(&key.as_str());
            if reserved {
                warn!("Ignoring extra option {:?}: it is set by the client", key);
            }
            !reserved
        });

        if let Some(max_tokens) = self.max_tokens {
            options.insert(backend.max_tokens_key().to_string(), Value::from(max_tokens));
        }
        if let Some(regex) = &self.regex {
            options.insert(backend.regex_key().to_string(), Value::from(regex.clone()));
        }

        options
    }
}

impl From<&GenerationConfig> for GenerationParams {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            stop: config.stop.clone(),
            max_tokens: config.max_tokens,
            regex: config.regex.clone(),
            extra: config.extra.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>, params: GenerationParams) -> Self {
        Self { messages, params }
    }

    /// A single user turn.
    pub fn from_prompt(prompt: impl Into<String>, params: GenerationParams) -> Self {
        Self::new(vec![Message::user(prompt)], params)
    }

    /// Content of the first message; servers that echo the prompt repeat this.
    fn echoed_prompt(&self) -> &str {
        self.messages
            .first()
            .map(|message| message.content.as_str())
            .unwrap_or_default()
    }
}

/// Outcome of one successful chat completion.
#[derive(Debug, Clone, Serialize)]
pub struct Generation {
    pub response: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency: Duration,
}

impl Generation {
    /// Completion tokens per second of request latency, if any time elapsed.
    pub fn tokens_per_second(&self) -> Option<f64> {
        let secs = self.latency.as_secs_f64();
        if secs > 0.0 {
            Some(self.completion_tokens as f64 / secs)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenCount {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Configuration for connecting an [`EndpointClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the OpenAI-compatible API, e.g. `http://127.0.0.1:9000/v1`
    pub base_url: String,
    /// Model to use; the first model the server lists when `None`
    pub model: Option<String>,
    /// Initial per-request timeout
    pub timeout: Duration,
    /// Added to the timeout each time a request times out
    pub timeout_increment: Duration,
    /// Idle connections kept per host (should match the batch size)
    pub pool_size: usize,
}

impl From<&Config> for ClientConfig {
    fn from(config: &Config) -> Self {
        Self {
            base_url: config.endpoint.base_url(),
            model: config.endpoint.model.clone(),
            timeout: Duration::from_secs(config.endpoint.timeout),
            timeout_increment: Duration::from_secs(config.endpoint.timeout_increment),
            pool_size: config.load.batch_size,
        }
    }
}

/// Client for a single model served by vLLM, SGLang or another
/// OpenAI-compatible server.
///
/// Model metadata is fetched once in [`EndpointClient::connect`]. The client
/// keeps cumulative token counters and a timeout budget that grows every time
/// a request times out; both are shared by all concurrent callers.
#[derive(Debug)]
pub struct EndpointClient {
    client: Client,
    base_url: String,
    model: String,
    backend: Backend,
    timeout_ms: AtomicU64,
    timeout_increment: Duration,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl EndpointClient {
    /// Builds the HTTP client and discovers the served model.
    ///
    /// Fails if the server is unreachable, lists no models, or does not serve
    /// the configured model.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.pool_size) // Match concurrency for connection reuse
            .pool_idle_timeout(Duration::from_secs(300))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        let models = fetch_models(&client, &config.base_url, config.timeout).await?;
        let model = select_model(models, config.model.as_deref(), &config.base_url)?;
        let backend = Backend::from_owner(&model.owned_by);

        info!("Using model {} hosted by {}", model.id, backend);
        if let Backend::Other(owner) = &backend {
            warn!(
                "Unrecognized backend {:?}, generation options are sent untranslated",
                owner
            );
        }

        Metrics::record_timeout_budget(config.timeout);

        Ok(Self {
            client,
            base_url: config.base_url,
            model: model.id,
            backend,
            timeout_ms: AtomicU64::new(config.timeout.as_millis() as u64),
            timeout_increment: config.timeout_increment,
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Timeout that the next request will be sent with.
    pub fn current_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn token_count(&self) -> TokenCount {
        TokenCount {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
        }
    }

    pub fn reset_token_count(&self) {
        self.prompt_tokens.store(0, Ordering::Relaxed);
        self.completion_tokens.store(0, Ordering::Relaxed);
    }

    /// Sends one chat completion.
    ///
    /// Returns `Ok(None)` when the request times out; the timeout budget has
    /// then been extended for later requests. Non-200 responses and transport
    /// failures are errors.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<Option<Generation>> {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: request.messages.clone(),
            temperature: request.params.temperature,
            stop: request.params.stop.clone(),
            options: request.params.options_for(&self.backend),
        };

        let timeout = self.current_timeout();
        let request_start = Instant::now();
        let _inflight = Metrics::record_request_sent();

        let completion = match self.post_completion(&body, timeout).await {
            Ok(Some(completion)) => completion,
            Ok(None) => {
                Metrics::record_request_complete(RequestStatus::Timeout);
                let extended = self.extend_timeout();
                warn!(
                    "Request timed out after {:.1}s, retrying with {:.1}s (+{:.1}s)",
                    timeout.as_secs_f64(),
                    extended.as_secs_f64(),
                    self.timeout_increment.as_secs_f64()
                );
                return Ok(None);
            }
            Err(e) => {
                Metrics::record_request_complete(RequestStatus::Failed);
                return Err(e);
            }
        };
        let latency = request_start.elapsed();

        let Some(choice) = completion.choices.into_iter().next() else {
            Metrics::record_request_complete(RequestStatus::Failed);
            return Err(ClientError::EmptyChoices.into());
        };
        let content = choice.message.content.unwrap_or_default();
        let response = strip_echo(&content, request.echoed_prompt());

        let usage = completion.usage;
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens as u64, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens as u64, Ordering::Relaxed);

        Metrics::record_tokens(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        Metrics::record_latency(latency);
        Metrics::record_request_complete(RequestStatus::Success);

        debug!(
            "Completion {} finished - prompt_tokens: {}, completion_tokens: {}, latency_ms: {:.1}, finish_reason: {:?}",
            completion.id,
            usage.prompt_tokens,
            usage.completion_tokens,
            latency.as_secs_f64() * 1000.0,
            choice.finish_reason
        );

        Ok(Some(Generation {
            response,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            latency,
        }))
    }

    /// POST the request; `Ok(None)` means the timeout elapsed.
    async fn post_completion(
        &self,
        body: &ChatCompletionRequest,
        timeout: Duration,
    ) -> Result<Option<ChatCompletionResponse>> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = match self.client.post(&url).json(body).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Ok(None),
            Err(e) => return Err(ClientError::Connection(e.to_string()).into()),
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            return Err(ClientError::Http { status, message }.into());
        }

        // The timeout also covers reading the body
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) if e.is_timeout() => return Ok(None),
            Err(e) => return Err(ClientError::Connection(e.to_string()).into()),
        };

        let completion = serde_json::from_slice::<ChatCompletionResponse>(&bytes)
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        if completion.model != self.model && !completion.model.is_empty() {
            debug!(
                "Server answered as {} (requested {})",
                completion.model, self.model
            );
        }

        Ok(Some(completion))
    }

    /// Grow the timeout budget by one increment and return the new value.
    fn extend_timeout(&self) -> Duration {
        let increment = self.timeout_increment.as_millis() as u64;
        let previous = self.timeout_ms.fetch_add(increment, Ordering::Relaxed);
        let extended = Duration::from_millis(previous + increment);
        Metrics::record_timeout_budget(extended);
        extended
    }
}

/// Remove every occurrence of the prompt from the generated text.
fn strip_echo(text: &str, prompt: &str) -> String {
    if prompt.is_empty() {
        return text.trim().to_string();
    }
    text.replace(prompt, "").trim().to_string()
}

fn select_model(models: Vec<Model>, wanted: Option<&str>, base_url: &str) -> Result<Model> {
    if let Some(wanted) = wanted {
        return models
            .into_iter()
            .find(|model| model.id == wanted)
            .ok_or_else(|| {
                ClientError::ModelNotFound {
                    model: wanted.to_string(),
                    base_url: base_url.to_string(),
                }
                .into()
            });
    }

    if models.len() > 1 {
        debug!(
            "Available models: {:?}",
            models.iter().map(|m| &m.id).collect::<Vec<_>>()
        );
    }

    models
        .into_iter()
        .next()
        .ok_or_else(|| ClientError::NoModels(base_url.to_string()).into())
}

async fn fetch_models(client: &Client, base_url: &str, timeout: Duration) -> Result<Vec<Model>> {
    let url = format!("{}/models", base_url);

    let response = client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ClientError::Connection(format!("Failed to query models endpoint: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response".to_string());
        return Err(ClientError::Http { status, message }.into());
    }

    let models_response: ModelsResponse = response
        .json()
        .await
        .map_err(|e| ClientError::Parse(format!("Failed to parse models response: {}", e)))?;

    Ok(models_response.data)
}

/// Wait for the server to become ready by polling `/v1/models`.
///
/// Useful when the inference server is started alongside the benchmark and
/// still loading weights. Returns an error once `total_timeout` elapses.
pub async fn check_server_ready(
    base_url: &str,
    total_timeout: Duration,
    retry_interval: Duration,
) -> Result<()> {
    let client = Client::builder().build()?;
    let start_time = Instant::now();
    let mut attempt = 0;

    info!("Waiting for server to be ready at {}...", base_url);

    loop {
        attempt += 1;

        debug!("Server readiness check attempt {}: GET {}/models", attempt, base_url);

        match fetch_models(&client, base_url, Duration::from_secs(10)).await {
            Ok(models) if !models.is_empty() => {
                info!(
                    "Server is ready ({} model{} available after {:.1}s)",
                    models.len(),
                    if models.len() == 1 { "" } else { "s" },
                    start_time.elapsed().as_secs_f64()
                );
                return Ok(());
            }
            Ok(_) => debug!("Models endpoint lists no models yet"),
            Err(e) => debug!("Models endpoint returned error: {}", e),
        }

        let elapsed = start_time.elapsed();
        let remaining = total_timeout.saturating_sub(elapsed);
        if remaining.is_zero() {
            anyhow::bail!(
                "Server readiness timeout after {:.1}s. Server at {} did not become ready.",
                total_timeout.as_secs_f64(),
                base_url
            );
        }

        tokio::time::sleep(retry_interval.min(remaining)).await;
    }
}
