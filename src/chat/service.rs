// service.rs — background side of chat: config, prompts, provider HTTP, cancellation
use crate::bridge::{lock, DEFAULT_TIMEOUT};
use crate::chat::config::{self, ConfigOverrides, EffectiveConfig};
use crate::chat::conversation::{ChatTurn, DEFAULT_CONVERSATION};
use crate::chat::prompt::{self, Prompts};
use crate::chat::provider::{ProviderAdapter, ProviderRegistry, DEFAULT_PROVIDER};
use crate::chat::sse::{SseDecoder, SseFrame};
use crate::message::now_millis;
use crate::settings::{SettingsStore, API_KEYS, CURRENT_PROVIDER, MODELS, TEMPERATURES};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatRequest {
    /// None = `currentProvider` from settings, else the default provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider:        Option<String>,
    pub text:            String,
    pub action:          String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book:            Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author:          Option<String>,
    pub conversation_id: String,
    pub context:         Vec<ChatTurn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id:      Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key:         Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model:           Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature:     Option<f64>,
    pub is_test:         bool,
}

impl Default for ChatRequest {
    fn default() -> Self {
        ChatRequest {
            provider:        None,
            text:            String::new(),
            action:          "chat".to_string(),
            book:            None,
            author:          None,
            conversation_id: DEFAULT_CONVERSATION.to_string(),
            context:         Vec::new(),
            request_id:      None,
            api_key:         None,
            model:           None,
            temperature:     None,
            is_test:         false,
        }
    }
}

impl ChatRequest {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            api_key:     self.api_key.clone(),
            model:       self.model.clone(),
            temperature: self.temperature,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatResponse {
    pub text:            String,
    pub provider:        String,
    pub action:          String,
    pub model:           String,
    pub conversation_id: String,
    /// Superseded by a newer call with the same request id; `text` is empty.
    pub cancelled:       bool,
    pub timestamp:       i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestResult {
    pub success:  bool,
    pub message:  String,
    /// First 50 characters of the provider's answer.
    pub response: String,
    pub model:    String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("please configure an API key for {0} first")]
    MissingApiKey(String),
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("settings unavailable: {0}")]
    Settings(String),
}

/// Result of a call that can be aborted. Abort is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Done(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Done(v)   => Outcome::Done(f(v)),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

/// A request with its provider, config and prompts settled; ready to send.
#[derive(Clone)]
pub struct PreparedRequest {
    pub provider: Arc<dyn ProviderAdapter>,
    pub config:   EffectiveConfig,
    pub prompts:  Prompts,
}

// ── HTTP helpers ────────────────────────────────────────────────────────

/// No overall timeout: streamed answers may run for many minutes. Whole-body
/// calls get their own bound in `execute`.
pub fn http_client() -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
}

pub fn build_request_body(config: &EffectiveConfig, prompts: &Prompts, stream: bool) -> Value {
    let mut body = json!({
        "model": config.model,
        "messages": [
            { "role": "system", "content": prompts.system },
            { "role": "user",   "content": prompts.user },
        ],
        "stream": stream,
    });
    if let Some(t) = config.temperature {
        body["temperature"] = json!(t);
    }
    body
}

fn api_error(status: u16, body: &str) -> ChatError {
    let json: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let message = json["error"]["message"]
        .as_str()
        .or_else(|| json["message"].as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("API Error: {}", status));
    ChatError::Api { status, message }
}

/// Resolves once the token is set. A dropped sender that never fired means
/// nobody can cancel any more.
async fn cancelled(token: &mut watch::Receiver<bool>) {
    loop {
        if *token.borrow_and_update() {
            return;
        }
        if token.changed().await.is_err() {
            if *token.borrow() {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}

// ── Abort handles ───────────────────────────────────────────────────────

struct AbortSlot {
    generation: u64,
    cancel:     watch::Sender<bool>,
}

/// Live cancellation token of one outbound call. Dropping it removes the
/// abort handle, unless a newer call has already taken the same request id.
pub struct AbortGuard<'a> {
    service:    &'a ChatService,
    request_id: Option<String>,
    generation: u64,
    cancel:     watch::Receiver<bool>,
    _own:       Option<watch::Sender<bool>>,
}

impl AbortGuard<'_> {
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        let Some(id) = &self.request_id else { return };
        let mut aborts = lock(&self.service.aborts);
        if aborts.get(id).map_or(false, |slot| slot.generation == self.generation) {
            aborts.remove(id);
        }
    }
}

// ── ChatService ─────────────────────────────────────────────────────────

pub struct ChatService {
    client:          Client,
    registry:        ProviderRegistry,
    settings:        Arc<dyn SettingsStore>,
    aborts:          Mutex<HashMap<String, AbortSlot>>,
    next_generation: AtomicU64,
    request_timeout: Duration,
}

impl ChatService {
    pub fn new(settings: Arc<dyn SettingsStore>, registry: ProviderRegistry) -> anyhow::Result<Self> {
        Ok(ChatService {
            client: http_client()?,
            registry,
            settings,
            aborts: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            request_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Bound for non-streaming provider calls; defaults to the bridge's
    /// request timeout, past which nobody is waiting for the answer.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    // ── Config ───────────────────────────────────────────────────────────

    pub async fn resolve_provider(&self, requested: Option<&str>) -> Result<Arc<dyn ProviderAdapter>, ChatError> {
        let id = match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                let stored = self
                    .settings
                    .get(&[CURRENT_PROVIDER])
                    .await
                    .map_err(|e| ChatError::Settings(e.to_string()))?;
                stored
                    .get(CURRENT_PROVIDER)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_PROVIDER)
                    .to_string()
            }
        };
        self.registry.get(&id).ok_or(ChatError::UnknownProvider(id))
    }

    /// `override > stored > default` for one provider.
    pub async fn effective_config(&self, provider: &str, overrides: &ConfigOverrides) -> Result<EffectiveConfig, ChatError> {
        let adapter = self
            .registry
            .get(provider)
            .ok_or_else(|| ChatError::UnknownProvider(provider.to_string()))?;
        self.load_config(adapter.as_ref(), overrides).await
    }

    async fn load_config(&self, provider: &dyn ProviderAdapter, overrides: &ConfigOverrides) -> Result<EffectiveConfig, ChatError> {
        let stored = self
            .settings
            .get(&[API_KEYS, MODELS, TEMPERATURES])
            .await
            .map_err(|e| ChatError::Settings(e.to_string()))?;
        Ok(config::resolve(&stored, provider, overrides))
    }

    /// Provider, config and prompts for `request`. Fails before any network
    /// activity when no API key is available.
    pub async fn prepare(&self, request: &ChatRequest) -> Result<PreparedRequest, ChatError> {
        let provider = self.resolve_provider(request.provider.as_deref()).await?;
        let config = self.load_config(provider.as_ref(), &request.overrides()).await?;
        if config.api_key.is_none() {
            return Err(ChatError::MissingApiKey(provider.name().to_string()));
        }
        let prompts = prompt::build_prompts(
            &request.action,
            &request.text,
            request.book.as_deref(),
            request.author.as_deref(),
            &request.context,
        );
        Ok(PreparedRequest { provider, config, prompts })
    }

    // ── Abort handles ────────────────────────────────────────────────────

    /// Install the abort handle for a call. A live call with the same id is
    /// aborted and replaced. Without an id the call can't be aborted.
    pub fn begin(&self, request_id: Option<&str>) -> AbortGuard<'_> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = watch::channel(false);
        let Some(id) = request_id else {
            return AbortGuard { service: self, request_id: None, generation, cancel: rx, _own: Some(tx) };
        };

        let previous = lock(&self.aborts).insert(id.to_string(), AbortSlot { generation, cancel: tx });
        if let Some(previous) = previous {
            log::info!("ChatService: request {} superseded, aborting the earlier call", id);
            previous.cancel.send_replace(true);
        }
        AbortGuard { service: self, request_id: Some(id.to_string()), generation, cancel: rx, _own: None }
    }

    /// Abort the call registered under `request_id`. False when none is in flight.
    pub fn abort(&self, request_id: &str) -> bool {
        let Some(slot) = lock(&self.aborts).remove(request_id) else {
            return false;
        };
        log::info!("ChatService: aborting request {}", request_id);
        slot.cancel.send_replace(true);
        true
    }

    /// Abort `request_id` only while `generation` still owns it, so a caller
    /// holding a superseded handle cannot cancel the call that replaced it.
    pub fn abort_generation(&self, request_id: &str, generation: u64) -> bool {
        let slot = {
            let mut aborts = lock(&self.aborts);
            let owned = aborts.get(request_id).map_or(false, |slot| slot.generation == generation);
            if owned { aborts.remove(request_id) } else { None }
        };
        let Some(slot) = slot else { return false };
        log::info!("ChatService: aborting request {}", request_id);
        slot.cancel.send_replace(true);
        true
    }

    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.aborts).keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    // ── Requests ─────────────────────────────────────────────────────────

    /// Send a prepared request. Streaming calls hand every text delta to
    /// `on_chunk` and resolve with the concatenation. Cancellation is checked
    /// before each read and before each delta.
    pub async fn execute<F>(
        &self,
        prepared: &PreparedRequest,
        stream:   bool,
        guard:    &AbortGuard<'_>,
        mut on_chunk: F,
    ) -> Result<Outcome<String>, ChatError>
    where
        F: FnMut(&str) + Send,
    {
        let mut cancel = guard.cancel.clone();
        let PreparedRequest { provider, config, prompts } = prepared;
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| ChatError::MissingApiKey(provider.name().to_string()))?;
        let headers = provider
            .build_headers(api_key, stream)
            .map_err(|e| ChatError::Network(format!("invalid header value: {}", e)))?;
        let body = build_request_body(config, prompts, stream);

        log::info!(
            "ChatService → {} model={} stream={} request_id={:?}",
            provider.id(), config.model, stream, guard.request_id()
        );

        let mut builder = self.client.post(provider.url()).headers(headers).json(&body);
        if !stream {
            builder = builder.timeout(self.request_timeout);
        }
        let send = builder.send();
        let resp = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return Ok(Outcome::Cancelled),
            resp = send => resp.map_err(|e| ChatError::Network(e.to_string()))?,
        };

        let status = resp.status();
        if !status.is_success() {
            let text = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Ok(Outcome::Cancelled),
                text = resp.text() => text.unwrap_or_default(),
            };
            let err = api_error(status.as_u16(), &text);
            log::warn!("ChatService ← {} {}: {}", provider.id(), status.as_u16(), err);
            return Err(err);
        }

        if !stream {
            let text = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Ok(Outcome::Cancelled),
                text = resp.text() => text.map_err(|e| ChatError::Network(e.to_string()))?,
            };
            let json: Value = serde_json::from_str(&text).map_err(|e| ChatError::Decode(e.to_string()))?;
            return provider
                .extract_content(&json)
                .map(Outcome::Done)
                .ok_or_else(|| ChatError::Decode("response carries no message content".into()));
        }

        let mut body = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut full = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Ok(Outcome::Cancelled),
                next = body.next() => next,
            };
            let (frames, eof) = match next {
                Some(Ok(bytes)) => (decoder.push(&bytes), false),
                Some(Err(e))    => return Err(ChatError::Network(format!("stream read failed: {}", e))),
                None            => (decoder.finish(), true),
            };
            for frame in frames {
                match frame {
                    SseFrame::Done => return Ok(Outcome::Done(full)),
                    SseFrame::Data(payload) => {
                        let Some(delta) = provider.parse_stream_chunk(&payload) else { continue };
                        if *cancel.borrow() {
                            return Ok(Outcome::Cancelled);
                        }
                        full.push_str(&delta);
                        on_chunk(&delta);
                    }
                }
            }
            if eof {
                return Ok(Outcome::Done(full));
            }
        }
    }

    /// Non-streaming chat turn. A call superseded by a newer one with the
    /// same request id resolves as `Outcome::Cancelled`.
    pub async fn process_request(&self, request: &ChatRequest) -> Result<Outcome<ChatResponse>, ChatError> {
        let prepared = self.prepare(request).await?;
        let guard = self.begin(request.request_id.as_deref());
        let outcome = self.execute(&prepared, false, &guard, |_| {}).await?;
        Ok(outcome.map(|text| ChatResponse {
            text,
            provider:        prepared.provider.id().to_string(),
            action:          request.action.clone(),
            model:           prepared.config.model.clone(),
            conversation_id: request.conversation_id.clone(),
            cancelled:       false,
            timestamp:       now_millis(),
        }))
    }

    /// Validate a key/model pair with a minimal request through the same
    /// config and body path as real chat.
    pub async fn test_api_connection(
        &self,
        provider: &str,
        api_key:  Option<&str>,
        model:    Option<&str>,
    ) -> Result<TestResult, ChatError> {
        let adapter = self
            .registry
            .get(provider)
            .ok_or_else(|| ChatError::UnknownProvider(provider.to_string()))?;
        let overrides = ConfigOverrides {
            api_key:     api_key.map(str::to_string),
            model:       model.map(str::to_string),
            temperature: None,
        };
        let config = self.load_config(adapter.as_ref(), &overrides).await?;
        if config.api_key.is_none() {
            return Err(ChatError::MissingApiKey(adapter.name().to_string()));
        }

        let prepared = PreparedRequest { provider: adapter, config, prompts: prompt::connection_test_prompts() };
        let guard = self.begin(None);
        let answer = match self.execute(&prepared, false, &guard, |_| {}).await? {
            Outcome::Done(text) => text,
            Outcome::Cancelled  => return Err(ChatError::Network("connection test was cancelled".into())),
        };

        let effective = prepared.config.model.clone();
        let message = match model {
            Some(typed) if typed != effective => {
                format!("API connection test succeeded (model {:?} was used as {})", typed, effective)
            }
            _ => "API connection test succeeded".to_string(),
        };
        log::info!("ChatService: {} connection test ok, model={}", provider, effective);
        Ok(TestResult {
            success:  true,
            message,
            response: answer.chars().take(50).collect(),
            model:    effective,
        })
    }
}
