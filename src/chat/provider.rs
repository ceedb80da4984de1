// provider.rs — per-provider adapters and the built-in catalogue
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_PROVIDER: &str = "qianwen";

/// Everything that differs between chat-completion vendors.
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> &str;
    /// Display name used in user-facing messages.
    fn name(&self) -> &str;
    fn url(&self) -> &str;
    fn default_model(&self) -> &str;

    fn build_headers(&self, api_key: &str, stream: bool) -> Result<HeaderMap, InvalidHeaderValue> {
        bearer_headers(api_key, stream)
    }

    /// Answer text of a whole (non-streaming) response.
    fn extract_content(&self, body: &Value) -> Option<String> {
        let choice = &body["choices"][0];
        choice["message"]["content"]
            .as_str()
            .or_else(|| choice["text"].as_str())
            .map(str::to_string)
    }

    /// Text delta carried by one decoded SSE payload.
    fn parse_stream_chunk(&self, payload: &Value) -> Option<String> {
        payload["choices"][0]["delta"]["content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

pub fn bearer_headers(api_key: &str, stream: bool) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", api_key))?);
    let accept = if stream { "text/event-stream" } else { "application/json" };
    headers.insert(ACCEPT, HeaderValue::from_static(accept));
    Ok(headers)
}

// ── OpenAI-compatible endpoint ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiCompatible {
    id:            String,
    name:          String,
    url:           String,
    default_model: String,
    /// Extra header that repeats the key (some gateways want both).
    key_header:    Option<&'static str>,
}

impl OpenAiCompatible {
    pub fn new(id: &str, name: &str, url: &str, default_model: &str) -> Self {
        OpenAiCompatible {
            id:            id.to_string(),
            name:          name.to_string(),
            url:           url.to_string(),
            default_model: default_model.to_string(),
            key_header:    None,
        }
    }

    pub fn with_key_header(mut self, header: &'static str) -> Self {
        self.key_header = Some(header);
        self
    }
}

impl ProviderAdapter for OpenAiCompatible {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn build_headers(&self, api_key: &str, stream: bool) -> Result<HeaderMap, InvalidHeaderValue> {
        let mut headers = bearer_headers(api_key, stream)?;
        if let Some(name) = self.key_header {
            headers.insert(HeaderName::from_static(name), HeaderValue::from_str(api_key)?);
        }
        Ok(headers)
    }
}

// ── Registry ────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The vendors the reader ships with.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.insert(
            OpenAiCompatible::new(
                "wenxin",
                "Wenxin",
                "https://qianfan.baidubce.com/v2/chat/completions",
                "ernie-4.5-turbo-128k",
            )
            .with_key_header("api-key"),
        );
        registry.insert(OpenAiCompatible::new(
            "qianwen",
            "Qianwen",
            "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions",
            "qwen-turbo",
        ));
        registry.insert(OpenAiCompatible::new(
            "doubao",
            "Doubao",
            "https://ark.cn-beijing.volces.com/api/v3/chat/completions",
            "doubao-1-5-pro-256k-250115",
        ));
        registry.insert(OpenAiCompatible::new(
            "kimi",
            "Kimi",
            "https://api.moonshot.cn/v1/chat/completions",
            "moonshot-v1-8k",
        ));
        registry.insert(OpenAiCompatible::new(
            "minimax",
            "MiniMax",
            "https://api.minimax.chat/v1/text/chatcompletion_v2",
            "MiniMax-M2.1-lightning",
        ));
        registry.insert(OpenAiCompatible::new(
            "zhipu",
            "Zhipu",
            "https://open.bigmodel.cn/api/paas/v4/chat/completions",
            "glm-4-flash",
        ));
        registry.insert(OpenAiCompatible::new(
            "deepseek",
            "DeepSeek",
            "https://api.deepseek.com/v1/chat/completions",
            "deepseek-chat",
        ));
        registry
    }

    /// Add or replace an adapter under its own id.
    pub fn insert(&mut self, adapter: impl ProviderAdapter + 'static) {
        self.adapters.insert(adapter.id().to_string(), Arc::new(adapter));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
