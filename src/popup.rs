// popup.rs — the popup context: key testing and settings editing
use crate::bridge::{BridgeService, SendOptions};
use crate::chat::service::TestResult;
use crate::error::BridgeError;
use crate::message::{ContextId, EndpointId, MessageType};
use crate::settings::SettingsMap;
use crate::substrate::SharedSubstrate;
use serde_json::{json, Value};

pub struct PopupBridge {
    bridge: BridgeService,
}

impl PopupBridge {
    pub fn new(substrate: SharedSubstrate) -> Self {
        PopupBridge { bridge: BridgeService::new(ContextId::Popup, substrate) }
    }

    pub fn bridge(&self) -> &BridgeService {
        &self.bridge
    }

    /// Content contexts that can serve settings requests, oldest first.
    pub fn content_tabs(&self) -> Vec<EndpointId> {
        self.bridge.substrate().peers(ContextId::Content)
    }

    /// Validate a key through the background. Failures come back as an
    /// unsuccessful result carrying the error text, ready to show.
    pub async fn test_api_connection(&self, provider: &str, api_key: Option<&str>, model: Option<&str>) -> TestResult {
        let sent = self
            .bridge
            .send(
                MessageType::TestApiKey,
                json!({ "provider": provider, "apiKey": api_key, "model": model }),
                SendOptions::to(ContextId::Background),
            )
            .await;
        let outcome = sent.and_then(|data| serde_json::from_value::<TestResult>(data).map_err(BridgeError::from));
        match outcome {
            Ok(result) => result,
            Err(e) => {
                log::warn!("popup: {} key test failed: {}", provider, e);
                TestResult {
                    success: false,
                    message: e.to_string(),
                    model:   model.unwrap_or_default().to_string(),
                    ..Default::default()
                }
            }
        }
    }

    pub async fn get_settings(&self, tab: EndpointId, keys: &[&str]) -> Result<SettingsMap, BridgeError> {
        let data = self
            .bridge
            .send(MessageType::SettingsGet, json!({ "keys": keys }), SendOptions::to(ContextId::Content).destination(tab))
            .await?;
        match data {
            Value::Object(map) => Ok(map),
            other => Err(BridgeError::Codec(format!("settings reply is not an object: {}", other))),
        }
    }

    /// Persist through `tab`, then tell that tab its settings changed.
    pub async fn save_settings(&self, tab: EndpointId, settings: SettingsMap) -> Result<(), BridgeError> {
        let options = SendOptions::to(ContextId::Content).destination(tab);
        self.bridge
            .send(MessageType::SettingsSet, json!({ "settings": settings }), options.clone())
            .await?;
        self.bridge
            .send(MessageType::SettingsChanged, Value::Object(settings), options)
            .await?;
        log::info!("popup: settings saved via endpoint {}", tab);
        Ok(())
    }

    pub async fn page_status(&self, tab: EndpointId) -> Result<Value, BridgeError> {
        self.bridge
            .send(MessageType::SystemStatus, json!({}), SendOptions::to(ContextId::Content).destination(tab))
            .await
    }
}
