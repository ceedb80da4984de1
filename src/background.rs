// background.rs — the background worker: chat handlers, stream relay, settings fan-out
use crate::bridge::{lock, BridgeService, BroadcastSummary};
use crate::chat::service::{ChatRequest, ChatResponse, ChatService, Outcome};
use crate::error::BridgeError;
use crate::message::{ContextId, MessageType, CHAT_REQUEST_STREAM};
use crate::stream;
use crate::substrate::SharedSubstrate;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestKeyRequest {
    provider: String,
    #[serde(default)]
    api_key:  Option<String>,
    #[serde(default)]
    model:    Option<String>,
}

pub struct MessageRouter {
    bridge: Arc<BridgeService>,
    chat:   Arc<ChatService>,
    relay:  Mutex<Option<JoinHandle<()>>>,
}

impl MessageRouter {
    pub fn new(substrate: SharedSubstrate, chat: Arc<ChatService>) -> Result<Self, BridgeError> {
        let bridge = Arc::new(BridgeService::new(ContextId::Background, substrate.clone()));

        let handler_chat = chat.clone();
        bridge.register(MessageType::ChatRequest, move |data, sender| {
            let chat = handler_chat.clone();
            async move {
                let request: ChatRequest = serde_json::from_value(data)?;
                log::info!(
                    "CHAT_REQUEST from {} endpoint {}: provider={:?} action={} test={}",
                    sender.context, sender.endpoint, request.provider, request.action, request.is_test
                );
                if request.is_test {
                    let provider = chat.resolve_provider(request.provider.as_deref()).await?;
                    let result = chat
                        .test_api_connection(provider.id(), request.api_key.as_deref(), request.model.as_deref())
                        .await?;
                    return Ok(serde_json::to_value(result)?);
                }
                let response = match chat.process_request(&request).await? {
                    Outcome::Done(response) => response,
                    Outcome::Cancelled => ChatResponse {
                        action:          request.action.clone(),
                        conversation_id: request.conversation_id.clone(),
                        cancelled:       true,
                        ..Default::default()
                    },
                };
                Ok(serde_json::to_value(response)?)
            }
        });

        let handler_chat = chat.clone();
        bridge.register(MessageType::TestApiKey, move |data, _| {
            let chat = handler_chat.clone();
            async move {
                let request: TestKeyRequest = serde_json::from_value(data)?;
                log::info!("TEST_API_KEY: provider={} model={:?}", request.provider, request.model);
                let result = chat
                    .test_api_connection(&request.provider, request.api_key.as_deref(), request.model.as_deref())
                    .await?;
                Ok(serde_json::to_value(result)?)
            }
        });

        let incoming = substrate.listen(bridge.endpoint(), CHAT_REQUEST_STREAM)?;
        let relay = stream::serve_streams(chat.clone(), incoming);

        log::info!("MessageRouter ready");
        Ok(MessageRouter { bridge, chat, relay: Mutex::new(Some(relay)) })
    }

    pub fn bridge(&self) -> &Arc<BridgeService> {
        &self.bridge
    }

    pub fn chat(&self) -> &Arc<ChatService> {
        &self.chat
    }

    /// Tell every content context that settings changed.
    pub async fn notify_settings_changed(&self, changes: Value) -> Result<BroadcastSummary, BridgeError> {
        let summary = self.bridge.broadcast(MessageType::SettingsChanged, changes).await?;
        log::info!(
            "SETTINGS_CHANGED delivered to {} content context(s), {} failed",
            summary.delivered, summary.failed
        );
        Ok(summary)
    }

    pub fn destroy(&self) {
        if let Some(relay) = lock(&self.relay).take() {
            relay.abort();
        }
        for id in self.chat.in_flight() {
            self.chat.abort(&id);
        }
        self.bridge.destroy();
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.destroy();
    }
}
