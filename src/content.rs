// content.rs — the content-script context: chat facade plus settings relay for the popup
use crate::bridge::{lock, BridgeService};
use crate::chat::client::ChatClient;
use crate::message::{ContextId, MessageType};
use crate::settings::{SettingsMap, SettingsStore};
use crate::substrate::SharedSubstrate;
use anyhow::Context;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

pub struct ContentBridge {
    bridge: Arc<BridgeService>,
    chat:   Arc<ChatClient>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SettingsMap>>>,
}

fn as_object(value: Value, what: &str) -> anyhow::Result<SettingsMap> {
    match value {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("{} must be an object, got {}", what, other),
    }
}

impl ContentBridge {
    pub fn new(
        substrate: SharedSubstrate,
        settings:  Arc<dyn SettingsStore>,
        book:      Option<String>,
        author:    Option<String>,
    ) -> Self {
        let bridge = Arc::new(BridgeService::new(ContextId::Content, substrate));
        let chat = Arc::new(ChatClient::new(bridge.clone(), book, author));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        bridge.register(MessageType::SettingsChanged, move |data, sender| {
            let events = events_tx.clone();
            async move {
                let changes = as_object(data, "settings change")?;
                log::info!(
                    "SETTINGS_CHANGED from {}: {:?}",
                    sender.context,
                    changes.keys().collect::<Vec<_>>()
                );
                // Nobody listening is fine: the UI may not have subscribed.
                let _ = events.send(changes);
                Ok(json!({ "received": true }))
            }
        });

        let store = settings.clone();
        bridge.register(MessageType::SettingsGet, move |data, _| {
            let store = store.clone();
            async move {
                let keys: Vec<String> = match data.get("keys") {
                    Some(keys) => serde_json::from_value(keys.clone()).context("keys must be a list of strings")?,
                    None => Vec::new(),
                };
                let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
                Ok(Value::Object(store.get(&keys).await?))
            }
        });

        let store = settings;
        bridge.register(MessageType::SettingsSet, move |data, _| {
            let store = store.clone();
            async move {
                let values = as_object(data.get("settings").cloned().unwrap_or(Value::Null), "settings")?;
                let count = values.len();
                store.set(values).await?;
                log::info!("SETTINGS_SET: {} key(s) saved", count);
                Ok(json!({ "saved": count }))
            }
        });

        let weak_chat: Weak<ChatClient> = Arc::downgrade(&chat);
        let endpoint = bridge.endpoint();
        bridge.register(MessageType::SystemStatus, move |_, _| {
            let chat = weak_chat.upgrade();
            async move {
                let chat = chat.context("chat client is gone")?;
                Ok(json!({
                    "context":  ContextId::Content,
                    "endpoint": endpoint,
                    "chat":     chat.status(),
                }))
            }
        });

        ContentBridge { bridge, chat, events: Mutex::new(Some(events_rx)) }
    }

    pub fn bridge(&self) -> &Arc<BridgeService> {
        &self.bridge
    }

    pub fn chat(&self) -> &Arc<ChatClient> {
        &self.chat
    }

    /// Settings changes pushed by the background or popup. Can be taken once.
    pub fn settings_events(&self) -> Option<mpsc::UnboundedReceiver<SettingsMap>> {
        lock(&self.events).take()
    }

    /// Whether the background worker answers.
    pub async fn is_connected(&self) -> bool {
        self.bridge.health_check(ContextId::Background, None).await
    }

    pub fn destroy(&self) {
        self.chat.destroy();
        self.bridge.destroy();
    }
}
