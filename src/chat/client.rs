// client.rs — content-side chat facade: history, one-shot and streaming turns
use crate::bridge::{lock, BridgeService, SendOptions};
use crate::chat::conversation::{ChatTurn, ConversationStore, DEFAULT_CONVERSATION};
use crate::chat::service::{ChatRequest, ChatResponse, TestResult};
use crate::error::BridgeError;
use crate::message::{ContextId, MessageType, SenderInfo};
use crate::stream::{StreamClient, StreamObserver, StreamStart};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One user turn as the UI describes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOptions {
    pub text:            String,
    pub action:          String,
    pub provider:        Option<String>,
    pub conversation_id: String,
    /// Send prior turns of the conversation as context.
    pub include_history: bool,
    pub request_id:      Option<String>,
}

impl ChatOptions {
    pub fn new(text: impl Into<String>) -> Self {
        ChatOptions {
            text:            text.into(),
            action:          "chat".to_string(),
            provider:        None,
            conversation_id: DEFAULT_CONVERSATION.to_string(),
            include_history: true,
            request_id:      None,
        }
    }

    pub fn action(mut self, action: &str) -> Self {
        self.action = action.to_string();
        self
    }

    pub fn provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    pub fn conversation(mut self, id: &str) -> Self {
        self.conversation_id = id.to_string();
        self
    }

    pub fn without_history(mut self) -> Self {
        self.include_history = false;
        self
    }

    pub fn request_id(mut self, id: &str) -> Self {
        self.request_id = Some(id.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub content:         String,
    pub provider:        String,
    pub model:           String,
    pub conversation_id: String,
    /// The background dropped this call in favour of a newer one.
    pub cancelled:       bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStatus {
    pub available:          bool,
    pub conversation_count: usize,
    pub active_streams:     usize,
}

#[derive(Debug, Clone, Default)]
struct BookInfo {
    book:   Option<String>,
    author: Option<String>,
}

pub struct ChatClient {
    bridge:        Arc<BridgeService>,
    streams:       StreamClient,
    conversations: Arc<Mutex<ConversationStore>>,
    book:          Mutex<BookInfo>,
    available:     AtomicBool,
}

impl ChatClient {
    pub fn new(bridge: Arc<BridgeService>, book: Option<String>, author: Option<String>) -> Self {
        let me = SenderInfo { endpoint: bridge.endpoint(), context: bridge.context() };
        let streams = StreamClient::new(bridge.substrate().clone(), me);
        ChatClient {
            bridge,
            streams,
            conversations: Arc::new(Mutex::new(ConversationStore::new())),
            book:          Mutex::new(BookInfo { book, author }),
            available:     AtomicBool::new(true),
        }
    }

    pub fn set_book(&self, book: Option<String>, author: Option<String>) {
        *lock(&self.book) = BookInfo { book, author };
    }

    fn ensure_available(&self) -> Result<(), BridgeError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::Destroyed)
        }
    }

    fn build_request(&self, options: &ChatOptions) -> ChatRequest {
        let context = if options.include_history {
            self.conversation_history(&options.conversation_id)
        } else {
            Vec::new()
        };
        let book = lock(&self.book).clone();
        ChatRequest {
            provider:        options.provider.clone(),
            text:            options.text.clone(),
            action:          options.action.clone(),
            book:            book.book,
            author:          book.author,
            conversation_id: options.conversation_id.clone(),
            context,
            request_id:      options.request_id.clone(),
            ..Default::default()
        }
    }

    /// Whole-answer turn through `CHAT_REQUEST`. History gains the exchange
    /// only when an answer came back.
    pub async fn send_message(&self, options: ChatOptions) -> Result<ChatReply, BridgeError> {
        self.ensure_available()?;
        let request = self.build_request(&options);
        let data = self
            .bridge
            .send(MessageType::ChatRequest, serde_json::to_value(&request)?, SendOptions::to(ContextId::Background))
            .await?;
        let response: ChatResponse = serde_json::from_value(data)?;

        if !response.cancelled {
            lock(&self.conversations).append_exchange(&options.conversation_id, &options.text, &response.text);
        }
        Ok(ChatReply {
            content:         response.text,
            provider:        response.provider,
            model:           response.model,
            conversation_id: options.conversation_id,
            cancelled:       response.cancelled,
        })
    }

    /// Start a streaming turn; events go to `observer`. Returns the request
    /// id as soon as the stream is open.
    pub fn send_stream_message<O: StreamObserver>(&self, options: ChatOptions, observer: O) -> Result<String, BridgeError> {
        self.ensure_available()?;
        let request = self.build_request(&options);
        let recorder = HistoryRecorder {
            inner:           observer,
            conversations:   self.conversations.clone(),
            conversation_id: options.conversation_id,
            question:        options.text,
        };
        self.streams.open(request, recorder)
    }

    pub fn cancel_stream_request(&self, request_id: &str) -> bool {
        self.streams.cancel(request_id)
    }

    pub fn conversation_history(&self, conversation_id: &str) -> Vec<ChatTurn> {
        lock(&self.conversations).history(conversation_id)
    }

    pub fn add_to_conversation(&self, conversation_id: &str, turn: ChatTurn) {
        lock(&self.conversations).append(conversation_id, turn);
    }

    pub fn clear_conversation(&self, conversation_id: &str) -> bool {
        lock(&self.conversations).clear(conversation_id)
    }

    pub fn clear_all_conversations(&self) {
        lock(&self.conversations).clear_all();
    }

    /// Ask the background to validate a key without touching stored settings.
    pub async fn test_api_key(
        &self,
        provider: &str,
        api_key:  Option<&str>,
        model:    Option<&str>,
    ) -> Result<TestResult, BridgeError> {
        self.ensure_available()?;
        let data = self
            .bridge
            .send(
                MessageType::TestApiKey,
                json!({ "provider": provider, "apiKey": api_key, "model": model }),
                SendOptions::to(ContextId::Background),
            )
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    pub fn status(&self) -> ChatStatus {
        ChatStatus {
            available:          self.available.load(Ordering::SeqCst),
            conversation_count: lock(&self.conversations).len(),
            active_streams:     self.streams.active().len(),
        }
    }

    /// Cancel every stream and forget all history. The bridge itself belongs
    /// to the caller.
    pub fn destroy(&self) {
        if !self.available.swap(false, Ordering::SeqCst) {
            return;
        }
        self.streams.cancel_all();
        lock(&self.conversations).clear_all();
        log::info!("ChatClient destroyed");
    }
}

/// Writes the exchange to history once the stream completes, then forwards.
struct HistoryRecorder<O> {
    inner:           O,
    conversations:   Arc<Mutex<ConversationStore>>,
    conversation_id: String,
    question:        String,
}

impl<O: StreamObserver> StreamObserver for HistoryRecorder<O> {
    fn on_start(&mut self, start: &StreamStart) {
        self.inner.on_start(start);
    }

    fn on_chunk(&mut self, text: &str) {
        self.inner.on_chunk(text);
    }

    fn on_complete(&mut self, full_text: &str) {
        lock(&self.conversations).append_exchange(&self.conversation_id, &self.question, full_text);
        self.inner.on_complete(full_text);
    }

    fn on_error(&mut self, error: &str) {
        self.inner.on_error(error);
    }
}
