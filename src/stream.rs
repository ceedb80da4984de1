// stream.rs — streaming chat over persistent ports
//
// Protocol on one port, all frames tagged with the request id:
//   client → background: the ChatRequest
//   background → client: start, chunk*, then exactly one of complete | error
// The client disconnecting is the cancel signal; the relay turns it into an
// abort of the provider call.
use crate::bridge::lock;
use crate::chat::service::{AbortGuard, ChatError, ChatRequest, ChatService, Outcome};
use crate::error::BridgeError;
use crate::message::{SenderInfo, CHAT_REQUEST_STREAM};
use crate::substrate::{Port, PortReceiver, PortSender, SharedSubstrate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DISCONNECTED: &str = "stream disconnected before completion";

pub fn new_request_id() -> String {
    format!("stream_{}", uuid::Uuid::new_v4().simple())
}

// ── Events ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub request_id:      String,
    pub provider:        String,
    pub action:          String,
    pub model:           String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Start(StreamStart),
    Chunk {
        #[serde(rename = "requestId")]
        request_id: String,
        text:       String,
    },
    Complete {
        #[serde(rename = "requestId")]
        request_id: String,
    },
    Error {
        #[serde(rename = "requestId")]
        request_id: String,
        error:      String,
    },
}

impl StreamEvent {
    pub fn request_id(&self) -> &str {
        match self {
            StreamEvent::Start(s)                 => &s.request_id,
            StreamEvent::Chunk { request_id, .. } => request_id,
            StreamEvent::Complete { request_id }  => request_id,
            StreamEvent::Error { request_id, .. } => request_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }
}

/// Callbacks of one stream. At most one of `on_complete` / `on_error` fires,
/// and none fire after the stream was cancelled.
pub trait StreamObserver: Send + 'static {
    fn on_start(&mut self, _start: &StreamStart) {}
    fn on_chunk(&mut self, _text: &str) {}
    fn on_complete(&mut self, _full_text: &str) {}
    fn on_error(&mut self, _error: &str) {}
}

/// Observer callbacks as values, for callers that prefer a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Started(StreamStart),
    Chunk(String),
    Completed(String),
    Failed(String),
}

impl StreamObserver for mpsc::UnboundedSender<StreamUpdate> {
    fn on_start(&mut self, start: &StreamStart) {
        let _ = self.send(StreamUpdate::Started(start.clone()));
    }

    fn on_chunk(&mut self, text: &str) {
        let _ = self.send(StreamUpdate::Chunk(text.to_string()));
    }

    fn on_complete(&mut self, full_text: &str) {
        let _ = self.send(StreamUpdate::Completed(full_text.to_string()));
    }

    fn on_error(&mut self, error: &str) {
        let _ = self.send(StreamUpdate::Failed(error.to_string()));
    }
}

// ── Client side ─────────────────────────────────────────────────────────

struct Session {
    conversation_id: String,
    port:            PortSender,
    reader:          JoinHandle<()>,
}

#[derive(Default)]
struct SessionTable {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionTable {
    fn contains(&self, request_id: &str) -> bool {
        lock(&self.sessions).contains_key(request_id)
    }

    fn remove(&self, request_id: &str) -> Option<Session> {
        lock(&self.sessions).remove(request_id)
    }

    fn in_conversation(&self, conversation_id: &str) -> Vec<String> {
        lock(&self.sessions)
            .iter()
            .filter(|(_, s)| s.conversation_id == conversation_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        ids.sort_unstable();
        ids
    }
}

/// Streaming sessions of one content context.
pub struct StreamClient {
    substrate: SharedSubstrate,
    me:        SenderInfo,
    sessions:  Arc<SessionTable>,
}

impl StreamClient {
    pub fn new(substrate: SharedSubstrate, me: SenderInfo) -> Self {
        StreamClient { substrate, me, sessions: Arc::new(SessionTable::default()) }
    }

    /// Open a stream for `request` and return its request id once the port is
    /// up. Any active stream of the same conversation is cancelled first.
    pub fn open<O: StreamObserver>(&self, mut request: ChatRequest, observer: O) -> Result<String, BridgeError> {
        let request_id = request.request_id.get_or_insert_with(new_request_id).clone();

        self.cancel(&request_id);
        for stale in self.sessions.in_conversation(&request.conversation_id) {
            log::info!(
                "stream {} replaced by {} in conversation {}",
                stale, request_id, request.conversation_id
            );
            self.cancel(&stale);
        }

        let port = self.substrate.connect(self.me, CHAT_REQUEST_STREAM)?;
        let (tx, rx) = port.split();
        tx.post_message(serde_json::to_value(&request)?)?;

        // Insert before the reader can observe anything about its session.
        let mut sessions = lock(&self.sessions.sessions);
        let reader = tokio::spawn(read_session(
            request_id.clone(),
            rx,
            tx.clone(),
            self.sessions.clone(),
            observer,
        ));
        sessions.insert(request_id.clone(), Session {
            conversation_id: request.conversation_id.clone(),
            port:            tx,
            reader,
        });
        drop(sessions);

        log::info!("stream {} opened ({} chars)", request_id, request.text.chars().count());
        Ok(request_id)
    }

    /// Stop delivering events for `request_id` and close its port. False when
    /// no such stream is active.
    pub fn cancel(&self, request_id: &str) -> bool {
        let Some(session) = self.sessions.remove(request_id) else {
            return false;
        };
        session.reader.abort();
        session.port.disconnect();
        log::info!("stream {} cancelled", request_id);
        true
    }

    pub fn cancel_all(&self) {
        for id in self.sessions.ids() {
            self.cancel(&id);
        }
    }

    pub fn active(&self) -> Vec<String> {
        self.sessions.ids()
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn read_session<O: StreamObserver>(
    request_id:   String,
    mut rx:       PortReceiver,
    port:         PortSender,
    sessions:     Arc<SessionTable>,
    mut observer: O,
) {
    let mut full = String::new();
    let mut started = false;

    let outcome: Result<(), String> = loop {
        let Some(frame) = rx.recv().await else {
            break Err(DISCONNECTED.to_string());
        };
        let event: StreamEvent = match serde_json::from_value(frame) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("stream {}: dropping undecodable frame: {}", request_id, e);
                continue;
            }
        };
        if event.request_id() != request_id {
            log::debug!("stream {}: ignoring event for {}", request_id, event.request_id());
            continue;
        }
        if !sessions.contains(&request_id) {
            return;
        }
        match event {
            StreamEvent::Start(start) => {
                started = true;
                observer.on_start(&start);
            }
            StreamEvent::Chunk { text, .. } => {
                if !started {
                    log::warn!("stream {}: chunk before start", request_id);
                }
                full.push_str(&text);
                observer.on_chunk(&text);
            }
            StreamEvent::Complete { .. } => break Ok(()),
            StreamEvent::Error { error, .. } => break Err(error),
        }
    };

    port.disconnect();
    // Gone already means cancelled: stay silent.
    if sessions.remove(&request_id).is_none() {
        return;
    }
    match outcome {
        Ok(()) => {
            log::info!("stream {} complete ({} chars)", request_id, full.chars().count());
            observer.on_complete(&full);
        }
        Err(e) => {
            log::warn!("stream {} failed: {}", request_id, e);
            observer.on_error(&e);
        }
    }
}

// ── Background relay ────────────────────────────────────────────────────

/// Serve every stream port accepted on `incoming`, one task per port.
pub fn serve_streams(chat: Arc<ChatService>, mut incoming: mpsc::UnboundedReceiver<Port>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(port) = incoming.recv().await {
            log::debug!("stream port opened by {} endpoint {}", port.peer.context, port.peer.endpoint);
            tokio::spawn(relay(chat.clone(), port));
        }
    })
}

fn emit(tx: &PortSender, event: StreamEvent) {
    let payload = match serde_json::to_value(&event) {
        Ok(v) => v,
        Err(e) => {
            log::error!("stream {}: could not encode event: {}", event.request_id(), e);
            return;
        }
    };
    if let Err(e) = tx.post_message(payload) {
        log::debug!("stream {}: client gone, event dropped: {}", event.request_id(), e);
    }
}

async fn relay(chat: Arc<ChatService>, port: Port) {
    let (tx, mut rx) = port.split();
    let Some(frame) = rx.recv().await else { return };

    let claimed_id = frame["requestId"].as_str().unwrap_or_default().to_string();
    let mut request: ChatRequest = match serde_json::from_value(frame) {
        Ok(r) => r,
        Err(e) => {
            log::warn!("stream {}: malformed request: {}", claimed_id, e);
            emit(&tx, StreamEvent::Start(fallback_start(&claimed_id, &ChatRequest::default())));
            emit(&tx, StreamEvent::Error { request_id: claimed_id, error: format!("malformed request: {}", e) });
            return;
        }
    };
    let request_id = request.request_id.get_or_insert_with(new_request_id).clone();
    let guard = chat.begin(Some(&request_id));

    let watcher = {
        let chat = chat.clone();
        let request_id = request_id.clone();
        let generation = guard.generation();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {}
            if chat.abort_generation(&request_id, generation) {
                log::info!("stream {}: client disconnected, provider call aborted", request_id);
            }
        })
    };

    let mut started = false;
    let outcome = relay_request(&chat, &tx, &request, &guard, &mut started).await;
    watcher.abort();
    drop(guard);

    match outcome {
        Ok(Outcome::Done(())) => emit(&tx, StreamEvent::Complete { request_id }),
        Ok(Outcome::Cancelled) => log::info!("stream {} cancelled, no terminal event", request_id),
        Err(e) => {
            log::warn!("stream {} error: {}", request_id, e);
            // The client always sees start before the terminal event.
            if !started {
                emit(&tx, StreamEvent::Start(fallback_start(&request_id, &request)));
            }
            emit(&tx, StreamEvent::Error { request_id, error: e.to_string() });
        }
    }
}

/// Start event for a request that failed before its config was resolved.
fn fallback_start(request_id: &str, request: &ChatRequest) -> StreamStart {
    StreamStart {
        request_id:      request_id.to_string(),
        provider:        request.provider.clone().unwrap_or_default(),
        action:          request.action.clone(),
        model:           request.model.clone().unwrap_or_default(),
        conversation_id: request.conversation_id.clone(),
    }
}

async fn relay_request(
    chat:    &ChatService,
    tx:      &PortSender,
    request: &ChatRequest,
    guard:   &AbortGuard<'_>,
    started: &mut bool,
) -> Result<Outcome<()>, ChatError> {
    let request_id = guard.request_id().unwrap_or_default().to_string();
    let prepared = chat.prepare(request).await?;
    if guard.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }

    emit(tx, StreamEvent::Start(StreamStart {
        request_id:      request_id.clone(),
        provider:        prepared.provider.id().to_string(),
        action:          request.action.clone(),
        model:           prepared.config.model.clone(),
        conversation_id: request.conversation_id.clone(),
    }));
    *started = true;

    let outcome = chat
        .execute(&prepared, true, guard, |text| {
            emit(tx, StreamEvent::Chunk { request_id: request_id.clone(), text: text.to_string() })
        })
        .await?;
    Ok(outcome.map(|_| ()))
}
