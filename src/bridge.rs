// bridge.rs — request/response multiplexing over one-shot messages
//
// Every context owns one `BridgeService`. `send` turns a one-shot message into
// an awaited reply correlated by id; `register` answers incoming requests of a
// given type. Replies come back through the same inbox as requests, so a late
// or duplicate reply simply finds no pending entry.
use crate::error::BridgeError;
use crate::message::{
    now_millis, ContextId, EndpointId, Envelope, MessageStatus, MessageType, Reply, SenderInfo,
};
use crate::substrate::{Inbound, SharedSubstrate};
use futures_util::future::{join_all, BoxFuture};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const DEFAULT_TIMEOUT: Duration      = Duration::from_millis(100_000);
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

type Handler = Arc<dyn Fn(Value, SenderInfo) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Context the request is meant for; other receivers ignore it.
    pub target:      Option<ContextId>,
    /// Specific endpoint (e.g. one tab's content script). None = runtime delivery.
    pub destination: Option<EndpointId>,
    /// None = DEFAULT_TIMEOUT
    pub timeout:     Option<Duration>,
}

impl SendOptions {
    pub fn to(target: ContextId) -> Self {
        SendOptions { target: Some(target), ..Default::default() }
    }

    pub fn destination(mut self, endpoint: EndpointId) -> Self {
        self.destination = Some(endpoint);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    pub delivered: usize,
    pub failed:    usize,
}

struct PendingRequest {
    settle:   oneshot::Sender<Result<Value, BridgeError>>,
    timer:    JoinHandle<()>,
    msg_type: MessageType,
}

struct Shared {
    context:   ContextId,
    endpoint:  EndpointId,
    substrate: SharedSubstrate,
    next_id:   AtomicU64,
    destroyed: AtomicBool,
    pending:   Mutex<HashMap<u64, PendingRequest>>,
    handlers:  Mutex<HashMap<MessageType, Handler>>,
}

pub struct BridgeService {
    shared:   Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

// Maps stay consistent across a panicking holder: every critical section is a
// single insert/remove/lookup.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl BridgeService {
    /// Attach `context` to the substrate and start listening. Must be called
    /// inside a tokio runtime.
    pub fn new(context: ContextId, substrate: SharedSubstrate) -> Self {
        let attachment = substrate.attach(context);
        let shared = Arc::new(Shared {
            context,
            endpoint:  attachment.endpoint,
            substrate,
            next_id:   AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            pending:   Mutex::new(HashMap::new()),
            handlers:  Mutex::new(HashMap::new()),
        });

        let listener = tokio::spawn(listen(shared.clone(), attachment.inbox));
        let service = BridgeService { shared, listener: Mutex::new(Some(listener)) };

        service.register(MessageType::HealthCheck, move |_, _| async move {
            Ok(json!({ "healthy": true, "context": context }))
        });

        log::info!("BridgeService ready: {} (endpoint {})", context, service.endpoint());
        service
    }

    pub fn context(&self) -> ContextId {
        self.shared.context
    }

    pub fn endpoint(&self) -> EndpointId {
        self.shared.endpoint
    }

    pub fn substrate(&self) -> &SharedSubstrate {
        &self.shared.substrate
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    pub fn has_handler(&self, msg_type: MessageType) -> bool {
        lock(&self.shared.handlers).contains_key(&msg_type)
    }

    // ── Outgoing ─────────────────────────────────────────────────────────

    /// Send a request and wait for its reply payload. Settles exactly once:
    /// reply, error reply, timeout, transport failure or destroy.
    pub async fn send(
        &self,
        msg_type: MessageType,
        data:     Value,
        options:  SendOptions,
    ) -> Result<Value, BridgeError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(BridgeError::Destroyed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = Envelope {
            id,
            msg_type:  msg_type.as_str().to_string(),
            data,
            source:    self.shared.context,
            target:    options.target,
            timestamp: now_millis(),
        };

        log::debug!(
            "BridgeService send: id={} type={} source={} target={:?} destination={:?}",
            id, msg_type, self.shared.context, options.target, options.destination
        );

        let (settle, settled) = oneshot::channel();
        let timeout = options.timeout.unwrap_or(DEFAULT_TIMEOUT);
        {
            // The timer cannot expire the entry before it is inserted: expiry
            // needs this same lock.
            let mut pending = lock(&self.shared.pending);
            let weak: Weak<Shared> = Arc::downgrade(&self.shared);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(shared) = weak.upgrade() {
                    shared.expire(id);
                }
            });
            pending.insert(id, PendingRequest { settle, timer, msg_type });
        }

        let from = SenderInfo { endpoint: self.shared.endpoint, context: self.shared.context };
        if let Err(e) = self.shared.substrate.send_one_shot(from, options.destination, envelope) {
            log::error!("BridgeService send failed: id={} type={}: {}", id, msg_type, e);
            if let Some(p) = lock(&self.shared.pending).remove(&id) {
                p.timer.abort();
            }
            return Err(e);
        }

        match settled.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Destroyed),
        }
    }

    /// Fan a request out to every content context. Background only; one
    /// peer's failure never stops delivery to the others.
    pub async fn broadcast(&self, msg_type: MessageType, data: Value) -> Result<BroadcastSummary, BridgeError> {
        if self.shared.context != ContextId::Background {
            return Err(BridgeError::Capability { operation: "broadcast", context: self.shared.context });
        }

        let peers = self.shared.substrate.peers(ContextId::Content);
        let sends = peers.into_iter().map(|endpoint| {
            let data = data.clone();
            async move {
                let options = SendOptions::to(ContextId::Content).destination(endpoint);
                (endpoint, self.send(msg_type, data, options).await)
            }
        });

        let mut summary = BroadcastSummary::default();
        for (endpoint, result) in join_all(sends).await {
            match result {
                Ok(_) => summary.delivered += 1,
                Err(e) => {
                    log::warn!("broadcast {} to endpoint {} failed: {}", msg_type, endpoint, e);
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// True when `target` answers a HEALTH_CHECK within three seconds.
    pub async fn health_check(&self, target: ContextId, destination: Option<EndpointId>) -> bool {
        let mut options = SendOptions::to(target).timeout(HEALTH_CHECK_TIMEOUT);
        options.destination = destination;
        self.send(MessageType::HealthCheck, json!({}), options).await.is_ok()
    }

    // ── Incoming ─────────────────────────────────────────────────────────

    /// Register the handler for `msg_type`. A second registration replaces the first.
    pub fn register<F, Fut>(&self, msg_type: MessageType, handler: F)
    where
        F:   Fn(Value, SenderInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |data, sender| Box::pin(handler(data, sender)));
        if lock(&self.shared.handlers).insert(msg_type, handler).is_some() {
            log::debug!("BridgeService {}: replaced handler for {}", self.shared.context, msg_type);
        }
    }

    pub fn unregister(&self, msg_type: MessageType) {
        lock(&self.shared.handlers).remove(&msg_type);
    }

    /// Reject everything still pending, drop all handlers and timers, and
    /// leave the substrate. Idempotent.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }

        let pending: Vec<PendingRequest> = lock(&self.shared.pending).drain().map(|(_, p)| p).collect();
        for p in pending {
            p.timer.abort();
            let _ = p.settle.send(Err(BridgeError::Destroyed));
        }
        lock(&self.shared.handlers).clear();
        self.shared.substrate.detach(self.shared.endpoint);
        log::info!("BridgeService destroyed: {}", self.shared.context);
    }
}

impl Drop for BridgeService {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Shared {
    fn expire(&self, id: u64) {
        let Some(p) = lock(&self.pending).remove(&id) else { return };
        log::warn!("BridgeService timeout: id={} type={} source={}", id, p.msg_type, self.context);
        let _ = p.settle.send(Err(BridgeError::Timeout { message_type: p.msg_type.to_string() }));
    }

    fn settle(&self, reply: Reply) {
        let Some(p) = lock(&self.pending).remove(&reply.id) else {
            log::debug!("BridgeService ignoring reply for settled request {}", reply.id);
            return;
        };
        p.timer.abort();

        log::debug!(
            "BridgeService reply: id={} type={} status={:?}",
            reply.id, reply.msg_type, reply.status
        );

        let result = match reply.status {
            MessageStatus::Success => Ok(reply.data.unwrap_or(Value::Null)),
            MessageStatus::Error   => Err(BridgeError::Remote(
                reply.error.unwrap_or_else(|| "unknown error".to_string()),
            )),
        };
        let _ = p.settle.send(result);
    }

    async fn dispatch(self: Arc<Self>, envelope: Envelope, sender: SenderInfo) {
        let handler = envelope
            .msg_type
            .parse::<MessageType>()
            .ok()
            .and_then(|t| lock(&self.handlers).get(&t).cloned());

        let outcome = match handler {
            // Untargeted envelopes reach every listening context; only the
            // addressed one may answer that it cannot handle the type.
            None if envelope.target != Some(self.context) => {
                log::debug!("BridgeService {}: no handler for untargeted {}", self.context, envelope.msg_type);
                return;
            }
            None => {
                log::warn!("BridgeService {}: unknown message type {}", self.context, envelope.msg_type);
                Err(BridgeError::UnknownMessageType(envelope.msg_type.clone()).to_string())
            }
            Some(handler) => {
                let data = envelope.data.clone();
                // Run in its own task so a panicking handler only fails this request.
                match tokio::spawn(async move { handler(data, sender).await }).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e))    => Err(e.to_string()),
                    Err(e)        => {
                        log::error!("handler for {} crashed: {}", envelope.msg_type, e);
                        Err(format!("handler for {} crashed", envelope.msg_type))
                    }
                }
            }
        };

        let reply = Reply::to(&envelope, self.context, outcome);
        if let Err(e) = self.substrate.reply(sender.endpoint, reply) {
            log::warn!("BridgeService {}: could not reply to {}: {}", self.context, sender.endpoint, e);
        }
    }
}

async fn listen(shared: Arc<Shared>, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(msg) = inbox.recv().await {
        match msg {
            Inbound::Reply(reply) => shared.settle(reply),
            Inbound::Request { envelope, sender } => {
                if envelope.target.map_or(false, |t| t != shared.context) {
                    continue;
                }
                tokio::spawn(shared.clone().dispatch(envelope, sender));
            }
        }
    }
}

// ── Unit tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::LocalRuntime;

    fn pair() -> (BridgeService, BridgeService) {
        let rt: SharedSubstrate = LocalRuntime::new();
        let content = BridgeService::new(ContextId::Content, rt.clone());
        let background = BridgeService::new(ContextId::Background, rt);
        (content, background)
    }

    #[tokio::test]
    async fn test_send_resolves_with_handler_payload() {
        let (content, background) = pair();
        background.register(MessageType::ChatRequest, |data, sender| async move {
            assert_eq!(sender.context, ContextId::Content);
            Ok(json!({ "echo": data["text"] }))
        });

        let reply = content
            .send(MessageType::ChatRequest, json!({ "text": "hi" }), SendOptions::to(ContextId::Background))
            .await
            .unwrap();
        assert_eq!(reply, json!({ "echo": "hi" }));
        assert_eq!(content.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies_match_their_requests() {
        let (content, background) = pair();
        background.register(MessageType::ChatRequest, |data, _| async move {
            let delay = data["delay"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(data)
        });

        let slow = content.send(
            MessageType::ChatRequest,
            json!({ "n": 1, "delay": 80 }),
            SendOptions::to(ContextId::Background),
        );
        let fast = content.send(
            MessageType::ChatRequest,
            json!({ "n": 2, "delay": 0 }),
            SendOptions::to(ContextId::Background),
        );
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap()["n"], 1);
        assert_eq!(fast.unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn test_timeout_rejects_once_and_late_reply_is_ignored() {
        let (content, background) = pair();
        background.register(MessageType::ChatRequest, |_, _| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(json!("late"))
        });

        let err = content
            .send(
                MessageType::ChatRequest,
                json!({}),
                SendOptions::to(ContextId::Background).timeout(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Timeout { message_type: "CHAT_REQUEST".into() });
        assert_eq!(content.pending_count(), 0);

        // Let the late reply arrive; it must find nothing to settle.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(content.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_type_gets_unknown_message_error() {
        let (content, _background) = pair();
        let err = content
            .send(MessageType::ChatRequest, json!({}), SendOptions::to(ContextId::Background))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown message type: CHAT_REQUEST");
    }

    #[tokio::test]
    async fn test_untargeted_send_ignores_contexts_without_handler() {
        let rt: SharedSubstrate = LocalRuntime::new();
        let content = BridgeService::new(ContextId::Content, rt.clone());
        let background = BridgeService::new(ContextId::Background, rt.clone());
        let _popup = BridgeService::new(ContextId::Popup, rt);
        background.register(MessageType::ChatRequest, |_, _| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(json!("answer"))
        });

        let reply = content
            .send(MessageType::ChatRequest, json!({}), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, json!("answer"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_reply() {
        let (content, background) = pair();
        background.register(MessageType::TestApiKey, |_, _| async move {
            Err(anyhow::anyhow!("invalid key"))
        });
        let err = content
            .send(MessageType::TestApiKey, json!({}), SendOptions::to(ContextId::Background))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Remote("invalid key".into()));
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_listener() {
        let (content, background) = pair();
        background.register(MessageType::ChatRequest, |data, _| async move {
            if data["boom"].as_bool() == Some(true) {
                panic!("boom");
            }
            Ok(json!("fine"))
        });

        let err = content
            .send(MessageType::ChatRequest, json!({ "boom": true }), SendOptions::to(ContextId::Background))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Remote(_)));

        let ok = content
            .send(MessageType::ChatRequest, json!({}), SendOptions::to(ContextId::Background))
            .await
            .unwrap();
        assert_eq!(ok, json!("fine"));
    }

    #[tokio::test]
    async fn test_transport_failure_cleans_up() {
        let rt: SharedSubstrate = LocalRuntime::new();
        let content = BridgeService::new(ContextId::Content, rt);
        let err = content
            .send(MessageType::ChatRequest, json!({}), SendOptions::to(ContextId::Background))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(content.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_target_filter_routes_to_matching_context() {
        let rt: SharedSubstrate = LocalRuntime::new();
        let content = BridgeService::new(ContextId::Content, rt.clone());
        let background = BridgeService::new(ContextId::Background, rt.clone());
        let popup = BridgeService::new(ContextId::Popup, rt);
        background.register(MessageType::ChatRequest, |_, _| async move { Ok(json!("background")) });
        popup.register(MessageType::ChatRequest, |_, _| async move { Ok(json!("popup")) });

        let reply = content
            .send(MessageType::ChatRequest, json!({}), SendOptions::to(ContextId::Background))
            .await
            .unwrap();
        assert_eq!(reply, json!("background"));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let (content, background) = pair();
        background.register(MessageType::ChatRequest, |_, _| async move { Ok(json!(1)) });
        background.register(MessageType::ChatRequest, |_, _| async move { Ok(json!(2)) });
        let reply = content
            .send(MessageType::ChatRequest, json!({}), SendOptions::to(ContextId::Background))
            .await
            .unwrap();
        assert_eq!(reply, json!(2));

        background.unregister(MessageType::ChatRequest);
        assert!(!background.has_handler(MessageType::ChatRequest));
    }

    #[tokio::test]
    async fn test_broadcast_only_from_background() {
        let (content, _background) = pair();
        let err = content.broadcast(MessageType::SettingsChanged, json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::Capability { .. }));
    }

    #[tokio::test]
    async fn test_broadcast_isolates_peer_failures() {
        let rt: SharedSubstrate = LocalRuntime::new();
        let background = BridgeService::new(ContextId::Background, rt.clone());
        let good = BridgeService::new(ContextId::Content, rt.clone());
        let _silent = BridgeService::new(ContextId::Content, rt);
        good.register(MessageType::SettingsChanged, |_, _| async move { Ok(json!({})) });

        let summary = background.broadcast(MessageType::SettingsChanged, json!({ "provider": "kimi" })).await.unwrap();
        assert_eq!(summary, BroadcastSummary { delivered: 1, failed: 1 });
    }

    #[tokio::test]
    async fn test_destroy_rejects_pending_requests() {
        let (content, background) = pair();
        background.register(MessageType::ChatRequest, |_, _| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        });
        let content = Arc::new(content);

        let sender = content.clone();
        let call = tokio::spawn(async move {
            sender.send(MessageType::ChatRequest, json!({}), SendOptions::to(ContextId::Background)).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(content.pending_count(), 1);

        content.destroy();
        assert_eq!(call.await.unwrap().unwrap_err(), BridgeError::Destroyed);
        assert_eq!(content.pending_count(), 0);
        assert!(!content.has_handler(MessageType::HealthCheck));

        let err = content
            .send(MessageType::ChatRequest, json!({}), SendOptions::to(ContextId::Background))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Destroyed);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (content, background) = pair();
        assert!(content.health_check(ContextId::Background, None).await);
        background.destroy();
        assert!(!content.health_check(ContextId::Background, None).await);
    }
}
