// substrate.rs — the runtime that carries messages between isolated contexts
//
// The browser provides two primitives: one-shot messages (with a reply routed
// back to the sender) and persistent duplex ports. `ChannelSubstrate` is that
// contract; `LocalRuntime` implements it in-process on tokio channels so the
// three contexts can run as tasks of one process.
use crate::error::BridgeError;
use crate::message::{ContextId, EndpointId, Envelope, Reply, SenderInfo};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

const NO_RECEIVER: &str = "could not establish connection: receiving end does not exist";

/// Anything delivered to a context's inbox.
#[derive(Debug)]
pub enum Inbound {
    Request { envelope: Envelope, sender: SenderInfo },
    Reply(Reply),
}

/// A freshly attached context: its address and the inbox it must drain.
pub struct Attachment {
    pub endpoint: EndpointId,
    pub inbox:    mpsc::UnboundedReceiver<Inbound>,
}

pub trait ChannelSubstrate: Send + Sync + 'static {
    fn attach(&self, context: ContextId) -> Attachment;
    fn detach(&self, endpoint: EndpointId);

    /// Deliver `envelope` to `destination`, or, when absent, to every attached
    /// background and popup context other than the sender.
    fn send_one_shot(
        &self,
        from:        SenderInfo,
        destination: Option<EndpointId>,
        envelope:    Envelope,
    ) -> Result<(), BridgeError>;

    fn reply(&self, to: EndpointId, reply: Reply) -> Result<(), BridgeError>;

    /// Every attached endpoint of the given context kind.
    fn peers(&self, context: ContextId) -> Vec<EndpointId>;

    /// Accept ports opened under `name` towards this endpoint.
    fn listen(&self, endpoint: EndpointId, name: &str) -> Result<mpsc::UnboundedReceiver<Port>, BridgeError>;

    /// Open a port to whichever other context listens on `name`.
    fn connect(&self, from: SenderInfo, name: &str) -> Result<Port, BridgeError>;
}

pub type SharedSubstrate = Arc<dyn ChannelSubstrate>;

// ── Ports ───────────────────────────────────────────────────────────────

/// Sending half of a port. Cheap to clone; `disconnect` closes both sides.
#[derive(Clone)]
pub struct PortSender {
    tx:     mpsc::UnboundedSender<Value>,
    closed: Arc<watch::Sender<bool>>,
}

impl PortSender {
    pub fn post_message(&self, payload: Value) -> Result<(), BridgeError> {
        if *self.closed.borrow() {
            return Err(BridgeError::Transport("port is disconnected".into()));
        }
        self.tx
            .send(payload)
            .map_err(|_| BridgeError::Transport("port is disconnected".into()))
    }

    pub fn disconnect(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_connected(&self) -> bool {
        !*self.closed.borrow() && !self.tx.is_closed()
    }
}

/// Receiving half of a port. `recv` yields `None` once either side disconnects
/// or the peer is gone; frames queued before that are still delivered.
pub struct PortReceiver {
    rx:     mpsc::UnboundedReceiver<Value>,
    closed: watch::Receiver<bool>,
}

impl PortReceiver {
    pub async fn recv(&mut self) -> Option<Value> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = closed(&mut self.closed) => None,
        }
    }
}

/// Resolves once the shared flag is set or every sender is gone.
async fn closed(flag: &mut watch::Receiver<bool>) {
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            return;
        }
    }
}

pub struct Port {
    pub name: String,
    pub peer: SenderInfo,
    pub sender:   PortSender,
    pub receiver: PortReceiver,
}

impl Port {
    /// Two connected ends; `a` sees `b_info` as its peer and vice versa.
    pub fn pair(name: &str, a_info: SenderInfo, b_info: SenderInfo) -> (Port, Port) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed = Arc::new(closed_tx);

        let a = Port {
            name:     name.to_string(),
            peer:     b_info,
            sender:   PortSender { tx: a_tx, closed: closed.clone() },
            receiver: PortReceiver { rx: a_rx, closed: closed_rx.clone() },
        };
        let b = Port {
            name:     name.to_string(),
            peer:     a_info,
            sender:   PortSender { tx: b_tx, closed },
            receiver: PortReceiver { rx: b_rx, closed: closed_rx },
        };
        (a, b)
    }

    pub fn post_message(&self, payload: Value) -> Result<(), BridgeError> {
        self.sender.post_message(payload)
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    pub fn disconnect(&self) {
        self.sender.disconnect();
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

// ── In-process runtime ──────────────────────────────────────────────────

struct Endpoint {
    context:   ContextId,
    inbox:     mpsc::UnboundedSender<Inbound>,
    listeners: HashMap<String, mpsc::UnboundedSender<Port>>,
}

#[derive(Default)]
pub struct LocalRuntime {
    next_endpoint: AtomicU64,
    endpoints:     Mutex<HashMap<EndpointId, Endpoint>>,
}

impl LocalRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn endpoints(&self) -> std::sync::MutexGuard<'_, HashMap<EndpointId, Endpoint>> {
        // A poisoned map is still structurally valid; keep routing.
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ChannelSubstrate for LocalRuntime {
    fn attach(&self, context: ContextId) -> Attachment {
        let endpoint = self.next_endpoint.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, inbox) = mpsc::unbounded_channel();
        self.endpoints().insert(endpoint, Endpoint {
            context,
            inbox:     tx,
            listeners: HashMap::new(),
        });
        log::debug!("substrate: attached {} as endpoint {}", context, endpoint);
        Attachment { endpoint, inbox }
    }

    fn detach(&self, endpoint: EndpointId) {
        if self.endpoints().remove(&endpoint).is_some() {
            log::debug!("substrate: detached endpoint {}", endpoint);
        }
    }

    fn send_one_shot(
        &self,
        from:        SenderInfo,
        destination: Option<EndpointId>,
        envelope:    Envelope,
    ) -> Result<(), BridgeError> {
        let endpoints = self.endpoints();
        let targets: Vec<&Endpoint> = match destination {
            Some(id) if id != from.endpoint => endpoints.get(&id).into_iter().collect(),
            Some(_) => Vec::new(),
            None => endpoints
                .iter()
                .filter(|(id, ep)| {
                    **id != from.endpoint
                        && matches!(ep.context, ContextId::Background | ContextId::Popup)
                })
                .map(|(_, ep)| ep)
                .collect(),
        };

        let mut delivered = 0;
        for ep in targets {
            let msg = Inbound::Request { envelope: envelope.clone(), sender: from };
            if ep.inbox.send(msg).is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            return Err(BridgeError::Transport(NO_RECEIVER.into()));
        }
        Ok(())
    }

    fn reply(&self, to: EndpointId, reply: Reply) -> Result<(), BridgeError> {
        let endpoints = self.endpoints();
        let ep = endpoints
            .get(&to)
            .ok_or_else(|| BridgeError::Transport(NO_RECEIVER.into()))?;
        ep.inbox
            .send(Inbound::Reply(reply))
            .map_err(|_| BridgeError::Transport(NO_RECEIVER.into()))
    }

    fn peers(&self, context: ContextId) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = self
            .endpoints()
            .iter()
            .filter(|(_, ep)| ep.context == context)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn listen(&self, endpoint: EndpointId, name: &str) -> Result<mpsc::UnboundedReceiver<Port>, BridgeError> {
        let mut endpoints = self.endpoints();
        let ep = endpoints
            .get_mut(&endpoint)
            .ok_or_else(|| BridgeError::Transport(format!("endpoint {} is not attached", endpoint)))?;
        let (tx, rx) = mpsc::unbounded_channel();
        ep.listeners.insert(name.to_string(), tx);
        Ok(rx)
    }

    fn connect(&self, from: SenderInfo, name: &str) -> Result<Port, BridgeError> {
        let endpoints = self.endpoints();
        let (id, ep) = endpoints
            .iter()
            .filter(|(id, ep)| **id != from.endpoint && ep.listeners.contains_key(name))
            .min_by_key(|(id, _)| **id)
            .ok_or_else(|| BridgeError::Transport(NO_RECEIVER.into()))?;

        let remote = SenderInfo { endpoint: *id, context: ep.context };
        let (local, accepted) = Port::pair(name, from, remote);
        ep.listeners[name]
            .send(accepted)
            .map_err(|_| BridgeError::Transport(NO_RECEIVER.into()))?;
        Ok(local)
    }
}
