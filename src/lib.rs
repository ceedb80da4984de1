//! Cross-context message bridge and streaming AI relay for a reading assistant.
//!
//! Three isolated contexts (content, background, popup) talk only through a
//! [`substrate::ChannelSubstrate`]. Each owns a [`bridge::BridgeService`] for
//! request/response traffic; streamed chat answers travel over ports managed
//! by [`stream`]. The background owns the provider calls ([`chat::ChatService`]),
//! the content side owns history and the UI-facing facade ([`chat::ChatClient`]).

pub mod background;
pub mod bridge;
pub mod chat;
pub mod content;
pub mod error;
pub mod message;
pub mod popup;
pub mod settings;
pub mod stream;
pub mod substrate;

pub use background::MessageRouter;
pub use bridge::{BridgeService, BroadcastSummary, SendOptions};
pub use content::ContentBridge;
pub use error::BridgeError;
pub use message::{ContextId, MessageType};
pub use popup::PopupBridge;
pub use stream::{StreamEvent, StreamObserver, StreamUpdate};
pub use substrate::{ChannelSubstrate, LocalRuntime, SharedSubstrate};
