pub mod client;
pub mod config;
pub mod conversation;
pub mod prompt;
pub mod provider;
pub mod service;
pub mod sse;

pub use client::{ChatClient, ChatOptions, ChatReply, ChatStatus};
pub use conversation::{ChatTurn, ConversationStore, Role};
pub use provider::{OpenAiCompatible, ProviderAdapter, ProviderRegistry};
pub use service::{ChatError, ChatRequest, ChatResponse, ChatService, Outcome, TestResult};
