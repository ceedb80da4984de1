// conversation.rs — bounded per-conversation chat history
use crate::message::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub const MAX_HISTORY: usize = 20;
pub const DEFAULT_CONVERSATION: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role:      Role,
    pub content:   String,
    #[serde(default)]
    pub timestamp: i64,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        ChatTurn { role: Role::User, content: content.into(), timestamp: now_millis() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatTurn { role: Role::Assistant, content: content.into(), timestamp: now_millis() }
    }
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<String, VecDeque<ChatTurn>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest first; empty for an unknown id.
    pub fn history(&self, id: &str) -> Vec<ChatTurn> {
        self.conversations
            .get(id)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn append(&mut self, id: &str, turn: ChatTurn) {
        let turns = self.conversations.entry(id.to_string()).or_default();
        turns.push_back(turn);
        while turns.len() > MAX_HISTORY {
            turns.pop_front();
        }
    }

    /// Record one completed question/answer pair.
    pub fn append_exchange(&mut self, id: &str, question: &str, answer: &str) {
        self.append(id, ChatTurn::user(question));
        self.append(id, ChatTurn::assistant(answer));
    }

    pub fn clear(&mut self, id: &str) -> bool {
        self.conversations.remove(id).is_some()
    }

    pub fn clear_all(&mut self) {
        self.conversations.clear();
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}
