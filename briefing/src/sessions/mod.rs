//! Per-chat conversation state for the bot. Held in memory for the life of
//! the process.

use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use crate::llm::ChatMessage;

/// Conversation of one chat
#[derive(Debug, Default, Clone)]
pub struct ChatSession {
    messages: VecDeque<ChatMessage>,
    system_prompt: Option<String>,
}

pub struct SessionStore {
    /// Stored messages per chat: `2 * max_history`, so about `max_history` exchanges
    capacity: usize,
    chats: Mutex<HashMap<i64, ChatSession>>,
}

impl SessionStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            capacity: max_history.saturating_mul(2).max(2),
            chats: Mutex::new(HashMap::new()),
        }
    }

    async fn push(&self, chat_id: i64, message: ChatMessage) {
        let mut chats = self.chats.lock().await;
        let session = chats.entry(chat_id).or_default();
        session.messages.push_back(message);
        while session.messages.len() > self.capacity {
            session.messages.pop_front();
        }
    }

    pub async fn push_user(&self, chat_id: i64, content: &str) {
        self.push(chat_id, ChatMessage::user(content)).await;
    }

    pub async fn push_assistant(&self, chat_id: i64, content: &str) {
        self.push(chat_id, ChatMessage::assistant(content)).await;
    }

    /// Remove and return the newest message (used to retract a failed turn).
    pub async fn pop_last(&self, chat_id: i64) -> Option<ChatMessage> {
        let mut chats = self.chats.lock().await;
        chats.get_mut(&chat_id).and_then(|s| s.messages.pop_back())
    }

    pub async fn history(&self, chat_id: i64) -> Vec<ChatMessage> {
        let chats = self.chats.lock().await;
        chats
            .get(&chat_id)
            .map(|s| s.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget the conversation; a custom system prompt is kept.
    pub async fn clear(&self, chat_id: i64) {
        let mut chats = self.chats.lock().await;
        if let Some(s) = chats.get_mut(&chat_id) {
            s.messages.clear();
        }
    }

    /// `None` restores the default prompt.
    pub async fn set_system_prompt(&self, chat_id: i64, prompt: Option<String>) {
        let mut chats = self.chats.lock().await;
        chats.entry(chat_id).or_default().system_prompt = prompt.filter(|p| !p.trim().is_empty());
    }

    pub async fn system_prompt(&self, chat_id: i64) -> Option<String> {
        let chats = self.chats.lock().await;
        chats.get(&chat_id).and_then(|s| s.system_prompt.clone())
    }
}
