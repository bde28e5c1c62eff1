use crate::types::ChatMessage;

/// Chat history for one task. The system prompt is held apart so trimming
/// can never evict it.
#[derive(Debug, Clone)]
pub struct Conversation {
    system: ChatMessage,
    entries: Vec<ChatMessage>,
    capacity: usize,
}

impl Conversation {
    /// `capacity` bounds stored non-system entries; oldest go first.
    pub fn new(system_prompt: impl Into<String>, capacity: usize) -> Self {
        Self {
            system: ChatMessage::system(system_prompt),
            entries: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.entries.push(message);
        if self.entries.len() > self.capacity {
            let excess = self.entries.len() - self.capacity;
            self.entries.drain(..excess);
        }
    }

    /// System prompt followed by the most recent `recent` entries.
    pub fn window(&self, recent: usize) -> Vec<ChatMessage> {
        let start = self.entries.len().saturating_sub(recent);
        std::iter::once(self.system.clone())
            .chain(self.entries[start..].iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.entries.last()
    }

    /// Remove the newest entry. The system prompt is not reachable from here.
    pub fn pop(&mut self) -> Option<ChatMessage> {
        self.entries.pop()
    }
}
