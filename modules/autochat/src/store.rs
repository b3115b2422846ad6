use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Conversation, ConversationStatus, PairKey};

/// Conversation progress keyed by pair. Ordered by key so every scan over it
/// is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationStore {
    conversations: BTreeMap<PairKey, Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PairKey) -> Option<&Conversation> {
        self.conversations.get(key)
    }

    pub fn get_mut(&mut self, key: &PairKey) -> Option<&mut Conversation> {
        self.conversations.get_mut(key)
    }

    /// Insert a conversation for a pair that has none. An existing record is
    /// never overwritten; returns false in that case.
    pub fn create(&mut self, key: PairKey, conversation: Conversation) -> bool {
        if self.conversations.contains_key(&key) {
            return false;
        }
        self.conversations.insert(key, conversation);
        true
    }

    /// Record a finished outcome for a pair, replacing any record that is
    /// still active. A terminal record is kept; returns false in that case.
    pub fn settle(&mut self, key: PairKey, conversation: Conversation) -> bool {
        if self.status(&key).is_some_and(|s| s.is_terminal()) {
            return false;
        }
        self.conversations.insert(key, conversation);
        true
    }

    pub fn contains(&self, key: &PairKey) -> bool {
        self.conversations.contains_key(key)
    }

    pub fn status(&self, key: &PairKey) -> Option<ConversationStatus> {
        self.conversations.get(key).map(|c| c.status)
    }

    /// Active conversations in pair-key order.
    pub fn active(&self) -> impl Iterator<Item = (&PairKey, &Conversation)> {
        self.conversations
            .iter()
            .filter(|(_, c)| c.status == ConversationStatus::Active)
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
    }

    /// Drop every conversation with a participant `keep` rejects. Returns how many went.
    pub fn retain_participants(&mut self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let before = self.conversations.len();
        self.conversations.retain(|key, _| {
            let (a, b) = key.participants();
            keep(a) && keep(b)
        });
        before - self.conversations.len()
    }
}
