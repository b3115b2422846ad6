use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dedup::DedupRegistry;
use crate::directory::IdentityDirectory;
use crate::error::{EngineError, Result};
use crate::store::ConversationStore;
use crate::types::pair_key;

/// Round-robin position over the sorted identity list.
///
/// Fairness is per identity: the current sender drives dialogues with every
/// peer, and the baton only passes once all of them are settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundRobin {
    rr_index: usize,
}

/// Result of passing the baton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    pub sender: String,
    pub rr_index: usize,
    /// The index wrapped to 0: every identity has driven once, and the
    /// conversation store and dedup registry were cleared.
    pub cycle_completed: bool,
}

impl RoundRobin {
    pub fn at(rr_index: usize) -> Self {
        Self { rr_index }
    }

    pub fn rr_index(&self) -> usize {
        self.rr_index
    }

    /// Keep `rr_index < n` after the directory changed size.
    pub fn normalize(&mut self, n: usize) {
        if n > 0 {
            self.rr_index %= n;
        }
    }

    /// The identity currently driving new conversations.
    pub fn current_sender(&self, directory: &IdentityDirectory) -> Result<String> {
        let addresses = directory.addresses();
        if addresses.len() < 2 {
            return Err(EngineError::InsufficientIdentities {
                found: addresses.len(),
            });
        }
        Ok(addresses[self.rr_index % addresses.len()].clone())
    }

    /// Move to the next identity. Wrapping back to index 0 ends a cycle and
    /// clears all conversations and dedup entries.
    pub fn advance(
        &mut self,
        directory: &IdentityDirectory,
        conversations: &mut ConversationStore,
        seen: &mut DedupRegistry,
    ) -> Result<Advance> {
        let addresses = directory.addresses();
        let n = addresses.len();
        if n < 2 {
            return Err(EngineError::InsufficientIdentities { found: n });
        }

        self.rr_index = (self.rr_index % n + 1) % n;
        let cycle_completed = self.rr_index == 0;
        if cycle_completed {
            info!(
                conversations = conversations.len(),
                seen = seen.len(),
                "Round-robin cycle complete, resetting conversations"
            );
            conversations.clear();
            seen.clear();
        }

        let sender = addresses[self.rr_index].clone();
        info!(sender = %sender, rr_index = self.rr_index, "Next round-robin sender");
        Ok(Advance {
            sender,
            rr_index: self.rr_index,
            cycle_completed,
        })
    }
}

/// True once every conversation between `sender` and its peers has reached a
/// terminal status. A sender without peers is trivially exhausted.
///
/// `Error` counts as settled: a failed pair is never retried, so waiting on it
/// would pin the baton to this sender forever.
pub fn is_sender_exhausted(
    sender: &str,
    directory: &IdentityDirectory,
    conversations: &ConversationStore,
) -> bool {
    directory.peers(sender).iter().all(|peer| {
        conversations
            .get(&pair_key(sender, peer))
            .is_some_and(|c| c.is_terminal())
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{Conversation, Identity, RouteHandle};

    fn directory(addresses: &[&str]) -> IdentityDirectory {
        IdentityDirectory::from_identities(addresses.iter().enumerate().map(|(i, a)| Identity {
            address: a.to_string(),
            route: RouteHandle::new(1, i as u32),
        }))
    }

    fn done(sender: &str) -> Conversation {
        let now = Utc::now();
        let mut c = Conversation::started(sender, now);
        c.complete(now);
        c
    }

    #[test]
    fn current_sender_requires_two_identities() {
        let rr = RoundRobin::default();
        assert!(matches!(
            rr.current_sender(&directory(&["A"])),
            Err(EngineError::InsufficientIdentities { found: 1 })
        ));
        assert_eq!(rr.current_sender(&directory(&["B", "A"])).unwrap(), "A");
        assert_eq!(RoundRobin::at(5).current_sender(&directory(&["A", "B"])).unwrap(), "B");
    }

    #[test]
    fn exhaustion_requires_every_peer_settled() {
        let dir = directory(&["A", "B", "C"]);
        let mut store = ConversationStore::new();
        assert!(!is_sender_exhausted("A", &dir, &store));

        store.create(pair_key("A", "B"), done("A"));
        assert!(!is_sender_exhausted("A", &dir, &store));

        store.create(pair_key("A", "C"), Conversation::started("A", Utc::now()));
        assert!(!is_sender_exhausted("A", &dir, &store));

        store.get_mut(&pair_key("A", "C")).unwrap().complete(Utc::now());
        assert!(is_sender_exhausted("A", &dir, &store));
    }

    #[test]
    fn failed_pairs_count_as_settled() {
        let dir = directory(&["A", "B"]);
        let mut store = ConversationStore::new();
        store.create(pair_key("A", "B"), Conversation::failed("rejected", Utc::now()));
        assert!(is_sender_exhausted("A", &dir, &store));
    }

    #[test]
    fn lone_identity_is_vacuously_exhausted() {
        let dir = directory(&["A"]);
        assert!(is_sender_exhausted("A", &dir, &ConversationStore::new()));
    }

    #[test]
    fn advance_moves_to_next_sender() {
        let dir = directory(&["A", "B", "C"]);
        let mut store = ConversationStore::new();
        store.create(pair_key("A", "B"), done("A"));
        store.create(pair_key("A", "C"), done("A"));
        let mut seen = DedupRegistry::new();
        seen.observe("1");

        let mut rr = RoundRobin::default();
        assert!(is_sender_exhausted("A", &dir, &store));
        let adv = rr.advance(&dir, &mut store, &mut seen).unwrap();
        assert_eq!(adv.sender, "B");
        assert_eq!(adv.rr_index, 1);
        assert_eq!(rr.rr_index(), 1);
        assert!(!adv.cycle_completed);
        assert_eq!(store.len(), 2);
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn wrap_clears_store_and_dedup() {
        let dir = directory(&["A", "B", "C"]);
        let mut store = ConversationStore::new();
        store.create(pair_key("C", "A"), done("C"));
        store.create(pair_key("C", "B"), done("C"));
        let mut seen = DedupRegistry::new();
        seen.observe("1");
        seen.observe("2");

        let mut rr = RoundRobin::at(2);
        let adv = rr.advance(&dir, &mut store, &mut seen).unwrap();
        assert_eq!(adv.sender, "A");
        assert_eq!(rr.rr_index(), 0);
        assert!(adv.cycle_completed);
        assert!(store.is_empty());
        assert!(seen.is_empty());
    }

    #[test]
    fn normalize_after_directory_shrinks() {
        let mut rr = RoundRobin::at(4);
        rr.normalize(3);
        assert_eq!(rr.rr_index(), 1);
        rr.normalize(0);
        assert_eq!(rr.rr_index(), 1);
    }
}
