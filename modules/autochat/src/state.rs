use serde::Serialize;
use tracing::{info, warn};

use crate::dedup::DedupRegistry;
use crate::directory::IdentityDirectory;
use crate::error::Result;
use crate::scheduler::{self, Advance, RoundRobin};
use crate::store::ConversationStore;

/// Everything the engine persists between restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineState {
    pub conversations: ConversationStore,
    #[serde(rename = "rr_index")]
    pub scheduler: RoundRobin,
    pub identities: IdentityDirectory,
    pub seen: DedupRegistry,
    /// Completed cycles since the state was last reset.
    pub cycle: u64,
}

/// What a directory refresh changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryChange {
    pub installed: bool,
    pub identities: usize,
    pub purged: usize,
}

impl EngineState {
    /// Replace the identity directory with a freshly fetched one.
    ///
    /// A listing with fewer than two identities is treated as a transient
    /// gateway glitch and the previous directory is kept. Otherwise
    /// conversations with a participant no longer present are dropped and
    /// the round-robin index is brought back in range.
    pub fn install_directory(&mut self, fresh: IdentityDirectory) -> DirectoryChange {
        if fresh.len() < 2 {
            warn!(
                fetched = fresh.len(),
                kept = self.identities.len(),
                "Directory refresh returned fewer than 2 identities, keeping previous"
            );
            return DirectoryChange {
                installed: false,
                identities: self.identities.len(),
                purged: 0,
            };
        }

        let purged = self.conversations.retain_participants(|a| fresh.contains(a));
        if purged > 0 {
            info!(purged, "Dropped conversations with departed identities");
        }
        if fresh != self.identities {
            info!(identities = fresh.len(), "Identity directory updated");
        }
        self.identities = fresh;
        self.scheduler.normalize(self.identities.len());

        DirectoryChange {
            installed: true,
            identities: self.identities.len(),
            purged,
        }
    }

    pub fn current_sender(&self) -> Result<String> {
        self.scheduler.current_sender(&self.identities)
    }

    pub fn is_sender_exhausted(&self, sender: &str) -> bool {
        scheduler::is_sender_exhausted(sender, &self.identities, &self.conversations)
    }

    /// Pass the baton, counting the cycle when the index wraps.
    pub fn advance(&mut self) -> Result<Advance> {
        let advance = self
            .scheduler
            .advance(&self.identities, &mut self.conversations, &mut self.seen)?;
        if advance.cycle_completed {
            self.cycle += 1;
        }
        Ok(advance)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::testing::identity;
    use crate::types::{pair_key, Conversation};

    fn directory(addresses: &[&str]) -> IdentityDirectory {
        IdentityDirectory::from_identities(
            addresses
                .iter()
                .enumerate()
                .map(|(i, a)| identity(a, 1, i as u32)),
        )
    }

    #[test]
    fn refresh_purges_departed_identities() {
        let mut state = EngineState::default();
        state.install_directory(directory(&["A", "B", "C"]));
        state
            .conversations
            .create(pair_key("A", "B"), Conversation::started("A", Utc::now()));
        state
            .conversations
            .create(pair_key("A", "C"), Conversation::started("A", Utc::now()));
        state.scheduler = RoundRobin::at(2);

        let change = state.install_directory(directory(&["A", "B"]));
        assert!(change.installed);
        assert_eq!(change.purged, 1);
        assert!(state.conversations.contains(&pair_key("A", "B")));
        assert!(!state.conversations.contains(&pair_key("A", "C")));
        assert_eq!(state.scheduler.rr_index(), 0);
    }

    #[test]
    fn short_listing_keeps_previous_directory() {
        let mut state = EngineState::default();
        state.install_directory(directory(&["A", "B", "C"]));
        state
            .conversations
            .create(pair_key("A", "B"), Conversation::started("A", Utc::now()));

        let change = state.install_directory(directory(&["A"]));
        assert!(!change.installed);
        assert_eq!(state.identities.len(), 3);
        assert_eq!(state.conversations.len(), 1);
    }

    #[test]
    fn wrap_counts_cycles() {
        let mut state = EngineState::default();
        state.install_directory(directory(&["A", "B"]));
        assert!(!state.advance().unwrap().cycle_completed);
        assert!(state.advance().unwrap().cycle_completed);
        assert_eq!(state.cycle, 1);
    }
}
