use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::dedup::DedupRegistry;
use crate::directory::IdentityDirectory;
use crate::error::{EngineError, Result};
use crate::scheduler::RoundRobin;
use crate::state::EngineState;
use crate::store::ConversationStore;
use crate::types::{Conversation, PairKey};

/// On-disk shape. Conversation keys are validated before they reach the store.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSnapshot {
    conversations: BTreeMap<String, Conversation>,
    rr_index: RoundRobin,
    identities: IdentityDirectory,
    seen: DedupRegistry,
    cycle: u64,
}

impl RawSnapshot {
    fn into_state(self) -> EngineState {
        let mut conversations = ConversationStore::new();
        for (raw_key, conversation) in self.conversations {
            match PairKey::parse(&raw_key) {
                Some(key) => {
                    conversations.create(key, conversation);
                }
                None => warn!(key = %raw_key, "Dropping conversation with malformed pair key"),
            }
        }

        let mut scheduler = self.rr_index;
        scheduler.normalize(self.identities.len());

        EngineState {
            conversations,
            scheduler,
            identities: self.identities,
            seen: self.seen,
            cycle: self.cycle,
        }
    }
}

/// JSON snapshot of [`EngineState`] on local disk.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing or unreadable file yields empty state;
    /// neither is fatal.
    pub fn load(&self) -> EngineState {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No snapshot found, starting fresh");
                return EngineState::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Snapshot unreadable, starting fresh");
                return EngineState::default();
            }
        };

        match serde_json::from_slice::<RawSnapshot>(&bytes) {
            Ok(raw) => {
                let state = raw.into_state();
                info!(
                    path = %self.path.display(),
                    conversations = state.conversations.len(),
                    identities = state.identities.len(),
                    rr_index = state.scheduler.rr_index(),
                    cycle = state.cycle,
                    "Snapshot loaded"
                );
                state
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Snapshot corrupt, starting fresh");
                EngineState::default()
            }
        }
    }

    /// Write the snapshot atomically: a temp file in the same directory is
    /// fully written, flushed and then renamed over the target.
    pub fn save(&self, state: &EngineState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let tmp = NamedTempFile::new_in(&dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, state)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        debug!(path = %self.path.display(), conversations = state.conversations.len(), "Snapshot saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::testing::identity;
    use crate::types::pair_key;

    fn sample_state() -> EngineState {
        let mut state = EngineState::default();
        state.install_directory(IdentityDirectory::from_identities(vec![
            identity("+331", 1, 0),
            identity("+332", 1, 1),
            identity("+333", 2, 0),
        ]));
        state
            .conversations
            .create(pair_key("+331", "+332"), Conversation::started("+331", Utc::now()));
        state
            .conversations
            .create(pair_key("+331", "+333"), Conversation::failed("rejected", Utc::now()));
        state.scheduler = RoundRobin::at(1);
        state.seen.observe("17");
        state.cycle = 3;
        state
    }

    #[test]
    fn save_then_load_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.json"));
        let state = sample_state();

        store.save(&state).unwrap();
        assert_eq!(store.load(), state);
    }

    #[test]
    fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("absent.json"));
        assert_eq!(store.load(), EngineState::default());
    }

    #[test]
    fn corrupt_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{\"conversations\": [1, 2").unwrap();
        assert_eq!(SnapshotStore::new(&path).load(), EngineState::default());
    }

    #[test]
    fn snapshot_layout_uses_flat_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.json"));
        store.save(&sample_state()).unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(json["rr_index"], 1);
        assert_eq!(json["identities"]["+332"], "1|1");
        assert_eq!(json["conversations"]["+331|+332"]["status"], "active");
        assert_eq!(json["conversations"]["+331|+333"]["turn"], 0);
        assert!(json["seen"]["17"].is_string());
    }

    #[test]
    fn malformed_pair_keys_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let now = Utc::now().to_rfc3339();
        let raw = format!(
            r#"{{
                "conversations": {{
                    "+331|+332": {{"turn": 2, "status": "active", "last_sender": "+332", "updated_at": "{now}"}},
                    "+332|+331": {{"turn": 1, "status": "active", "updated_at": "{now}"}},
                    "garbage": {{"turn": 1, "status": "done", "updated_at": "{now}"}}
                }},
                "rr_index": 0,
                "identities": {{"+331": "1|0", "+332": "1|1"}}
            }}"#
        );
        fs::write(&path, raw).unwrap();

        let state = SnapshotStore::new(&path).load();
        assert_eq!(state.conversations.len(), 1);
        assert_eq!(state.conversations.get(&pair_key("+331", "+332")).unwrap().turn, 2);
        assert!(state.seen.is_empty());
    }

    #[test]
    fn overwrite_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("nested").join("state.json"));
        store.save(&sample_state()).unwrap();
        store.save(&EngineState::default()).unwrap();
        assert_eq!(store.load(), EngineState::default());

        // No temp files left behind.
        let leftovers = fs::read_dir(dir.path().join("nested")).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
