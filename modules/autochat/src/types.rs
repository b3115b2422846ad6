use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use exagate_client::{Ack, Identity, InboundEvent, RouteHandle};

const PAIR_SEPARATOR: char = '|';

/// Order-independent key of a two-identity conversation: the two addresses
/// sorted lexicographically and joined with `|`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairKey(String);

impl PairKey {
    pub fn new(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{first}{PAIR_SEPARATOR}{second}"))
    }

    /// Accept a persisted key only if it splits into two non-empty, sorted parts.
    pub fn parse(raw: &str) -> Option<Self> {
        let (a, b) = raw.split_once(PAIR_SEPARATOR)?;
        if a.is_empty() || b.is_empty() || b.contains(PAIR_SEPARATOR) || a > b {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn participants(&self) -> (&str, &str) {
        self.0
            .split_once(PAIR_SEPARATOR)
            .unwrap_or((self.0.as_str(), ""))
    }

    pub fn contains(&self, address: &str) -> bool {
        let (a, b) = self.participants();
        a == address || b == address
    }

    /// The participant that is not `address`, if `address` is in the pair.
    pub fn other(&self, address: &str) -> Option<&str> {
        match self.participants() {
            (a, b) if a == address => Some(b),
            (a, b) if b == address => Some(a),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn pair_key(a: &str, b: &str) -> PairKey {
    PairKey::new(a, b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Done,
    Error,
}

impl ConversationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Progress of the scripted dialogue between the two identities of a pair.
///
/// `turn` never decreases, and once `status` leaves `Active` every mutator
/// is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub turn: u32,
    pub status: ConversationStatus,
    #[serde(default)]
    pub last_sender: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Conversation {
    /// First line went out from `sender`.
    pub fn started(sender: &str, now: DateTime<Utc>) -> Self {
        Self {
            turn: 1,
            status: ConversationStatus::Active,
            last_sender: Some(sender.to_string()),
            updated_at: now,
            last_error: None,
        }
    }

    /// The opening send failed; the pair is abandoned.
    pub fn failed(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            turn: 0,
            status: ConversationStatus::Error,
            last_sender: None,
            updated_at: now,
            last_error: Some(error.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record that `sender` delivered the line for `turn`. Completes the
    /// conversation once `max_turns` is reached. Returns false if terminal.
    pub fn record_turn(
        &mut self,
        turn: u32,
        sender: &str,
        max_turns: u32,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.turn = self.turn.max(turn);
        self.last_sender = Some(sender.to_string());
        self.updated_at = now;
        if self.turn >= max_turns {
            self.status = ConversationStatus::Done;
        }
        true
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = ConversationStatus::Done;
        self.updated_at = now;
        true
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = ConversationStatus::Error;
        self.last_error = Some(error.into());
        self.updated_at = now;
        true
    }
}
