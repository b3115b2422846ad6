//! Dispatch strategies: the loops that decide when conversations are
//! opened and advanced.
//!
//! - [`TickLoop`]: poll inbound and answer, open new pairs on a scheduler tick.
//! - [`BlockingRunner`]: one pair at a time, each dialogue played to the end.
//! - [`FanOut`]: every pair of a cycle concurrently, joined before the pause.

mod blocking;
mod fanout;
mod tick;

use std::fmt;

use tracing::warn;

pub use blocking::{BlockingRunner, SenderRound};
pub use fanout::{unordered_pairs, FanOut, FanOutReport};
pub use tick::{IterationReport, TickLoop};

use crate::directory::IdentityDirectory;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::state::{DirectoryChange, EngineState};

/// What one scheduler tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sender: String,
    pub advanced: bool,
    pub cycle_completed: bool,
    /// Opening messages delivered.
    pub sent: usize,
    /// Peers that already had a conversation with the sender.
    pub skipped: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub active: usize,
}

impl fmt::Display for TickReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Tick ===")?;
        writeln!(f, "Sender:           {}", self.sender)?;
        writeln!(f, "Advanced:         {}", self.advanced)?;
        writeln!(f, "Cycle completed:  {}", self.cycle_completed)?;
        writeln!(f, "Sent:             {}", self.sent)?;
        writeln!(f, "Skipped:          {}", self.skipped)?;
        writeln!(f, "Failed:           {}", self.failed)?;
        writeln!(f, "Rate limited:     {}", self.rate_limited)?;
        write!(f, "Active:           {}", self.active)
    }
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        !self.advanced && self.sent + self.failed + self.rate_limited == 0
    }
}

/// What one inbound drain did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundReport {
    pub fetched: usize,
    pub duplicates: usize,
    pub replied: usize,
    pub completed: usize,
    pub ignored: usize,
    pub unmatched: usize,
    pub failed: usize,
    pub rate_limited: usize,
}

impl InboundReport {
    /// True when nothing new arrived.
    pub fn is_empty(&self) -> bool {
        self.fetched == self.duplicates
    }
}

impl fmt::Display for InboundReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched={} duplicates={} replied={} completed={} ignored={} unmatched={} failed={} rate_limited={}",
            self.fetched,
            self.duplicates,
            self.replied,
            self.completed,
            self.ignored,
            self.unmatched,
            self.failed,
            self.rate_limited
        )
    }
}

/// Fetch the SIM directory and install it into `state`.
pub async fn refresh_directory(gateway: &dyn Gateway, state: &mut EngineState) -> Result<DirectoryChange> {
    let identities = gateway.list_identities().await?;
    Ok(state.install_directory(IdentityDirectory::from_identities(identities)))
}

/// Refresh, logging instead of failing: the previous directory stays in use.
pub(crate) async fn refresh_or_keep(gateway: &dyn Gateway, state: &mut EngineState) {
    if let Err(e) = refresh_directory(gateway, state).await {
        warn!(error = %e, kept = state.identities.len(), "Directory refresh failed, keeping previous");
    }
}
