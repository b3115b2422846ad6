use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info, warn};

use super::refresh_or_keep;
use crate::config::LoopConfig;
use crate::engine::{ConversationEngine, FixedScriptRun};
use crate::error::{EngineError, Result};
use crate::snapshot::SnapshotStore;
use crate::state::EngineState;
use crate::types::Identity;

/// Every unordered pair `(a, b)` with `a` before `b` in address order.
pub fn unordered_pairs(identities: &[Identity]) -> Vec<(Identity, Identity)> {
    let mut sorted = identities.to_vec();
    sorted.sort_by(|a, b| a.address.cmp(&b.address));
    let mut pairs = Vec::with_capacity(sorted.len() * sorted.len().saturating_sub(1) / 2);
    for (i, a) in sorted.iter().enumerate() {
        for b in &sorted[i + 1..] {
            pairs.push((a.clone(), b.clone()));
        }
    }
    pairs
}

/// Outcome of one fan-out cycle.
#[derive(Debug, Clone, Default)]
pub struct FanOutReport {
    pub cycle: u64,
    pub runs: Vec<FixedScriptRun>,
    /// Pair units that panicked instead of reporting.
    pub lost: usize,
}

impl FanOutReport {
    pub fn completed(&self, max_turns: u32) -> usize {
        self.runs.iter().filter(|r| r.is_complete(max_turns)).count()
    }

    pub fn failed(&self) -> usize {
        self.runs.iter().filter(|r| r.error.is_some()).count()
    }
}

impl fmt::Display for FanOutReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Fan-out cycle {} ===", self.cycle)?;
        writeln!(f, "Pairs:   {}", self.runs.len() + self.lost)?;
        writeln!(f, "Failed:  {}", self.failed())?;
        write!(f, "Lost:    {}", self.lost)
    }
}

/// Runs every pair's dialogue concurrently, one independent task per pair,
/// and waits for all of them before pausing.
pub struct FanOut {
    engine: Arc<ConversationEngine>,
    snapshots: SnapshotStore,
    config: LoopConfig,
}

impl FanOut {
    pub fn new(engine: Arc<ConversationEngine>, snapshots: SnapshotStore, config: LoopConfig) -> Self {
        Self {
            engine,
            snapshots,
            config,
        }
    }

    pub async fn run(&self, state: &mut EngineState) -> Result<()> {
        info!("Fan-out runner started");
        loop {
            match self.run_cycle(state).await {
                Ok(report) => {
                    info!(
                        cycle = report.cycle,
                        pairs = report.runs.len(),
                        failed = report.failed(),
                        lost = report.lost,
                        "Cycle complete"
                    );
                    if self.config.runs_once() {
                        return Ok(());
                    }
                    tokio::time::sleep(self.config.cycle_pause).await;
                }
                Err(e) => {
                    error!(error = %e, "Fan-out cycle failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// One cycle: spawn a unit per pair, join them all, then persist. Units
    /// share nothing but the gateway; only this coordinator writes state.
    pub async fn run_cycle(&self, state: &mut EngineState) -> Result<FanOutReport> {
        refresh_or_keep(self.engine.gateway().as_ref(), state).await;

        let identities = state.identities.identities();
        if identities.len() < 2 {
            return Err(EngineError::InsufficientIdentities {
                found: identities.len(),
            });
        }

        let pairs = unordered_pairs(&identities);
        info!(pairs = pairs.len(), cycle = state.cycle + 1, "Fan-out cycle started");

        let handles: Vec<_> = pairs
            .into_iter()
            .map(|(a, b)| {
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move { engine.run_fixed_script(&a, &b).await })
            })
            .collect();

        let mut report = FanOutReport::default();
        for joined in join_all(handles).await {
            match joined {
                Ok(run) => report.runs.push(run),
                Err(e) => {
                    warn!(error = %e, "Pair unit did not report");
                    report.lost += 1;
                }
            }
        }

        state.cycle += 1;
        report.cycle = state.cycle;
        self.snapshots.save(state)?;
        Ok(report)
    }
}
