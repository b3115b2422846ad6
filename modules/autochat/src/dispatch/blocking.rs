use std::sync::Arc;

use tracing::{error, info};

use super::refresh_or_keep;
use crate::config::LoopConfig;
use crate::engine::{ConversationEngine, FixedScriptRun};
use crate::error::{EngineError, Result};
use crate::scheduler::Advance;
use crate::snapshot::SnapshotStore;
use crate::state::EngineState;
use crate::types::pair_key;

/// One sender's turn at the baton.
#[derive(Debug, Clone)]
pub struct SenderRound {
    pub sender: String,
    pub runs: Vec<FixedScriptRun>,
    pub advance: Advance,
}

/// Plays each pair's whole dialogue to the end before moving to the next
/// pair. At most one conversation is in flight.
pub struct BlockingRunner {
    engine: Arc<ConversationEngine>,
    snapshots: SnapshotStore,
    config: LoopConfig,
}

impl BlockingRunner {
    pub fn new(engine: Arc<ConversationEngine>, snapshots: SnapshotStore, config: LoopConfig) -> Self {
        Self {
            engine,
            snapshots,
            config,
        }
    }

    pub async fn run(&self, state: &mut EngineState) -> Result<()> {
        info!("Blocking runner started");
        loop {
            match self.run_cycle(state).await {
                Ok(rounds) => {
                    let pairs: usize = rounds.iter().map(|r| r.runs.len()).sum();
                    info!(cycle = state.cycle, senders = rounds.len(), pairs, "Cycle complete");
                    if self.config.runs_once() {
                        return Ok(());
                    }
                    tokio::time::sleep(self.config.cycle_pause).await;
                }
                Err(e) => {
                    error!(error = %e, "Blocking cycle failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Rounds until the round-robin index wraps back to the first identity.
    pub async fn run_cycle(&self, state: &mut EngineState) -> Result<Vec<SenderRound>> {
        refresh_or_keep(self.engine.gateway().as_ref(), state).await;

        let mut rounds = Vec::new();
        loop {
            let round = self.run_sender_round(state).await?;
            let done = round.advance.cycle_completed;
            rounds.push(round);
            if done {
                return Ok(rounds);
            }
        }
    }

    /// Let the current sender play the script with every peer it has not
    /// finished with, then pass the baton.
    pub async fn run_sender_round(&self, state: &mut EngineState) -> Result<SenderRound> {
        let sender_address = state.current_sender()?;
        let sender = state
            .identities
            .identity(&sender_address)
            .ok_or(EngineError::InsufficientIdentities {
                found: state.identities.len(),
            })?;

        let pending: Vec<_> = state
            .identities
            .peers(&sender.address)
            .into_iter()
            .filter(|peer| {
                !state
                    .conversations
                    .status(&pair_key(&sender.address, peer))
                    .is_some_and(|s| s.is_terminal())
            })
            .filter_map(|peer| state.identities.identity(&peer))
            .collect();

        info!(sender = %sender.address, pairs = pending.len(), "Sender round started");

        let mut runs = Vec::with_capacity(pending.len());
        for (i, peer) in pending.iter().enumerate() {
            if i > 0 {
                self.config.pair_delay.wait().await;
            }
            let run = self.engine.run_fixed_script(&sender, peer).await;
            self.engine.settle_fixed_run(&mut state.conversations, &run);
            self.snapshots.save(state)?;
            info!(%run, "Pair finished");
            runs.push(run);
        }

        let advance = state.advance()?;
        self.snapshots.save(state)?;

        Ok(SenderRound {
            sender: sender.address,
            runs,
            advance,
        })
    }
}
