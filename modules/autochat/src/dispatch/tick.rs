use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::{refresh_directory, InboundReport, TickReport};
use crate::config::LoopConfig;
use crate::engine::{ConversationEngine, InboundOutcome, InitiateOutcome};
use crate::error::{EngineError, Result};
use crate::snapshot::SnapshotStore;
use crate::state::EngineState;
use crate::types::pair_key;

/// What one pass of the tick loop did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub refreshed: bool,
    pub inbound: Option<InboundReport>,
    pub tick: Option<TickReport>,
}

impl IterationReport {
    pub fn cycle_completed(&self) -> bool {
        self.tick.as_ref().is_some_and(|t| t.cycle_completed)
    }
}

/// Poll-driven dispatcher: answers inbound messages as they arrive and, on a
/// slower tick, lets the current sender open conversations with its peers.
pub struct TickLoop {
    engine: Arc<ConversationEngine>,
    snapshots: SnapshotStore,
    config: LoopConfig,
    last_refresh: Option<Instant>,
    last_tick: Option<Instant>,
}

fn is_due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last {
        None => true,
        Some(at) => now.duration_since(at) >= interval,
    }
}

impl TickLoop {
    pub fn new(engine: Arc<ConversationEngine>, snapshots: SnapshotStore, config: LoopConfig) -> Self {
        Self {
            engine,
            snapshots,
            config,
            last_refresh: None,
            last_tick: None,
        }
    }

    /// Run until a cycle completes with a zero cycle pause, otherwise forever,
    /// sleeping `cycle_pause` between cycles. Iteration errors are logged and
    /// the loop carries on.
    pub async fn run(&mut self, state: &mut EngineState) -> Result<()> {
        info!(
            poll_interval = ?self.config.poll_interval,
            tick_interval = ?self.config.tick_interval,
            "Tick loop started"
        );
        loop {
            match self.iterate(state).await {
                Ok(report) if report.cycle_completed() => {
                    if self.config.runs_once() {
                        info!(cycle = state.cycle, "Cycle complete, stopping");
                        return Ok(());
                    }
                    info!(cycle = state.cycle, pause = ?self.config.cycle_pause, "Cycle complete, pausing");
                    tokio::time::sleep(self.config.cycle_pause).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Tick loop iteration failed"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One pass: refresh the directory when due, drain inbound, tick when
    /// due, then persist.
    pub async fn iterate(&mut self, state: &mut EngineState) -> Result<IterationReport> {
        let now = Instant::now();
        let mut report = IterationReport::default();

        if is_due(self.last_refresh, self.config.refresh_interval, now) {
            match refresh_directory(self.engine.gateway().as_ref(), state).await {
                Ok(_) => {
                    self.last_refresh = Some(now);
                    report.refreshed = true;
                }
                Err(e) => warn!(error = %e, "Directory refresh failed, keeping previous"),
            }
        }

        if state.identities.len() < 2 {
            warn!(identities = state.identities.len(), "Fewer than 2 identities known, waiting");
            return Ok(report);
        }

        match self.drain_inbound(state).await {
            Ok(inbound) => report.inbound = Some(inbound),
            Err(e) => warn!(error = %e, "Inbound poll failed"),
        }

        if is_due(self.last_tick, self.config.tick_interval, now) {
            self.last_tick = Some(now);
            match self.tick(state).await {
                Ok(tick) => report.tick = Some(tick),
                Err(e) => warn!(error = %e, "Scheduler tick failed"),
            }
        }

        self.snapshots.save(state)?;
        Ok(report)
    }

    /// Fetch inbound, drop already-seen ids and feed the rest to the engine
    /// in gateway order.
    pub async fn drain_inbound(&self, state: &mut EngineState) -> Result<InboundReport> {
        let mut events = self.engine.gateway().list_inbound().await?;
        events.sort_by(|a, b| a.sequence().cmp(&b.sequence()).then_with(|| a.id.cmp(&b.id)));

        let mut report = InboundReport {
            fetched: events.len(),
            ..Default::default()
        };

        for event in &events {
            if !state.seen.observe(&event.id) {
                report.duplicates += 1;
                continue;
            }
            let outcome = self
                .engine
                .handle_inbound(&state.identities, &mut state.conversations, event)
                .await;
            match outcome {
                InboundOutcome::Replied { .. } => report.replied += 1,
                InboundOutcome::Completed { .. } => report.completed += 1,
                InboundOutcome::Ignored { .. } => report.ignored += 1,
                InboundOutcome::UnknownSender { .. } | InboundOutcome::Unmatched { .. } => {
                    report.unmatched += 1
                }
                InboundOutcome::Failed { .. } => report.failed += 1,
                InboundOutcome::RateLimited { .. } => report.rate_limited += 1,
            }
        }

        if !report.is_empty() {
            info!(%report, "Inbound processed");
        }
        Ok(report)
    }

    /// Scheduler tick: pass the baton if the current sender is exhausted,
    /// then open a conversation with every peer the sender has none with.
    /// A tick that wraps the round-robin opens nothing; the next cycle starts
    /// on the following tick.
    pub async fn tick(&self, state: &mut EngineState) -> Result<TickReport> {
        let mut report = TickReport {
            sender: state.current_sender()?,
            ..Default::default()
        };

        if state.is_sender_exhausted(&report.sender) {
            let advance = state.advance()?;
            report.sender = advance.sender;
            report.advanced = true;
            report.cycle_completed = advance.cycle_completed;
            if advance.cycle_completed {
                info!(cycle = state.cycle, "Round-robin wrapped");
                return Ok(report);
            }
        }

        let sender = state
            .identities
            .identity(&report.sender)
            .ok_or(EngineError::InsufficientIdentities {
                found: state.identities.len(),
            })?;
        let (existing, missing): (Vec<String>, Vec<String>) = state
            .identities
            .peers(&sender.address)
            .into_iter()
            .partition(|peer| state.conversations.contains(&pair_key(&sender.address, peer)));
        report.skipped = existing.len();

        for (i, peer) in missing.iter().enumerate() {
            if i > 0 {
                self.engine.config().initiate_delay.wait().await;
            }
            match self.engine.initiate(&mut state.conversations, &sender, peer).await {
                InitiateOutcome::Started { .. } => report.sent += 1,
                InitiateOutcome::Failed { .. } => report.failed += 1,
                InitiateOutcome::RateLimited { .. } => report.rate_limited += 1,
                InitiateOutcome::AlreadyExists { .. } => report.skipped += 1,
            }
        }

        report.active = state.conversations.active_count();
        if !report.is_empty() {
            info!(
                sender = %report.sender,
                advanced = report.advanced,
                sent = report.sent,
                skipped = report.skipped,
                failed = report.failed,
                rate_limited = report.rate_limited,
                active = report.active,
                "Tick"
            );
        }
        Ok(report)
    }
}
