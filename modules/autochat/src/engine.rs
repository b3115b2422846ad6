use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::directory::IdentityDirectory;
use crate::error::{EngineError, Result};
use crate::gateway::Gateway;
use crate::rate::SendRateLimiter;
use crate::script::Script;
use crate::store::ConversationStore;
use crate::types::{pair_key, Conversation, ConversationStatus, Identity, InboundEvent, PairKey};

/// Result of trying to open a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiateOutcome {
    Started { pair: PairKey },
    /// Send failed; the pair is recorded as `Error` and never retried.
    Failed { pair: PairKey, error: String },
    /// Over the send budget; nothing recorded, retried on a later tick.
    RateLimited { pair: PairKey },
    AlreadyExists { pair: PairKey, status: ConversationStatus },
}

/// Result of feeding one inbound event through the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Sender is not one of our identities.
    UnknownSender { from: String },
    /// No receiver could be resolved; the event is dropped.
    Unmatched { from: String },
    /// Pair already terminal.
    Ignored { pair: PairKey, status: ConversationStatus },
    /// Turn limit was already reached; closed without replying.
    Completed { pair: PairKey, turn: u32 },
    Replied { pair: PairKey, turn: u32, done: bool },
    RateLimited { pair: PairKey },
    /// Reply failed; the pair is now `Error`.
    Failed { pair: PairKey, error: String },
}

/// Outcome of a fixed-schedule dialogue between two identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedScriptRun {
    pub pair: PairKey,
    /// Identity that sent the odd turns.
    pub first: String,
    /// Identity that sent the even turns.
    pub second: String,
    pub turns_sent: u32,
    pub error: Option<String>,
}

impl FixedScriptRun {
    pub fn is_complete(&self, max_turns: u32) -> bool {
        self.error.is_none() && self.turns_sent >= max_turns
    }

    fn last_sender(&self) -> &str {
        if self.turns_sent % 2 == 1 {
            &self.first
        } else {
            &self.second
        }
    }
}

impl fmt::Display for FixedScriptRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None => write!(f, "{}: {} turns", self.pair, self.turns_sent),
            Some(e) => write!(f, "{}: failed after {} turns ({e})", self.pair, self.turns_sent),
        }
    }
}

/// Drives the per-pair turn state machine against the gateway.
pub struct ConversationEngine {
    gateway: Arc<dyn Gateway>,
    config: EngineConfig,
    script: Script,
    limiter: Mutex<SendRateLimiter>,
}

impl ConversationEngine {
    pub fn new(gateway: Arc<dyn Gateway>, config: EngineConfig) -> Self {
        Self::with_script(gateway, config, Script::default())
    }

    pub fn with_script(gateway: Arc<dyn Gateway>, config: EngineConfig, script: Script) -> Self {
        let limiter = SendRateLimiter::new(config.global_send_per_min, config.per_route_send_per_min);
        Self {
            gateway,
            config,
            script,
            limiter: Mutex::new(limiter),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn max_turns(&self) -> u32 {
        self.config.max_turns
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    fn admit(&self, identity: &Identity) -> bool {
        match self.limiter.lock() {
            Ok(mut limiter) => limiter.try_acquire(&identity.route),
            Err(poisoned) => poisoned.into_inner().try_acquire(&identity.route),
        }
    }

    /// Open a conversation from `sender` to `target` with the first scripted line.
    pub async fn initiate(
        &self,
        conversations: &mut ConversationStore,
        sender: &Identity,
        target: &str,
    ) -> InitiateOutcome {
        let pair = pair_key(&sender.address, target);
        if let Some(status) = conversations.status(&pair) {
            return InitiateOutcome::AlreadyExists { pair, status };
        }
        if !self.admit(sender) {
            debug!(pair = %pair, "Initiate rate limited");
            return InitiateOutcome::RateLimited { pair };
        }

        match self.gateway.send(&sender.route, target, self.script.line(1)).await {
            Ok(_) => {
                conversations.create(pair.clone(), Conversation::started(&sender.address, Utc::now()));
                info!(pair = %pair, from = %sender.address, to = target, "Conversation started");
                InitiateOutcome::Started { pair }
            }
            Err(e) => {
                let error = e.to_string();
                warn!(pair = %pair, from = %sender.address, to = target, error = %error, "Opening send failed, abandoning pair");
                conversations.create(pair.clone(), Conversation::failed(&error, Utc::now()));
                InitiateOutcome::Failed { pair, error }
            }
        }
    }

    /// Work out which of our identities received `event`.
    ///
    /// Exact route match first. Otherwise the first active conversation, in
    /// pair-key order, that involves the sender. That fallback is ambiguous
    /// when the sender is active with several peers; pair-key order keeps it
    /// reproducible.
    pub fn resolve_receiver(
        &self,
        directory: &IdentityDirectory,
        conversations: &ConversationStore,
        event: &InboundEvent,
    ) -> Result<String> {
        let from = event.from_address.as_str();

        if let Some(route) = &event.route_handle {
            if let Some(address) = directory.address_for_route(route) {
                if address != from {
                    return Ok(address.to_string());
                }
            }
        }

        conversations
            .active()
            .filter_map(|(pair, _)| pair.other(from))
            .find(|other| directory.contains(other))
            .map(str::to_string)
            .ok_or_else(|| EngineError::UnmatchedInbound {
                from: from.to_string(),
            })
    }

    /// Advance the matched conversation in response to an inbound message:
    /// reply with the next scripted line from the receiver, or close it once
    /// the turn limit is met.
    pub async fn handle_inbound(
        &self,
        directory: &IdentityDirectory,
        conversations: &mut ConversationStore,
        event: &InboundEvent,
    ) -> InboundOutcome {
        let from = event.from_address.clone();
        if !directory.contains(&from) {
            debug!(from = %from, id = %event.id, "Inbound from unknown sender");
            return InboundOutcome::UnknownSender { from };
        }

        let receiver = match self.resolve_receiver(directory, conversations, event) {
            Ok(receiver) => receiver,
            Err(_) => {
                info!(from = %from, id = %event.id, route = ?event.route_handle, "Inbound matches no conversation, dropped");
                return InboundOutcome::Unmatched { from };
            }
        };
        let Some(receiver_identity) = directory.identity(&receiver) else {
            return InboundOutcome::Unmatched { from };
        };

        let pair = pair_key(&from, &receiver);
        if !conversations.contains(&pair) {
            // The peer opened this pair without us recording it.
            conversations.create(pair.clone(), Conversation::started(&from, Utc::now()));
        }

        let (turn, status) = match conversations.get(&pair) {
            Some(c) => (c.turn, c.status),
            None => return InboundOutcome::Unmatched { from },
        };

        if status.is_terminal() {
            debug!(pair = %pair, status = %status, "Inbound for finished conversation, skipped");
            return InboundOutcome::Ignored { pair, status };
        }

        let max_turns = self.config.max_turns;
        if turn >= max_turns {
            if let Some(c) = conversations.get_mut(&pair) {
                c.complete(Utc::now());
            }
            info!(pair = %pair, turn, "Conversation done");
            return InboundOutcome::Completed { pair, turn };
        }

        if !self.admit(&receiver_identity) {
            debug!(pair = %pair, "Reply rate limited");
            return InboundOutcome::RateLimited { pair };
        }

        let next_turn = turn + 1;
        self.config.reply_delay.wait().await;

        let sent = self
            .gateway
            .send(&receiver_identity.route, &from, self.script.line(next_turn))
            .await;

        let Some(conversation) = conversations.get_mut(&pair) else {
            return InboundOutcome::Unmatched { from };
        };
        match sent {
            Ok(_) => {
                conversation.record_turn(next_turn, &receiver, max_turns, Utc::now());
                let done = conversation.status == ConversationStatus::Done;
                info!(pair = %pair, from = %receiver, to = %from, turn = next_turn, done, "Replied");
                InboundOutcome::Replied {
                    pair,
                    turn: next_turn,
                    done,
                }
            }
            Err(e) => {
                let error = e.to_string();
                conversation.fail(&error, Utc::now());
                warn!(pair = %pair, from = %receiver, error = %error, "Reply failed, abandoning pair");
                InboundOutcome::Failed { pair, error }
            }
        }
    }

    /// Play the whole script between two identities on a fixed schedule:
    /// odd turns from `first`, even turns from `second`, pausing between turns.
    /// Reads no shared state, so runs for different pairs may overlap freely.
    pub async fn run_fixed_script(&self, first: &Identity, second: &Identity) -> FixedScriptRun {
        let pair = pair_key(&first.address, &second.address);
        let max_turns = self.config.max_turns;
        let mut run = FixedScriptRun {
            pair,
            first: first.address.clone(),
            second: second.address.clone(),
            turns_sent: 0,
            error: None,
        };

        for turn in 1..=max_turns {
            let (from, to) = if turn % 2 == 1 {
                (first, second)
            } else {
                (second, first)
            };

            if let Err(e) = self
                .gateway
                .send(&from.route, &to.address, self.script.line(turn))
                .await
            {
                warn!(pair = %run.pair, turn, error = %e, "Scripted send failed, abandoning pair");
                run.error = Some(e.to_string());
                return run;
            }
            run.turns_sent = turn;
            debug!(pair = %run.pair, turn, from = %from.address, "Scripted turn sent");

            if turn < max_turns {
                self.config.turn_delay.wait().await;
            }
        }

        info!(pair = %run.pair, turns = run.turns_sent, "Scripted conversation complete");
        run
    }

    /// Record a fixed-script run in the store as a terminal conversation.
    /// A record left active by another strategy is replaced.
    pub fn settle_fixed_run(&self, conversations: &mut ConversationStore, run: &FixedScriptRun) {
        let now = Utc::now();
        let conversation = if run.turns_sent == 0 {
            Conversation::failed(run.error.clone().unwrap_or_default(), now)
        } else {
            let mut c = Conversation::started(&run.first, now);
            c.record_turn(run.turns_sent, run.last_sender(), self.config.max_turns, now);
            if let Some(error) = &run.error {
                c.fail(error, now);
            }
            c
        };
        if !conversations.settle(run.pair.clone(), conversation) {
            debug!(pair = %run.pair, "Pair already finished, keeping existing conversation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{identity, inbound, MockGateway};
    use crate::types::RouteHandle;

    fn setup(max_turns: u32) -> (Arc<MockGateway>, ConversationEngine, IdentityDirectory) {
        let ids = vec![identity("A", 1, 0), identity("B", 1, 1), identity("C", 2, 0)];
        let gateway = Arc::new(MockGateway::new(ids.clone()));
        let engine = ConversationEngine::new(gateway.clone(), EngineConfig::immediate(max_turns));
        (gateway, engine, IdentityDirectory::from_identities(ids))
    }

    fn active_at(turn: u32, last: &str) -> Conversation {
        let now = Utc::now();
        let mut c = Conversation::started(last, now);
        c.turn = turn;
        c
    }

    #[tokio::test]
    async fn initiate_creates_turn_one() {
        let (gateway, engine, dir) = setup(4);
        let mut store = ConversationStore::new();
        let sender = dir.identity("A").unwrap();

        let outcome = engine.initiate(&mut store, &sender, "B").await;
        assert_eq!(outcome, InitiateOutcome::Started { pair: pair_key("A", "B") });

        let conv = store.get(&pair_key("B", "A")).unwrap();
        assert_eq!(conv.turn, 1);
        assert_eq!(conv.status, ConversationStatus::Active);
        assert_eq!(conv.last_sender.as_deref(), Some("A"));

        let sent = gateway.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].route, RouteHandle::new(1, 0));
        assert_eq!(sent[0].to, "B");
        assert_eq!(sent[0].text, engine.script().line(1));
    }

    #[tokio::test]
    async fn failed_initiate_is_terminal_error() {
        let (gateway, engine, dir) = setup(4);
        gateway.fail_sends_to("B");
        let mut store = ConversationStore::new();
        let sender = dir.identity("A").unwrap();

        let outcome = engine.initiate(&mut store, &sender, "B").await;
        assert!(matches!(outcome, InitiateOutcome::Failed { .. }));
        let conv = store.get(&pair_key("A", "B")).unwrap();
        assert_eq!(conv.turn, 0);
        assert_eq!(conv.status, ConversationStatus::Error);

        // Never retried.
        gateway.clear_failures();
        let again = engine.initiate(&mut store, &sender, "B").await;
        assert!(matches!(again, InitiateOutcome::AlreadyExists { status: ConversationStatus::Error, .. }));
        assert_eq!(gateway.sent().len(), 0);
    }

    #[tokio::test]
    async fn reply_at_turn_three_completes_at_four() {
        let (gateway, engine, dir) = setup(4);
        let mut store = ConversationStore::new();
        store.create(pair_key("A", "B"), active_at(3, "A"));

        // B received A's turn-3 message on route 1|1.
        let event = inbound("100", "A", Some(RouteHandle::new(1, 1)));
        let outcome = engine.handle_inbound(&dir, &mut store, &event).await;
        assert_eq!(
            outcome,
            InboundOutcome::Replied { pair: pair_key("A", "B"), turn: 4, done: true }
        );

        let conv = store.get(&pair_key("A", "B")).unwrap();
        assert_eq!(conv.turn, 4);
        assert_eq!(conv.status, ConversationStatus::Done);
        assert_eq!(conv.last_sender.as_deref(), Some("B"));

        let sent = gateway.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].route, RouteHandle::new(1, 1));
        assert_eq!(sent[0].to, "A");
        assert_eq!(sent[0].text, engine.script().line(4));
    }

    #[tokio::test]
    async fn inbound_at_turn_limit_sends_nothing() {
        let (gateway, engine, dir) = setup(4);
        let mut store = ConversationStore::new();
        store.create(pair_key("A", "B"), active_at(4, "B"));

        let event = inbound("101", "B", Some(RouteHandle::new(1, 0)));
        let outcome = engine.handle_inbound(&dir, &mut store, &event).await;
        assert_eq!(outcome, InboundOutcome::Completed { pair: pair_key("A", "B"), turn: 4 });
        assert!(gateway.sent().is_empty());

        let conv = store.get(&pair_key("A", "B")).unwrap();
        assert_eq!(conv.turn, 4);
        assert_eq!(conv.last_sender.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn terminal_pairs_ignore_inbound() {
        let (gateway, engine, dir) = setup(4);
        let mut store = ConversationStore::new();
        let mut done = active_at(2, "A");
        done.complete(Utc::now());
        store.create(pair_key("A", "B"), done.clone());
        store.create(pair_key("A", "C"), Conversation::failed("rejected", Utc::now()));

        let to_b = inbound("1", "A", Some(RouteHandle::new(1, 1)));
        let to_c = inbound("2", "A", Some(RouteHandle::new(2, 0)));
        assert!(matches!(
            engine.handle_inbound(&dir, &mut store, &to_b).await,
            InboundOutcome::Ignored { status: ConversationStatus::Done, .. }
        ));
        assert!(matches!(
            engine.handle_inbound(&dir, &mut store, &to_c).await,
            InboundOutcome::Ignored { status: ConversationStatus::Error, .. }
        ));
        assert!(gateway.sent().is_empty());
        assert_eq!(store.get(&pair_key("A", "B")), Some(&done));
        assert_eq!(store.get(&pair_key("A", "C")).unwrap().turn, 0);
    }

    #[tokio::test]
    async fn failed_reply_marks_error() {
        let (gateway, engine, dir) = setup(6);
        gateway.fail_sends_from(RouteHandle::new(1, 1));
        let mut store = ConversationStore::new();
        store.create(pair_key("A", "B"), active_at(1, "A"));

        let event = inbound("7", "A", Some(RouteHandle::new(1, 1)));
        let outcome = engine.handle_inbound(&dir, &mut store, &event).await;
        assert!(matches!(outcome, InboundOutcome::Failed { .. }));
        let conv = store.get(&pair_key("A", "B")).unwrap();
        assert_eq!(conv.status, ConversationStatus::Error);
        assert_eq!(conv.turn, 1);
    }

    #[tokio::test]
    async fn fallback_matching_uses_active_conversation() {
        let (gateway, engine, dir) = setup(6);
        let mut store = ConversationStore::new();
        store.create(pair_key("A", "C"), active_at(1, "A"));

        // No route reported: resolved through the active A|C conversation.
        let event = inbound("8", "A", None);
        let outcome = engine.handle_inbound(&dir, &mut store, &event).await;
        assert_eq!(
            outcome,
            InboundOutcome::Replied { pair: pair_key("A", "C"), turn: 2, done: false }
        );
        assert_eq!(gateway.sent()[0].route, RouteHandle::new(2, 0));
    }

    #[tokio::test]
    async fn fallback_is_first_active_in_pair_key_order() {
        let (_gateway, engine, dir) = setup(6);
        let mut store = ConversationStore::new();
        store.create(pair_key("A", "C"), active_at(1, "A"));
        store.create(pair_key("A", "B"), active_at(1, "A"));

        let event = inbound("9", "A", Some(RouteHandle::new(99, 0)));
        assert_eq!(engine.resolve_receiver(&dir, &store, &event).unwrap(), "B");
    }

    #[tokio::test]
    async fn unknown_and_unmatched_are_dropped() {
        let (gateway, engine, dir) = setup(6);
        let mut store = ConversationStore::new();

        let stranger = inbound("1", "+99999999", Some(RouteHandle::new(1, 1)));
        assert!(matches!(
            engine.handle_inbound(&dir, &mut store, &stranger).await,
            InboundOutcome::UnknownSender { .. }
        ));

        let orphan = inbound("2", "A", None);
        assert!(matches!(
            engine.handle_inbound(&dir, &mut store, &orphan).await,
            InboundOutcome::Unmatched { .. }
        ));
        assert!(store.is_empty());
        assert!(gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn inbound_for_unknown_pair_creates_it() {
        let (gateway, engine, dir) = setup(6);
        let mut store = ConversationStore::new();

        let event = inbound("3", "C", Some(RouteHandle::new(1, 0)));
        let outcome = engine.handle_inbound(&dir, &mut store, &event).await;
        assert_eq!(
            outcome,
            InboundOutcome::Replied { pair: pair_key("A", "C"), turn: 2, done: false }
        );
        assert_eq!(gateway.sent()[0].to, "C");
    }

    #[tokio::test]
    async fn rate_limited_reply_leaves_conversation() {
        let ids = vec![identity("A", 1, 0), identity("B", 1, 1)];
        let gateway = Arc::new(MockGateway::new(ids.clone()));
        let mut config = EngineConfig::immediate(6);
        config.per_route_send_per_min = 1;
        let engine = ConversationEngine::new(gateway.clone(), config);
        let dir = IdentityDirectory::from_identities(ids);
        let mut store = ConversationStore::new();

        let a = dir.identity("A").unwrap();
        assert!(matches!(engine.initiate(&mut store, &a, "B").await, InitiateOutcome::Started { .. }));

        // B's route still has budget, A's does not.
        let first = inbound("1", "A", Some(RouteHandle::new(1, 1)));
        assert!(matches!(engine.handle_inbound(&dir, &mut store, &first).await, InboundOutcome::Replied { .. }));
        let second = inbound("2", "B", Some(RouteHandle::new(1, 0)));
        assert!(matches!(
            engine.handle_inbound(&dir, &mut store, &second).await,
            InboundOutcome::RateLimited { .. }
        ));
        let conv = store.get(&pair_key("A", "B")).unwrap();
        assert_eq!(conv.turn, 2);
        assert_eq!(conv.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn turn_never_decreases_across_transitions() {
        let (_gateway, engine, dir) = setup(5);
        let mut store = ConversationStore::new();
        let a = dir.identity("A").unwrap();
        engine.initiate(&mut store, &a, "B").await;

        let mut last = store.get(&pair_key("A", "B")).unwrap().turn;
        let routes = [RouteHandle::new(1, 1), RouteHandle::new(1, 0)];
        for i in 0..8 {
            let from = if i % 2 == 0 { "A" } else { "B" };
            let event = inbound(&format!("{i}"), from, Some(routes[i % 2]));
            engine.handle_inbound(&dir, &mut store, &event).await;
            let conv = store.get(&pair_key("A", "B")).unwrap();
            assert!(conv.turn >= last);
            last = conv.turn;
        }
        let conv = store.get(&pair_key("A", "B")).unwrap();
        assert_eq!(conv.turn, 5);
        assert_eq!(conv.status, ConversationStatus::Done);
    }

    #[tokio::test]
    async fn fixed_script_alternates_senders() {
        let (gateway, engine, dir) = setup(4);
        let a = dir.identity("A").unwrap();
        let b = dir.identity("B").unwrap();

        let run = engine.run_fixed_script(&a, &b).await;
        assert!(run.is_complete(4));
        let sent = gateway.sent();
        let pattern: Vec<(&str, &str)> = sent.iter().map(|s| (s.to.as_str(), s.text.as_str())).collect();
        assert_eq!(
            pattern,
            vec![
                ("B", engine.script().line(1)),
                ("A", engine.script().line(2)),
                ("B", engine.script().line(3)),
                ("A", engine.script().line(4)),
            ]
        );
        assert_eq!(sent[0].route, a.route);
        assert_eq!(sent[1].route, b.route);
    }

    #[tokio::test]
    async fn fixed_script_stops_on_failure_and_settles_error() {
        let (gateway, engine, dir) = setup(4);
        gateway.fail_sends_from(RouteHandle::new(1, 1));
        let a = dir.identity("A").unwrap();
        let b = dir.identity("B").unwrap();

        let run = engine.run_fixed_script(&a, &b).await;
        assert_eq!(run.turns_sent, 1);
        assert!(run.error.is_some());

        let mut store = ConversationStore::new();
        engine.settle_fixed_run(&mut store, &run);
        let conv = store.get(&pair_key("A", "B")).unwrap();
        assert_eq!(conv.status, ConversationStatus::Error);
        assert_eq!(conv.turn, 1);
        assert_eq!(conv.last_sender.as_deref(), Some("A"));
    }
}
