// In-memory gateway for tests, enabled by the `test-support` feature.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::gateway::Gateway;
use crate::types::{Ack, Identity, InboundEvent, RouteHandle};

/// A send the mock accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub route: RouteHandle,
    pub to: String,
    pub text: String,
}

pub fn identity(address: &str, device_id: u64, slot: u32) -> Identity {
    Identity {
        address: address.to_string(),
        route: RouteHandle::new(device_id, slot),
    }
}

/// `n` identities `+33700000001..` on device 1, one slot each.
pub fn sims(n: usize) -> Vec<Identity> {
    (1..=n)
        .map(|i| identity(&format!("+3370000{i:04}"), 1, i as u32 - 1))
        .collect()
}

pub fn inbound(id: &str, from: &str, route: Option<RouteHandle>) -> InboundEvent {
    InboundEvent {
        id: id.to_string(),
        from_address: from.to_string(),
        route_handle: route,
        text: "hello".to_string(),
        received_at: None,
    }
}

/// Records every send and replays queued inbound batches, one batch per poll.
///
/// In loopback mode a send addressed to one of the mock's own identities is
/// delivered back as inbound on the next poll, so the tick loop can play
/// whole conversations against it.
pub struct MockGateway {
    identities: Mutex<Vec<Identity>>,
    inbound: Mutex<VecDeque<Vec<InboundEvent>>>,
    sent: Mutex<Vec<SentMessage>>,
    failing_routes: Mutex<HashSet<RouteHandle>>,
    failing_targets: Mutex<HashSet<String>>,
    directory_down: AtomicBool,
    inbound_down: AtomicBool,
    loopback: AtomicBool,
    delivered: Mutex<Vec<InboundEvent>>,
    next_id: AtomicU64,
}

impl MockGateway {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self {
            identities: Mutex::new(identities),
            inbound: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            failing_routes: Mutex::new(HashSet::new()),
            failing_targets: Mutex::new(HashSet::new()),
            directory_down: AtomicBool::new(false),
            inbound_down: AtomicBool::new(false),
            loopback: AtomicBool::new(false),
            delivered: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_inbound(self, batch: Vec<InboundEvent>) -> Self {
        self.queue_inbound(batch);
        self
    }

    pub fn with_loopback(self) -> Self {
        self.loopback.store(true, Ordering::SeqCst);
        self
    }

    pub fn queue_inbound(&self, batch: Vec<InboundEvent>) {
        self.inbound.lock().unwrap().push_back(batch);
    }

    pub fn set_identities(&self, identities: Vec<Identity>) {
        *self.identities.lock().unwrap() = identities;
    }

    /// Every send from `route` is rejected.
    pub fn fail_sends_from(&self, route: RouteHandle) {
        self.failing_routes.lock().unwrap().insert(route);
    }

    /// Every send to `address` is rejected.
    pub fn fail_sends_to(&self, address: &str) {
        self.failing_targets.lock().unwrap().insert(address.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_routes.lock().unwrap().clear();
        self.failing_targets.lock().unwrap().clear();
    }

    pub fn set_directory_down(&self, down: bool) {
        self.directory_down.store(down, Ordering::SeqCst);
    }

    pub fn set_inbound_down(&self, down: bool) {
        self.inbound_down.store(down, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Sends exchanged in either direction between two routes' owners.
    pub fn sent_between(&self, a: &Identity, b: &Identity) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| {
                (m.route == a.route && m.to == b.address) || (m.route == b.route && m.to == a.address)
            })
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn list_identities(&self) -> Result<Vec<Identity>> {
        if self.directory_down.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("connection refused".into()));
        }
        Ok(self.identities.lock().unwrap().clone())
    }

    async fn send(&self, route: &RouteHandle, to: &str, text: &str) -> Result<Ack> {
        if self.failing_routes.lock().unwrap().contains(route) {
            return Err(EngineError::GatewayRejected(format!("device {route} offline")));
        }
        if self.failing_targets.lock().unwrap().contains(to) {
            return Err(EngineError::GatewayRejected(format!("invalid number {to}")));
        }
        self.sent.lock().unwrap().push(SentMessage {
            route: *route,
            to: to.to_string(),
            text: text.to_string(),
        });
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        if self.loopback.load(Ordering::SeqCst) {
            let identities = self.identities.lock().unwrap().clone();
            let from = identities.iter().find(|i| i.route == *route);
            let receiver = identities.iter().find(|i| i.address == to);
            if let (Some(from), Some(receiver)) = (from, receiver) {
                self.delivered.lock().unwrap().push(InboundEvent {
                    id: id.to_string(),
                    from_address: from.address.clone(),
                    route_handle: Some(receiver.route),
                    text: text.to_string(),
                    received_at: None,
                });
            }
        }
        Ok(Ack {
            message_ids: vec![id.to_string()],
        })
    }

    async fn list_inbound(&self) -> Result<Vec<InboundEvent>> {
        if self.inbound_down.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("timed out".into()));
        }
        let mut batch = self.inbound.lock().unwrap().pop_front().unwrap_or_default();
        batch.append(&mut self.delivered.lock().unwrap());
        Ok(batch)
    }
}
