//! Round-robin scripted SMS conversations between the SIMs of one gateway.
//!
//! Every identity (a SIM-backed number) takes a turn as the sender and plays
//! a short script with each of its peers. Conversation progress, the
//! round-robin position and the seen-message registry survive restarts
//! through a JSON snapshot.

pub mod config;
pub mod dedup;
pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod rate;
pub mod scheduler;
pub mod script;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::{Config, DelayRange, EngineConfig, LoopConfig, Strategy};
pub use dispatch::{BlockingRunner, FanOut, InboundReport, TickLoop, TickReport};
pub use engine::{ConversationEngine, FixedScriptRun, InboundOutcome, InitiateOutcome};
pub use error::{EngineError, Result};
pub use gateway::Gateway;
pub use snapshot::SnapshotStore;
pub use state::EngineState;
pub use types::{pair_key, Conversation, ConversationStatus, Identity, InboundEvent, PairKey, RouteHandle};
