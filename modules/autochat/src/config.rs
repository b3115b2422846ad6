use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use tracing::info;

use crate::error::{EngineError, Result};

/// Inclusive bounds of a randomized, human-like pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub const ZERO: DelayRange = DelayRange {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn secs(min: u64, max: u64) -> Self {
        Self::new(Duration::from_secs(min), Duration::from_secs(max))
    }

    pub fn millis(min: u64, max: u64) -> Self {
        Self::new(Duration::from_millis(min), Duration::from_millis(max))
    }

    pub fn is_zero(&self) -> bool {
        self.max.is_zero()
    }

    /// Uniform pick in `[min, max]` at millisecond resolution.
    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }

    /// Sleep for a sampled duration. Not interruptible once started.
    pub async fn wait(&self) {
        let pause = self.sample();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Poll inbound messages and answer them, initiating on a scheduler tick.
    #[default]
    Tick,
    /// Drive each pair's full dialogue synchronously, one pair at a time.
    Blocking,
    /// Drive every pair's full dialogue concurrently, once per cycle.
    FanOut,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tick => write!(f, "tick"),
            Self::Blocking => write!(f, "blocking"),
            Self::FanOut => write!(f, "fanout"),
        }
    }
}

/// Settings the conversation engine itself needs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_turns: u32,
    /// Pause before answering an inbound message.
    pub reply_delay: DelayRange,
    /// Spacing between consecutive opening messages of one tick.
    pub initiate_delay: DelayRange,
    /// Pause between scripted turns in blocking and fan-out runs.
    pub turn_delay: DelayRange,
    pub global_send_per_min: u32,
    pub per_route_send_per_min: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            reply_delay: DelayRange::secs(3, 5),
            initiate_delay: DelayRange::millis(1500, 3000),
            turn_delay: DelayRange::secs(3, 5),
            global_send_per_min: 120,
            per_route_send_per_min: 30,
        }
    }
}

impl EngineConfig {
    /// No pauses and no rate limits.
    pub fn immediate(max_turns: u32) -> Self {
        Self {
            max_turns,
            reply_delay: DelayRange::ZERO,
            initiate_delay: DelayRange::ZERO,
            turn_delay: DelayRange::ZERO,
            global_send_per_min: 0,
            per_route_send_per_min: 0,
        }
    }
}

/// Timing of the dispatch loops.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub poll_interval: Duration,
    pub refresh_interval: Duration,
    pub tick_interval: Duration,
    pub pair_delay: DelayRange,
    /// Pause after a completed cycle. Zero means stop after the first cycle.
    pub cycle_pause: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(60),
            tick_interval: Duration::from_secs(20),
            pair_delay: DelayRange::secs(5, 10),
            cycle_pause: Duration::from_secs(60),
        }
    }
}

impl LoopConfig {
    pub fn immediate() -> Self {
        Self {
            poll_interval: Duration::ZERO,
            refresh_interval: Duration::ZERO,
            tick_interval: Duration::ZERO,
            pair_delay: DelayRange::ZERO,
            cycle_pause: Duration::ZERO,
        }
    }

    pub fn runs_once(&self) -> bool {
        self.cycle_pause.is_zero()
    }
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub gateway_url: String,
    pub api_key: String,
    pub state_file: PathBuf,
    pub strategy: Strategy,
    pub reset_state: bool,
    pub startup_delay: Duration,
    pub engine: EngineConfig,
    pub loops: LoopConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(EngineError::Config(
                "SMS_GATEWAY_API_KEY (or RBSOFT_TOKEN) is required".to_string(),
            ));
        }
        if self.gateway_url.trim().is_empty() {
            return Err(EngineError::Config("gateway URL is empty".to_string()));
        }
        if self.engine.max_turns == 0 {
            return Err(EngineError::Config("MAX_TURNS must be at least 1".to_string()));
        }
        for (name, range) in [
            ("reply delay", self.engine.reply_delay),
            ("initiate delay", self.engine.initiate_delay),
            ("turn delay", self.engine.turn_delay),
            ("pair delay", self.loops.pair_delay),
        ] {
            if range.min > range.max {
                return Err(EngineError::Config(format!(
                    "{name}: min {:?} exceeds max {:?}",
                    range.min, range.max
                )));
            }
        }
        Ok(())
    }

    /// Log effective settings without the credential.
    pub fn log_redacted(&self) {
        info!(
            gateway_url = %self.gateway_url,
            api_key = "<redacted>",
            state_file = %self.state_file.display(),
            strategy = %self.strategy,
            reset_state = self.reset_state,
            max_turns = self.engine.max_turns,
            poll_interval = ?self.loops.poll_interval,
            refresh_interval = ?self.loops.refresh_interval,
            tick_interval = ?self.loops.tick_interval,
            reply_delay = ?self.engine.reply_delay,
            pair_delay = ?self.loops.pair_delay,
            cycle_pause = ?self.loops.cycle_pause,
            global_send_per_min = self.engine.global_send_per_min,
            per_route_send_per_min = self.engine.per_route_send_per_min,
            "Configuration loaded"
        );
    }
}
