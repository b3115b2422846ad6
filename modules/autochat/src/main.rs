use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use autochat::directory::IdentityDirectory;
use autochat::{
    BlockingRunner, Config, ConversationEngine, DelayRange, EngineConfig, EngineState, FanOut,
    Gateway, LoopConfig, SnapshotStore, Strategy, TickLoop,
};
use exagate_client::{ExaGateClient, DEFAULT_BASE_URL};

#[derive(Parser)]
#[command(name = "autochat")]
#[command(about = "Round-robin scripted SMS conversations between gateway SIMs")]
#[command(version)]
struct Cli {
    /// Gateway base URL (falls back to RBSOFT_BASE_URL)
    #[arg(long, env = "SMS_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Gateway API key (falls back to RBSOFT_TOKEN)
    #[arg(long, env = "SMS_GATEWAY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Snapshot file
    #[arg(long, env = "STATE_FILE", default_value = "autochat_state.json")]
    state_file: PathBuf,

    /// Turns per conversation
    #[arg(long, env = "MAX_TURNS", default_value_t = 10)]
    max_turns: u32,

    /// Seconds between inbound polls
    #[arg(long, env = "POLL_INTERVAL_S", default_value_t = 5)]
    poll_interval_s: u64,

    /// Seconds between SIM directory refreshes
    #[arg(long, env = "SIM_REFRESH_INTERVAL_S", default_value_t = 60)]
    sim_refresh_interval_s: u64,

    /// Seconds between scheduler ticks
    #[arg(long, env = "RR_TICK_S", default_value_t = 20)]
    rr_tick_s: u64,

    #[arg(long, env = "REPLY_DELAY_MIN_S", default_value_t = 3)]
    reply_delay_min_s: u64,

    #[arg(long, env = "REPLY_DELAY_MAX_S", default_value_t = 5)]
    reply_delay_max_s: u64,

    #[arg(long, env = "INITIATE_DELAY_MIN_MS", default_value_t = 1500)]
    initiate_delay_min_ms: u64,

    #[arg(long, env = "INITIATE_DELAY_MAX_MS", default_value_t = 3000)]
    initiate_delay_max_ms: u64,

    #[arg(long, env = "PAIR_DELAY_MIN_S", default_value_t = 5)]
    pair_delay_min_s: u64,

    #[arg(long, env = "PAIR_DELAY_MAX_S", default_value_t = 10)]
    pair_delay_max_s: u64,

    /// Pause after a completed cycle; 0 stops after one cycle
    #[arg(long, env = "CYCLE_PAUSE_S", default_value_t = 60)]
    cycle_pause_s: u64,

    /// Sends per minute across all SIMs (0 = unlimited)
    #[arg(long, env = "GLOBAL_SEND_PER_MIN", default_value_t = 120)]
    global_send_per_min: u32,

    /// Sends per minute from one SIM (0 = unlimited)
    #[arg(long, env = "PER_SIM_SEND_PER_MIN", default_value_t = 30)]
    per_sim_send_per_min: u32,

    #[arg(long, env = "STARTUP_DELAY_S", default_value_t = 3)]
    startup_delay_s: u64,

    /// Ignore the snapshot and start from empty state
    #[arg(long, env = "RESET_STATE", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    reset_state: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll and answer inbound messages, open pairs on a scheduler tick (default)
    Tick,
    /// Play each pair's whole script, one pair at a time
    Blocking,
    /// Play every pair's script concurrently, once per cycle
    Fanout,
}

impl Cli {
    fn into_config(self) -> Config {
        let gateway_url = self
            .gateway_url
            .or_else(|| std::env::var("RBSOFT_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let api_key = self
            .api_key
            .or_else(|| std::env::var("RBSOFT_TOKEN").ok())
            .unwrap_or_default();

        let strategy = match self.command {
            None | Some(Commands::Tick) => Strategy::Tick,
            Some(Commands::Blocking) => Strategy::Blocking,
            Some(Commands::Fanout) => Strategy::FanOut,
        };

        let reply_delay = DelayRange::secs(self.reply_delay_min_s, self.reply_delay_max_s);
        Config {
            gateway_url,
            api_key,
            state_file: self.state_file,
            strategy,
            reset_state: self.reset_state,
            startup_delay: Duration::from_secs(self.startup_delay_s),
            engine: EngineConfig {
                max_turns: self.max_turns,
                reply_delay,
                initiate_delay: DelayRange::millis(self.initiate_delay_min_ms, self.initiate_delay_max_ms),
                turn_delay: reply_delay,
                global_send_per_min: self.global_send_per_min,
                per_route_send_per_min: self.per_sim_send_per_min,
            },
            loops: LoopConfig {
                poll_interval: Duration::from_secs(self.poll_interval_s),
                refresh_interval: Duration::from_secs(self.sim_refresh_interval_s),
                tick_interval: Duration::from_secs(self.rr_tick_s),
                pair_delay: DelayRange::secs(self.pair_delay_min_s, self.pair_delay_max_s),
                cycle_pause: Duration::from_secs(self.cycle_pause_s),
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("autochat=info,exagate_client=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli.into_config()).await {
        error!(error = %format!("{e:#}"), "Fatal");
        eprintln!("Error: {e:#}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run(config: Config) -> Result<()> {
    config.validate()?;
    info!("autochat starting...");
    config.log_redacted();

    let client = ExaGateClient::new(&config.gateway_url, &config.api_key)
        .context("Failed to build gateway client")?;
    let gateway: Arc<dyn Gateway> = Arc::new(client);

    // Connectivity check doubles as the first directory fetch
    let identities = gateway
        .list_identities()
        .await
        .with_context(|| format!("Gateway unreachable at {}", config.gateway_url))?;
    if identities.len() < 2 {
        bail!(
            "Need at least 2 SIMs with E.164 numbers to converse, gateway reports {}",
            identities.len()
        );
    }
    info!(identities = identities.len(), "Gateway reachable");

    let snapshots = SnapshotStore::new(&config.state_file);
    let mut state = if config.reset_state {
        info!(path = %snapshots.path().display(), "Resetting state");
        EngineState::default()
    } else {
        snapshots.load()
    };
    state.install_directory(IdentityDirectory::from_identities(identities));
    snapshots.save(&state)?;

    if !config.startup_delay.is_zero() {
        info!(delay = ?config.startup_delay, "Waiting before first send");
        tokio::time::sleep(config.startup_delay).await;
    }

    let engine = Arc::new(ConversationEngine::new(gateway, config.engine.clone()));
    let loops = config.loops.clone();

    let outcome = tokio::select! {
        result = run_strategy(config.strategy, engine, snapshots.clone(), loops, &mut state) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, saving state");
            Ok(())
        }
    };
    snapshots.save(&state)?;
    outcome?;

    info!(cycle = state.cycle, "autochat stopped");
    Ok(())
}

async fn run_strategy(
    strategy: Strategy,
    engine: Arc<ConversationEngine>,
    snapshots: SnapshotStore,
    loops: LoopConfig,
    state: &mut EngineState,
) -> autochat::Result<()> {
    info!(strategy = %strategy, "Starting dispatch");
    match strategy {
        Strategy::Tick => TickLoop::new(engine, snapshots, loops).run(state).await,
        Strategy::Blocking => BlockingRunner::new(engine, snapshots, loops).run(state).await,
        Strategy::FanOut => FanOut::new(engine, snapshots, loops).run(state).await,
    }
}
