//! Groupcall CLI Application
//!
//! Drives a group call session against the in-process loopback service and
//! a simulated media engine, printing what the session publishes.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use event_display::{mute_label, EventDisplay};
use groupcall_core::loopback::{LoopbackService, SimulatedEngineFactory};
use groupcall_core::prelude::*;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod event_display;

const LEVEL_INTERVAL: Duration = Duration::from_millis(100);
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated call
    Demo {
        /// Call title
        #[arg(long)]
        title: Option<String>,

        /// Join with the microphone muted
        #[arg(long)]
        muted: bool,

        /// Drop media connectivity once to exercise rejoin
        #[arg(long)]
        drop_connection: bool,

        /// Number of simulated remote speakers
        #[arg(long, default_value_t = 2)]
        speakers: u32,

        /// How long to feed audio levels, in seconds
        #[arg(long, default_value_t = 3)]
        seconds: u64,

        /// Session configuration file (JSON)
        #[arg(short, long, env = "GROUPCALL_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Print the default configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("groupcall=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            title,
            muted,
            drop_connection,
            speakers,
            seconds,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let options = DemoOptions {
                title,
                muted,
                drop_connection,
                speakers,
                duration: Duration::from_secs(seconds),
            };
            handle_demo(config, options).await?;
        }
        Commands::Config => {
            println!(
                "{}",
                serde_json::to_string_pretty(&GroupCallConfig::default())?
            );
        }
    }

    Ok(())
}

struct DemoOptions {
    title: Option<String>,
    muted: bool,
    drop_connection: bool,
    speakers: u32,
    duration: Duration,
}

fn load_config(path: Option<&Path>) -> Result<GroupCallConfig> {
    let Some(path) = path else {
        return Ok(GroupCallConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

async fn handle_demo(config: GroupCallConfig, options: DemoOptions) -> Result<()> {
    let service = LoopbackService::new();
    let engines = SimulatedEngineFactory::new();
    let self_user = UserId(rand::thread_rng().gen_range(1..1_000_000));
    let mute = if options.muted {
        MuteState::Muted
    } else {
        MuteState::Active
    };

    let call = GroupCall::builder(self_user, service.client(self_user), Arc::new(engines.clone()))
        .with_config(config)
        .with_mute(mute)
        .build()?;
    println!("🔗 Session {} as {}", call.id(), self_user);
    println!("🎙️  Microphone: {}", mute_label(mute));

    let printer = tokio::spawn(print_events(
        call.subscribe_events(),
        EventDisplay::new(self_user),
    ));

    call.start(options.title.clone())?;
    let state = call
        .wait_for_state(|s| s == SessionState::Joined || s.is_terminal())
        .await?;
    if state != SessionState::Joined {
        bail!("session did not join: {:?}", state);
    }
    let snapshot = call.snapshot().await?;
    let handle = snapshot.handle.context("joined without a call handle")?;
    println!(
        "✅ Joined call {} as source {}",
        handle, snapshot.self_source
    );

    let mut sources = Vec::with_capacity(options.speakers as usize);
    for i in 0..options.speakers {
        let user = UserId(self_user.0 + 1 + u64::from(i));
        sources.push(service.add_participant(handle, user, false)?);
    }

    if options.drop_connection {
        println!("⚠️  Simulating connectivity loss");
        let generation = snapshot.engine_generation;
        if let Some(engine) = engines.live() {
            engine.events().connectivity_changed(false);
        }
        tokio::time::timeout(RECONNECT_TIMEOUT, wait_reconnected(&call, generation))
            .await
            .context("timed out waiting for rejoin")??;
        println!("✅ Reconnected");
    }

    let ticks = (options.duration.as_millis() / LEVEL_INTERVAL.as_millis()).max(1);
    for _ in 0..ticks {
        if let Some(engine) = engines.live() {
            let (levels, own) = synthetic_levels(&sources);
            engine.events().levels(levels);
            engine.events().self_level(own);
        }
        tokio::time::sleep(LEVEL_INTERVAL).await;
    }

    let snapshot = call.snapshot().await?;
    if let Some(info) = &snapshot.call {
        println!(
            "📊 {} participants, {} speaking, version {}",
            info.full_count(),
            snapshot.speakers.len(),
            info.version()
        );
    }

    call.hangup()?;
    let state = call.wait_for_state(SessionState::is_terminal).await?;
    println!("📞 Call finished: {:?}", state);

    drop(call);
    if tokio::time::timeout(Duration::from_secs(1), printer)
        .await
        .is_err()
    {
        tracing::debug!("Event printer did not stop in time");
    }
    Ok(())
}

async fn wait_reconnected(call: &GroupCall, old_generation: Option<u64>) -> Result<()> {
    loop {
        let snapshot = call.snapshot().await?;
        if snapshot.state.is_terminal() {
            bail!("session ended while rejoining: {:?}", snapshot.state);
        }
        if snapshot.state == SessionState::Joined && snapshot.engine_generation != old_generation {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Random levels for the remote sources and the local microphone
fn synthetic_levels(sources: &[SourceId]) -> (Vec<(SourceId, f32)>, f32) {
    let mut rng = rand::thread_rng();
    let levels = sources
        .iter()
        .map(|source| (*source, rng.gen_range(0.0..1.0)))
        .collect();
    (levels, rng.gen_range(0.0..1.0))
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>, display: EventDisplay) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = display.render(&event) {
                    println!("{}", line);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
