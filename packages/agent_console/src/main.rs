use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use agent_console::config::{FileConfig, load_config};
use agent_console::models::ConnectionStatus;
use agent_console::{
    Agent, ConsoleConfig, ConsoleDirs, ConsoleEvent, HttpVisitorApi, MultiplexerHandle,
    NotificationChannel, RosterMonitor, TakeOutcome, TakeWorkflow, Visitor, VisitorApi,
    VisitorQueue, WsConnector,
};

#[derive(Parser)]
#[command(name = "agent-console")]
#[command(about = "Headless live-chat agent console")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.agent-console)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the notification channel and log roster changes
    Monitor(MonitorArgs),

    /// Claim a visitor and chat with it from stdin
    Take(TakeArgs),
}

#[derive(Parser)]
struct MonitorArgs {
    /// Agent id to act as
    #[arg(long)]
    agent: String,
}

#[derive(Parser)]
struct TakeArgs {
    /// Agent id to act as
    #[arg(long)]
    agent: String,

    /// Visitor id to claim
    visitor: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "agent_console=debug,info"
    } else {
        "agent_console=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let dirs = ConsoleDirs::new(cli.data_dir)?;
    let file_config: FileConfig = load_config(&dirs.data_dir)
        .extract()
        .with_context(|| format!("Invalid config in {:?}", dirs.config_toml_path()))?;
    let config = ConsoleConfig::from_file(&file_config);
    config.validate()?;
    info!(http = %config.http_base, ws = %config.ws_base, "agent console starting");

    match cli.command {
        Commands::Monitor(args) => monitor_command(config, args).await,
        Commands::Take(args) => take_command(config, args).await,
    }
}

struct Console {
    config: ConsoleConfig,
    api: Arc<dyn VisitorApi>,
    mux: MultiplexerHandle,
    channel: NotificationChannel,
}

impl Console {
    async fn start(config: ConsoleConfig, agent_id: &str) -> Result<Self> {
        let connector = Arc::new(WsConnector::new());
        let api: Arc<dyn VisitorApi> = Arc::new(HttpVisitorApi::from_config(&config));
        let mux = MultiplexerHandle::spawn(config.clone(), connector.clone(), api.clone());
        mux.set_agent(Agent::new(agent_id)).await?;

        let channel = NotificationChannel::new(
            connector,
            config.timing.notification_backoff,
            config.timing.listener_grace,
        );
        channel.connect(agent_id, &config.ws_base).await;

        Ok(Self {
            config,
            api,
            mux,
            channel,
        })
    }
}

async fn monitor_command(config: ConsoleConfig, args: MonitorArgs) -> Result<()> {
    let console = Console::start(config, &args.agent).await?;
    let monitor = RosterMonitor::start(
        console.channel.clone(),
        console.mux.clone(),
        console.api.clone(),
        console.config.timing.stale_visitor,
    )
    .await
    .context("Failed to load visitor roster")?;

    let mut roster = monitor.watch();
    let mut queue = monitor.watch_queue();
    let mut events = console.mux.subscribe_events();
    log_roster(&roster.borrow_and_update());
    log_queue(&queue.borrow_and_update());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                log_roster(&roster.borrow_and_update());
            }
            changed = queue.changed() => {
                if changed.is_err() {
                    break;
                }
                log_queue(&queue.borrow_and_update());
            }
            Ok(event) = events.recv() => log_event(&event),
        }
    }

    monitor.stop().await;
    console.channel.disconnect().await;
    Ok(())
}

fn log_roster(roster: &agent_console::Roster) {
    info!(
        pending = roster.pending.len(),
        active = roster.active.len(),
        "roster"
    );
    for visitor in &roster.pending {
        info!(visitor = %visitor.id, name = %visitor.label(), "  pending");
    }
}

fn log_queue(queue: &VisitorQueue) {
    match queue.front() {
        Some(next) => info!(waiting = queue.len(), next = %next.label(), "queue"),
        None => info!("queue empty"),
    }
}

fn log_event(event: &ConsoleEvent) {
    match event {
        ConsoleEvent::VisitorActivated(v) => info!(visitor = %v.id, "visitor activated"),
        ConsoleEvent::VisitorDisconnected { visitor_id } => {
            info!(visitor = %visitor_id, "visitor disconnected")
        }
        ConsoleEvent::ClaimFailed {
            visitor_id,
            message,
        } => warn!(visitor = %visitor_id, "claim failed: {}", message),
        ConsoleEvent::EndChatFailed {
            visitor_id,
            message,
        } => warn!(visitor = %visitor_id, "end chat failed: {}", message),
    }
}

async fn take_command(config: ConsoleConfig, args: TakeArgs) -> Result<()> {
    let console = Console::start(config, &args.agent).await?;
    let workflow = TakeWorkflow::new(
        console.api.clone(),
        console.mux.clone(),
        console.config.timing.take_cooldown,
    );

    let visitor = match workflow.take(&Visitor::new(args.visitor.clone()), true).await? {
        TakeOutcome::Taken(visitor) => visitor,
        TakeOutcome::AlreadyInFlight => anyhow::bail!("claim already in flight"),
    };
    info!(visitor = %visitor.id, name = %visitor.label(), "chatting; type /end to end the chat");

    let mut snapshots = console.mux.watch();
    let mut events = console.mux.subscribe_events();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0usize;
    let mut status = ConnectionStatus::Disconnected;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = snapshots.borrow_and_update().clone();
                let Some(session) = snap.session(&visitor.id) else {
                    continue;
                };
                if session.status != status {
                    status = session.status;
                    info!(visitor = %visitor.id, status = ?status, "connection");
                }
                if session.messages.len() < printed {
                    // History replaced the log
                    printed = 0;
                }
                for message in &session.messages[printed..] {
                    println!("[{:?}] {}", message.sender, message.body);
                }
                printed = session.messages.len();
            }
            Ok(event) = events.recv() => {
                log_event(&event);
                if matches!(&event, ConsoleEvent::VisitorDisconnected { visitor_id } if *visitor_id == visitor.id) {
                    break;
                }
            }
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim() == "/end" => {
                    console.mux.end_chat(&visitor.id).await?;
                }
                Some(line) if !line.trim().is_empty() => {
                    if console.mux.send_chat_message(&visitor.id, line.trim()).await?.is_none() {
                        warn!("not connected, message dropped");
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    console.channel.disconnect().await;
    Ok(())
}
