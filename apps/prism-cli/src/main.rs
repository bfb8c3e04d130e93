//! # Prism CLI
//!
//! Command-line front end for the hub sync engine.
//!
//! ```text
//! prism watch                         stream states and entity changes
//! prism states --domain light         list mirrored entities
//! prism set light.kitchen state on    issue a command and wait for the hub
//! prism toggle switch.fan             toggle like a widget press
//! prism config show                   effective configuration, token hidden
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::StreamExt;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

use prism_core::{EntityKey, WidgetAction};
use prism_sync::{CommandHandle, SyncConfig, SyncEngine};

mod output;

/// How long one-shot commands wait for the mirror to come up.
const SYNC_WAIT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "prism")]
#[command(about = "Prism - Home Assistant hub mirror and remote")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (defaults to PRISM_CONFIG, then the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream connection states and entity changes until Ctrl-C
    Watch,
    /// List mirrored entities
    States {
        /// Only entities in this domain
        #[arg(short, long)]
        domain: Option<String>,
    },
    /// Set an attribute through the matching hub service
    Set {
        /// Entity key, e.g. light.kitchen
        entity: String,
        /// `state` or an attribute name such as `brightness`
        attribute: String,
        /// JSON value; anything that is not valid JSON is sent as text
        value: String,
    },
    /// Toggle an entity
    Toggle {
        /// Entity key, e.g. switch.fan
        entity: String,
    },
    /// Show configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if let Commands::Config { command } = &cli.command {
        return handle_config_command(*command, cli.config);
    }

    let config = SyncConfig::load(cli.config).context("loading configuration")?;
    let mut engine = SyncEngine::from_config(config);
    engine.start().context("starting sync engine")?;

    let result = match cli.command {
        Commands::Watch => watch(&engine).await,
        Commands::States { domain } => list_states(&engine, domain.as_deref()).await,
        Commands::Set {
            entity,
            attribute,
            value,
        } => set_attribute(&engine, &entity, &attribute, &value).await,
        Commands::Toggle { entity } => toggle(&engine, &entity).await,
        Commands::Config { .. } => Ok(()),
    };

    engine.stop().await;
    result
}

/// Initializes the tracing subscriber. `RUST_LOG` overrides the default.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,prism=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .with_writer(std::io::stderr)
        .init();
}

// =============================================================================
// Commands
// =============================================================================

async fn watch(engine: &SyncEngine) -> Result<()> {
    let mut states = engine.watch_connection();
    let mut changes = engine.store().subscribe();
    let mut notifications = engine.notifications();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    println!("state: {}", *states.borrow_and_update());

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("state: {}", *states.borrow_and_update());
            }
            Some(change) = changes.next() => println!("{}", output::change_line(&change)),
            notification = notifications.recv() => match notification {
                Ok(n) => println!("notification: {}: {}", n.title, n.message),
                Err(RecvError::Lagged(missed)) => debug!(missed, "Notification receiver lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    if let Some(err) = engine.status().last_error {
        debug!(last_error = %err, "Watch ended");
    }
    Ok(())
}

async fn list_states(engine: &SyncEngine, domain: Option<&str>) -> Result<()> {
    engine.wait_until_synced(SYNC_WAIT).await?;

    let entities = match domain {
        Some(domain) => engine.store().in_domain(domain),
        None => engine.store().snapshot().values().cloned().collect(),
    };
    for entity in &entities {
        println!("{}", output::entity_line(entity));
    }
    info!(count = entities.len(), "Listed entities");
    Ok(())
}

async fn set_attribute(engine: &SyncEngine, entity: &str, attribute: &str, value: &str) -> Result<()> {
    let key = parse_key(entity)?;
    engine.wait_until_synced(SYNC_WAIT).await?;

    let handle = engine
        .issue(&key, attribute, output::parse_value(value))
        .await?;
    await_outcome(handle).await
}

async fn toggle(engine: &SyncEngine, entity: &str) -> Result<()> {
    let key = parse_key(entity)?;
    engine.wait_until_synced(SYNC_WAIT).await?;

    match engine.perform(WidgetAction::Toggle { entity: key }).await? {
        Some(handle) => await_outcome(handle).await,
        None => bail!("toggle was debounced"),
    }
}

async fn await_outcome(handle: CommandHandle) -> Result<()> {
    let id = handle.correlation_id();
    handle
        .outcome()
        .await
        .with_context(|| format!("command {} failed", id))?;
    println!("ok (command {})", id);
    Ok(())
}

fn parse_key(raw: &str) -> Result<EntityKey> {
    raw.parse::<EntityKey>()
        .with_context(|| format!("invalid entity key {:?}", raw))
}

fn handle_config_command(command: ConfigCommands, path: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = SyncConfig::load(path)?;
            print!("{}", toml::to_string_pretty(&config)?);
            let token = if config.token().is_ok() { "set" } else { "not set" };
            println!("# hub token: {}", token);
        }
        ConfigCommands::Path => match path.or_else(SyncConfig::config_path) {
            Some(path) => println!("{}", path.display()),
            None => bail!("no config directory available on this platform"),
        },
    }
    Ok(())
}
