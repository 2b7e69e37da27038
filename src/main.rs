#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    dead_code
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::sync::Arc;
use switchboard::bridge::Bridge;
use switchboard::channel::socket;
use switchboard::protocol::SequentialIdSource;
use switchboard::{daemon, Config, ConfigCommands};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// `switchboard` - relay calls between a page, the hub and the chat agent.
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Cross-context hub for chat, bot, SMS, OCR and spreadsheet integrations.", long_about = None)]
struct Cli {
    /// Directory holding config.toml and hub_state.json
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the hub: page and agent listeners, scheduler, restored sessions
    Hub,

    /// Send one call to a running hub and print the result
    #[command(long_about = "\
Send one call to a running hub and print the result.

The call goes through the same bridge a page uses: it waits for the hub to \
answer a probe, then sends the call. The hub authorizes it by this \
process's address (`tcp://127.0.0.1:<port>` when run locally).

Examples:
  switchboard call ping
  switchboard call get_status
  switchboard call connect --data '{\"integration\":\"sms\"}'
  switchboard call queue_message --data '{\"integration\":\"sms\",\"recipient\":\"79991234567\",\"text\":\"hi\"}'")]
    Call {
        /// Call kind (ping, get_status, connect, disconnect, operate, ...)
        kind: String,
        /// Call data as JSON
        #[arg(long)]
        data: Option<String>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("SWITCHBOARD_CONFIG_DIR", config_dir);
    }

    // Schema output must stay clean JSON on stdout.
    if let Commands::Config {
        config_command: ConfigCommands::Schema,
    } = &cli.command
    {
        let schema = schemars::schema_for!(Config);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Hub => {
            info!(
                pages = %config.hub.listen_addr,
                agent = %config.hub.agent_listen_addr,
                "Starting switchboard hub"
            );
            daemon::run(config).await
        }

        Commands::Call { kind, data } => {
            let data = match data.as_deref() {
                Some(raw) => serde_json::from_str(raw).context("--data must be valid JSON")?,
                None => Value::Null,
            };
            let result = call_once(&config, &kind, data).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }

        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                println!("# {}", config.config_path.display());
                println!("{}", toml::to_string_pretty(&config.redacted())?);
                Ok(())
            }
            ConfigCommands::Schema => Ok(()),
        },
    }
}

/// One Bridge call with an overall deadline: the hub must answer a probe
/// and then the call within one probe interval plus the call timeout.
async fn call_once(config: &Config, kind: &str, data: Value) -> Result<Value> {
    let bridge = Bridge::start(
        socket::dial("cli", config.bridge.hub_addr.clone()),
        &config.bridge,
        Arc::new(SequentialIdSource::new()),
    );
    let deadline = config.bridge.call_timeout() + config.bridge.probe_interval();
    let outcome = tokio::time::timeout(deadline, bridge.call(kind, data)).await;
    bridge.teardown();

    match outcome {
        Ok(result) => result.with_context(|| format!("call `{kind}` failed")),
        Err(_) => bail!(
            "hub at {} did not answer within {deadline:?}",
            config.bridge.hub_addr
        ),
    }
}
