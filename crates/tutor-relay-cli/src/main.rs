mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use tutor_relay_core::config::Config;
use tutor_relay_gateway::GatewayState;

#[derive(Parser)]
#[command(
    name = "tutor-relay",
    about = "Real-time speech-to-speech language tutoring relay",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Port to listen on (default: 8787)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show whether a relay is running
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration, secrets masked
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;

    logging::init(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Serve { port, bind } => {
            if let Some(bind) = bind {
                config.gateway.get_or_insert_with(Default::default).bind = Some(bind);
            }
            let port = port.unwrap_or_else(|| config.gateway_port());

            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                for error in &errors {
                    tracing::error!("{error}");
                }
                anyhow::bail!("Invalid configuration in {}", config_path.display());
            }

            tracing::info!(config = %config_path.display(), "Starting tutor relay on port {port}");
            let state = Arc::new(GatewayState::from_config(config)?);
            tutor_relay_gateway::start_gateway(state, port).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&redact(serde_json::to_value(&config)?))?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
        Commands::Status => {
            println!("Tutor relay v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Port: {}", config.gateway_port());

            let url = format!("http://127.0.0.1:{}/health", config.gateway_port());
            match reqwest::get(&url).await {
                Ok(resp) if resp.status().is_success() => {
                    let body: Value = resp.json().await?;
                    println!("Status: running");
                    println!("Sessions: {}", body["sessions"]);
                }
                Ok(resp) => println!("Status: unhealthy (HTTP {})", resp.status()),
                Err(_) => println!("Status: not running"),
            }
        }
    }

    Ok(())
}

/// Mask every `api_key` value.
fn redact(mut value: Value) -> Value {
    match &mut value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if key == "api_key" && v.is_string() {
                    *v = Value::String("********".into());
                } else {
                    *v = redact(v.take());
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                *item = redact(item.take());
            }
        }
        _ => {}
    }
    value
}
