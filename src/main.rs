//! Silk Engine host process
//!
//! Loads the TOML configuration, registers a logging agent on every
//! configured topic and runs until a signal, an admin request or a fault
//! ends the process.

use clap::{Parser, Subcommand};
use serde_json::Value;
use silk_engine::agent::{Agent, AgentContext, HandlerError};
use silk_engine::config::EngineConfig;
use silk_engine::message::PayloadShape;
use silk_engine::observability::{init_default_logging, init_logging, LogFormat};
use silk_engine::App;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{error, info, Level};

/// Topic-routed agent dispatch engine
#[derive(Parser)]
#[command(name = "silk-engine")]
#[command(about = "Consume topics and dispatch each record to its registered agents")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "SILK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume every configured topic until shutdown
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["silk-engine.toml", "config/silk-engine.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Pretty, true),
        _ => init_logging(Level::TRACE, LogFormat::Pretty, true),
    }

    info!("Starting silk-engine v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Run => run_engine(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    process::exit(code);
}

fn load_configuration(path: Option<&Path>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(EngineConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS.iter().map(Path::new) {
        if candidate.exists() {
            info!("Loading configuration from: {}", candidate.display());
            return Ok(EngineConfig::load_from_file(candidate)?);
        }
    }

    info!("No configuration file found; using defaults with environment overrides");
    let mut config = EngineConfig::default();
    config.apply_env_overrides(|name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

/// Handler used for every configured topic: log the record and move on
async fn log_record(payload: Arc<Value>, ctx: AgentContext) -> Result<(), HandlerError> {
    info!(
        topic = %ctx.topic(),
        partition = ctx.partition(),
        offset = ctx.offset(),
        key = ?ctx.key().map(|k| String::from_utf8_lossy(k).into_owned()),
        payload = %payload,
        "Record received"
    );
    Ok(())
}

async fn run_engine(config: EngineConfig) -> i32 {
    let topics = config.topic_names();
    if topics.is_empty() {
        error!("No topics configured; add [[topics]] entries");
        return 1;
    }

    let app = match App::new(config) {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to build engine: {}", e);
            return 1;
        }
    };

    for topic in &topics {
        let agent = Agent::from_fn(topic.as_str(), PayloadShape::any(), log_record).with_name("logger");
        if let Err(e) = app.register_agent(agent) {
            error!("Failed to register agent on {}: {}", topic, e);
            return 1;
        }
    }

    match app.run().await {
        Ok(report) => {
            info!(
                reason = %report.reason,
                timed_out = report.timed_out,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Engine stopped"
            );
            report.exit_code()
        }
        Err(e) => {
            error!("Engine failed: {}", e);
            1
        }
    }
}

fn handle_config_command(config: &EngineConfig, show: bool) -> i32 {
    if show {
        match toml::to_string_pretty(&config.redacted()) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                error!("Failed to render configuration: {}", e);
                return 1;
            }
        }
    }

    println!("✅ Configuration is valid");
    println!("   Broker: {:?} at {}", config.broker.backend, config.broker.url);
    println!("   Group: {}", config.broker.group_id);
    println!("   Topics: {}", config.topic_names().join(", "));
    println!("   HTTP: {}", config.listen_addr());
    0
}
