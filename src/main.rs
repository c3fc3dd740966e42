//! trap-relay - main application entry point

use anyhow::{Context, Result};
use clap::{Arg, Command};
use futures_util::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use trap_relay::{
    logging, ChannelPublisher, Config, Dispatcher, RedisSink, RetryPolicy, ScriptPublisher,
    SnmpListener,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("trap-relay")
        .version(VERSION)
        .about("Receives SNMP traps and relays them to Redis pub/sub and external scripts")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.json"),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as daemon (suppress console output)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a default configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let daemon_mode = matches.get_flag("daemon");

    if matches.get_flag("generate-config") {
        return generate_default_config(&config_path).await;
    }

    let config = load_configuration(&config_path).await?;

    let _log_guard = logging::init(&config.logging, daemon_mode)?;

    info!("Starting trap-relay v{}", VERSION);
    info!("Configuration loaded from: {}", config_path.display());

    config.validate().context("Configuration validation failed")?;

    run_application(config).await
}

/// Generate a default configuration file
async fn generate_default_config(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("Configuration file already exists: {}", config_path.display());
    }

    Config::default()
        .save_to_file(config_path)
        .await
        .context("Failed to save default configuration")?;

    println!("Configuration generated: {}", config_path.display());
    println!("Please edit the configuration file and restart the application.");
    Ok(())
}

/// Load configuration from file, creating a default one if missing
async fn load_configuration(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        let default_config = Config::default();
        default_config
            .save_to_file(config_path)
            .await
            .context("Failed to create default configuration file")?;

        // logging is not up yet
        eprintln!(
            "Configuration file not found, wrote defaults to {}",
            config_path.display()
        );
        return Ok(default_config);
    }

    Config::load_from_file(config_path)
        .await
        .context("Failed to load configuration file")
}

/// Build publishers, start the listener and wait for a shutdown signal
async fn run_application(config: Config) -> Result<()> {
    let mut dispatcher = Dispatcher::new(config.listen.community.clone());

    if config.redis.enabled {
        info!("Publishing to Redis enabled, connecting to {}", config.redis.address);
        let sink = RedisSink::new(
            &config.redis.address,
            &config.redis.password,
            config.redis.database,
        );
        let publisher = ChannelPublisher::new(sink, config.redis.channel.clone(), RetryPolicy::default());
        publisher
            .try_connect(config.redis.connect_timeout())
            .await
            .context("Redis is unreachable")?;
        info!("Traps will be published on Redis channel '{}'", publisher.channel());
        dispatcher.add_publisher(Arc::new(publisher));
    }

    if config.script_handler.enabled {
        info!("Script handler enabled: {}", config.script_handler.command);
        let handler = ScriptPublisher::new(
            &config.script_handler.shell,
            &config.script_handler.command,
            config.script_handler.count_handlers,
            config.script_handler.queue_size,
        );
        dispatcher.add_publisher(Arc::new(handler));
    }

    if dispatcher.publisher_count() == 0 {
        warn!("No publishers enabled, received traps will be decoded and dropped");
    }

    let dispatcher = Arc::new(dispatcher);
    let listener = Arc::new(SnmpListener::new(config.listen.clone(), Arc::clone(&dispatcher)));
    let socket = listener.bind().await?;

    let mut signals = Signals::new([SIGTERM, SIGINT]).context("Failed to register signal handlers")?;

    info!("starting SNMP trap listener...");
    let mut listener_handle = tokio::spawn(listener.serve(socket));

    tokio::select! {
        _ = signals.next() => {
            info!("Received shutdown signal, stopping gracefully...");
        }
        result = &mut listener_handle => {
            match result {
                Ok(Err(e)) => error!("SNMP listener failed: {:#}", e),
                Ok(Ok(())) => warn!("SNMP listener stopped unexpectedly"),
                Err(e) => error!("SNMP listener task failed: {}", e),
            }
        }
    }

    listener_handle.abort();

    info!("Draining publishers ({}s timeout)", SHUTDOWN_TIMEOUT.as_secs());
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, dispatcher.shutdown()).await.is_err() {
        warn!("Publisher shutdown timed out, queued traps may be lost");
    }

    info!("trap-relay stopped");
    Ok(())
}
