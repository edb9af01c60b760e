//! DECADA sensor node - main entry point

use clap::{Parser, Subcommand};
use decada_node::config::{ConfigError, NodeConfig};
use decada_node::crypto::{KeyKind, KeyStore, SoftwareKeyStore};
use decada_node::node::{self, DeviceNode, JsonFileSource, MeasurementSource, NodeServices};
use decada_node::observability::logging::parse_level;
use decada_node::observability::{init_default_logging, init_logging, LogFormat};
use decada_node::platform::{ProcessReset, SoftwareWatchdog, SystemClock, SystemReset};
use decada_node::store::{FileStore, PersistStore};
use decada_node::NodeResult;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["decada-node.toml", "/etc/decada-node/config.toml"];

/// DECADA sensor node: provisioning and MQTT telemetry
#[derive(Parser)]
#[command(name = "decada-node")]
#[command(about = "Provision a sensor node on DECADA and stream its readings over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "DECADA_NODE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision, connect and stream readings (default)
    Run,
    /// Renew the client certificate, then reset
    RenewCert,
    /// Print the provisioning status
    Status,
    /// Validate the configuration
    Config {
        /// Print the configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        verbosity => {
            let level = parse_level(if verbosity == 1 { "DEBUG" } else { "TRACE" });
            let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
            init_logging(level, format, false)
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "Starting decada-node");

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_node(config).await,
        Commands::RenewCert => renew_cert(config).await,
        Commands::Status => print_status(&config),
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(error = %e, category = e.category(), "Command failed");
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> Result<NodeConfig, ConfigError> {
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loading configuration");
        return NodeConfig::load_from_file(path);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            return NodeConfig::load_from_file(path);
        }
    }

    Err(ConfigError::InvalidConfig(format!(
        "no configuration file found; pass --config, set DECADA_NODE_CONFIG or create one of {}",
        DEFAULT_CONFIG_PATHS.join(", ")
    )))
}

/// Production collaborators for the node
fn build_services(config: &NodeConfig) -> NodeResult<NodeServices> {
    let store: Arc<dyn PersistStore> = Arc::new(FileStore::open(&config.store.path)?);

    let keys: Arc<dyn KeyStore> = match config.key_kind() {
        KeyKind::Software => Arc::new(SoftwareKeyStore::load(store.clone())?),
        KeyKind::SecureElement => {
            return Err(ConfigError::InvalidConfig(
                "device.secure_element is set but this build has no secure element driver"
                    .to_string(),
            )
            .into())
        }
    };

    let reset: Arc<dyn SystemReset> = Arc::new(ProcessReset);
    let (watchdog, _monitor) = SoftwareWatchdog::start(
        Duration::from_secs(config.supervisor.watchdog_timeout_secs),
        reset.clone(),
    );

    let source = match &config.sensors.readings_path {
        Some(path) => Some(Arc::new(JsonFileSource::new(path)) as Arc<dyn MeasurementSource>),
        None => {
            warn!("sensors.readings_path is not set; telemetry is disabled");
            None
        }
    };

    Ok(NodeServices {
        store,
        keys,
        clock: Arc::new(SystemClock),
        watchdog,
        reset,
        source,
    })
}

async fn run_node(config: NodeConfig) -> NodeResult<()> {
    info!(device_id = %config.device.uid, "Node starting");
    let services = build_services(&config)?;
    let node = DeviceNode::boot(config, services).await?;
    node.run(shutdown_signal()).await
}

async fn renew_cert(config: NodeConfig) -> NodeResult<()> {
    let services = build_services(&config)?;
    let certificate = node::renew_certificate(&config, &services).await?;
    info!(serial = %certificate.serial, "Certificate renewed");
    Ok(())
}

fn print_status(config: &NodeConfig) -> NodeResult<()> {
    let services = build_services(config)?;
    println!("{}", node::status(config, &services)?);
    Ok(())
}

fn handle_config_command(config: &NodeConfig, show: bool) -> NodeResult<()> {
    if show {
        // The file only names the variables holding secrets; report whether they are set
        match toml::to_string_pretty(config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => warn!(error = %e, "Could not render configuration"),
        }
        for (name, present) in [
            (&config.cloud.access_key_env, config.get_access_key().is_ok()),
            (&config.cloud.access_secret_env, config.get_access_secret().is_ok()),
        ] {
            println!("# {name}: {}", if present { "set" } else { "missing" });
        }
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}
