use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use dbus_controller::api::{self, ApiState};
use dbus_controller::cache::IntrospectionCache;
use dbus_controller::config::{self, Config, LogFormat, LoggingConfig};
use dbus_controller::dbus::{BoundedConnector, BusConnector, ZbusConnector};
use dbus_controller::signals::SignalHub;
use dbus_controller::watcher::OwnerWatcher;
use dbus_controller::Dispatcher;

#[derive(Parser)]
#[command(name = "dbus-controller")]
#[command(author, version, about = "REST API server for D-Bus introspection and control", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the REST API server
    Serve {
        /// Override the configured bind address (e.g. 0.0.0.0:8080)
        #[arg(long)]
        bind: Option<String>,
    },

    /// List configured buses
    Buses,

    /// Configure settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

/// Console logs go to stderr so command output on stdout stays clean.
fn init_logging(verbose: bool, config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = if verbose {
        EnvFilter::new("dbus_controller=debug,tower_http=debug,zbus=info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "dbus_controller={},tower_http=info,zbus=warn",
                config.level
            ))
        })
    };

    let console = match config.format {
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let (file, guard) = match &config.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "dbus-controller.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();

    guard
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}

async fn serve(config: Config, bind: Option<String>) -> anyhow::Result<()> {
    let mut server = config.server.clone();
    if let Some(bind) = bind {
        server.bind = bind;
    }

    let zbus: Arc<dyn BusConnector> =
        Arc::new(ZbusConnector::new(config.buses.clone(), &config.dbus));
    let connector: Arc<dyn BusConnector> = Arc::new(BoundedConnector::new(zbus, &config.dbus));
    let cache = Arc::new(IntrospectionCache::new(
        connector.clone(),
        config.cache.ttl(),
    ));
    let watcher = OwnerWatcher::spawn(connector.clone(), cache.clone());
    let signals = SignalHub::new(connector.clone(), config.signals.buffer_size);
    let dispatcher = Arc::new(Dispatcher::new(connector, cache, signals));

    for bus in &config.buses {
        info!("Exposing {} bus ({:?})", bus.id, bus.kind);
    }

    let result = api::serve(ApiState::new(dispatcher), &server, shutdown_signal()).await;
    watcher.shutdown();
    info!("Server stopped");
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let _log_guard = init_logging(cli.verbose, &config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            info!("Starting dbus-controller {}", env!("CARGO_PKG_VERSION"));
            serve(config, bind).await?;
        }

        Commands::Buses => {
            for bus in &config.buses {
                let address = bus.address.as_deref().unwrap_or("-");
                println!(
                    "{:<12} {:<8} {:<24} {}",
                    bus.id,
                    bus.kind.as_str(),
                    address,
                    bus.description
                );
            }
        }

        Commands::Config { show } => {
            if show {
                config::show(cli.config.as_deref())?;
            } else {
                println!("Use --show to display the configuration.");
                println!("Edit the config file directly to change settings.");
            }
        }
    }

    Ok(())
}
