//! Zoidberg - review-event relay daemon.
//!
//! Loads the routing configuration, opens an event stream per configured
//! review host, and runs the process loop until terminated.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zoidberg::actions::ActionRegistry;
use zoidberg::client::SshClientFactory;
use zoidberg::engine::Zoidberg;
use zoidberg::shutdown::ShutdownSignal;

#[derive(Parser, Debug)]
#[command(name = "zoidberg")]
#[command(about = "Relay review events between code-review servers", long_about = None)]
struct Cli {
    /// Path to the yaml configuration file
    #[arg(short = 'c', long = "config", default_value = "./etc/zoidberg.yaml")]
    config: PathBuf,

    /// Raise the log level to debug
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "zoidberg=debug"
    } else {
        "zoidberg=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registry = ActionRegistry::with_builtins();

    // The initial configuration is the only fatal load: without it there is
    // nothing to run. Later reloads are survived by the engine.
    let mut engine =
        match Zoidberg::new(&cli.config, registry, Box::new(SshClientFactory)) {
            Ok(engine) => engine,
            Err(e) => {
                error!(path = %cli.config.display(), error = %e, "Cannot load configuration");
                return Err(Box::new(e) as Box<dyn std::error::Error>);
            }
        };

    info!(path = %cli.config.display(), "Zoidberg starting");

    let shutdown = ShutdownSignal::new();
    let running = engine.running_handle();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown.wait().await;
            running.store(false, Ordering::SeqCst);
        }
    });

    engine.run().await;

    info!("Zoidberg shutdown complete");
    Ok(())
}
