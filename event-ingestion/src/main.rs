use envconfig::Envconfig;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use event_ingestion::config::Config;
use event_ingestion::server::serve;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_tracing();
    info!("starting event ingestion service");

    let config = Config::init_from_env().expect("invalid configuration");

    let listener = tokio::net::TcpListener::bind(config.bind()).await?;

    if let Err(err) = serve(config, listener, shutdown()).await {
        error!("event ingestion service failed: {:#}", err);
        return Err(err.into());
    }

    info!("shutdown complete");
    Ok(())
}
