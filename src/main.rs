use std::sync::Arc;
use anyhow::{Context, Result};
use tracing::info;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

mod certs;
mod config;
mod memoize;
mod proxy;
mod recorder;
mod rules;
mod state;
mod throttle;

#[tokio::main]
async fn main() -> Result<()> {
    let settings: Arc<config::Settings> = Arc::new(config::init().context("while loading the configuration")?);

    let default_level = if settings.silent { "warn" } else { "info" };
    tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let (authority, generated) = certs::RootAuthority::load_or_generate(&settings.ca_cert_path, &settings.ca_key_path)
        .context("while preparing the root certificate")?;
    if generated {
        info!("{}", certs::RootAuthority::trust_instructions(&settings.ca_cert_path));
    }

    let state: Arc<RwLock<state::State>> = Arc::new(RwLock::new(state::init(&settings)?));
    let recorder = Arc::new(recorder::MemoryRecorder::new());

    let server = proxy::ProxyServer::bind(settings.clone(), state, recorder, Arc::new(authority)).await?;
    let handle = server.handle();
    let interrupt = handle.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            interrupt.shutdown();
        }
    });

    info!("starting services on {}", handle.local_addr());
    server.run().await;
    info!("exiting ({:?})", handle.status());

    Ok(())
}
