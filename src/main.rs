use std::path::PathBuf;
use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use vertex_core::config::load_config;
use vertex_core::paths::default_data_dir;
use vertex_core::proxy::ProxyServer;
use vertex_core::{App, Result};

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("VERTEX_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(|| default_data_dir().join("config.toml"))
}

async fn run() -> Result<()> {
    let path = config_path();
    log::info!("Using configuration {:?}", path);
    let config = load_config(&path)?;
    let proxy_addr = config.proxy_addr.clone();

    let app = App::new(config)?;
    let token = CancellationToken::new();

    let server = ProxyServer::bind(&proxy_addr, std::sync::Arc::clone(app.router())).await?;
    let proxy = tokio::spawn(server.serve(token.clone()));

    app.instances().load_all()?;
    let started = app.instances().start_all().await;
    log::info!("Auto-started {} instance(s)", started.len());

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }
    log::info!("Shutting down");

    app.instances().stop_all().await;
    token.cancel();
    match proxy.await {
        Ok(result) => result?,
        Err(e) => log::error!("Proxy task failed: {}", e),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
