use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let boot = mrelay_core::bootstrap_from_env().await?;
    mrelay_tasks::spawn_poller(boot.state.clone());

    let app = mrelay_router::relay_router(boot.state.clone());
    let global = boot.state.global.load_full();
    let bind = format!("{}:{}", global.host, global.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(event = "listening", address = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}
