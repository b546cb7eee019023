use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tripmatch_match_service::build_router;
use tripmatch_match_service::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind_addr = config.bind_addr;
    let app = build_router(config).context("failed to build router")?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(
        target: "tripmatch.service",
        %bind_addr,
        "tripmatch match service listening",
    );

    axum::serve(listener, app.into_make_service())
        .await
        .context("server terminated with error")?;
    Ok(())
}
