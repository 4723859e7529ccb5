use tokio_util::sync::CancellationToken;

use runway::config::Config;
use runway::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env from the binary's directory, then the cargo project root
    // (development builds: target/release/../..), then the CWD.
    let loaded = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .into_iter()
        .flat_map(|dir| [dir.join(".env"), dir.join("../../.env")])
        .find(|path| path.exists())
        .map(|path| dotenvy::from_path(&path).is_ok())
        .unwrap_or(false);
    if !loaded {
        dotenvy::dotenv().ok();
    }

    tracing::info!("runway starting");

    let config = Config::load()?;
    let bind = config.bind;
    tracing::info!(
        stylists = config.stylists.len(),
        video = config.video.is_some(),
        mode = ?config.orchestrator.mode,
        "config loaded"
    );

    let shutdown = CancellationToken::new();
    let app = server::router(AppState::from_config(&config, shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .inspect_err(|e| tracing::error!("failed to bind {bind}: {e}"))?;
    tracing::info!(%bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown requested");
            // Stops in-flight roast runs and video polls so the server can drain.
            shutdown.cancel();
        })
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    tracing::info!("runway shutting down");
    Ok(())
}
