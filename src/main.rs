use std::sync::Arc;

use anyhow::Context;
use smtp_to_gotify::{Config, Server, Shutdown, TracingSink};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smtp_to_gotify=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to read configuration")?;
    if config.notification_token.is_empty() {
        tracing::warn!("no Gotify token configured, notifications will be rejected");
    }

    let server = Server::start(config, Arc::new(TracingSink))
        .await
        .context("failed to start server")?;

    match server.run(shutdown_signal()).await {
        Shutdown::Graceful => tracing::info!("server exited"),
        Shutdown::Forced { active } => {
            tracing::warn!(active, "server exited with open connections")
        }
    }
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {},
        () = terminate => {},
    }
}
