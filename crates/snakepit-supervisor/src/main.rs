use anyhow::Context;
use snakepit_supervisor::{Supervisor, SupervisorConfig, config, http};

/// Resolves on SIGTERM or Ctrl-C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = SupervisorConfig::from_env();
    let addr = config::listen_addr()?;
    let supervisor = Supervisor::new(cfg)
        .await
        .context("prepare supervisor work dir")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "snakepit-supervisor listening");

    let served = axum::serve(listener, http::router(supervisor.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("shutting down; stopping all snakes");
    supervisor.close().await;
    served?;

    Ok(())
}
