use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::server;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → load → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let metrics = Metrics::install()?;
    let config = GatewayConfig::load(&args.config_path)?;
    let state = server::GatewayState::new(config, metrics);

    let shutdown = Arc::new(Notify::new());
    start_admin_server(&state, &args, &shutdown);

    tracing::info!("server: starting gateway, listen={}", args.listen);

    let mut proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    tokio::select! {
        _ = wait_for_shutdown(&shutdown) => {}
        // The proxy only returns early on a bind failure.
        result = &mut proxy_handle => {
            return result.map_err(|e| anyhow::anyhow!("proxy task failed: {}", e))?;
        }
    }

    // Wait for proxy to finish draining.
    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy error during shutdown, error={}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // Keep the writer alive for the life of the process.
    std::mem::forget(_guard);
}

fn start_admin_server(
    state: &server::GatewayState,
    args: &BootstrapArgs,
    shutdown: &Arc<Notify>,
) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s, shutdown).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("server: failed to listen for SIGINT, error={}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("server: failed to install SIGTERM handler, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // Signal the listeners to stop accepting.
    shutdown.notify_waiters();
}
