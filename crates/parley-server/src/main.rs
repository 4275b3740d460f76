use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use parley_server::transport::CLOSE_GRACE;
use parley_server::{api, Listener, ServerConfig, ServerContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and persisted state
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let ctx = Arc::new(ServerContext::open(config)?);
    info!(
        name = %ctx.config.server_name,
        accounts = ctx.credentials.len()?,
        blacklisted = ctx.blacklist.len(),
        "Server state loaded"
    );

    // -----------------------------------------------------------------------
    // 3. Admin API (only when a token is configured)
    // -----------------------------------------------------------------------
    if ctx.config.admin_token.is_some() {
        let state = ctx.clone();
        let http_addr = ctx.config.http_addr;
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, http_addr).await {
                error!(error = %e, "HTTP server failed");
            }
        });
    } else {
        warn!("PARLEY_ADMIN_TOKEN not set, admin API disabled");
    }

    // -----------------------------------------------------------------------
    // 4. Run the chat listener until shutdown
    // -----------------------------------------------------------------------
    let listener = Listener::bind(ctx.clone()).await?;
    let mut accept_loop = tokio::spawn(listener.run());

    tokio::select! {
        _ = &mut accept_loop => {
            info!("Listener exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            ctx.shutdown().await;
            let _ = accept_loop.await;
        }
    }

    // Give sessions a moment to deliver their CONNECTION_SUSPENDED.
    let drained = async {
        while ctx.registry.session_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    if tokio::time::timeout(CLOSE_GRACE, drained).await.is_err() {
        warn!("Sessions still open at exit");
    }

    Ok(())
}
