//! Forkcast API server

use forkcast_api::{create_router, AppState, Config};
use tokio::{net::TcpListener, signal};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    let bind_address = config.bind_address.clone();

    let state = AppState::new(config);
    let hub = state.hub.clone();
    let background = hub.start_background_tasks();

    let app = create_router(state);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "Forkcast API listening");

    // Open sockets and streams only end once the hub closes them
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            background.stop();
            hub.shutdown().await;
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("forkcast_api=info,forkcast_realtime=info,tower_http=info"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                tracing::info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
