use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kiln_core::{logging::init_tracing, Generator};
use kiln_server::{build_router, AppState, ServerArgs};
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    let config = args.resolve().context("failed to read configuration")?;
    init_tracing(&config.server.log_level);

    let state = AppState::loading(config.server.max_concurrent_generations);

    // Bind first and load in the background; generation answers 503 until the model is ready.
    let loader_state = state.clone();
    let loader_config = config.clone();
    tokio::spawn(async move {
        info!("Loading model...");
        match Generator::from_config(&loader_config).await {
            Ok(generator) => {
                info!("Model loaded successfully!");
                loader_state.set_generator(Arc::new(generator));
            }
            Err(e) => {
                error!("Failed to load model: {e}");
                loader_state.set_load_error(e.to_string());
            }
        }
    });

    let app = build_router(state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
