// ABOUTME: Media conversion service: audio transcoding and HDRI compression over HTTP
// ABOUTME: Loads configuration, connects object storage, serves HTTP/1 and HTTP/2

mod audio;
mod config;
mod error;
mod hdri;
mod routes;
mod storage;

use crate::config::Config;
use crate::routes::AppState;
use anyhow::Result;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::sync::Arc;
use tower::Service;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("media_converter=info".parse()?),
        )
        .init();

    let config = Config::from_env();
    let port = config.port;

    tokio::fs::create_dir_all(&config.scratch_dir).await?;
    info!("Scratch directory: {:?}", config.scratch_dir);
    info!(
        "Conversion limit: {} concurrent, uploads up to {} bytes",
        config.max_concurrent_conversions, config.max_upload_bytes
    );

    info!("Storage backend: {}", config.storage_backend.as_str());
    let store = storage::connect(&config).await?;

    let mut state = AppState::new(config, store);
    state.ffmpeg_available = state.transcoder.is_available().await;
    if state.ffmpeg_available {
        info!("ffmpeg available at {}", state.config.ffmpeg_path);
    } else {
        warn!(
            "ffmpeg not found at {}; audio conversions will fail",
            state.config.ffmpeg_path
        );
    }

    let app = routes::router(Arc::new(state));

    let addr = format!("0.0.0.0:{}", port);
    info!("Starting media converter on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // Use hyper's auto builder which supports both HTTP/1 and HTTP/2
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let app = app.clone();

        tokio::spawn(async move {
            let builder = Builder::new(hyper_util::rt::TokioExecutor::new());
            if let Err(e) = builder
                .serve_connection(
                    io,
                    hyper::service::service_fn(move |req| {
                        let mut app = app.clone();
                        async move { app.call(req).await }
                    }),
                )
                .await
            {
                error!("Connection error: {}", e);
            }
        });
    }
}
