use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use booking_api::{
    config::{Config, VideoProviderKind},
    handlers,
    video_client::HttpVideoProvider,
};
use booking_core::{
    BookingEngine, LogSubscriber, LoopbackProvider, MemoryStore, Subscriber, VideoProvider,
};
use dotenv::dotenv;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .json()
        .init();

    info!("Starting Booking API...");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    info!("Configuration loaded successfully");

    // Initialize video provider
    let provider: Arc<dyn VideoProvider> = match config.video.provider {
        VideoProviderKind::Http => Arc::new(
            HttpVideoProvider::new(
                config.video.base_url.clone(),
                config.video.api_key.clone(),
                config.video.timeout_secs,
            )
            .context("Failed to build video provider client")?,
        ),
        VideoProviderKind::Loopback => {
            warn!("Using loopback video provider; join links are not real meetings");
            Arc::new(LoopbackProvider::default())
        }
    };

    info!("Video provider initialized: {}", provider.name());

    // Initialize engine
    let engine = BookingEngine::with_store(
        config.engine.clone(),
        Arc::new(MemoryStore::new()),
        provider,
        vec![Arc::new(LogSubscriber) as Arc<dyn Subscriber>],
    )
    .context("Failed to start booking engine")?;

    // Start expiry sweeper
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = engine.spawn_sweeper(shutdown_rx);

    // Start HTTP server
    let server_config = config.server.clone();
    let engine_data = web::Data::new(engine);

    info!(
        "Starting HTTP server on {}:{}",
        server_config.host, server_config.port
    );

    HttpServer::new(move || {
        App::new()
            .app_data(engine_data.clone())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(handlers::configure_routes)
    })
    .workers(server_config.workers)
    .bind((server_config.host, server_config.port))?
    .run()
    .await?;

    info!("HTTP server stopped, shutting down sweeper");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweeper {
        if let Err(e) = handle.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }
    }

    Ok(())
}
