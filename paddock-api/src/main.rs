mod http;
mod state;
mod ws;

use anyhow::Result;
use bytes::Bytes;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use paddock_core::repository::{DeviceRepository, HorseRepository, UserRepository};
use paddock_core::service::{
    ClientNotifier, DeviceEventRouter, FeedingCoordinator, FrameRelay, StreamSessionManager,
    SubscriptionLifecycleManager,
};
use paddock_core::transport::{run_event_loop, CommandTransport, MqttCommandTransport};
use paddock_core::{logging, Config};

use crate::state::AppState;
use crate::ws::hub::WsHub;

#[tokio::main]
async fn main() -> Result<()> {
    // Optional config file path as the sole argument; env vars override
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}");
        eprintln!("Using default configuration");
        Config::default()
    });

    logging::init_logging(&config.logging)?;

    info!("Paddock server starting...");
    info!("HTTP address: {}", config.http_address());

    let pool: sqlx::PgPool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_seconds))
        .connect(config.database_url())
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            anyhow::anyhow!("Database connection failed: {e}")
        })?;
    info!("Database connected");

    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            anyhow::anyhow!("Migration failed: {e}")
        })?;
    info!("Migrations completed");

    // Placeholder frame served to viewers while no camera frame exists
    let placeholder = match &config.streaming.placeholder_path {
        Some(path) => match tokio::fs::read(path).await {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                warn!(path = %path, error = %e, "placeholder not loaded, viewers see gaps instead");
                None
            }
        },
        None => None,
    };

    let relay = Arc::new(FrameRelay::new(
        config.streaming.frame_buffer_capacity,
        Duration::from_millis(config.streaming.target_frame_interval_ms),
        placeholder,
    ));

    let (mqtt, event_loop) = MqttCommandTransport::new(&config.mqtt);
    let transport: Arc<dyn CommandTransport> = Arc::new(mqtt.clone());
    info!("MQTT transport initialized ({}:{})", config.mqtt.host, config.mqtt.port);

    let grace = Duration::from_secs(config.telemetry.stop_grace_seconds);
    let subscriptions = Arc::new(SubscriptionLifecycleManager::new(transport.clone(), grace));

    let hub = Arc::new(WsHub::new());
    hub.attach_rooms(subscriptions.clone());
    let notifier: Arc<dyn ClientNotifier> = hub.clone();

    let stream_sessions = Arc::new(StreamSessionManager::new(
        pool.clone(),
        transport.clone(),
        notifier.clone(),
    ));
    subscriptions.set_stream_sessions(stream_sessions.clone());

    let feeding_coordinator = Arc::new(FeedingCoordinator::new(
        pool.clone(),
        transport.clone(),
        notifier.clone(),
    ));

    let event_router = Arc::new(DeviceEventRouter::new(
        DeviceRepository::new(pool.clone()),
        HorseRepository::new(pool.clone()),
        feeding_coordinator.clone(),
        stream_sessions.clone(),
        notifier,
    ));

    let shutdown = CancellationToken::new();
    let mqtt_task = tokio::spawn(run_event_loop(
        mqtt.client(),
        event_loop,
        event_router,
        shutdown.clone(),
    ));

    let app_state = AppState {
        config: Arc::new(config.clone()),
        relay,
        subscriptions,
        stream_sessions,
        feeding_coordinator,
        hub,
        horses: HorseRepository::new(pool.clone()),
        devices: DeviceRepository::new(pool.clone()),
        users: UserRepository::new(pool),
    };

    let router = http::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(config.http_address()).await?;
    info!("Listening on {}", config.http_address());

    let server_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = mqtt_task.await;
    info!("Paddock server stopped");

    Ok(())
}
