/**
 * schedsync monitor
 *
 * Connects the sync engine to a realtime server, joins the project rooms
 * given on the command line and logs engine events until Ctrl-C.
 *
 * Usage: schedsync-monitor <project-id>...
 */
use schedsync::audit::TracingAuditLogger;
use schedsync::local_db::SqliteQueueStore;
use schedsync::offline::StateSync;
use schedsync::realtime::{EngineEvent, RealtimeManager, WebSocketTransport};
use schedsync::shared::EngineConfig;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    let config = EngineConfig::from_env()?;
    tracing::info!("[Monitor] Server {}", config.server_url);
    tracing::info!("[Monitor] Queue database {}", config.database_path.display());

    let store = SqliteQueueStore::open(&config.database_path).await?;
    let transport = WebSocketTransport::new(&config.server_url)?;
    let engine = RealtimeManager::new(
        &config,
        Arc::new(transport),
        Arc::new(store),
        StateSync::in_memory(config.rollback_timeout),
        Arc::new(TracingAuditLogger),
    );

    let mut events = engine.subscribe();
    engine.initialize().await?;

    let projects: Vec<String> = std::env::args().skip(1).collect();
    if projects.is_empty() {
        tracing::warn!("[Monitor] No project ids given, only connection events will show");
    }
    for project_id in &projects {
        engine.subscribe_to_project(project_id).await?;
        tracing::info!("[Monitor] Subscribed to project {}", project_id);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(EngineEvent::StatusChanged { previous, current }) => {
                    tracing::info!("[Monitor] {} -> {}", previous, current);
                }
                Ok(EngineEvent::QueueUpdated(stats)) => {
                    tracing::info!(
                        "[Monitor] Queue: {} pending, {} in flight, {} failed",
                        stats.pending,
                        stats.processing,
                        stats.failed
                    );
                }
                Ok(EngineEvent::ResourceChanged { resource_kind, resource_id, outcome }) => {
                    tracing::info!("[Monitor] {} {} {:?}", resource_kind, resource_id, outcome);
                }
                Ok(EngineEvent::ConflictResolved { resource_kind, resource_id, strategy, version }) => {
                    tracing::info!(
                        "[Monitor] Conflict on {} {} resolved with {:?} at version {}",
                        resource_kind,
                        resource_id,
                        strategy,
                        version
                    );
                }
                Ok(EngineEvent::OperationFailed { resource_kind, resource_id, error, .. }) => {
                    tracing::error!("[Monitor] {} {} failed: {}", resource_kind, resource_id, error);
                }
                Ok(EngineEvent::Error(message)) => tracing::error!("[Monitor] {}", message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("[Monitor] Skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let metrics = engine.get_connection_metrics().await;
    tracing::info!(
        "[Monitor] Shutting down (uptime {:?}, {} reconnections, {} packets lost)",
        metrics.total_uptime,
        metrics.reconnection_count,
        metrics.packets_lost
    );
    engine.shutdown().await;
    Ok(())
}
