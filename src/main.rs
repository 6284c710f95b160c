use std::sync::Arc;

use doc2video::broadcast::{StatusBroadcaster, SubscriptionRegistry};
use doc2video::config::Config;
use doc2video::pipeline::stages::SimulatedStages;
use doc2video::pipeline::store::{InMemoryPipelineStore, PgPipelineStore, PipelineStore};
use doc2video::{db, handlers, AppState, Orchestrator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    init_logging()?;

    let (store, store_kind): (Arc<dyn PipelineStore>, &'static str) = match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = db::create_pool(database_url, config.db_max_connections).await?;
            tracing::info!("✅ Pipeline store: PostgreSQL ({} connections)", config.db_max_connections);
            (Arc::new(PgPipelineStore::new(pool)), "postgres")
        }
        None => {
            tracing::warn!("DATABASE_URL not set. Pipelines are kept in memory and lost on restart.");
            (Arc::new(InMemoryPipelineStore::new()), "memory")
        }
    };

    let broadcaster = Arc::new(StatusBroadcaster::new(config.topic_buffer_size));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        broadcaster.clone(),
        Arc::new(SimulatedStages::new(config.simulated_stage_latency)),
        config.stage_timeout,
    ));
    let registry = Arc::new(SubscriptionRegistry::new(
        broadcaster,
        store,
        config.subscription_idle_timeout,
    ));
    tracing::info!("🎬 Pipeline orchestrator initialized");

    // Retention sweep for finished pipelines
    let cleanup_orchestrator = orchestrator.clone();
    let retention = config.pipeline_retention;
    let cleanup_interval = config.cleanup_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        loop {
            ticker.tick().await;
            match cleanup_orchestrator.cleanup_finished(retention).await {
                Ok(0) => tracing::debug!("✅ Retention sweep found nothing to remove"),
                Ok(removed) => tracing::info!("🧹 Removed {} finished pipelines", removed),
                Err(e) => tracing::error!("❌ Retention sweep failed: {}", e),
            }
        }
    });

    let bind_addr = config.bind_addr;
    let shared_state = Arc::new(AppState {
        orchestrator,
        registry,
        config,
        store_kind,
    });
    let app = handlers::app(shared_state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

// Production-grade logging configuration
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,doc2video=trace,sqlx=info,hyper=info,tower=info".to_string()
        } else {
            "info,doc2video=info,sqlx=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        // JSON logging for log aggregation
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("🎬 doc2video starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Build mode: {}", if cfg!(debug_assertions) { "development" } else { "production" });
    tracing::info!("Log level: {}", log_level);

    Ok(())
}
