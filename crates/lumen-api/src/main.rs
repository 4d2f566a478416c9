use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lumen_api::{
    build_router,
    config::{Config, StorageBackend},
    state::AppState,
};
use lumen_engine::Engine;
use lumen_llm::{ClientFactory, LlmClient, ProviderConfig};
use lumen_persist::Stores;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().context("Failed to load configuration")?;

    init_logging(&config);

    tracing::info!("Starting Lumen API server");
    tracing::info!(addr = %config.bind_addr(), storage = ?config.storage.backend, "Config loaded");

    let llm_client = build_llm_client(&config)?;
    let stores = build_stores(&config).await?;

    let engine = Engine::builder()
        .stores(stores)
        .llm_client(llm_client)
        .config(config.engine_config())
        .build()
        .context("Failed to build engine")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = engine.start_workers(shutdown_rx);
    tracing::info!(workers = workers.len(), "Job workers started");

    let state = AppState::new(config.clone(), engine.clone());
    let app = build_router(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Health check: http://{}/health", addr);
    tracing::info!("API docs: http://{}/api/docs/openapi.json", addr);

    let hub = engine.notifier.hub().clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open SSE streams would otherwise keep the server draining forever
            hub.close_all();
            let _ = shutdown_tx.send(true);
        })
        .await?;

    tracing::info!("Server stopped; draining job workers");
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "job worker panicked");
        }
    }

    Ok(())
}

fn build_llm_client(config: &Config) -> anyhow::Result<Arc<dyn LlmClient>> {
    tracing::info!(model = %config.llm.chat_model, "Initializing LLM client");
    let mut provider = ProviderConfig::openai(config.openai_api_key.clone()).with_models(config.llm.clone().into());
    if let Some(base_url) = &config.llm.base_url {
        provider = provider.with_base_url(base_url.clone());
    }
    ClientFactory::create_client(provider).context("Failed to create LLM client")
}

async fn build_stores(config: &Config) -> anyhow::Result<Stores> {
    match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; data is lost on restart");
            Ok(Stores::in_memory())
        }
        StorageBackend::Mongodb => connect_mongo(config).await,
    }
}

#[cfg(feature = "mongodb")]
async fn connect_mongo(config: &Config) -> anyhow::Result<Stores> {
    use lumen_persist::{InMemoryVectorStore, MongoStore};

    let uri = config
        .mongodb_uri
        .as_deref()
        .context("MONGODB_URI is required for the mongodb backend")?;

    tracing::info!(database = %config.storage.database, "Connecting to MongoDB");
    let store = MongoStore::connect(uri, &config.storage.database)
        .await
        .context("Failed to connect to MongoDB")?;
    store.ensure_indexes().await.context("Failed to create MongoDB indexes")?;
    tracing::info!("MongoDB connected");

    // The vector index is a cache; rebuild jobs repopulate it from the stored docs
    Ok(Stores::from_mongo(Arc::new(store), Arc::new(InMemoryVectorStore::new())))
}

#[cfg(not(feature = "mongodb"))]
async fn connect_mongo(_config: &Config) -> anyhow::Result<Stores> {
    anyhow::bail!("storage.backend = \"mongodb\" needs the `mongodb` feature")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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
    tracing::info!("Shutdown signal received");
}

fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.logging.format.as_str() {
        "json" => {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        }
        _ => {
            registry.with(tracing_subscriber::fmt::layer().pretty()).init();
        }
    }
}
