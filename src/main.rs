//! Handoff - donation fulfillment service

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use handoff::{
    cache::{spawn_cleanup_task, CacheConfig, LocalCache, ViewLayer},
    config::{Args, LogFormat, StoreBackend},
    db::MongoClient,
    nats::{EventBus, LocalBus, NatsClient, Publisher, Subjects},
    server::{self, AppState},
    services::{Handoff, ServiceConfig},
    store::{FulfillmentStore, MemoryStore, MongoStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is normal outside local development
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args);

    if let Err(problems) = args.validate() {
        error!(%problems, "Refusing to start with invalid configuration");
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %args.node_id,
        listen = %args.listen,
        dev_mode = args.dev_mode,
        store = ?args.store_backend,
        nats = %args.nats.nats_url,
        "Starting handoff"
    );

    let store = open_store(&args).await;
    let bus = open_bus(&args).await;
    let publisher = Publisher::new(bus, Subjects::new(&args.nats.nats_subject_prefix));

    let cache_config = CacheConfig::from(&args.cache);
    let cache = Arc::new(LocalCache::new(cache_config.clone()));
    spawn_cleanup_task(Arc::clone(&cache));
    let views = ViewLayer::new(cache.clone(), cache_config);

    let handoff = Handoff::new(store, views, publisher, ServiceConfig::from(&args));
    server::run(Arc::new(AppState::new(args, handoff, Some(cache)))).await?;
    Ok(())
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("handoff={},info", args.log_level)));
    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// MongoDB, or the in-memory store when asked for (or in dev mode when
/// MongoDB is down). Exits on failure otherwise.
async fn open_store(args: &Args) -> Arc<dyn FulfillmentStore> {
    if args.store_backend == StoreBackend::Memory {
        warn!("In-memory store selected; nothing survives a restart");
        return Arc::new(MemoryStore::new());
    }

    match connect_mongo(args).await {
        Ok(store) => Arc::new(store),
        Err(e) if args.dev_mode => {
            warn!(error = %e, "MongoDB unavailable, dev mode continues in memory");
            Arc::new(MemoryStore::new())
        }
        Err(e) => {
            error!(error = %e, "MongoDB unavailable");
            std::process::exit(1);
        }
    }
}

/// NATS, or a process-local broadcast bus in dev mode
async fn open_bus(args: &Args) -> Arc<dyn EventBus> {
    let connection_name = format!("handoff-{}", args.node_id);
    match NatsClient::new(&args.nats, &connection_name).await {
        Ok(client) => Arc::new(client),
        Err(e) if args.dev_mode => {
            warn!(error = %e, "NATS unavailable, dev mode publishes locally");
            Arc::new(LocalBus::default())
        }
        Err(e) => {
            error!(error = %e, "NATS unavailable");
            std::process::exit(1);
        }
    }
}

async fn connect_mongo(args: &Args) -> handoff::Result<MongoStore> {
    let client = MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await?;
    MongoStore::new(&client).await
}
