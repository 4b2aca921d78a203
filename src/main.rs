//! Rating service - incremental reputation aggregation per workspace

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rating_service::{
    config::Args,
    db::{InMemoryStorageProvider, MongoClient, StorageProvider},
    manager::{ManagerDeps, WorkspaceManager},
    model::{ContentModel, DomainIndex},
    nats::{JetStreamProducer, NatsClient},
    services::{AccountClient, NoopNotifier, NotifierFactory, TokenIssuer, TransactorNotifierFactory},
};

/// Timeout of account service calls
const ACCOUNTS_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("rating_service={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let model = ContentModel::load(args.content_model.as_deref())?;
    let index = Arc::new(DomainIndex::build(&model)?);
    let manager_config = args.manager_config().map_err(anyhow::Error::msg)?;

    info!("======================================");
    info!("  Rating Service");
    info!("  Reputation aggregation per workspace");
    info!("======================================");
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("NATS: {}", args.nats.nats_url);
    info!("MongoDB: {} (prefix {})", args.mongodb_uri, args.mongodb_db_prefix);
    info!("Accounts: {}", args.accounts_url);
    info!("Transactor: {}", args.transactor_url().as_deref().unwrap_or("disabled"));
    info!(
        "Content model: {} classes, supported version {}",
        index.class_count(),
        manager_config.supported_version.unwrap_or_else(|| index.version())
    );
    info!("Consumer group: {}", manager_config.consumer_group);
    info!("======================================");

    // Connect to MongoDB (in-memory storage in dev mode)
    let storage: Arc<dyn StorageProvider> =
        match MongoClient::new(&args.mongodb_uri, &args.mongodb_db_prefix).await {
            Ok(client) => {
                info!("MongoDB connected successfully");
                Arc::new(client)
            }
            Err(e) => {
                if args.dev_mode {
                    warn!("MongoDB connection failed (dev mode, using in-memory storage): {}", e);
                    Arc::new(InMemoryStorageProvider::new())
                } else {
                    error!("MongoDB connection failed: {}", e);
                    std::process::exit(1);
                }
            }
        };

    let nats = match NatsClient::new(&args.nats, "rating-service").await {
        Ok(client) => {
            info!("NATS connected successfully");
            client
        }
        Err(e) => {
            error!("NATS connection failed: {}", e);
            std::process::exit(1);
        }
    };

    let tokens = TokenIssuer::new(args.server_secret())?;
    let accounts = Arc::new(AccountClient::new(
        args.accounts_url.clone(),
        tokens.clone(),
        ACCOUNTS_TIMEOUT,
    ));
    let notifiers: Arc<dyn NotifierFactory> = match args.transactor_url() {
        Some(url) => Arc::new(TransactorNotifierFactory::new(Some(url), tokens)),
        None => Arc::new(NoopNotifier),
    };

    let manager = WorkspaceManager::new(
        manager_config,
        ManagerDeps {
            index,
            storage,
            directory: accounts.clone(),
            identities: accounts,
            notifiers,
            producer: Arc::new(JetStreamProducer::new(nats.clone())),
        },
    );

    manager.start(nats).await?;
    info!("Rating service running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    if let Err(e) = manager.shutdown(false).await {
        error!("Error during shutdown: {}", e);
    }

    Ok(())
}
