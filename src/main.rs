use anyhow::{Context, Result};
use clap::Parser;
use quotaservice::bucket_factory::StoreBucketFactory;
use quotaservice::clock::SystemClock;
use quotaservice::config::Config;
use quotaservice::persister::{ConfigPersister, FileConfigPersister, MemoryConfigPersister};
use quotaservice::routes::{create_app, serve, shutdown_signal};
use quotaservice::server::{Server, ServerSettings};
use quotaservice::service_config::ServiceConfig;
use quotaservice::store::{MemoryConnector, MemoryStore, RedisConnector, StoreConnector};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Distributed quota service. Flags override the matching environment variables.
#[derive(Parser, Debug)]
#[command(name = "quotaservice", version)]
struct Cli {
    /// Address to listen on (BIND_ADDRESS)
    #[arg(long)]
    bind_address: Option<String>,

    /// Redis URL; empty selects the in-memory store (REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// Directory holding configuration history (CONFIG_DIR)
    #[arg(long)]
    config_dir: Option<String>,

    /// Log level for this crate (LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,

    /// JSON configuration used when nothing has been persisted yet
    #[arg(long)]
    initial_config: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(bind_address) = &self.bind_address {
            config.bind_address = bind_address.clone();
        }
        if let Some(redis_url) = &self.redis_url {
            config.redis_url = redis_url.clone();
        }
        if let Some(config_dir) = &self.config_dir {
            config.config_dir = config_dir.clone();
        }
        if let Some(log_level) = &self.log_level {
            config.log_level = log_level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("quotaservice={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting quota service");
    tracing::info!(
        bind_address = %config.bind_address,
        redis_url = %config.redis_url,
        config_dir = %config.config_dir,
        "Configuration loaded"
    );

    let connector: Arc<dyn StoreConnector> = if config.redis_url.is_empty() {
        tracing::warn!("No Redis URL configured; bucket state is kept in process memory");
        Arc::new(MemoryConnector::new(Arc::new(MemoryStore::new(Arc::new(SystemClock)))))
    } else {
        Arc::new(RedisConnector::new(&config.redis_url).context("Failed to create Redis connector")?)
    };

    let persister: Arc<dyn ConfigPersister> = if config.config_dir.is_empty() {
        Arc::new(MemoryConfigPersister::new())
    } else {
        Arc::new(FileConfigPersister::new(&config.config_dir))
    };

    let initial = match &cli.initial_config {
        Some(path) => {
            let blob = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            ServiceConfig::unmarshal(&blob).context("Failed to parse initial configuration")?
        }
        None => ServiceConfig::default(),
    };

    let factory = Arc::new(StoreBucketFactory::new(
        connector,
        Arc::new(SystemClock),
        config.connection_retries,
        config.retry_backoff_ms,
    ));
    let server = Server::new(
        initial,
        persister,
        factory,
        ServerSettings {
            dynamic_reap_interval: config.dynamic_reap_interval(),
        },
    );
    server.start().await.context("Failed to start quota server")?;

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    let served = serve(listener, create_app(Arc::clone(&server)), shutdown_signal()).await;

    server.stop().await.context("Failed to stop quota server")?;
    served.context("Server error")?;

    Ok(())
}
