pub mod admin;
pub mod backoff;
pub mod bucket;
pub mod bucket_factory;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod connection;
pub mod container;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod persister;
pub mod response;
pub mod routes;
pub mod server;
pub mod service_config;
pub mod stats;
pub mod store;
pub mod token_bucket;

pub use admin::Administrable;
pub use config::Config;
pub use error::{QuotaError, QuotaResult};
pub use routes::create_app;
pub use server::{ReloadOutcome, Server, ServerSettings};
pub use service_config::{BucketConfig, NamespaceConfig, ServiceConfig};
