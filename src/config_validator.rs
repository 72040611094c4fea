use crate::error::QuotaError;
use crate::service_config::{BucketConfig, ServiceConfig, DEFAULT_BUCKET_NAME, GLOBAL_NAMESPACE};
use regex::Regex;
use std::sync::LazyLock;
use validator::Validate;

// ':' is the key separator in the backing store and must never appear in a name.
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid name regex"));

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL. An empty URL selects the in-memory store.
    pub fn validate_redis_url(url: &str) -> Result<(), QuotaError> {
        if url.is_empty() {
            return Ok(());
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(QuotaError::Validation(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a bind address
    pub fn validate_bind_address(address: &str) -> Result<(), QuotaError> {
        if address.is_empty() {
            return Err(QuotaError::Validation("Bind address cannot be empty".to_string()));
        }

        if !address.contains(':') {
            return Err(QuotaError::Validation(
                "Bind address must be in host:port format".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a namespace or bucket name
    pub fn validate_name(kind: &str, name: &str) -> Result<(), QuotaError> {
        if !NAME_PATTERN.is_match(name) {
            return Err(QuotaError::Validation(format!(
                "Invalid {} name '{}': only alphanumerics, '.', '-' and '_' are allowed",
                kind, name
            )));
        }
        if name == GLOBAL_NAMESPACE || name == DEFAULT_BUCKET_NAME {
            return Err(QuotaError::Validation(format!("{} name '{}' is reserved", kind, name)));
        }
        Ok(())
    }

    /// Validates the numeric parameters of one bucket
    pub fn validate_bucket(location: &str, bucket: &BucketConfig) -> Result<(), QuotaError> {
        bucket
            .validate()
            .map_err(|e| QuotaError::Validation(format!("{}: {}", location, e)))
    }

    /// Validates a bucket that is not a dynamic template
    fn validate_static_bucket(location: &str, bucket: &BucketConfig) -> Result<(), QuotaError> {
        if bucket.dynamic {
            return Err(QuotaError::Validation(format!(
                "{}: only dynamic bucket templates may be marked dynamic",
                location
            )));
        }
        Self::validate_bucket(location, bucket)
    }

    /// Validates a whole service configuration before it is persisted or applied
    pub fn validate_service_config(config: &ServiceConfig) -> Result<(), QuotaError> {
        if let Some(global) = &config.global_default_bucket {
            Self::validate_static_bucket("global default bucket", global)?;
        }

        for (key, namespace) in &config.namespaces {
            if key != &namespace.name {
                return Err(QuotaError::Validation(format!(
                    "Namespace keyed as '{}' is named '{}'",
                    key, namespace.name
                )));
            }
            Self::validate_name("namespace", key)?;

            if let Some(default_bucket) = &namespace.default_bucket {
                Self::validate_static_bucket(&format!("{} default bucket", key), default_bucket)?;
            }
            if let Some(template) = &namespace.dynamic_bucket_template {
                Self::validate_bucket(&format!("{} dynamic bucket template", key), template)?;
            }

            for (name, bucket) in &namespace.buckets {
                Self::validate_name("bucket", name)?;
                Self::validate_static_bucket(&format!("{}:{}", key, name), bucket)?;
            }
        }

        Ok(())
    }

    /// Validates process settings
    pub fn validate_settings(
        bind_address: &str,
        redis_url: &str,
        connection_retries: usize,
    ) -> Result<(), QuotaError> {
        Self::validate_bind_address(bind_address)?;
        Self::validate_redis_url(redis_url)?;

        if connection_retries == 0 {
            return Err(QuotaError::Validation(
                "Connection retries must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
