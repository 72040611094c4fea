use crate::service_config::ServiceConfig;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize)]
pub struct AllowResponse {
    pub namespace: String,
    pub bucket: String,
    pub tokens: i64,
    /// How long the caller must wait before using the tokens.
    pub wait_millis: u64,
}

impl AllowResponse {
    pub fn granted(namespace: String, bucket: String, tokens: i64, wait: Duration) -> Self {
        Self {
            namespace,
            bucket,
            tokens,
            wait_millis: wait.as_millis() as u64,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub message: String,
    pub config: ServiceConfig,
}

impl ConfigResponse {
    pub fn current(config: ServiceConfig) -> Self {
        Self {
            message: "Current configuration".to_string(),
            config,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub count: usize,
    pub configs: Vec<ServiceConfig>,
}

impl HistoryResponse {
    pub fn new(configs: Vec<ServiceConfig>) -> Self {
        Self {
            count: configs.len(),
            configs,
        }
    }
}

/// Returned for accepted changes; they are applied asynchronously.
#[derive(Debug, Serialize)]
pub struct ChangeResponse {
    pub message: String,
    pub user: String,
}

impl ChangeResponse {
    pub fn accepted(message: impl Into<String>, user: &str) -> Self {
        Self {
            message: message.into(),
            user: user.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_response_serialization() {
        let response = AllowResponse::granted("api".into(), "search".into(), 2, Duration::from_millis(250));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["wait_millis"], 250);
        assert_eq!(json["tokens"], 2);
    }

    #[test]
    fn test_history_response_counts() {
        let response = HistoryResponse::new(vec![ServiceConfig::default(), ServiceConfig::default()]);
        assert_eq!(response.count, 2);
    }
}
