use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::admin::Administrable;
use crate::error::{QuotaError, QuotaResult};
use crate::health::HealthChecker;
use crate::response::{AllowResponse, ChangeResponse, ConfigResponse, HistoryResponse};
use crate::server::Server;
use crate::service_config::{BucketConfig, NamespaceConfig, ServiceConfig};

/// Shared application state
pub type SharedState = Arc<Server>;

/// Header naming the user a change is attributed to.
pub const USER_HEADER: &str = "x-quota-user";
pub const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Default, Deserialize)]
pub struct AllowRequest {
    #[serde(default)]
    pub tokens: Option<i64>,
    #[serde(default)]
    pub max_wait_millis: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct NewBucketRequest {
    pub name: String,
    #[serde(flatten)]
    pub config: BucketConfig,
}

fn acting_user(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

fn accepted(message: impl Into<String>, user: &str) -> (StatusCode, Json<ChangeResponse>) {
    (StatusCode::ACCEPTED, Json(ChangeResponse::accepted(message, user)))
}

/// Take tokens from a bucket
pub async fn allow(
    State(server): State<SharedState>,
    Path((namespace, bucket)): Path<(String, String)>,
    payload: Option<Json<AllowRequest>>,
) -> QuotaResult<impl IntoResponse> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let tokens = request.tokens.unwrap_or(1);
    let max_wait = Duration::from_millis(request.max_wait_millis.unwrap_or(0));

    let (wait, admitted) = server.allow(&namespace, &bucket, tokens, max_wait).await?;
    if !admitted {
        return Err(QuotaError::QuotaExceeded { namespace, bucket });
    }

    Ok(Json(AllowResponse::granted(namespace, bucket, tokens, wait)))
}

pub async fn get_config(State(server): State<SharedState>) -> impl IntoResponse {
    Json(ConfigResponse::current(server.configs()))
}

pub async fn get_config_history(State(server): State<SharedState>) -> QuotaResult<impl IntoResponse> {
    let configs = server.historical_configs().await?;
    Ok(Json(HistoryResponse::new(configs)))
}

pub async fn update_config(
    State(server): State<SharedState>,
    headers: HeaderMap,
    Json(config): Json<ServiceConfig>,
) -> QuotaResult<impl IntoResponse> {
    let user = acting_user(&headers);
    server.update_config(config, &user).await?;
    Ok(accepted("Configuration accepted", &user))
}

pub async fn add_namespace(
    State(server): State<SharedState>,
    headers: HeaderMap,
    Json(namespace): Json<NamespaceConfig>,
) -> QuotaResult<impl IntoResponse> {
    let user = acting_user(&headers);
    let message = format!("Namespace {} accepted", namespace.name);
    server.add_namespace(namespace, &user).await?;
    Ok(accepted(message, &user))
}

pub async fn update_namespace(
    State(server): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(mut namespace): Json<NamespaceConfig>,
) -> QuotaResult<impl IntoResponse> {
    let user = acting_user(&headers);
    if namespace.name.is_empty() {
        namespace.name = name.clone();
    } else if namespace.name != name {
        return Err(QuotaError::Validation(format!(
            "Body names namespace '{}' but the path names '{}'",
            namespace.name, name
        )));
    }
    server.update_namespace(namespace, &user).await?;
    Ok(accepted(format!("Namespace {} update accepted", name), &user))
}

pub async fn delete_namespace(
    State(server): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> QuotaResult<impl IntoResponse> {
    let user = acting_user(&headers);
    server.delete_namespace(&name, &user).await?;
    Ok(accepted(format!("Namespace {} deletion accepted", name), &user))
}

pub async fn add_bucket(
    State(server): State<SharedState>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
    Json(request): Json<NewBucketRequest>,
) -> QuotaResult<impl IntoResponse> {
    let user = acting_user(&headers);
    server
        .add_bucket(&namespace, &request.name, request.config, &user)
        .await?;
    Ok(accepted(format!("Bucket {}:{} accepted", namespace, request.name), &user))
}

pub async fn update_bucket(
    State(server): State<SharedState>,
    Path((namespace, bucket)): Path<(String, String)>,
    headers: HeaderMap,
    Json(config): Json<BucketConfig>,
) -> QuotaResult<impl IntoResponse> {
    let user = acting_user(&headers);
    server.update_bucket(&namespace, &bucket, config, &user).await?;
    Ok(accepted(format!("Bucket {}:{} update accepted", namespace, bucket), &user))
}

pub async fn delete_bucket(
    State(server): State<SharedState>,
    Path((namespace, bucket)): Path<(String, String)>,
    headers: HeaderMap,
) -> QuotaResult<impl IntoResponse> {
    let user = acting_user(&headers);
    server.delete_bucket(&namespace, &bucket, &user).await?;
    Ok(accepted(format!("Bucket {}:{} deletion accepted", namespace, bucket), &user))
}

pub async fn top_hits(
    State(server): State<SharedState>,
    Path(namespace): Path<String>,
) -> impl IntoResponse {
    Json(server.top_dynamic_hits(&namespace).await)
}

pub async fn top_misses(
    State(server): State<SharedState>,
    Path(namespace): Path<String>,
) -> impl IntoResponse {
    Json(server.top_dynamic_misses(&namespace).await)
}

pub async fn bucket_stats(
    State(server): State<SharedState>,
    Path((namespace, bucket)): Path<(String, String)>,
) -> QuotaResult<impl IntoResponse> {
    server
        .dynamic_bucket_stats(&namespace, &bucket)
        .await
        .map(Json)
        .ok_or(QuotaError::NoSuchBucket { namespace, bucket })
}

/// Health check endpoint
pub async fn health_check(State(server): State<SharedState>) -> impl IntoResponse {
    let status = HealthChecker::new(server).check_health().await;
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_acting_user() {
        let mut headers = HeaderMap::new();
        assert_eq!(acting_user(&headers), ANONYMOUS_USER);

        headers.insert(USER_HEADER, HeaderValue::from_static("  "));
        assert_eq!(acting_user(&headers), ANONYMOUS_USER);

        headers.insert(USER_HEADER, HeaderValue::from_static("alice"));
        assert_eq!(acting_user(&headers), "alice");
    }

    #[test]
    fn test_new_bucket_request_flattens_config() {
        let request: NewBucketRequest =
            serde_json::from_str(r#"{"name":"search","fill_rate":5,"size":10}"#).unwrap();
        assert_eq!(request.name, "search");
        assert_eq!(request.config.fill_rate, 5);
        assert_eq!(request.config.max_debt_millis, 0);
    }
}
