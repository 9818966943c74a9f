//! Request and response logging middleware
//!
//! Captures HTTP request/response details including method, path, status,
//! duration, and request IDs. Also provides timing wrappers for provider
//! API calls and order store queries.

use axum::{
    extract::{MatchedPath, Request},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tower_http::request_id::{MakeRequestId, RequestId};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

const SLOW_REQUEST_MS: u128 = 200;
const SLOW_QUERY_MS: u128 = 100;
const SLOW_EXTERNAL_CALL_MS: u128 = 1_000;

/// Generate unique request IDs using UUIDv4
#[derive(Clone, Default)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &http::Request<B>) -> Option<RequestId> {
        let id = Uuid::new_v4().to_string();
        Some(RequestId::new(id.parse().ok()?))
    }
}

/// Middleware for logging HTTP requests and responses
///
/// Logs method, matched route, status and duration under the request id.
/// Requests slower than 200ms are logged at WARN; provider webhooks have
/// short delivery timeouts so these are worth watching.
pub async fn request_logging_middleware(
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let start = Instant::now();

    let method = request.method().clone();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let request_id = request
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .or_else(|| {
            request
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
        })
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        "Request started"
    );

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
    );
    let response = next.run(request).instrument(span).await;

    let duration_ms = start.elapsed().as_millis();
    let status = response.status();

    if duration_ms > SLOW_REQUEST_MS {
        warn!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration_ms,
            "Slow request completed"
        );
    } else if status.is_server_error() {
        tracing::error!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration_ms,
            "Request failed with server error"
        );
    } else if status.is_client_error() {
        warn!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration_ms,
            "Request completed with client error"
        );
    } else {
        info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration_ms,
            "Request completed"
        );
    }

    Ok(response)
}

/// Times an order store query and logs slow or failed ones
pub async fn log_database_query<F, T, E>(query: &str, operation: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();

    tracing::debug!(
        event_type = "database_query_start",
        query = %query,
        "Executing database query"
    );

    let result = operation.await;
    let duration_ms = start.elapsed().as_millis();

    match &result {
        Ok(_) if duration_ms > SLOW_QUERY_MS => {
            warn!(
                event_type = "slow_database_query",
                query = %query,
                duration_ms = %duration_ms,
                "Slow database query detected"
            );
        }
        Ok(_) => {
            tracing::debug!(
                event_type = "database_query_complete",
                query = %query,
                duration_ms = %duration_ms,
                "Database query completed"
            );
        }
        Err(e) => {
            tracing::error!(
                event_type = "database_query_error",
                query = %query,
                duration_ms = %duration_ms,
                error = %e,
                "Database query failed"
            );
        }
    }

    result
}

/// Times a call to an external service (provider API, merchant callback)
pub async fn log_external_call<F, T, E>(service: &str, endpoint: &str, operation: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();

    tracing::debug!(
        event_type = "external_call_start",
        service = %service,
        endpoint = %endpoint,
        "Calling external service"
    );

    let result = operation.await;
    let duration_ms = start.elapsed().as_millis();

    match &result {
        Ok(_) if duration_ms > SLOW_EXTERNAL_CALL_MS => {
            warn!(
                event_type = "slow_external_call",
                service = %service,
                endpoint = %endpoint,
                duration_ms = %duration_ms,
                "Slow external service call"
            );
        }
        Ok(_) => {
            info!(
                event_type = "external_call_complete",
                service = %service,
                endpoint = %endpoint,
                duration_ms = %duration_ms,
                "External service call completed"
            );
        }
        Err(e) => {
            warn!(
                event_type = "external_call_error",
                service = %service,
                endpoint = %endpoint,
                duration_ms = %duration_ms,
                error = %e,
                "External service call failed"
            );
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::get, Router};
    use tower::ServiceExt;
    use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

    #[tokio::test]
    async fn test_request_id_is_set_and_propagated() {
        async fn handler() -> &'static str {
            "ok"
        }

        let app: Router = Router::new()
            .route("/", get(handler))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(axum::middleware::from_fn(request_logging_middleware))
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId));

        let response = app
            .oneshot(http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers().get("x-request-id").unwrap().to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_log_database_query_passes_result_through() {
        let result = log_database_query("SELECT 1", async { Ok::<_, String>(42) }).await;
        assert_eq!(result.unwrap(), 42);

        let result = log_database_query("SELECT 1", async { Err::<i32, _>("down".to_string()) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_log_external_call_passes_result_through() {
        let result = log_external_call("alipay", "alipay.trade.query", async {
            Ok::<_, String>("success")
        })
        .await;
        assert_eq!(result.unwrap(), "success");
    }
}
