//! HTTP API
//!
//! - `POST /api/visits` records a visit keyed by the caller's IP address.
//! - `GET /api/visits` returns every stored visit, filtered by `gt`, `lt`
//!   and `day` query parameters.
//! - `GET /api/visits/:key` returns the visits of one key, same filters.
//!
//! Malformed filters answer 400; publish and store failures answer 500
//! with an opaque message. Error bodies are `{"error": "..."}`. A request
//! that outlives the configured timeout answers 408.

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::VisitstreamError;
use crate::event::VisitsByKey;
use crate::service::{ServiceError, VisitService};

const OPAQUE_ERROR: &str = "unexpected error occurred";

/// Error response of the visit endpoints.
#[derive(Debug)]
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            ServiceError::InvalidFilter(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            ServiceError::Publish(err) => {
                error!(error = %err, "Failed to publish visit");
                (StatusCode::INTERNAL_SERVER_ERROR, OPAQUE_ERROR.to_string())
            }
            ServiceError::Store(err) => {
                error!(error = %err, "Failed to query visits");
                (StatusCode::INTERNAL_SERVER_ERROR, OPAQUE_ERROR.to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Builds the visit API router.
///
/// Every request is traced and cut off after `request_timeout`.
pub fn router(service: VisitService, request_timeout: Duration) -> Router {
    Router::new()
        .route("/api/visits", post(record_visit).get(get_visits))
        .route("/api/visits/:key", get(get_visits_by_key))
        .with_state(service)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout)),
        )
}

async fn record_visit(
    State(service): State<VisitService>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<StatusCode, ApiError> {
    service.record_visit(&addr.ip().to_string()).await?;
    Ok(StatusCode::OK)
}

async fn get_visits(
    State(service): State<VisitService>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<VisitsByKey>, ApiError> {
    Ok(Json(service.get_visits(&query).await?))
}

async fn get_visits_by_key(
    State(service): State<VisitService>,
    Path(key): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<VisitsByKey>, ApiError> {
    Ok(Json(service.get_visits_by_key(&key, &query).await?))
}

/// Binds the listener socket.
///
/// # Errors
///
/// Returns `VisitstreamError::Listener` if the address cannot be bound.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, VisitstreamError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| VisitstreamError::Listener(format!("bind {}: {}", addr, e)))?;
    info!(addr = %addr, "HTTP listener bound");
    Ok(listener)
}

/// Serves `router` on `listener` until `cancel` fires.
///
/// In-flight requests are allowed to finish after cancellation.
///
/// # Errors
///
/// Returns `VisitstreamError::Listener` if the server fails.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> Result<(), VisitstreamError> {
    let result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await;

    match result {
        Ok(()) => {
            info!("HTTP listener stopped");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "HTTP listener failed");
            Err(VisitstreamError::Listener(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::event::VisitEvent;
    use crate::publisher::Publisher;
    use crate::storage::{SqliteVisitStore, StoreError, VisitStore};
    use crate::test_utils::first_week_of_2020;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Method, Request};
    use chrono::{DateTime, Utc};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Store that takes a full second to answer reads.
    struct SlowStore;

    #[async_trait]
    impl VisitStore for SlowStore {
        async fn insert_event(&self, _event: &VisitEvent) -> Result<(), StoreError> {
            Ok(())
        }

        async fn get_visits(&self) -> Result<VisitsByKey, StoreError> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(VisitsByKey::new())
        }

        async fn get_visits_by_key(
            &self,
            _key: &str,
            _weekday: Option<&str>,
            _gt: Option<DateTime<Utc>>,
            _lt: Option<DateTime<Utc>>,
        ) -> Result<Vec<DateTime<Utc>>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn with_caller(app: Router) -> Router {
        app.layer(MockConnectInfo(SocketAddr::from(([10, 1, 2, 3], 4567))))
    }

    struct Fixture {
        app: Router,
        broker: MemoryBroker,
        db_path: std::path::PathBuf,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("visits.db");
        let store = SqliteVisitStore::new_with_path(&db_path).unwrap();
        for event in first_week_of_2020("ip") {
            store.insert_event(&event).await.unwrap();
        }

        let broker = MemoryBroker::default();
        let publisher = Publisher::new(broker.producer().unwrap(), "visits");
        let service = VisitService::new(Arc::new(publisher), Arc::new(store));
        let app = with_caller(router(service, TEST_TIMEOUT));

        Fixture {
            app,
            broker,
            db_path,
            _dir: dir,
        }
    }

    async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_post_publishes_with_caller_ip() {
        let fx = fixture().await;
        let (status, body) = send(&fx.app, Method::POST, "/api/visits").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::Value::Null);
        assert_eq!(fx.broker.message_count("visits"), 1);
    }

    #[tokio::test]
    async fn test_post_publish_failure_is_500() {
        let fx = fixture().await;
        fx.broker.fail_next_deliveries(1);

        let (status, body) = send(&fx.app, Method::POST, "/api/visits").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], OPAQUE_ERROR);
    }

    #[tokio::test]
    async fn test_get_visits_with_filter() {
        let fx = fixture().await;
        let (status, body) = send(&fx.app, Method::GET, "/api/visits?gt=2020-01-05").await;

        assert_eq!(status, StatusCode::OK);
        let times = body["ip"].as_array().unwrap();
        assert_eq!(times.len(), 3);
        assert_eq!(times[0], "2020-01-05T00:00:00Z");
    }

    #[tokio::test]
    async fn test_get_visits_filtered_out_is_empty_object() {
        let fx = fixture().await;
        let (status, body) = send(&fx.app, Method::GET, "/api/visits?gt=2021").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_invalid_filter_is_400() {
        let fx = fixture().await;

        let (status, body) = send(&fx.app, Method::GET, "/api/visits?day=mday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("day"));

        let (status, _) = send(&fx.app, Method::GET, "/api/visits/ip?lt=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_visits_by_key() {
        let fx = fixture().await;
        let (status, body) = send(&fx.app, Method::GET, "/api/visits/ip?day=Wednesday").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "ip": ["2020-01-01T00:00:00Z"] }));

        let (status, body) = send(&fx.app, Method::GET, "/api/visits/nobody").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_store_failure_is_opaque_500() {
        let fx = fixture().await;
        std::fs::remove_file(&fx.db_path).unwrap();
        std::fs::create_dir(&fx.db_path).unwrap();

        let (status, body) = send(&fx.app, Method::GET, "/api/visits").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], OPAQUE_ERROR);
    }

    #[tokio::test]
    async fn test_slow_request_times_out_with_408() {
        let broker = MemoryBroker::default();
        let publisher = Publisher::new(broker.producer().unwrap(), "visits");
        let service = VisitService::new(Arc::new(publisher), Arc::new(SlowStore));
        let app = with_caller(router(service, Duration::from_millis(50)));

        let started = std::time::Instant::now();
        let (status, _) = send(&app, Method::GET, "/api/visits").await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(1));

        let (status, _) = send(&app, Method::GET, "/api/visits/ip").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let fx = fixture().await;
        let listener = bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(serve(listener, fx.app.clone(), cancel.clone()));
        cancel.cancel();

        assert!(handle.await.unwrap().is_ok());
    }
}
