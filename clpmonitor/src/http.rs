//! HTTP surface: event stream, tag writes, assignments, manual refresh and health.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clpmonitor_s7::ErrorKind;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::monitor::{AssignmentError, Monitor};
use crate::write::{WriteOutcome, WriteRequest};

/// Create the HTTP router.
pub fn create_router(monitor: Monitor) -> Router {
    Router::new()
        .route("/clp-data-stream", get(stream_handler))
        .route("/write-tag", post(write_tag_handler))
        .route(
            "/assignments/:position",
            put(assign_handler).delete(release_handler),
        )
        .route("/manual-refresh", post(manual_refresh_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(monitor)
}

/// Handler for /clp-data-stream.
///
/// One subscriber per connection; it is dropped, and so unsubscribed, when
/// the client goes away.
async fn stream_handler(
    State(monitor): State<Monitor>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscriber = monitor.engine().subscribe();
    debug!(subscriber = subscriber.id(), "Event stream opened");

    let stream = subscriber.filter_map(|event| {
        match Event::default().event(&event.name).json_data(&event.payload) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                warn!(event = %event.name, error = %e, "Failed to encode event");
                None
            }
        }
    });

    Sse::new(stream)
}

/// Handler for /write-tag.
async fn write_tag_handler(
    State(monitor): State<Monitor>,
    Json(request): Json<WriteRequest>,
) -> Response {
    match monitor.writer().write(&request).await {
        Ok(write) => {
            let connector = monitor.writer().connector(&request);
            if monitor.refreshes_after_write(&connector, write.address().db()) {
                debug!(address = %write.address(), "Write touches stock levels, refreshing");
                monitor.request_refresh();
            }
            (StatusCode::OK, Json(WriteOutcome::written(&write))).into_response()
        }
        Err(failure) => (
            status_for(failure.kind()),
            Json(WriteOutcome::failed(&failure)),
        )
            .into_response(),
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::Address | ErrorKind::Format => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::Connection | ErrorKind::Protocol => StatusCode::BAD_GATEWAY,
    }
}

/// Body of `PUT /assignments/{position}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    pub order: String,
}

/// Reply to an assignment change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentOutcome {
    pub position: usize,
    /// Order now held by the position.
    pub order: Option<String>,
    /// Order the position held before.
    pub previous: Option<String>,
}

/// Handler for PUT /assignments/{position}.
async fn assign_handler(
    State(monitor): State<Monitor>,
    Path(position): Path<usize>,
    Json(request): Json<AssignRequest>,
) -> Response {
    match monitor.assign(position, &request.order) {
        Ok(previous) => {
            monitor.request_refresh();
            let outcome = AssignmentOutcome {
                position,
                order: Some(request.order.trim().to_string()),
                previous,
            };
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => assignment_error(e),
    }
}

/// Handler for DELETE /assignments/{position}.
async fn release_handler(
    State(monitor): State<Monitor>,
    Path(position): Path<usize>,
) -> Response {
    match monitor.release(position) {
        Ok(previous) => {
            monitor.request_refresh();
            let outcome = AssignmentOutcome {
                position,
                order: None,
                previous,
            };
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => assignment_error(e),
    }
}

fn assignment_error(error: AssignmentError) -> Response {
    let status = match error {
        AssignmentError::NotAvailable => StatusCode::NOT_FOUND,
        AssignmentError::Position { .. } | AssignmentError::EmptyOrder => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
    };
    let body = serde_json::json!({ "error": error.to_string() });
    (status, Json(body)).into_response()
}

/// Handler for /manual-refresh. Acknowledges the request, not its result.
async fn manual_refresh_handler(State(monitor): State<Monitor>) -> Response {
    monitor.request_refresh();
    (StatusCode::ACCEPTED, "refresh requested\n").into_response()
}

/// Handler for /health.
async fn health_handler(State(monitor): State<Monitor>) -> Response {
    (StatusCode::OK, Json(monitor.health())).into_response()
}

/// HTTP server configuration.
pub struct HttpServer {
    monitor: Monitor,
    listen_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(monitor: Monitor, listen_addr: SocketAddr) -> Self {
        Self {
            monitor,
            listen_addr,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    ///
    /// Open event streams keep the server alive until the engine stops and
    /// completes their subscribers.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.monitor);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(addr = %self.listen_addr, "HTTP server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobsConfig, MonitorConfig};
    use axum::body::Body;
    use axum::http::Request;
    use clpmonitor_engine::jobs::StockLevelsSettings;
    use clpmonitor_s7::SimulatedPlc;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn monitor(plc: &SimulatedPlc) -> Monitor {
        let config = MonitorConfig {
            jobs: JobsConfig {
                stock_levels: Some(StockLevelsSettings::new("10.74.241.10")),
                ..JobsConfig::default()
            },
            ..MonitorConfig::default()
        };
        Monitor::build(&config, Arc::new(plc.clone())).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let router = create_router(monitor(&SimulatedPlc::new()));

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("application/json"));
    }

    #[tokio::test]
    async fn test_manual_refresh_accepted() {
        let router = create_router(monitor(&SimulatedPlc::new()));

        let response = router
            .oneshot(Request::post("/manual-refresh").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_stream_content_type() {
        let router = create_router(monitor(&SimulatedPlc::new()));

        let response = router
            .oneshot(Request::get("/clp-data-stream").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert_eq!(content_type, "text/event-stream");
    }

    #[tokio::test]
    async fn test_write_status_codes() {
        let plc = SimulatedPlc::new().with_block(9, vec![0; 96]);
        let router = create_router(monitor(&plc));

        let ok = r#"{"host": "10.74.241.10", "tag": {"db": 9, "offset": 70, "type": "byte"}, "value": "2"}"#;
        let response = router.clone().oneshot(post_json("/write-tag", ok)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let no_bit = r#"{"host": "10.74.241.10", "tag": {"db": 9, "offset": 0, "type": "bit"}, "value": "1"}"#;
        let response = router.clone().oneshot(post_json("/write-tag", no_bit)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        plc.set_offline(true);
        let response = router.oneshot(post_json("/write-tag", ok)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::Format), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::Protocol), StatusCode::BAD_GATEWAY);
    }
}
