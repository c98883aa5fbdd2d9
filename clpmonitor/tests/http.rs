//! Integration tests for the HTTP surface, driven in-process against the
//! simulated controller.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use clpmonitor::{
    AssignmentOutcome, JobsConfig, Monitor, MonitorConfig, WriteOutcome, create_router,
    simulated_plc,
};
use clpmonitor_common::EventValue;
use clpmonitor_engine::HealthSnapshot;
use clpmonitor_engine::jobs::{OccupancySettings, StockLevelsSettings};
use clpmonitor_s7::SimulatedPlc;
use tokio_stream::StreamExt;
use tower::ServiceExt;

fn setup() -> (Monitor, SimulatedPlc) {
    let config = MonitorConfig {
        jobs: JobsConfig {
            stock_levels: Some(StockLevelsSettings::new("10.74.241.10")),
            ..JobsConfig::default()
        },
        ..MonitorConfig::default()
    };
    let plc = simulated_plc(&config.jobs);
    let monitor = Monitor::build(&config, Arc::new(plc.clone())).unwrap();
    (monitor, plc)
}

fn write_request(body: serde_json::Value) -> Request<Body> {
    Request::post("/write-tag")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_missing_bit_index_rejected_without_network() {
    let (monitor, plc) = setup();
    let router = create_router(monitor);

    let response = router
        .oneshot(write_request(serde_json::json!({
            "host": "10.74.241.10",
            "tag": {"db": 9, "offset": 0, "type": "BIT"},
            "value": "true"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let outcome: WriteOutcome = json_body(response).await;
    assert!(!outcome.success);
    assert_eq!(outcome.kind.as_deref(), Some("validation"));
    assert!(outcome.detail.is_none());
    assert_eq!(plc.connection_attempts(), 0);
}

#[tokio::test]
async fn test_write_refreshes_stock_levels() {
    let (monitor, plc) = setup();
    let mut subscriber = monitor.engine().subscribe();
    let router = create_router(monitor);

    let response = router
        .oneshot(write_request(serde_json::json!({
            "host": "10.74.241.10",
            "tag": {"db": 9, "offset": 68, "type": "byte"},
            "value": "5"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let outcome: WriteOutcome = json_body(response).await;
    assert!(outcome.success);
    assert_eq!(outcome.detail.as_deref(), Some("DB9.68 (BYTE) = 5"));
    assert_eq!(plc.block(9).unwrap()[68], 5);

    let event = tokio::time::timeout(Duration::from_secs(2), subscriber.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "stock-levels");
    let EventValue::Array(colours) = event.payload.value else {
        panic!("expected array payload");
    };
    assert_eq!(colours[0], 5);
    assert_eq!(colours[1], 2);
}

#[tokio::test]
async fn test_write_to_other_controller_does_not_refresh() {
    let (monitor, plc) = setup();
    let mut subscriber = monitor.engine().subscribe();
    let router = create_router(monitor);

    // The simulator answers every host; only the stock-levels controller counts
    let response = router
        .oneshot(write_request(serde_json::json!({
            "host": "10.74.241.99",
            "tag": {"db": 9, "offset": 68, "type": "byte"},
            "value": "7"
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(plc.block(9).unwrap()[68], 7);

    let next = tokio::time::timeout(Duration::from_millis(200), subscriber.recv()).await;
    assert!(next.is_err());
}

#[tokio::test]
async fn test_event_stream_carries_named_events() {
    let (monitor, _plc) = setup();
    let router = create_router(monitor.clone());

    let response = router
        .clone()
        .oneshot(Request::get("/clp-data-stream").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(monitor.engine().subscriber_count(), 1);

    let refresh = router
        .oneshot(Request::post("/manual-refresh").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(refresh.status(), StatusCode::ACCEPTED);

    let mut body = response.into_body().into_data_stream();
    let mut text = String::new();
    while !text.contains("\n\n") {
        let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        text.push_str(std::str::from_utf8(&chunk).unwrap());
    }

    assert!(text.contains("event:"));
    assert!(text.contains("stock-levels"));
    assert!(text.contains(r#"{"id":1,"value":[1,2,3,4,1,2,3,4,"#));

    drop(body);
    assert_eq!(monitor.engine().subscriber_count(), 0);
}

#[tokio::test]
async fn test_health_reports_job_failures() {
    let (monitor, plc) = setup();
    plc.set_offline(true);
    monitor.engine().manual_refresh().await;

    let response = create_router(monitor)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let snapshot: HealthSnapshot = json_body(response).await;
    assert_eq!(snapshot.status, "error");
    assert_eq!(snapshot.jobs.len(), 1);
    assert_eq!(snapshot.jobs[0].failures, 1);
    assert!(
        snapshot.jobs[0]
            .last_error
            .as_deref()
            .unwrap()
            .starts_with("Connection failed")
    );
}

#[tokio::test]
async fn test_write_to_offline_controller_is_bad_gateway() {
    let (monitor, plc) = setup();
    plc.set_offline(true);

    let response = create_router(monitor)
        .oneshot(write_request(serde_json::json!({
            "host": "10.74.241.10",
            "tag": {"db": 9, "offset": 68, "type": "byte"},
            "value": "5"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let outcome: WriteOutcome = json_body(response).await;
    assert_eq!(outcome.kind.as_deref(), Some("connection"));
    assert_eq!(outcome.detail.as_deref(), Some("DB9.68 (BYTE) = 5"));
}

fn occupancy_monitor() -> Monitor {
    let config = MonitorConfig {
        jobs: JobsConfig {
            occupancy: Some(OccupancySettings::default()),
            ..JobsConfig::default()
        },
        ..MonitorConfig::default()
    };
    Monitor::build(&config, Arc::new(SimulatedPlc::new())).unwrap()
}

fn assign_request(position: usize, order: &str) -> Request<Body> {
    Request::put(format!("/assignments/{}", position))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::json!({ "order": order }).to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_assignment_broadcasts_occupancy() {
    let monitor = occupancy_monitor();
    let mut subscriber = monitor.engine().subscribe();
    let router = create_router(monitor);

    let response = router
        .clone()
        .oneshot(assign_request(4, "PO-1204"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let outcome: AssignmentOutcome = json_body(response).await;
    assert_eq!(outcome.position, 4);
    assert_eq!(outcome.order.as_deref(), Some("PO-1204"));
    assert!(outcome.previous.is_none());

    let event = tokio::time::timeout(Duration::from_secs(2), subscriber.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "occupancy");
    assert_eq!(
        event.payload.value,
        EventValue::Array(vec![0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0])
    );

    let response = router
        .oneshot(
            Request::delete("/assignments/4")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let outcome: AssignmentOutcome = json_body(response).await;
    assert_eq!(outcome.previous.as_deref(), Some("PO-1204"));
    assert!(outcome.order.is_none());
}

#[tokio::test]
async fn test_assignment_rejections() {
    let router = create_router(occupancy_monitor());

    let response = router
        .clone()
        .oneshot(assign_request(12, "PO-1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = router.oneshot(assign_request(0, " ")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    // Occupancy not configured at all
    let (monitor, _plc) = setup();
    let response = create_router(monitor)
        .oneshot(assign_request(0, "PO-1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_event_stream_after_stop_ends() {
    let (monitor, _plc) = setup();
    monitor.engine().start().unwrap();
    monitor.engine().stop().await;

    let response = create_router(monitor.clone())
        .oneshot(Request::get("/clp-data-stream").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(monitor.engine().subscriber_count(), 0);

    let mut body = response.into_body().into_data_stream();
    let next = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .unwrap();
    assert!(next.is_none());
}
