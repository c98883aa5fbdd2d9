//! Integration tests for clpmonitor-common library.

use clpmonitor_common::{
    BroadcastEvent, EventPayload, EventValue, LogFormat, LoggingConfig, parse_config,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    #[serde(default)]
    logging: LoggingConfig,
    channels: Vec<String>,
}

#[test]
fn test_service_config_with_logging_section() {
    let json5 = r#"
    {
        // comments and trailing commas are accepted
        logging: { level: "trace", format: "json", },
        channels: ["stock-levels", "occupancy",],
    }
    "#;

    let config: ServiceConfig = parse_config(json5).expect("parse failed");
    assert_eq!(config.logging.level, "trace");
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.channels, vec!["stock-levels", "occupancy"]);
}

#[test]
fn test_event_payload_roundtrip_through_json() {
    let event = BroadcastEvent::array("occupancy", 4, vec![1, 0, 0, 1]);

    let json = serde_json::to_vec(&event).expect("encode failed");
    let decoded: BroadcastEvent = serde_json::from_slice(&json).expect("decode failed");

    assert_eq!(decoded.name, "occupancy");
    assert_eq!(
        decoded.payload,
        EventPayload::new(4, EventValue::Array(vec![1, 0, 0, 1]))
    );
}
