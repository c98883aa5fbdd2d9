//! Generic metrics: independent scalar channels, one event each.

use std::time::Duration;

use async_trait::async_trait;
use clpmonitor_common::BroadcastEvent;
use clpmonitor_s7::{Connector, TagAddress, TagDescriptor};
use serde::{Deserialize, Serialize};

use super::EndpointSettings;
use crate::error::{EngineError, JobError};
use crate::job::PollJob;

/// One scalar channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricChannel {
    pub event: String,
    pub id: i32,
    #[serde(flatten)]
    pub tag: TagDescriptor,
}

impl MetricChannel {
    pub fn new(event: impl Into<String>, id: i32, tag: TagDescriptor) -> Self {
        Self {
            event: event.into(),
            id,
            tag,
        }
    }
}

/// Settings for [`GenericMetricsJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericMetricsSettings {
    #[serde(default = "default_name")]
    pub name: String,
    pub endpoint: EndpointSettings,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_channels")]
    pub channels: Vec<MetricChannel>,
}

fn default_name() -> String {
    "generic-metrics".to_string()
}

fn default_interval_ms() -> u64 {
    3000
}

/// Channels 2 to 4 as 32-bit integers at the start of DB 10.
fn default_channels() -> Vec<MetricChannel> {
    (0..3)
        .map(|i| {
            MetricChannel::new(
                format!("clp{}-data", i + 2),
                i + 2,
                TagDescriptor::new(10, i as u32 * 4, "integer"),
            )
        })
        .collect()
}

impl GenericMetricsSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            endpoint: EndpointSettings::new(host),
            interval_ms: default_interval_ms(),
            channels: default_channels(),
        }
    }
}

/// Reads every channel over one session and emits one scalar event per channel.
///
/// A failure on any channel fails the whole run; the fallback is 0 on every
/// channel.
#[derive(Debug)]
pub struct GenericMetricsJob {
    name: String,
    interval: Duration,
    channels: Vec<(MetricChannel, TagAddress)>,
    connector: Connector,
}

impl GenericMetricsJob {
    /// Resolve every channel's tag; numeric kinds only.
    pub fn new(settings: GenericMetricsSettings, connector: Connector) -> Result<Self, EngineError> {
        if settings.channels.is_empty() {
            return Err(EngineError::config(format!(
                "job '{}' has no channels",
                settings.name
            )));
        }

        let channels = settings
            .channels
            .into_iter()
            .map(|channel| {
                let address = channel.tag.resolve()?;
                if matches!(
                    address.kind(),
                    clpmonitor_s7::TagKind::String { .. } | clpmonitor_s7::TagKind::Block { .. }
                ) {
                    return Err(EngineError::config(format!(
                        "channel '{}' must be numeric, got {}",
                        channel.event,
                        address.kind().name()
                    )));
                }
                Ok((channel, address))
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        Ok(Self {
            name: settings.name,
            interval: Duration::from_millis(settings.interval_ms),
            channels,
            connector,
        })
    }
}

#[async_trait]
impl PollJob for GenericMetricsJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn produce(&self) -> Result<Vec<BroadcastEvent>, JobError> {
        let mut client = self.connector.connect().await?;
        let mut events = Vec::with_capacity(self.channels.len());
        let mut failure = None;

        for (channel, address) in &self.channels {
            match client.read_tag(address).await {
                Ok(value) => match value.as_i64() {
                    Some(n) => events.push(BroadcastEvent::scalar(&channel.event, channel.id, n)),
                    None => {
                        failure = Some(JobError::value(format!(
                            "{} is not numeric",
                            address
                        )));
                        break;
                    }
                },
                Err(e) => {
                    failure = Some(e.into());
                    break;
                }
            }
        }
        client.disconnect().await;

        match failure {
            Some(error) => Err(error),
            None => Ok(events),
        }
    }

    fn fallback(&self) -> Vec<BroadcastEvent> {
        self.channels
            .iter()
            .map(|(channel, _)| BroadcastEvent::scalar(&channel.event, channel.id, 0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::PlcDefaults;
    use clpmonitor_common::EventValue;
    use clpmonitor_s7::SimulatedPlc;
    use std::sync::Arc;

    fn job(plc: &SimulatedPlc, settings: GenericMetricsSettings) -> GenericMetricsJob {
        let connector = settings
            .endpoint
            .connector(&PlcDefaults::default(), Arc::new(plc.clone()));
        GenericMetricsJob::new(settings, connector).unwrap()
    }

    #[tokio::test]
    async fn test_reads_every_channel() {
        let mut block = vec![0u8; 12];
        block[0..4].copy_from_slice(&17i32.to_be_bytes());
        block[4..8].copy_from_slice(&42i32.to_be_bytes());
        block[8..12].copy_from_slice(&(-5i32).to_be_bytes());
        let plc = SimulatedPlc::new().with_block(10, block);

        let events = job(&plc, GenericMetricsSettings::new("plc"))
            .produce()
            .await
            .unwrap();

        let values: Vec<_> = events
            .iter()
            .map(|e| (e.name.as_str(), e.payload.id, e.payload.value.clone()))
            .collect();
        assert_eq!(
            values,
            vec![
                ("clp2-data", 2, EventValue::Scalar(17)),
                ("clp3-data", 3, EventValue::Scalar(42)),
                ("clp4-data", 4, EventValue::Scalar(-5)),
            ]
        );
    }

    #[tokio::test]
    async fn test_bit_and_byte_channels() {
        let plc = SimulatedPlc::new().with_block(3, vec![0b0000_0100, 200]);
        let mut settings = GenericMetricsSettings::new("plc");
        settings.channels = vec![
            MetricChannel::new("running", 7, TagDescriptor::new(3, 0, "bit").with_bit(2)),
            MetricChannel::new("speed", 8, TagDescriptor::new(3, 1, "byte")),
        ];

        let events = job(&plc, settings).produce().await.unwrap();
        assert_eq!(events[0].payload.value, EventValue::Scalar(1));
        assert_eq!(events[1].payload.value, EventValue::Scalar(200));
    }

    #[tokio::test]
    async fn test_missing_block_fails_run() {
        let plc = SimulatedPlc::new();
        let job = job(&plc, GenericMetricsSettings::new("plc"));

        assert!(job.produce().await.is_err());
        let fallback = job.fallback();
        assert_eq!(fallback.len(), 3);
        assert!(
            fallback
                .iter()
                .all(|e| e.payload.value == EventValue::Scalar(0))
        );
    }

    #[test]
    fn test_rejects_non_numeric_channel() {
        let mut settings = GenericMetricsSettings::new("plc");
        settings.channels = vec![MetricChannel::new(
            "label",
            9,
            TagDescriptor::new(3, 0, "string").with_size(8),
        )];
        let connector = settings
            .endpoint
            .connector(&PlcDefaults::default(), Arc::new(SimulatedPlc::new()));

        assert!(GenericMetricsJob::new(settings, connector).is_err());
    }

    #[test]
    fn test_channel_json() {
        let channel: MetricChannel = serde_json::from_str(
            r#"{"event": "clp2-data", "id": 2, "db": 10, "offset": 0, "type": "INTEGER"}"#,
        )
        .unwrap();
        assert_eq!(channel.tag, TagDescriptor::new(10, 0, "INTEGER"));
    }
}
