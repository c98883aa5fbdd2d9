//! Tag write requests.

use std::sync::Arc;

use clpmonitor_engine::jobs::{EndpointSettings, PlcDefaults};
use clpmonitor_s7::{
    Connector, DEFAULT_PORT, ErrorKind, PlcError, TagDescriptor, TagWrite, TransportFactory,
};
use serde::{Deserialize, Serialize};

/// A write as submitted by a client. `value` is always text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rack: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u8>,
    pub tag: TagDescriptor,
    pub value: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl WriteRequest {
    pub fn new(host: impl Into<String>, tag: TagDescriptor, value: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            rack: None,
            slot: None,
            tag,
            value: value.into(),
        }
    }

    pub fn endpoint(&self) -> EndpointSettings {
        EndpointSettings {
            host: self.host.clone(),
            port: self.port,
            rack: self.rack,
            slot: self.slot,
            timeout_ms: None,
        }
    }

    /// Resolve the tag and parse the value. No network access.
    pub fn prepare(&self) -> clpmonitor_s7::Result<TagWrite> {
        if self.host.trim().is_empty() {
            return Err(PlcError::validation("host is required"));
        }
        TagWrite::prepare(&self.tag, &self.value)
    }
}

/// Reply to a write request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub success: bool,
    pub message: String,
    /// Error category on failure (`connection`, `validation`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// The operation, e.g. `DB9.68 (BYTE) = 3`, once the request resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WriteOutcome {
    pub fn written(write: &TagWrite) -> Self {
        Self {
            success: true,
            message: "Tag written".to_string(),
            kind: None,
            detail: Some(write.describe()),
        }
    }

    pub fn failed(failure: &WriteFailure) -> Self {
        Self {
            success: false,
            message: failure.error.to_string(),
            kind: Some(failure.error.kind().as_str().to_string()),
            detail: failure.write.as_ref().map(TagWrite::describe),
        }
    }
}

/// A rejected or failed write. `write` is set when the request resolved.
#[derive(Debug, Clone)]
pub struct WriteFailure {
    pub error: PlcError,
    pub write: Option<TagWrite>,
}

impl WriteFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Executes write requests, each on its own session.
#[derive(Debug, Clone)]
pub struct TagWriter {
    defaults: PlcDefaults,
    factory: Arc<dyn TransportFactory>,
}

impl TagWriter {
    pub fn new(defaults: PlcDefaults, factory: Arc<dyn TransportFactory>) -> Self {
        Self { defaults, factory }
    }

    /// Connector for the controller named in `request`.
    pub fn connector(&self, request: &WriteRequest) -> Connector {
        request
            .endpoint()
            .connector(&self.defaults, self.factory.clone())
    }

    /// Validate `request`, then write it. Invalid requests never connect.
    pub async fn write(&self, request: &WriteRequest) -> Result<TagWrite, WriteFailure> {
        let write = request
            .prepare()
            .map_err(|error| WriteFailure { error, write: None })?;

        match write.execute(&self.connector(request)).await {
            Ok(()) => Ok(write),
            Err(error) => Err(WriteFailure {
                error,
                write: Some(write),
            }),
        }
    }
}
