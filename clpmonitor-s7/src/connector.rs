//! Controller endpoints and the per-operation session factory.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::client::PlcClient;
use crate::error::Result;
use crate::transport::{TcpFactory, TransportFactory};

/// Default ISO-on-TCP port.
pub const DEFAULT_PORT: u16 = 102;

/// Default bound on connect, send and receive.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Network location of one controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    pub timeout: Duration,
}

impl Endpoint {
    /// Create an endpoint with rack 0, slot 1 and the default timeout.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            rack: 0,
            slot: 1,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_rack_slot(mut self, rack: u8, slot: u8) -> Self {
        self.rack = rack;
        self.slot = slot;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether both endpoints name the same controller.
    pub fn same_device(&self, other: &Endpoint) -> bool {
        self.host.eq_ignore_ascii_case(&other.host) && self.port == other.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Builds protocol clients for one endpoint.
///
/// Clients are never shared: every logical operation asks for its own
/// session and closes it when done.
#[derive(Debug, Clone)]
pub struct Connector {
    endpoint: Endpoint,
    factory: Arc<dyn TransportFactory>,
}

impl Connector {
    /// Connector using TCP transports.
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_factory(endpoint, Arc::new(TcpFactory))
    }

    /// Connector using a custom transport factory.
    pub fn with_factory(endpoint: Endpoint, factory: Arc<dyn TransportFactory>) -> Self {
        Self { endpoint, factory }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// A new, unconnected client.
    pub fn client(&self) -> PlcClient {
        PlcClient::new(self.endpoint.clone(), self.factory.create(&self.endpoint))
    }

    /// A new client with its session already established.
    pub async fn connect(&self) -> Result<PlcClient> {
        let mut client = self.client();
        client.connect().await?;
        Ok(client)
    }
}
