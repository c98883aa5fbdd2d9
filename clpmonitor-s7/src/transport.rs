//! Byte transports carrying S7 frames.

use std::fmt;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::trace;

use crate::codec::TpktCodec;
use crate::connector::Endpoint;
use crate::error::{PlcError, Result};

/// A request/response channel to one controller.
///
/// Frames passed in and out are COTP + S7 bytes; any outer framing is the
/// transport's business.
#[async_trait]
pub trait Transport: Send {
    /// Open the underlying channel.
    async fn open(&mut self) -> Result<()>;

    /// Send one frame and wait for its response.
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>>;

    /// Close the channel. Safe to call when not open.
    async fn close(&mut self);
}

/// Creates a fresh, unopened transport per session.
pub trait TransportFactory: Send + Sync + fmt::Debug {
    fn create(&self, endpoint: &Endpoint) -> Box<dyn Transport>;
}

/// Factory for [`TcpTransport`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpFactory;

impl TransportFactory for TcpFactory {
    fn create(&self, endpoint: &Endpoint) -> Box<dyn Transport> {
        Box::new(TcpTransport::new(endpoint.clone()))
    }
}

/// ISO-on-TCP transport: TPKT framing over a TCP stream.
///
/// Every connect, send and receive is bounded by the endpoint timeout.
pub struct TcpTransport {
    endpoint: Endpoint,
    framed: Option<Framed<TcpStream, TpktCodec>>,
}

impl TcpTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            framed: None,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<()> {
        if self.framed.is_some() {
            return Err(PlcError::connection("transport already open"));
        }
        let addr = (self.endpoint.host.as_str(), self.endpoint.port);
        let stream = tokio::time::timeout(self.endpoint.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                PlcError::connection(format!("connect to {} timed out", self.endpoint))
            })?
            .map_err(|e| PlcError::connection(format!("connect to {}: {}", self.endpoint, e)))?;
        stream.set_nodelay(true)?;
        self.framed = Some(Framed::new(stream, TpktCodec::new()));
        Ok(())
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let timeout = self.endpoint.timeout;
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| PlcError::connection("transport not open"))?;

        tokio::time::timeout(timeout, framed.send(request))
            .await
            .map_err(|_| PlcError::connection("send timed out"))??;
        let response = tokio::time::timeout(timeout, framed.next())
            .await
            .map_err(|_| PlcError::connection("receive timed out"))?
            .ok_or_else(|| PlcError::connection("connection closed by controller"))??;

        trace!(
            sent = request.len(),
            received = response.len(),
            "S7 exchange"
        );
        Ok(response)
    }

    async fn close(&mut self) {
        if let Some(framed) = self.framed.take() {
            let _ = framed.into_inner().shutdown().await;
        }
    }
}
