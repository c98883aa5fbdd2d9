//! In-memory controller speaking the same S7 frames as a real device.
//!
//! [`SimulatedPlc`] holds data blocks in memory and answers the requests
//! produced by [`crate::PlcClient`]. It plugs in either directly as a
//! [`TransportFactory`] or behind a TCP listener via [`SimulatedPlc::serve`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::TpktCodec;
use crate::connector::Endpoint;
use crate::error::{PlcError, Result};
use crate::pdu::{self, DEFAULT_PDU_SIZE, READ_OVERHEAD, Request, WRITE_OVERHEAD};
use crate::transport::{Transport, TransportFactory};

#[derive(Debug)]
struct SimState {
    blocks: RwLock<HashMap<u16, Vec<u8>>>,
    offline: AtomicBool,
    pdu_size: AtomicU16,
    connection_attempts: AtomicUsize,
    writes: AtomicUsize,
}

/// Shared handle to a simulated controller. Clones share the same memory.
#[derive(Debug, Clone)]
pub struct SimulatedPlc {
    state: Arc<SimState>,
}

impl Default for SimulatedPlc {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlc {
    /// Online controller with no data blocks.
    pub fn new() -> Self {
        Self {
            state: Arc::new(SimState {
                blocks: RwLock::new(HashMap::new()),
                offline: AtomicBool::new(false),
                pdu_size: AtomicU16::new(DEFAULT_PDU_SIZE),
                connection_attempts: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    /// Builder form of [`set_block`](Self::set_block).
    pub fn with_block(self, db: u16, data: Vec<u8>) -> Self {
        self.set_block(db, data);
        self
    }

    /// Replace the contents of data block `db`.
    pub fn set_block(&self, db: u16, data: Vec<u8>) {
        self.state.blocks.write().insert(db, data);
    }

    /// Copy of data block `db`.
    pub fn block(&self, db: u16) -> Option<Vec<u8>> {
        self.state.blocks.read().get(&db).cloned()
    }

    /// Overwrite bytes of an existing block. Returns false when out of range.
    pub fn poke(&self, db: u16, offset: usize, data: &[u8]) -> bool {
        let mut blocks = self.state.blocks.write();
        let Some(block) = blocks.get_mut(&db) else {
            return false;
        };
        match block.get_mut(offset..offset + data.len()) {
            Some(target) => {
                target.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Refuse new connections and break open sessions.
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.state.offline.load(Ordering::SeqCst)
    }

    /// Largest PDU granted during setup.
    pub fn set_pdu_size(&self, size: u16) {
        self.state.pdu_size.store(size, Ordering::SeqCst);
    }

    /// Number of session opens attempted, successful or not.
    pub fn connection_attempts(&self) -> usize {
        self.state.connection_attempts.load(Ordering::SeqCst)
    }

    /// Number of accepted write requests.
    pub fn write_count(&self) -> usize {
        self.state.writes.load(Ordering::SeqCst)
    }

    /// Answer one client frame.
    pub fn respond(&self, frame: &[u8]) -> Vec<u8> {
        let request = match pdu::decode_request(frame) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Rejecting malformed request");
                return pdu::error_response(0, 0x81, 0x04);
            }
        };

        let max_pdu = self.state.pdu_size.load(Ordering::SeqCst);
        match request {
            Request::Connect { .. } => pdu::connection_confirm(),
            Request::Setup { pdu_ref, pdu_size } => {
                pdu::setup_response(pdu_ref, pdu_size.min(max_pdu))
            }
            Request::Read {
                pdu_ref,
                db,
                offset,
                length,
            } => {
                if length as usize > (max_pdu as usize).saturating_sub(READ_OVERHEAD) {
                    return pdu::error_response(pdu_ref, 0x85, 0x00);
                }
                let blocks = self.state.blocks.read();
                let result = range_in(&blocks, db, offset as usize, length as usize)
                    .map(|range| &blocks[&db][range]);
                pdu::read_response(pdu_ref, result)
            }
            Request::Write {
                pdu_ref,
                db,
                offset,
                data,
            } => {
                if data.len() > (max_pdu as usize).saturating_sub(WRITE_OVERHEAD) {
                    return pdu::error_response(pdu_ref, 0x85, 0x00);
                }
                let mut blocks = self.state.blocks.write();
                let code = match range_in(&blocks, db, offset as usize, data.len()) {
                    Ok(range) => {
                        if let Some(block) = blocks.get_mut(&db) {
                            block[range].copy_from_slice(&data);
                        }
                        self.state.writes.fetch_add(1, Ordering::SeqCst);
                        pdu::RC_SUCCESS
                    }
                    Err(code) => code,
                };
                pdu::write_response(pdu_ref, code)
            }
        }
    }

    /// Accept ISO-on-TCP connections on `listener` until the task is dropped.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "Simulated controller listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            self.state.connection_attempts.fetch_add(1, Ordering::SeqCst);
            if self.is_offline() {
                debug!(%peer, "Offline, dropping connection");
                continue;
            }
            let plc = self.clone();
            tokio::spawn(async move {
                if let Err(e) = plc.handle_stream(stream).await {
                    debug!(%peer, error = %e, "Simulated session ended");
                }
            });
        }
    }

    async fn handle_stream(&self, stream: TcpStream) -> Result<()> {
        let mut framed = Framed::new(stream, TpktCodec::new());
        while let Some(frame) = framed.next().await {
            let frame = frame?;

            if self.is_offline() {
                return Err(PlcError::connection("controller went offline"));
            }

            let response = self.respond(&frame);
            framed.send(response.as_slice()).await?;
        }
        Ok(())
    }
}

/// Byte range of a block access, or the item return code rejecting it.
fn range_in(
    blocks: &HashMap<u16, Vec<u8>>,
    db: u16,
    offset: usize,
    len: usize,
) -> std::result::Result<std::ops::Range<usize>, u8> {
    let block = blocks.get(&db).ok_or(pdu::RC_NO_OBJECT)?;
    let end = offset.checked_add(len).ok_or(pdu::RC_OUT_OF_RANGE)?;
    if end > block.len() {
        return Err(pdu::RC_OUT_OF_RANGE);
    }
    Ok(offset..end)
}

impl TransportFactory for SimulatedPlc {
    fn create(&self, endpoint: &Endpoint) -> Box<dyn Transport> {
        Box::new(SimTransport {
            plc: self.clone(),
            endpoint: endpoint.clone(),
            open: false,
        })
    }
}

/// In-process transport bound to a [`SimulatedPlc`].
struct SimTransport {
    plc: SimulatedPlc,
    endpoint: Endpoint,
    open: bool,
}

#[async_trait]
impl Transport for SimTransport {
    async fn open(&mut self) -> Result<()> {
        self.plc
            .state
            .connection_attempts
            .fetch_add(1, Ordering::SeqCst);
        if self.plc.is_offline() {
            warn!(endpoint = %self.endpoint, "Simulated controller offline");
            return Err(PlcError::connection(format!(
                "connect to {}: connection refused",
                self.endpoint
            )));
        }
        self.open = true;
        Ok(())
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        if !self.open {
            return Err(PlcError::connection("transport not open"));
        }
        if self.plc.is_offline() {
            self.open = false;
            return Err(PlcError::connection(format!(
                "connection to {} reset",
                self.endpoint
            )));
        }
        Ok(self.plc.respond(request))
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_missing_block() {
        let plc = SimulatedPlc::new();
        let response = plc.respond(&pdu::read_request(1, 9, 0, 4).unwrap());
        let err = pdu::parse_read_response(&response, 4).unwrap_err();
        assert!(err.to_string().contains("object does not exist"));
    }

    #[test]
    fn test_write_updates_memory() {
        let plc = SimulatedPlc::new().with_block(9, vec![0; 8]);
        let response = plc.respond(&pdu::write_request(1, 9, 2, &[7, 8]).unwrap());
        assert!(pdu::parse_write_response(&response).is_ok());
        assert_eq!(plc.block(9).unwrap(), vec![0, 0, 7, 8, 0, 0, 0, 0]);
        assert_eq!(plc.write_count(), 1);
    }

    #[test]
    fn test_write_out_of_range_leaves_memory() {
        let plc = SimulatedPlc::new().with_block(9, vec![0; 4]);
        let response = plc.respond(&pdu::write_request(1, 9, 3, &[1, 2]).unwrap());
        assert!(pdu::parse_write_response(&response).is_err());
        assert_eq!(plc.block(9).unwrap(), vec![0; 4]);
        assert_eq!(plc.write_count(), 0);
    }

    #[test]
    fn test_setup_grants_smaller_pdu() {
        let plc = SimulatedPlc::new();
        plc.set_pdu_size(240);
        let response = plc.respond(&pdu::setup_request(1, DEFAULT_PDU_SIZE));
        assert_eq!(pdu::parse_setup_response(&response).unwrap(), 240);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let plc = SimulatedPlc::new().with_block(1, vec![0; 1000]);
        plc.set_pdu_size(240);
        let response = plc.respond(&pdu::read_request(1, 1, 0, 500).unwrap());
        assert!(pdu::parse_read_response(&response, 500).is_err());
    }

    #[test]
    fn test_poke() {
        let plc = SimulatedPlc::new().with_block(9, vec![0; 4]);
        assert!(plc.poke(9, 1, &[5, 6]));
        assert!(!plc.poke(9, 3, &[1, 2]));
        assert!(!plc.poke(8, 0, &[1]));
        assert_eq!(plc.block(9).unwrap(), vec![0, 5, 6, 0]);
    }

    #[tokio::test]
    async fn test_offline_counts_attempts() {
        let plc = SimulatedPlc::new();
        plc.set_offline(true);
        let mut transport = plc.create(&Endpoint::new("sim", 102));

        assert!(transport.open().await.is_err());
        assert_eq!(plc.connection_attempts(), 1);
    }
}
