//! Protocol client: one exclusive session to one controller.

use tracing::debug;

use crate::connector::Endpoint;
use crate::error::{PlcError, Result};
use crate::pdu::{self, DEFAULT_PDU_SIZE, READ_OVERHEAD, WRITE_OVERHEAD};
use crate::tag::{self, TagAddress, TagKind, TagValue};
use crate::transport::Transport;

/// Client performing raw and typed data block I/O.
///
/// The client never retries and never reconnects on its own; a failed
/// exchange closes the session and the error is returned to the caller.
///
/// Bit writes are a read-modify-write of the whole byte and are not atomic
/// against another writer touching the same byte.
pub struct PlcClient {
    endpoint: Endpoint,
    transport: Box<dyn Transport>,
    connected: bool,
    pdu_size: u16,
    pdu_ref: u16,
}

impl std::fmt::Debug for PlcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlcClient")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.connected)
            .field("pdu_size", &self.pdu_size)
            .field("pdu_ref", &self.pdu_ref)
            .finish_non_exhaustive()
    }
}

impl PlcClient {
    /// Create an unconnected client over `transport`.
    pub fn new(endpoint: Endpoint, transport: Box<dyn Transport>) -> Self {
        Self {
            endpoint,
            transport,
            connected: false,
            pdu_size: DEFAULT_PDU_SIZE,
            pdu_ref: 0,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// PDU length negotiated with the controller.
    pub fn pdu_size(&self) -> u16 {
        self.pdu_size
    }

    /// Largest data payload a single write can carry on this session.
    pub fn max_write_len(&self) -> usize {
        (self.pdu_size as usize).saturating_sub(WRITE_OVERHEAD)
    }

    /// Open the transport and perform the COTP and S7 handshakes.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Err(PlcError::connection(format!(
                "already connected to {}",
                self.endpoint
            )));
        }

        self.transport.open().await?;
        match self.handshake().await {
            Ok(pdu_size) => {
                self.pdu_size = pdu_size;
                self.connected = true;
                debug!(endpoint = %self.endpoint, pdu_size, "Connected to controller");
                Ok(())
            }
            Err(e) => {
                self.transport.close().await;
                Err(match e {
                    PlcError::Protocol(msg) => {
                        PlcError::connection(format!("handshake failed: {}", msg))
                    }
                    other => other,
                })
            }
        }
    }

    /// Close the session. No-op when not connected.
    pub async fn disconnect(&mut self) {
        if self.connected {
            self.transport.close().await;
            self.connected = false;
            debug!(endpoint = %self.endpoint, "Disconnected from controller");
        }
    }

    async fn handshake(&mut self) -> Result<u16> {
        let confirm = self
            .transport
            .exchange(&pdu::connection_request(
                self.endpoint.rack,
                self.endpoint.slot,
            ))
            .await?;
        pdu::check_connection_confirm(&confirm)?;

        let pdu_ref = self.next_ref();
        let response = self
            .transport
            .exchange(&pdu::setup_request(pdu_ref, DEFAULT_PDU_SIZE))
            .await?;
        pdu::parse_setup_response(&response)
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1).max(1);
        self.pdu_ref
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        if !self.connected {
            return Err(PlcError::connection(format!(
                "not connected to {}",
                self.endpoint
            )));
        }
        match self.transport.exchange(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // The stream position is unknown after a failed exchange.
                if matches!(e, PlcError::Connection(_)) {
                    self.disconnect().await;
                }
                Err(e)
            }
        }
    }

    /// Read exactly `length` bytes from `db` starting at `offset`.
    ///
    /// Ranges larger than one PDU are split into several requests. The
    /// returned buffer is freshly allocated for every call.
    pub async fn read_block(&mut self, db: u16, offset: u32, length: usize) -> Result<Vec<u8>> {
        let chunk = (self.pdu_size as usize).saturating_sub(READ_OVERHEAD).max(1);
        let mut out = Vec::with_capacity(length);

        while out.len() < length {
            let pos = out.len();
            let count = chunk.min(length - pos);
            let start = chunk_offset(offset, pos)?;
            let pdu_ref = self.next_ref();
            let request = pdu::read_request(pdu_ref, db, start, count as u16)?;
            let response = self.exchange(&request).await?;
            out.extend(pdu::parse_read_response(&response, count)?);
        }

        debug!(endpoint = %self.endpoint, db, offset, length, "Read block");
        Ok(out)
    }

    /// Write `data` verbatim into `db` starting at `offset`.
    ///
    /// The write travels in a single PDU so the controller applies all of
    /// it or none of it. Data larger than the negotiated payload is refused
    /// before anything is sent.
    pub async fn write_block(&mut self, db: u16, offset: u32, data: &[u8]) -> Result<()> {
        let max = self.max_write_len();
        if data.len() > max {
            return Err(PlcError::address(format!(
                "write of {} bytes exceeds the {}-byte PDU payload",
                data.len(),
                max
            )));
        }

        let pdu_ref = self.next_ref();
        let request = pdu::write_request(pdu_ref, db, offset, data)?;
        let response = self.exchange(&request).await?;
        pdu::parse_write_response(&response)?;

        debug!(endpoint = %self.endpoint, db, offset, length = data.len(), "Wrote block");
        Ok(())
    }

    pub async fn read_int32(&mut self, db: u16, offset: u32) -> Result<i32> {
        let bytes = self.read_block(db, offset, 4).await?;
        Ok(i32::from_be_bytes(quad(&bytes)?))
    }

    pub async fn write_int32(&mut self, db: u16, offset: u32, value: i32) -> Result<()> {
        self.write_block(db, offset, &value.to_be_bytes()).await
    }

    pub async fn read_float32(&mut self, db: u16, offset: u32) -> Result<f32> {
        let bytes = self.read_block(db, offset, 4).await?;
        Ok(f32::from_be_bytes(quad(&bytes)?))
    }

    pub async fn write_float32(&mut self, db: u16, offset: u32, value: f32) -> Result<()> {
        self.write_block(db, offset, &value.to_be_bytes()).await
    }

    pub async fn read_byte(&mut self, db: u16, offset: u32) -> Result<u8> {
        let bytes = self.read_block(db, offset, 1).await?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| PlcError::protocol("empty byte read"))
    }

    pub async fn write_byte(&mut self, db: u16, offset: u32, value: u8) -> Result<()> {
        self.write_block(db, offset, &[value]).await
    }

    pub async fn read_bit(&mut self, db: u16, offset: u32, index: u8) -> Result<bool> {
        check_bit_index(index)?;
        let byte = self.read_byte(db, offset).await?;
        Ok(tag::bit_of(byte, index))
    }

    /// Read-modify-write of one bit; the other seven bits are written back unchanged.
    pub async fn write_bit(&mut self, db: u16, offset: u32, index: u8, value: bool) -> Result<()> {
        check_bit_index(index)?;
        let current = self.read_byte(db, offset).await?;
        let updated = tag::apply_bit(current, index, value);
        self.write_byte(db, offset, updated).await
    }

    /// Read a string laid out as `[capacity][length][characters]`.
    pub async fn read_string(&mut self, db: u16, offset: u32, capacity: u8) -> Result<String> {
        let address = TagAddress::string(db, offset, capacity)?;
        match self.read_tag(&address).await? {
            TagValue::String(text) => Ok(text),
            other => Err(PlcError::protocol(format!("unexpected value {}", other))),
        }
    }

    /// Write `text` zero padded to `capacity`.
    pub async fn write_string(
        &mut self,
        db: u16,
        offset: u32,
        capacity: u8,
        text: &str,
    ) -> Result<()> {
        let address = TagAddress::string(db, offset, capacity)?;
        self.write_tag(&address, &TagValue::String(text.to_string()))
            .await
    }

    /// Read the value at `address`.
    pub async fn read_tag(&mut self, address: &TagAddress) -> Result<TagValue> {
        match address.kind() {
            TagKind::Bit { index } => self
                .read_bit(address.db(), address.offset(), index)
                .await
                .map(TagValue::Bit),
            kind => {
                let bytes = self
                    .read_block(address.db(), address.offset(), kind.byte_len())
                    .await?;
                tag::decode(kind, &bytes)
            }
        }
    }

    /// Write `value` at `address`.
    pub async fn write_tag(&mut self, address: &TagAddress, value: &TagValue) -> Result<()> {
        match (address.kind(), value) {
            (TagKind::Bit { index }, TagValue::Bit(bit)) => {
                self.write_bit(address.db(), address.offset(), index, *bit)
                    .await
            }
            (kind, value) => {
                let bytes = tag::encode(kind, value)?;
                self.write_block(address.db(), address.offset(), &bytes)
                    .await
            }
        }
    }
}

fn chunk_offset(offset: u32, pos: usize) -> Result<u32> {
    u32::try_from(pos)
        .ok()
        .and_then(|pos| offset.checked_add(pos))
        .ok_or_else(|| PlcError::address(format!("offset {} + {} overflows", offset, pos)))
}

fn check_bit_index(index: u8) -> Result<()> {
    if index > 7 {
        return Err(PlcError::address(format!(
            "bit index {} outside 0..=7",
            index
        )));
    }
    Ok(())
}

fn quad(bytes: &[u8]) -> Result<[u8; 4]> {
    bytes
        .try_into()
        .map_err(|_| PlcError::protocol(format!("expected 4 bytes, got {}", bytes.len())))
}
