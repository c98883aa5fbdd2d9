//! TPKT framing (RFC 1006) for ISO-on-TCP streams.
//!
//! ```text
//! +------+------+-------------+------------------+
//! | 0x03 | 0x00 | length (BE) | COTP + S7 frame  |
//! +------+------+-------------+------------------+
//! ```
//!
//! The length covers the 4-byte header itself.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{PlcError, Result};
use crate::pdu::{TPKT_HEADER_LEN, tpkt_header, tpkt_payload_len};

/// Codec turning a byte stream into COTP + S7 frames and back.
#[derive(Debug, Default)]
pub struct TpktCodec {
    payload_len: Option<usize>,
}

impl TpktCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for TpktCodec {
    type Item = Vec<u8>;
    type Error = PlcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if self.payload_len.is_none() {
            if src.len() < TPKT_HEADER_LEN {
                return Ok(None);
            }

            let mut header = [0u8; TPKT_HEADER_LEN];
            header.copy_from_slice(&src[..TPKT_HEADER_LEN]);
            // Rejects bad versions and lengths above MAX_FRAME_LEN
            let len = tpkt_payload_len(&header)?;
            src.advance(TPKT_HEADER_LEN);
            self.payload_len = Some(len);
        }

        let Some(len) = self.payload_len else {
            return Ok(None);
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.payload_len = None;
        Ok(Some(src.split_to(len).to_vec()))
    }
}

impl<'a> Encoder<&'a [u8]> for TpktCodec {
    type Error = PlcError;

    fn encode(&mut self, frame: &'a [u8], dst: &mut BytesMut) -> Result<()> {
        let header = tpkt_header(frame.len())?;
        dst.reserve(TPKT_HEADER_LEN + frame.len());
        dst.put_slice(&header);
        dst.put_slice(frame);
        Ok(())
    }
}
