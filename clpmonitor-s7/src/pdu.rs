//! S7 PDU encoding and decoding over ISO-on-TCP.
//!
//! Frames exchanged with the controller are
//!
//! ```text
//! TPKT  [0x03][0x00][len:2]            (added by TpktCodec)
//! COTP  CR/CC during the handshake, DT [0x02][0xF0][0x80] afterwards
//! S7    [0x32][rosctr][0x0000][pdu_ref:2][param_len:2][data_len:2]([err_class][err_code])
//! ```
//!
//! Only data block access (area `0x84`) with transport size BYTE is used.
//! The request side is used by [`crate::PlcClient`]; the response side by
//! [`crate::SimulatedPlc`].

use crate::error::{PlcError, Result};

/// TPKT header length.
pub const TPKT_HEADER_LEN: usize = 4;

/// Largest frame accepted from the wire.
pub const MAX_FRAME_LEN: usize = 4096;

/// PDU length proposed during setup.
pub const DEFAULT_PDU_SIZE: u16 = 480;

/// Highest byte offset representable in the 3-byte bit address.
pub const MAX_BYTE_OFFSET: u32 = 0x00FF_FFFF >> 3;

/// Bytes of read payload that fit in one PDU besides headers.
pub const READ_OVERHEAD: usize = 18;

/// Bytes of write payload that fit in one PDU besides headers.
pub const WRITE_OVERHEAD: usize = 28;

const TPKT_VERSION: u8 = 0x03;
const COTP_CR: u8 = 0xE0;
const COTP_CC: u8 = 0xD0;
const COTP_DT: [u8; 3] = [0x02, 0xF0, 0x80];
const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK: u8 = 0x02;
const ROSCTR_ACK_DATA: u8 = 0x03;
const FUNC_SETUP: u8 = 0xF0;
const FUNC_READ: u8 = 0x04;
const FUNC_WRITE: u8 = 0x05;
const AREA_DB: u8 = 0x84;
const TS_BYTE: u8 = 0x02;
const DATA_TS_BIT: u8 = 0x03;
const DATA_TS_BYTE: u8 = 0x04;
const DATA_TS_OCTET: u8 = 0x09;
const JOB_HEADER_LEN: usize = 10;
const ACK_HEADER_LEN: usize = 12;
const ITEM_LEN: usize = 12;

/// Item return code for success.
pub const RC_SUCCESS: u8 = 0xFF;
/// Item return code for an address beyond the end of the block.
pub const RC_OUT_OF_RANGE: u8 = 0x05;
/// Item return code for a block that does not exist.
pub const RC_NO_OBJECT: u8 = 0x0A;

/// Build the TPKT header for a payload of `payload_len` bytes.
pub fn tpkt_header(payload_len: usize) -> Result<[u8; TPKT_HEADER_LEN]> {
    let total = payload_len
        .checked_add(TPKT_HEADER_LEN)
        .filter(|total| *total <= MAX_FRAME_LEN)
        .and_then(|total| u16::try_from(total).ok())
        .ok_or_else(|| {
            PlcError::protocol(format!("frame payload of {} bytes too large", payload_len))
        })?;
    let [hi, lo] = total.to_be_bytes();
    Ok([TPKT_VERSION, 0x00, hi, lo])
}

/// Payload length announced by a TPKT header.
pub fn tpkt_payload_len(header: &[u8; TPKT_HEADER_LEN]) -> Result<usize> {
    if header[0] != TPKT_VERSION {
        return Err(PlcError::protocol(format!(
            "unexpected TPKT version 0x{:02X}",
            header[0]
        )));
    }
    let total = u16::from_be_bytes([header[2], header[3]]) as usize;
    if total < TPKT_HEADER_LEN + 3 || total > MAX_FRAME_LEN {
        return Err(PlcError::protocol(format!("invalid TPKT length {}", total)));
    }
    Ok(total - TPKT_HEADER_LEN)
}

// ---------------------------------------------------------------------------
// Requests (client side)
// ---------------------------------------------------------------------------

/// COTP connection request addressing `rack`/`slot`.
pub fn connection_request(rack: u8, slot: u8) -> Vec<u8> {
    vec![
        0x11, // length of the remaining COTP header
        COTP_CR,
        0x00,
        0x00, // destination reference
        0x00,
        0x01, // source reference
        0x00, // class 0
        0xC0,
        0x01,
        0x0A, // TPDU size 1024
        0xC1,
        0x02,
        0x01,
        0x00, // source TSAP
        0xC2,
        0x02,
        0x01,
        (rack << 5) | (slot & 0x1F), // destination TSAP
    ]
}

/// Check a COTP connection confirm.
pub fn check_connection_confirm(frame: &[u8]) -> Result<()> {
    match frame.get(1) {
        Some(&COTP_CC) => Ok(()),
        Some(other) => Err(PlcError::connection(format!(
            "connection refused by controller (COTP 0x{:02X})",
            other
        ))),
        None => Err(PlcError::connection("empty connection confirm")),
    }
}

/// S7 setup communication proposing `pdu_size`.
pub fn setup_request(pdu_ref: u16, pdu_size: u16) -> Vec<u8> {
    let mut params = vec![FUNC_SETUP, 0x00, 0x00, 0x01, 0x00, 0x01];
    params.extend_from_slice(&pdu_size.to_be_bytes());
    job_frame(pdu_ref, &params, &[])
}

/// Negotiated PDU length from a setup response.
pub fn parse_setup_response(frame: &[u8]) -> Result<u16> {
    let (params, _) = ack_body(frame)?;
    if params.len() < 8 || params[0] != FUNC_SETUP {
        return Err(PlcError::protocol("malformed setup communication response"));
    }
    let size = u16::from_be_bytes([params[6], params[7]]);
    if (READ_OVERHEAD.max(WRITE_OVERHEAD) as u16) >= size {
        return Err(PlcError::protocol(format!(
            "negotiated PDU size {} is too small",
            size
        )));
    }
    Ok(size)
}

/// Read var request for `length` bytes at `db`.`offset`.
pub fn read_request(pdu_ref: u16, db: u16, offset: u32, length: u16) -> Result<Vec<u8>> {
    let mut params = vec![FUNC_READ, 0x01];
    params.extend_from_slice(&item(db, offset, length)?);
    Ok(job_frame(pdu_ref, &params, &[]))
}

/// Payload of a read var response, checked to be exactly `expected` bytes.
pub fn parse_read_response(frame: &[u8], expected: usize) -> Result<Vec<u8>> {
    let (params, data) = ack_body(frame)?;
    if params.first() != Some(&FUNC_READ) {
        return Err(PlcError::protocol("response is not a read var"));
    }
    let Some(&code) = data.first() else {
        return Err(PlcError::protocol("read response carries no data item"));
    };
    if code != RC_SUCCESS {
        return Err(PlcError::protocol(format!(
            "read rejected: {}",
            describe_return_code(code)
        )));
    }
    if data.len() < 4 {
        return Err(PlcError::protocol("truncated read data item"));
    }
    let raw_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let len = match data[1] {
        DATA_TS_BIT | DATA_TS_OCTET => raw_len,
        _ => raw_len / 8,
    };
    let payload = &data[4..];
    if len != expected || payload.len() < len {
        return Err(PlcError::protocol(format!(
            "short read: expected {} bytes, got {}",
            expected,
            len.min(payload.len())
        )));
    }
    Ok(payload[..len].to_vec())
}

/// Write var request storing `data` at `db`.`offset`.
pub fn write_request(pdu_ref: u16, db: u16, offset: u32, data: &[u8]) -> Result<Vec<u8>> {
    let length = u16::try_from(data.len())
        .ok()
        .filter(|len| *len <= u16::MAX / 8)
        .ok_or_else(|| PlcError::address(format!("write of {} bytes too large", data.len())))?;

    let mut params = vec![FUNC_WRITE, 0x01];
    params.extend_from_slice(&item(db, offset, length)?);

    let mut payload = vec![0x00, DATA_TS_BYTE];
    payload.extend_from_slice(&(length * 8).to_be_bytes());
    payload.extend_from_slice(data);

    Ok(job_frame(pdu_ref, &params, &payload))
}

/// Check a write var response.
pub fn parse_write_response(frame: &[u8]) -> Result<()> {
    let (params, data) = ack_body(frame)?;
    if params.first() != Some(&FUNC_WRITE) {
        return Err(PlcError::protocol("response is not a write var"));
    }
    match data.first() {
        Some(&RC_SUCCESS) => Ok(()),
        Some(&code) => Err(PlcError::protocol(format!(
            "write rejected: {}",
            describe_return_code(code)
        ))),
        None => Err(PlcError::protocol("write response carries no data item")),
    }
}

/// Human readable meaning of a data item return code.
pub fn describe_return_code(code: u8) -> String {
    match code {
        0x01 => "hardware fault".to_string(),
        0x03 => "accessing the object not allowed".to_string(),
        RC_OUT_OF_RANGE => "address out of range".to_string(),
        0x06 => "data type not supported".to_string(),
        0x07 => "data type inconsistent".to_string(),
        RC_NO_OBJECT => "object does not exist".to_string(),
        RC_SUCCESS => "success".to_string(),
        other => format!("return code 0x{:02X}", other),
    }
}

fn item(db: u16, offset: u32, length: u16) -> Result<[u8; ITEM_LEN]> {
    if offset > MAX_BYTE_OFFSET {
        return Err(PlcError::address(format!(
            "offset {} exceeds the addressable range (max {})",
            offset, MAX_BYTE_OFFSET
        )));
    }
    let [len_hi, len_lo] = length.to_be_bytes();
    let [db_hi, db_lo] = db.to_be_bytes();
    let bit_address = offset << 3;
    Ok([
        0x12,
        0x0A,
        0x10,
        TS_BYTE,
        len_hi,
        len_lo,
        db_hi,
        db_lo,
        AREA_DB,
        (bit_address >> 16) as u8,
        (bit_address >> 8) as u8,
        bit_address as u8,
    ])
}

fn job_frame(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(COTP_DT.len() + JOB_HEADER_LEN + params.len() + data.len());
    frame.extend_from_slice(&COTP_DT);
    frame.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_JOB, 0x00, 0x00]);
    frame.extend_from_slice(&pdu_ref.to_be_bytes());
    frame.extend_from_slice(&(params.len() as u16).to_be_bytes());
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(params);
    frame.extend_from_slice(data);
    frame
}

/// Split an acknowledgement into its parameter and data sections.
fn ack_body(frame: &[u8]) -> Result<(&[u8], &[u8])> {
    if frame.len() < COTP_DT.len() + ACK_HEADER_LEN || frame[..2] != COTP_DT[..2] {
        return Err(PlcError::protocol(format!(
            "malformed response frame ({} bytes)",
            frame.len()
        )));
    }
    let s7 = &frame[COTP_DT.len()..];
    if s7[0] != S7_PROTOCOL_ID {
        return Err(PlcError::protocol(format!(
            "unexpected protocol id 0x{:02X}",
            s7[0]
        )));
    }
    if s7[1] != ROSCTR_ACK_DATA && s7[1] != ROSCTR_ACK {
        return Err(PlcError::protocol(format!(
            "unexpected message type 0x{:02X}",
            s7[1]
        )));
    }
    let (error_class, error_code) = (s7[10], s7[11]);
    if error_class != 0 || error_code != 0 {
        return Err(PlcError::protocol(format!(
            "controller reported error class 0x{:02X} code 0x{:02X}",
            error_class, error_code
        )));
    }

    let param_len = u16::from_be_bytes([s7[6], s7[7]]) as usize;
    let data_len = u16::from_be_bytes([s7[8], s7[9]]) as usize;
    let body = &s7[ACK_HEADER_LEN..];
    if body.len() < param_len + data_len {
        return Err(PlcError::protocol(format!(
            "truncated response: {} of {} bytes",
            body.len(),
            param_len + data_len
        )));
    }
    Ok((&body[..param_len], &body[param_len..param_len + data_len]))
}

// ---------------------------------------------------------------------------
// Responses (controller side)
// ---------------------------------------------------------------------------

/// A request decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect { rack: u8, slot: u8 },
    Setup { pdu_ref: u16, pdu_size: u16 },
    Read { pdu_ref: u16, db: u16, offset: u32, length: u16 },
    Write { pdu_ref: u16, db: u16, offset: u32, data: Vec<u8> },
}

/// Decode a client frame (TPKT already stripped).
pub fn decode_request(frame: &[u8]) -> Result<Request> {
    if frame.get(1) == Some(&COTP_CR) {
        return decode_connection_request(frame);
    }
    if frame.len() < COTP_DT.len() + JOB_HEADER_LEN || frame[..2] != COTP_DT[..2] {
        return Err(PlcError::protocol("malformed request frame"));
    }

    let s7 = &frame[COTP_DT.len()..];
    if s7[0] != S7_PROTOCOL_ID || s7[1] != ROSCTR_JOB {
        return Err(PlcError::protocol("not an S7 job request"));
    }
    let pdu_ref = u16::from_be_bytes([s7[4], s7[5]]);
    let param_len = u16::from_be_bytes([s7[6], s7[7]]) as usize;
    let data_len = u16::from_be_bytes([s7[8], s7[9]]) as usize;
    let body = &s7[JOB_HEADER_LEN..];
    if body.len() < param_len + data_len || param_len == 0 {
        return Err(PlcError::protocol("truncated job request"));
    }
    let params = &body[..param_len];
    let data = &body[param_len..param_len + data_len];

    match params[0] {
        FUNC_SETUP if params.len() >= 8 => Ok(Request::Setup {
            pdu_ref,
            pdu_size: u16::from_be_bytes([params[6], params[7]]),
        }),
        FUNC_READ => {
            let (db, offset, length) = decode_item(params)?;
            Ok(Request::Read {
                pdu_ref,
                db,
                offset,
                length,
            })
        }
        FUNC_WRITE => {
            let (db, offset, length) = decode_item(params)?;
            if data.len() < 4 {
                return Err(PlcError::protocol("write request without data item"));
            }
            let raw_len = u16::from_be_bytes([data[2], data[3]]) as usize;
            let len = match data[1] {
                DATA_TS_BIT | DATA_TS_OCTET => raw_len,
                _ => raw_len / 8,
            };
            let payload = &data[4..];
            if len != length as usize || payload.len() < len {
                return Err(PlcError::protocol("write data length mismatch"));
            }
            Ok(Request::Write {
                pdu_ref,
                db,
                offset,
                data: payload[..len].to_vec(),
            })
        }
        other => Err(PlcError::protocol(format!(
            "unsupported function 0x{:02X}",
            other
        ))),
    }
}

/// COTP connection confirm.
pub fn connection_confirm() -> Vec<u8> {
    vec![
        0x11, COTP_CC, 0x00, 0x01, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A, 0xC1, 0x02, 0x01, 0x00,
        0xC2, 0x02, 0x01, 0x01,
    ]
}

/// Setup communication acknowledgement granting `pdu_size`.
pub fn setup_response(pdu_ref: u16, pdu_size: u16) -> Vec<u8> {
    let mut params = vec![FUNC_SETUP, 0x00, 0x00, 0x01, 0x00, 0x01];
    params.extend_from_slice(&pdu_size.to_be_bytes());
    ack_frame(pdu_ref, 0, 0, &params, &[])
}

/// Read var acknowledgement carrying either the bytes or a return code.
pub fn read_response(pdu_ref: u16, result: std::result::Result<&[u8], u8>) -> Vec<u8> {
    let data = match result {
        Ok(bytes) => {
            let mut data = vec![RC_SUCCESS, DATA_TS_BYTE];
            data.extend_from_slice(&((bytes.len() * 8) as u16).to_be_bytes());
            data.extend_from_slice(bytes);
            data
        }
        Err(code) => vec![code, 0x00, 0x00, 0x00],
    };
    ack_frame(pdu_ref, 0, 0, &[FUNC_READ, 0x01], &data)
}

/// Write var acknowledgement with a single return code.
pub fn write_response(pdu_ref: u16, code: u8) -> Vec<u8> {
    ack_frame(pdu_ref, 0, 0, &[FUNC_WRITE, 0x01], &[code])
}

/// Acknowledgement rejecting the whole job with a header error.
pub fn error_response(pdu_ref: u16, class: u8, code: u8) -> Vec<u8> {
    ack_frame(pdu_ref, class, code, &[], &[])
}

fn ack_frame(pdu_ref: u16, class: u8, code: u8, params: &[u8], data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(COTP_DT.len() + ACK_HEADER_LEN + params.len() + data.len());
    frame.extend_from_slice(&COTP_DT);
    frame.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_ACK_DATA, 0x00, 0x00]);
    frame.extend_from_slice(&pdu_ref.to_be_bytes());
    frame.extend_from_slice(&(params.len() as u16).to_be_bytes());
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(&[class, code]);
    frame.extend_from_slice(params);
    frame.extend_from_slice(data);
    frame
}

fn decode_connection_request(frame: &[u8]) -> Result<Request> {
    // Parameters start after length, type, dst ref, src ref and class
    let mut rest = frame.get(7..).unwrap_or_default();
    while rest.len() >= 2 {
        let (code, len) = (rest[0], rest[1] as usize);
        let Some(value) = rest.get(2..2 + len) else {
            break;
        };
        if code == 0xC2 && len == 2 {
            return Ok(Request::Connect {
                rack: value[1] >> 5,
                slot: value[1] & 0x1F,
            });
        }
        rest = &rest[2 + len..];
    }
    Err(PlcError::protocol("connection request without destination TSAP"))
}

fn decode_item(params: &[u8]) -> Result<(u16, u32, u16)> {
    if params.len() < 2 + ITEM_LEN || params[1] != 1 {
        return Err(PlcError::protocol("expected exactly one request item"));
    }
    let item = &params[2..2 + ITEM_LEN];
    if item[0] != 0x12 || item[8] != AREA_DB {
        return Err(PlcError::protocol("only data block items are supported"));
    }
    let length = u16::from_be_bytes([item[4], item[5]]);
    let db = u16::from_be_bytes([item[6], item[7]]);
    let bit_address = ((item[9] as u32) << 16) | ((item[10] as u32) << 8) | item[11] as u32;
    Ok((db, bit_address >> 3, length))
}
