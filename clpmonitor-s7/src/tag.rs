//! Tag addressing and typed value encoding.
//!
//! A [`TagAddress`] says where a value lives (data block, byte offset) and how
//! its bytes are interpreted ([`TagKind`]). Encoding is big-endian throughout:
//!
//! ```text
//! Int32   4 bytes, two's complement
//! Float32 4 bytes, IEEE-754 binary32
//! Byte    1 byte
//! Bit     1 bit of the addressed byte, index 0 = least significant
//! String  [capacity][length][capacity bytes, zero padded]
//! Block   raw bytes
//! ```

use std::fmt;

use crate::error::{PlcError, Result};
use crate::hex;

/// Largest capacity representable in the one-byte string header.
pub const MAX_STRING_CAPACITY: u8 = 254;

/// Number of header bytes before string characters.
pub const STRING_HEADER_LEN: usize = 2;

/// How the bytes at an address are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    /// Fixed-capacity text.
    String { capacity: u8 },
    /// Raw bytes of a fixed length.
    Block { length: u16 },
    Float32,
    Int32,
    Byte,
    /// Single bit within the addressed byte.
    Bit { index: u8 },
}

impl TagKind {
    /// Number of bytes occupied on the device.
    pub fn byte_len(&self) -> usize {
        match self {
            TagKind::String { capacity } => STRING_HEADER_LEN + *capacity as usize,
            TagKind::Block { length } => *length as usize,
            TagKind::Float32 | TagKind::Int32 => 4,
            TagKind::Byte | TagKind::Bit { .. } => 1,
        }
    }

    /// Upper-case name used in operation descriptions.
    pub fn name(&self) -> &'static str {
        match self {
            TagKind::String { .. } => "STRING",
            TagKind::Block { .. } => "BLOCK",
            TagKind::Float32 => "FLOAT",
            TagKind::Int32 => "INTEGER",
            TagKind::Byte => "BYTE",
            TagKind::Bit { .. } => "BIT",
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            TagKind::Bit { index } if index > 7 => Err(PlcError::address(format!(
                "bit index {} outside 0..=7",
                index
            ))),
            TagKind::String { capacity } if capacity == 0 || capacity > MAX_STRING_CAPACITY => {
                Err(PlcError::address(format!(
                    "string capacity {} outside 1..={}",
                    capacity, MAX_STRING_CAPACITY
                )))
            }
            TagKind::Block { length: 0 } => {
                Err(PlcError::address("block length must be greater than zero"))
            }
            _ => Ok(()),
        }
    }
}

/// Location and interpretation of one value inside a data block.
///
/// Whether the offset exists on the physical device is only discovered at
/// I/O time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagAddress {
    db: u16,
    offset: u32,
    kind: TagKind,
}

impl TagAddress {
    /// Create an address, checking the kind's own invariants.
    pub fn new(db: u16, offset: u32, kind: TagKind) -> Result<Self> {
        kind.validate()?;
        Ok(Self { db, offset, kind })
    }

    pub fn int32(db: u16, offset: u32) -> Self {
        Self {
            db,
            offset,
            kind: TagKind::Int32,
        }
    }

    pub fn float32(db: u16, offset: u32) -> Self {
        Self {
            db,
            offset,
            kind: TagKind::Float32,
        }
    }

    pub fn byte(db: u16, offset: u32) -> Self {
        Self {
            db,
            offset,
            kind: TagKind::Byte,
        }
    }

    pub fn bit(db: u16, offset: u32, index: u8) -> Result<Self> {
        Self::new(db, offset, TagKind::Bit { index })
    }

    pub fn string(db: u16, offset: u32, capacity: u8) -> Result<Self> {
        Self::new(db, offset, TagKind::String { capacity })
    }

    pub fn block(db: u16, offset: u32, length: u16) -> Result<Self> {
        Self::new(db, offset, TagKind::Block { length })
    }

    pub fn db(&self) -> u16 {
        self.db
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn kind(&self) -> TagKind {
        self.kind
    }
}

impl fmt::Display for TagAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TagKind::Bit { index } => write!(f, "DB{}.{}.{}", self.db, self.offset, index),
            _ => write!(f, "DB{}.{}", self.db, self.offset),
        }
    }
}

/// A typed value matching a [`TagKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Int32(i32),
    Float32(f32),
    Byte(u8),
    Bit(bool),
    String(String),
    Block(Vec<u8>),
}

impl TagValue {
    /// Parse text according to `kind`.
    ///
    /// Surrounding whitespace is ignored. Booleans accept `true/false/1/0/on/off`,
    /// blocks are hex text.
    pub fn parse(kind: TagKind, text: &str) -> Result<Self> {
        let text = text.trim();
        match kind {
            TagKind::Int32 => text
                .parse::<i32>()
                .map(TagValue::Int32)
                .map_err(|e| PlcError::format(format!("invalid integer {:?}: {}", text, e))),
            TagKind::Float32 => text
                .parse::<f32>()
                .map(TagValue::Float32)
                .map_err(|e| PlcError::format(format!("invalid float {:?}: {}", text, e))),
            TagKind::Byte => text
                .parse::<u8>()
                .map(TagValue::Byte)
                .map_err(|e| PlcError::format(format!("invalid byte {:?}: {}", text, e))),
            TagKind::Bit { .. } => match text.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Ok(TagValue::Bit(true)),
                "false" | "0" | "off" => Ok(TagValue::Bit(false)),
                _ => Err(PlcError::format(format!("invalid boolean {:?}", text))),
            },
            TagKind::String { .. } => Ok(TagValue::String(text.to_string())),
            TagKind::Block { .. } => hex::decode(text).map(TagValue::Block),
        }
    }

    /// Whether this value can be stored under `kind`.
    pub fn matches(&self, kind: TagKind) -> bool {
        matches!(
            (self, kind),
            (TagValue::Int32(_), TagKind::Int32)
                | (TagValue::Float32(_), TagKind::Float32)
                | (TagValue::Byte(_), TagKind::Byte)
                | (TagValue::Bit(_), TagKind::Bit { .. })
                | (TagValue::String(_), TagKind::String { .. })
                | (TagValue::Block(_), TagKind::Block { .. })
        )
    }

    /// Integer view used by scalar broadcast channels.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TagValue::Int32(v) => Some(*v as i64),
            TagValue::Float32(v) => Some(v.round() as i64),
            TagValue::Byte(v) => Some(*v as i64),
            TagValue::Bit(v) => Some(*v as i64),
            TagValue::String(_) | TagValue::Block(_) => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Int32(v) => write!(f, "{}", v),
            TagValue::Float32(v) => write!(f, "{:.2}", v),
            TagValue::Byte(v) => write!(f, "{}", v),
            TagValue::Bit(v) => write!(f, "{}", v),
            TagValue::String(s) => write!(f, "'{}'", s),
            TagValue::Block(bytes) => write!(f, "{}", hex::encode(bytes)),
        }
    }
}

/// Encode `value` into the device byte layout of `kind`.
///
/// For [`TagKind::Bit`] the result is a byte with only the addressed bit
/// possibly set; merging it into the device byte is done with [`apply_bit`].
pub fn encode(kind: TagKind, value: &TagValue) -> Result<Vec<u8>> {
    kind.validate()?;
    match (kind, value) {
        (TagKind::Int32, TagValue::Int32(v)) => Ok(v.to_be_bytes().to_vec()),
        (TagKind::Float32, TagValue::Float32(v)) => Ok(v.to_be_bytes().to_vec()),
        (TagKind::Byte, TagValue::Byte(v)) => Ok(vec![*v]),
        (TagKind::Bit { index }, TagValue::Bit(v)) => Ok(vec![apply_bit(0, index, *v)]),
        (TagKind::String { capacity }, TagValue::String(text)) => encode_string(capacity, text),
        (TagKind::Block { length }, TagValue::Block(bytes)) => {
            if bytes.len() > length as usize {
                return Err(PlcError::address(format!(
                    "{} bytes do not fit a block of {} bytes",
                    bytes.len(),
                    length
                )));
            }
            Ok(bytes.clone())
        }
        (kind, value) => Err(PlcError::address(format!(
            "value {} cannot be written as {}",
            value,
            kind.name()
        ))),
    }
}

/// Decode device bytes laid out as `kind`.
pub fn decode(kind: TagKind, bytes: &[u8]) -> Result<TagValue> {
    kind.validate()?;
    let needed = match kind {
        TagKind::String { .. } => STRING_HEADER_LEN,
        other => other.byte_len(),
    };
    if bytes.len() < needed {
        return Err(PlcError::protocol(format!(
            "{} needs {} bytes, got {}",
            kind.name(),
            needed,
            bytes.len()
        )));
    }

    match kind {
        TagKind::Int32 => Ok(TagValue::Int32(i32::from_be_bytes(word(bytes)))),
        TagKind::Float32 => Ok(TagValue::Float32(f32::from_be_bytes(word(bytes)))),
        TagKind::Byte => Ok(TagValue::Byte(bytes[0])),
        TagKind::Bit { index } => Ok(TagValue::Bit(bit_of(bytes[0], index))),
        TagKind::String { capacity } => {
            let chars = &bytes[STRING_HEADER_LEN..];
            let len = (bytes[1] as usize).min(capacity as usize).min(chars.len());
            Ok(TagValue::String(
                String::from_utf8_lossy(&chars[..len]).into_owned(),
            ))
        }
        TagKind::Block { length } => Ok(TagValue::Block(bytes[..length as usize].to_vec())),
    }
}

/// Set or clear bit `index` of `byte`, leaving the other seven bits untouched.
pub fn apply_bit(byte: u8, index: u8, value: bool) -> u8 {
    let mask = 1u8 << (index & 0x07);
    if value { byte | mask } else { byte & !mask }
}

/// Read bit `index` of `byte`.
pub fn bit_of(byte: u8, index: u8) -> bool {
    byte & (1u8 << (index & 0x07)) != 0
}

fn word(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

fn encode_string(capacity: u8, text: &str) -> Result<Vec<u8>> {
    let chars = text.as_bytes();
    if chars.len() > capacity as usize {
        return Err(PlcError::address(format!(
            "text of {} bytes exceeds string capacity {}",
            chars.len(),
            capacity
        )));
    }

    let mut out = Vec::with_capacity(STRING_HEADER_LEN + capacity as usize);
    out.push(capacity);
    out.push(chars.len() as u8);
    out.extend_from_slice(chars);
    out.resize(STRING_HEADER_LEN + capacity as usize, 0);
    Ok(out)
}
