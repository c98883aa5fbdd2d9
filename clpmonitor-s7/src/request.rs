//! Resolving loosely typed write requests into checked tag operations.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::connector::Connector;
use crate::error::{PlcError, Result};
use crate::pdu::{DEFAULT_PDU_SIZE, WRITE_OVERHEAD};
use crate::tag::{TagAddress, TagKind, TagValue};

/// Tag location as supplied by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDescriptor {
    pub db: u16,
    pub offset: u32,
    /// Kind name, case-insensitive.
    #[serde(rename = "type")]
    pub kind: String,
    /// Bit index, required for bit tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit: Option<u8>,
    /// Capacity for strings, length for blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u16>,
}

impl TagDescriptor {
    pub fn new(db: u16, offset: u32, kind: impl Into<String>) -> Self {
        Self {
            db,
            offset,
            kind: kind.into(),
            bit: None,
            size: None,
        }
    }

    pub fn with_bit(mut self, bit: u8) -> Self {
        self.bit = Some(bit);
        self
    }

    pub fn with_size(mut self, size: u16) -> Self {
        self.size = Some(size);
        self
    }

    /// Resolve into a checked address.
    pub fn resolve(&self) -> Result<TagAddress> {
        let name = self.kind.trim().to_ascii_lowercase();
        let kind = match name.as_str() {
            "integer" | "int" | "dint" => TagKind::Int32,
            "float" | "real" => TagKind::Float32,
            "byte" => TagKind::Byte,
            "bit" | "bool" => TagKind::Bit {
                index: self
                    .bit
                    .ok_or_else(|| PlcError::validation("bit index is required for BIT tags"))?,
            },
            "string" => {
                let size = self.required_size("STRING")?;
                let capacity = u8::try_from(size).map_err(|_| {
                    PlcError::address(format!("string capacity {} is too large", size))
                })?;
                TagKind::String { capacity }
            }
            "block" => TagKind::Block {
                length: self.required_size("BLOCK")?,
            },
            _ => {
                return Err(PlcError::address(format!(
                    "unsupported tag type {:?}",
                    self.kind
                )));
            }
        };
        TagAddress::new(self.db, self.offset, kind)
    }

    fn required_size(&self, kind: &str) -> Result<u16> {
        self.size
            .ok_or_else(|| PlcError::validation(format!("size is required for {} tags", kind)))
    }
}

/// A fully resolved write: address and parsed value.
///
/// Building one performs every check that does not need the device, so a
/// malformed request never opens a session.
#[derive(Debug, Clone, PartialEq)]
pub struct TagWrite {
    address: TagAddress,
    value: TagValue,
}

impl TagWrite {
    /// Resolve `descriptor` and parse `text` against it.
    pub fn prepare(descriptor: &TagDescriptor, text: &str) -> Result<Self> {
        let address = descriptor.resolve()?;
        let value = TagValue::parse(address.kind(), text)?;
        Self::new(address, value)
    }

    /// Pair an address with an already typed value.
    pub fn new(address: TagAddress, value: TagValue) -> Result<Self> {
        if !value.matches(address.kind()) {
            return Err(PlcError::address(format!(
                "value {} cannot be written as {}",
                value,
                address.kind().name()
            )));
        }
        // Surface capacity errors before any network traffic
        if !matches!(address.kind(), TagKind::Bit { .. }) {
            let bytes = crate::tag::encode(address.kind(), &value)?;
            let max = DEFAULT_PDU_SIZE as usize - WRITE_OVERHEAD;
            if bytes.len() > max {
                return Err(PlcError::address(format!(
                    "{} bytes cannot be written in one request (max {})",
                    bytes.len(),
                    max
                )));
            }
        }
        Ok(Self { address, value })
    }

    pub fn address(&self) -> &TagAddress {
        &self.address
    }

    pub fn value(&self) -> &TagValue {
        &self.value
    }

    /// Human-readable operation, e.g. `DB9.68 (BYTE) = 3`.
    pub fn describe(&self) -> String {
        self.to_string()
    }

    /// Execute on a dedicated session, closed afterwards.
    pub async fn execute(&self, connector: &Connector) -> Result<()> {
        let result = async {
            let mut client = connector.connect().await?;
            let result = client.write_tag(&self.address, &self.value).await;
            client.disconnect().await;
            result
        }
        .await;

        match &result {
            Ok(()) => info!(
                endpoint = %connector.endpoint(),
                address = %self.address,
                kind = self.address.kind().name(),
                success = true,
                "Tag written"
            ),
            Err(e) => warn!(
                endpoint = %connector.endpoint(),
                address = %self.address,
                kind = self.address.kind().name(),
                success = false,
                error = %e,
                "Tag write failed"
            ),
        }
        result
    }
}

impl fmt::Display for TagWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) = {}",
            self.address,
            self.address.kind().name(),
            self.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Endpoint;
    use crate::sim::SimulatedPlc;
    use std::sync::Arc;

    #[test]
    fn test_kind_aliases() {
        for (name, kind) in [
            ("INTEGER", TagKind::Int32),
            ("dint", TagKind::Int32),
            ("Real", TagKind::Float32),
            ("float", TagKind::Float32),
            ("byte", TagKind::Byte),
        ] {
            let address = TagDescriptor::new(9, 0, name).resolve().unwrap();
            assert_eq!(address.kind(), kind, "{name}");
        }

        let bit = TagDescriptor::new(9, 2, "Bool").with_bit(3).resolve().unwrap();
        assert_eq!(bit.kind(), TagKind::Bit { index: 3 });
    }

    #[test]
    fn test_unknown_kind_is_address_error() {
        let err = TagDescriptor::new(9, 0, "word").resolve().unwrap_err();
        assert!(matches!(err, PlcError::Address(_)));
    }

    #[test]
    fn test_missing_fields_are_validation_errors() {
        let err = TagDescriptor::new(9, 0, "bit").resolve().unwrap_err();
        assert!(matches!(err, PlcError::Validation(_)));

        let err = TagDescriptor::new(9, 0, "string").resolve().unwrap_err();
        assert!(matches!(err, PlcError::Validation(_)));

        let err = TagDescriptor::new(9, 0, "block").resolve().unwrap_err();
        assert!(matches!(err, PlcError::Validation(_)));
    }

    #[test]
    fn test_bit_out_of_range() {
        let err = TagDescriptor::new(9, 0, "bit")
            .with_bit(8)
            .resolve()
            .unwrap_err();
        assert!(matches!(err, PlcError::Address(_)));
    }

    #[test]
    fn test_descriptor_json() {
        let descriptor: TagDescriptor =
            serde_json::from_str(r#"{"db": 9, "offset": 68, "type": "byte"}"#).unwrap();
        assert_eq!(descriptor, TagDescriptor::new(9, 68, "byte"));
    }

    #[test]
    fn test_prepare_and_describe() {
        let write = TagWrite::prepare(&TagDescriptor::new(9, 68, "byte"), " 3 ").unwrap();
        assert_eq!(write.describe(), "DB9.68 (BYTE) = 3");

        let write =
            TagWrite::prepare(&TagDescriptor::new(9, 2, "bit").with_bit(3), "on").unwrap();
        assert_eq!(write.describe(), "DB9.2.3 (BIT) = true");
    }

    #[test]
    fn test_prepare_rejects_bad_values() {
        let err = TagWrite::prepare(&TagDescriptor::new(9, 0, "integer"), "12x").unwrap_err();
        assert!(matches!(err, PlcError::Format(_)));

        let err = TagWrite::prepare(&TagDescriptor::new(9, 0, "block").with_size(2), "0g")
            .unwrap_err();
        assert!(matches!(err, PlcError::Format(_)));

        let err = TagWrite::prepare(&TagDescriptor::new(9, 0, "string").with_size(3), "abcd")
            .unwrap_err();
        assert!(matches!(err, PlcError::Address(_)));
    }

    #[test]
    fn test_block_wider_than_one_request_rejected() {
        let descriptor = TagDescriptor::new(9, 0, "block").with_size(500);
        let err = TagWrite::prepare(&descriptor, &"ab".repeat(500)).unwrap_err();
        assert!(matches!(err, PlcError::Address(_)));

        let descriptor = TagDescriptor::new(9, 0, "block").with_size(452);
        assert!(TagWrite::prepare(&descriptor, &"ab".repeat(452)).is_ok());
    }

    #[test]
    fn test_new_rejects_mismatched_value() {
        let err = TagWrite::new(TagAddress::byte(9, 0), TagValue::Int32(1)).unwrap_err();
        assert!(matches!(err, PlcError::Address(_)));
    }

    #[tokio::test]
    async fn test_execute_writes_and_closes() {
        let plc = SimulatedPlc::new().with_block(9, vec![0; 96]);
        let connector = Connector::with_factory(Endpoint::new("sim", 102), Arc::new(plc.clone()));

        let write = TagWrite::prepare(&TagDescriptor::new(9, 68, "byte"), "3").unwrap();
        write.execute(&connector).await.unwrap();

        assert_eq!(plc.block(9).unwrap()[68], 3);
        assert_eq!(plc.connection_attempts(), 1);
    }

    #[tokio::test]
    async fn test_execute_offline() {
        let plc = SimulatedPlc::new().with_block(9, vec![0; 96]);
        plc.set_offline(true);
        let connector = Connector::with_factory(Endpoint::new("sim", 102), Arc::new(plc.clone()));

        let write = TagWrite::prepare(&TagDescriptor::new(9, 68, "byte"), "3").unwrap();
        let err = write.execute(&connector).await.unwrap_err();
        assert!(matches!(err, PlcError::Connection(_)));
    }
}
