//! Trap record assembly
//!
//! Converts decoded variable bindings into structured fields and assembles
//! the per-packet [`TrapRecord`] that every publisher receives.

use crate::codec::{format_ip_octets, SnmpValue, TrapPacket, VarBind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

/// Type label of a decoded field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    EndOfContents,
    Boolean,
    Integer,
    BitString,
    OctetString,
    Null,
    ObjectIdentifier,
    ObjectDescription,
    IPAddress,
    Counter32,
    Gauge32,
    TimeTicks,
    Opaque,
    NsapAddress,
    Counter64,
    UnsignedInteger32,
    OpaqueFloat,
    OpaqueDouble,
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
    UnknownType,
}

impl FieldType {
    /// Byte-string-like types carry a hex rendering alongside the value
    pub fn has_hex(&self) -> bool {
        matches!(
            self,
            FieldType::OctetString | FieldType::ObjectDescription | FieldType::IPAddress
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The value carried by a field. `Null` serialises as JSON `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Float32(f32),
    Text(String),
    Null,
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::UInt(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Float32(v) => write!(f, "{}", v),
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::Null => f.write_str("null"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
}

impl Field {
    fn new(kind: FieldType, value: FieldValue) -> Self {
        Self {
            kind,
            value: Some(value),
            hex: None,
        }
    }

    fn bare(kind: FieldType) -> Self {
        Self {
            kind,
            value: None,
            hex: None,
        }
    }

    fn text(kind: FieldType, bytes: &[u8]) -> Self {
        Self::new(kind, FieldValue::Text(String::from_utf8_lossy(bytes).into_owned()))
    }

    fn with_hex(mut self, bytes: &[u8]) -> Self {
        self.hex = Some(bytes_to_hex_separated(bytes, ":"));
        self
    }
}

/// One decoded notification, serialised as the relay's JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrapRecord {
    pub host: String,
    pub version: String,
    pub community: String,
    #[serde(rename = "object")]
    pub object_identifier: String,
    #[serde(rename = "timeticks")]
    pub time_ticks: u32,
    #[serde(rename = "data")]
    pub fields: BTreeMap<String, Field>,
}

impl TrapRecord {
    pub fn new(host: IpAddr, version: impl Into<String>, community: impl Into<String>) -> Self {
        Self {
            host: host.to_string(),
            version: version.into(),
            community: community.into(),
            object_identifier: String::new(),
            time_ticks: 0,
            fields: BTreeMap::new(),
        }
    }

    /// Serialise into the JSON interchange form sent to sinks
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Decode a single variable binding into a [`Field`]
pub fn decode_variable(value: &SnmpValue) -> Field {
    match value {
        SnmpValue::EndOfContents => Field::bare(FieldType::EndOfContents),
        SnmpValue::Boolean(b) => Field::new(FieldType::Boolean, FieldValue::Bool(*b)),
        SnmpValue::Integer(i) => Field::new(FieldType::Integer, FieldValue::Int(*i)),
        SnmpValue::BitString(bytes) => Field::text(FieldType::BitString, bytes),
        SnmpValue::OctetString(bytes) => Field::text(FieldType::OctetString, bytes).with_hex(bytes),
        SnmpValue::Null => Field::new(FieldType::Null, FieldValue::Null),
        SnmpValue::ObjectIdentifier(oid) => {
            Field::new(FieldType::ObjectIdentifier, FieldValue::Text(oid.clone()))
        }
        SnmpValue::ObjectDescription(bytes) => {
            Field::text(FieldType::ObjectDescription, bytes).with_hex(bytes)
        }
        SnmpValue::IpAddress(octets) => {
            Field::new(FieldType::IPAddress, FieldValue::Text(format_ip_octets(octets))).with_hex(octets)
        }
        SnmpValue::Counter32(c) => Field::new(FieldType::Counter32, FieldValue::UInt(u64::from(*c))),
        SnmpValue::Gauge32(g) => Field::new(FieldType::Gauge32, FieldValue::UInt(u64::from(*g))),
        SnmpValue::TimeTicks(t) => Field::new(FieldType::TimeTicks, FieldValue::UInt(u64::from(*t))),
        SnmpValue::Opaque(bytes) => Field::text(FieldType::Opaque, bytes),
        SnmpValue::NsapAddress(bytes) => Field::text(FieldType::NsapAddress, bytes),
        SnmpValue::Counter64(c) => Field::new(FieldType::Counter64, FieldValue::UInt(*c)),
        SnmpValue::Unsigned32(u) => {
            Field::new(FieldType::UnsignedInteger32, FieldValue::UInt(u64::from(*u)))
        }
        SnmpValue::OpaqueFloat(f) => Field::new(FieldType::OpaqueFloat, FieldValue::Float32(*f)),
        SnmpValue::OpaqueDouble(d) => Field::new(FieldType::OpaqueDouble, FieldValue::Float(*d)),
        SnmpValue::NoSuchObject => Field::new(FieldType::NoSuchObject, FieldValue::Null),
        SnmpValue::NoSuchInstance => Field::new(FieldType::NoSuchInstance, FieldValue::Null),
        SnmpValue::EndOfMibView => Field::new(FieldType::EndOfMibView, FieldValue::Null),
        SnmpValue::Unknown(_) => Field::bare(FieldType::UnknownType),
    }
}

/// Build the record for one packet.
///
/// The object-identifier and time-ticks bindings are lifted into their own
/// record attributes and never appear in `fields`. A later binding with the
/// same name replaces an earlier one.
pub fn assemble_trap(source: IpAddr, packet: &TrapPacket) -> TrapRecord {
    let mut record = TrapRecord::new(source, packet.version.label(), packet.community.as_str());

    for VarBind { name, value } in &packet.variables {
        let field = decode_variable(value);
        debug!(
            "{} -> {} = {}: {}",
            source,
            name,
            field.kind,
            field.value.as_ref().map(ToString::to_string).unwrap_or_default()
        );

        match value {
            SnmpValue::ObjectIdentifier(oid) => {
                record.object_identifier = oid.clone();
                record.fields.remove(name);
            }
            SnmpValue::TimeTicks(ticks) => {
                record.time_ticks = *ticks;
                record.fields.remove(name);
            }
            _ => {
                record.fields.insert(name.clone(), field);
            }
        }
    }

    record
}

/// Lowercase hex with a separator between bytes, e.g. `68:69`
pub fn bytes_to_hex_separated(data: &[u8], sep: &str) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(sep)
}
