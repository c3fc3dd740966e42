//! SNMP wire decoding
//!
//! Turns a raw UDP datagram into a [`TrapPacket`]: protocol version, community
//! string and the ordered variable bindings, each carrying a typed
//! [`SnmpValue`]. Only community-based notifications are understood
//! (SNMPv1 Trap-PDU, SNMPv2c SNMPv2-Trap and InformRequest).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_OBJECT_IDENTIFIER: u8 = 0x06;
const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_TIME_TICKS: u8 = 0x43;

const PDU_TRAP_V1: u8 = 0xa4;
const PDU_INFORM: u8 = 0xa6;
const PDU_TRAP_V2: u8 = 0xa7;

/// Errors raised while decoding a datagram
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("expected tag 0x{expected:02x} at offset {offset}, found 0x{found:02x}")]
    UnexpectedTag { expected: u8, found: u8, offset: usize },

    #[error("invalid length encoding at offset {offset}")]
    InvalidLength { offset: usize },

    #[error("unsupported SNMP version {0}")]
    UnsupportedVersion(i64),

    #[error("unsupported PDU type 0x{0:02x} for this SNMP version")]
    UnsupportedPdu(u8),

    #[error("invalid {kind} encoding")]
    InvalidValue { kind: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpVersion {
    V1,
    V2c,
}

impl SnmpVersion {
    pub fn label(&self) -> &'static str {
        match self {
            SnmpVersion::V1 => "1",
            SnmpVersion::V2c => "2c",
        }
    }
}

impl fmt::Display for SnmpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A variable binding value, tagged once at the protocol boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    EndOfContents,
    Boolean(bool),
    Integer(i64),
    BitString(Vec<u8>),
    OctetString(Vec<u8>),
    Null,
    ObjectIdentifier(String),
    ObjectDescription(Vec<u8>),
    /// Raw address octets (4 for IPv4, 16 for IPv6)
    IpAddress(Vec<u8>),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Opaque(Vec<u8>),
    NsapAddress(Vec<u8>),
    Counter64(u64),
    Unsigned32(u32),
    OpaqueFloat(f32),
    OpaqueDouble(f64),
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
    /// Any tag outside the known type set
    Unknown(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarBind {
    pub name: String,
    pub value: SnmpValue,
}

impl VarBind {
    pub fn new(name: impl Into<String>, value: SnmpValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A decoded notification as handed to the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct TrapPacket {
    pub version: SnmpVersion,
    pub community: String,
    pub variables: Vec<VarBind>,
}

/// Decode one SNMP message into a [`TrapPacket`]
pub fn decode_packet(data: &[u8]) -> Result<TrapPacket, DecodeError> {
    let mut outer = Reader::new(data);
    let mut message = outer.expect(TAG_SEQUENCE)?;

    let version = match decode_integer(message.expect(TAG_INTEGER)?.bytes())? {
        0 => SnmpVersion::V1,
        1 => SnmpVersion::V2c,
        other => return Err(DecodeError::UnsupportedVersion(other)),
    };

    let community = String::from_utf8_lossy(message.expect(TAG_OCTET_STRING)?.bytes()).into_owned();

    let (pdu_tag, mut pdu) = message.read_tlv()?;
    match (version, pdu_tag) {
        (SnmpVersion::V1, PDU_TRAP_V1) => {
            // enterprise, agent-addr, generic-trap, specific-trap, time-stamp
            decode_oid(pdu.expect(TAG_OBJECT_IDENTIFIER)?.bytes())?;
            pdu.expect(TAG_IP_ADDRESS)?;
            pdu.expect(TAG_INTEGER)?;
            pdu.expect(TAG_INTEGER)?;
            pdu.expect(TAG_TIME_TICKS)?;
        }
        (SnmpVersion::V2c, PDU_TRAP_V2 | PDU_INFORM) => {
            // request-id, error-status, error-index
            for _ in 0..3 {
                pdu.expect(TAG_INTEGER)?;
            }
        }
        _ => return Err(DecodeError::UnsupportedPdu(pdu_tag)),
    }

    let variables = decode_varbinds(pdu.expect(TAG_SEQUENCE)?)?;

    Ok(TrapPacket {
        version,
        community,
        variables,
    })
}

fn decode_varbinds(mut list: Reader<'_>) -> Result<Vec<VarBind>, DecodeError> {
    let mut variables = Vec::new();
    while !list.is_empty() {
        let mut binding = list.expect(TAG_SEQUENCE)?;
        let name = decode_oid(binding.expect(TAG_OBJECT_IDENTIFIER)?.bytes())?;
        let (tag, content) = binding.read_tlv()?;
        let value = decode_value(tag, content.bytes())?;
        variables.push(VarBind { name, value });
    }
    Ok(variables)
}

fn decode_value(tag: u8, content: &[u8]) -> Result<SnmpValue, DecodeError> {
    let value = match tag {
        0x00 => SnmpValue::EndOfContents,
        0x01 => {
            let flag = content
                .first()
                .ok_or(DecodeError::InvalidValue { kind: "boolean" })?;
            SnmpValue::Boolean(*flag != 0)
        }
        0x02 => SnmpValue::Integer(decode_integer(content)?),
        0x03 => SnmpValue::BitString(content.to_vec()),
        0x04 => SnmpValue::OctetString(content.to_vec()),
        0x05 => SnmpValue::Null,
        0x06 => SnmpValue::ObjectIdentifier(decode_oid(content)?),
        0x07 => SnmpValue::ObjectDescription(content.to_vec()),
        0x40 => {
            if content.len() != 4 && content.len() != 16 {
                return Err(DecodeError::InvalidValue { kind: "IpAddress" });
            }
            SnmpValue::IpAddress(content.to_vec())
        }
        0x41 => SnmpValue::Counter32(decode_u32(content, "Counter32")?),
        0x42 => SnmpValue::Gauge32(decode_u32(content, "Gauge32")?),
        0x43 => SnmpValue::TimeTicks(decode_u32(content, "TimeTicks")?),
        0x44 => decode_opaque(content),
        0x45 => SnmpValue::NsapAddress(content.to_vec()),
        0x46 => SnmpValue::Counter64(decode_unsigned(content, "Counter64")?),
        0x47 => SnmpValue::Unsigned32(decode_u32(content, "Unsigned32")?),
        0x80 => SnmpValue::NoSuchObject,
        0x81 => SnmpValue::NoSuchInstance,
        0x82 => SnmpValue::EndOfMibView,
        other => SnmpValue::Unknown(other),
    };
    Ok(value)
}

/// Opaque may wrap a float (0x9f 0x78) or a double (0x9f 0x79)
fn decode_opaque(content: &[u8]) -> SnmpValue {
    match content {
        [0x9f, 0x78, 0x04, rest @ ..] if rest.len() == 4 => {
            SnmpValue::OpaqueFloat(f32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]))
        }
        [0x9f, 0x79, 0x08, rest @ ..] if rest.len() == 8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(rest);
            SnmpValue::OpaqueDouble(f64::from_be_bytes(raw))
        }
        _ => SnmpValue::Opaque(content.to_vec()),
    }
}

fn decode_integer(bytes: &[u8]) -> Result<i64, DecodeError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(DecodeError::InvalidValue { kind: "integer" });
    }
    let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for byte in bytes {
        value = (value << 8) | i64::from(*byte);
    }
    Ok(value)
}

fn decode_unsigned(bytes: &[u8], kind: &'static str) -> Result<u64, DecodeError> {
    // a ninth byte is only allowed as the leading zero of a large counter
    if bytes.is_empty() || bytes.len() > 9 || (bytes.len() == 9 && bytes[0] != 0) {
        return Err(DecodeError::InvalidValue { kind });
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn decode_u32(bytes: &[u8], kind: &'static str) -> Result<u32, DecodeError> {
    u32::try_from(decode_unsigned(bytes, kind)?).map_err(|_| DecodeError::InvalidValue { kind })
}

fn decode_oid(bytes: &[u8]) -> Result<String, DecodeError> {
    const KIND: &str = "object identifier";
    if bytes.is_empty() {
        return Err(DecodeError::InvalidValue { kind: KIND });
    }

    let mut arcs: Vec<u64> = Vec::with_capacity(bytes.len() + 1);
    let mut acc: u64 = 0;
    for (index, byte) in bytes.iter().enumerate() {
        if acc > (u64::MAX >> 7) {
            return Err(DecodeError::InvalidValue { kind: KIND });
        }
        acc = (acc << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 != 0 {
            if index == bytes.len() - 1 {
                return Err(DecodeError::InvalidValue { kind: KIND });
            }
            continue;
        }
        if arcs.is_empty() {
            let (first, second) = match acc {
                0..=39 => (0, acc),
                40..=79 => (1, acc - 40),
                _ => (2, acc - 80),
            };
            arcs.push(first);
            arcs.push(second);
        } else {
            arcs.push(acc);
        }
        acc = 0;
    }

    Ok(arcs
        .iter()
        .map(|arc| arc.to_string())
        .collect::<Vec<_>>()
        .join("."))
}

/// Render raw address octets in their usual textual form
pub fn format_ip_octets(octets: &[u8]) -> String {
    match octets.len() {
        4 => Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]).to_string(),
        16 => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(octets);
            Ipv6Addr::from(raw).to_string()
        }
        _ => String::from_utf8_lossy(octets).into_owned(),
    }
}

/// Cursor over a BER encoded buffer. `base` keeps error offsets absolute.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, base: 0 }
    }

    fn bytes(&self) -> &'a [u8] {
        self.data
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn read_tlv(&mut self) -> Result<(u8, Reader<'a>), DecodeError> {
        let tag = *self
            .data
            .get(self.pos)
            .ok_or(DecodeError::Truncated { offset: self.offset() })?;
        self.pos += 1;

        let len = self.read_length()?;
        let start = self.pos;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DecodeError::Truncated { offset: self.base + start })?;
        self.pos = end;

        Ok((
            tag,
            Reader {
                data: &self.data[start..end],
                pos: 0,
                base: self.base + start,
            },
        ))
    }

    fn expect(&mut self, expected: u8) -> Result<Reader<'a>, DecodeError> {
        let offset = self.offset();
        let (found, content) = self.read_tlv()?;
        if found != expected {
            return Err(DecodeError::UnexpectedTag {
                expected,
                found,
                offset,
            });
        }
        Ok(content)
    }

    fn read_length(&mut self) -> Result<usize, DecodeError> {
        let offset = self.offset();
        let first = *self
            .data
            .get(self.pos)
            .ok_or(DecodeError::Truncated { offset })?;
        self.pos += 1;

        if first & 0x80 == 0 {
            return Ok(usize::from(first));
        }

        let count = usize::from(first & 0x7f);
        if count == 0 || count > 4 {
            return Err(DecodeError::InvalidLength { offset });
        }
        let bytes = self
            .data
            .get(self.pos..self.pos + count)
            .ok_or(DecodeError::Truncated { offset })?;
        self.pos += count;

        Ok(bytes.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b)))
    }
}
