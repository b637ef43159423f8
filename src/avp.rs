//! Diameter AVP (Attribute-Value Pair) encoding and decoding
//!
//! AVP format (RFC 6733):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           AVP Code                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V M P r r r r r|                  AVP Length                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Vendor-ID (opt)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Data ...
//! +-+-+-+-+-+-+-+-+
//! ```
//!
//! The AVP length field covers the header and the payload but not the
//! trailing padding to the 4-byte boundary. Typed decoding is driven by the
//! process-wide [`crate::dictionary`]; unknown or malformed payloads fall
//! back to `OctetString`, preserving the payload bytes verbatim.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::dictionary::{self, AvpType};
use crate::error::{DiameterError, DiameterResult};

/// AVP flags
pub mod avp_flags {
    /// Vendor-Specific bit
    pub const VENDOR: u8 = 0x80;
    /// Mandatory bit
    pub const MANDATORY: u8 = 0x40;
    /// Protected bit (end-to-end encryption)
    pub const PROTECTED: u8 = 0x20;
}

/// AVP header size without vendor ID
pub const AVP_HEADER_SIZE: usize = 8;
/// AVP header size with vendor ID
pub const AVP_HEADER_SIZE_VENDOR: usize = 12;

// NTP era handling for the Time type (RFC 2030 extension rule). Values with
// the most significant bit clear belong to the second NTP era and decode as
// instants past 7 February 2036.
const NTP_UNIX_OFFSET: u64 = ((70 * 365) + 17) * 86400;
// 2036-02-07 06:28:16 UTC, where the second NTP era begins
const NTP_ERA1_UNIX_BASE: u64 = (1u64 << 32) - NTP_UNIX_OFFSET;
const NTP_ERA_CUTOFF: u32 = 0x8000_0000;

/// Diameter AVP
#[derive(Debug, Clone, PartialEq)]
pub struct Avp {
    /// AVP code
    pub code: u32,
    /// AVP flags
    pub flags: u8,
    /// Vendor ID (present iff the V flag is set)
    pub vendor_id: Option<u32>,
    /// AVP value
    pub value: AvpValue,
}

/// Typed AVP values
#[derive(Debug, Clone, PartialEq)]
pub enum AvpValue {
    /// OctetString; also the fallback for unknown codes and payloads that
    /// fail typed parsing
    OctetString(Bytes),
    /// UTF8String
    Utf8String(String),
    /// Integer32
    Integer32(i32),
    /// Integer64
    Integer64(i64),
    /// Unsigned32
    Unsigned32(u32),
    /// Unsigned64
    Unsigned64(u64),
    /// Float32
    Float32(f32),
    /// Float64
    Float64(f64),
    /// Address (2-byte address family tag + address); unknown families are
    /// kept as OctetString so the tag survives re-encoding
    Address(IpAddr),
    /// Time: seconds since 1900-01-01 00:00:00 UTC, NTP era rules
    Time(u32),
    /// DiameterIdentity (FQDN)
    Identity(String),
    /// DiameterURI
    Uri(String),
    /// Enumerated (wire-identical to Integer32)
    Enumerated(i32),
    /// Grouped AVP (ordered sequence of inner AVPs)
    Grouped(Vec<Avp>),
}

impl Avp {
    /// Create a new AVP
    pub fn new(code: u32, flags: u8, vendor_id: Option<u32>, value: AvpValue) -> Self {
        let flags = match vendor_id {
            Some(_) => flags | avp_flags::VENDOR,
            None => flags & !avp_flags::VENDOR,
        };
        Self {
            code,
            flags,
            vendor_id,
            value,
        }
    }

    /// Create a mandatory AVP
    pub fn mandatory(code: u32, value: AvpValue) -> Self {
        Self::new(code, avp_flags::MANDATORY, None, value)
    }

    /// Create a vendor-specific mandatory AVP
    pub fn vendor_mandatory(code: u32, vendor_id: u32, value: AvpValue) -> Self {
        Self::new(
            code,
            avp_flags::VENDOR | avp_flags::MANDATORY,
            Some(vendor_id),
            value,
        )
    }

    /// Create an AVP with flags taken from the dictionary definition for
    /// (code, vendor). Unknown codes get empty flags.
    pub fn build(code: u32, vendor_id: u32, value: AvpValue) -> Self {
        let mut flags = 0u8;
        if let Some(def) = dictionary::lookup_avp(code, vendor_id) {
            if def.mandatory {
                flags |= avp_flags::MANDATORY;
            }
            if def.protected {
                flags |= avp_flags::PROTECTED;
            }
        }
        let vendor = if vendor_id != 0 { Some(vendor_id) } else { None };
        Self::new(code, flags, vendor, value)
    }

    /// Check if AVP is vendor-specific
    pub fn is_vendor_specific(&self) -> bool {
        self.flags & avp_flags::VENDOR != 0
    }

    /// Check if AVP is mandatory
    pub fn is_mandatory(&self) -> bool {
        self.flags & avp_flags::MANDATORY != 0
    }

    /// Check if AVP is protected
    pub fn is_protected(&self) -> bool {
        self.flags & avp_flags::PROTECTED != 0
    }

    fn header_len(&self) -> usize {
        if self.is_vendor_specific() {
            AVP_HEADER_SIZE_VENDOR
        } else {
            AVP_HEADER_SIZE
        }
    }

    /// Get the encoded length of this AVP, including trailing padding
    pub fn encoded_len(&self) -> usize {
        let total = self.header_len() + self.value.encoded_len();
        (total + 3) & !3
    }

    /// Encode AVP to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        let data_len = self.value.encoded_len();
        let avp_len = self.header_len() + data_len;

        buf.put_u32(self.code);
        buf.put_u8(self.flags);
        buf.put_u8(((avp_len >> 16) & 0xff) as u8);
        buf.put_u16((avp_len & 0xffff) as u16);

        if let Some(vendor_id) = self.vendor_id {
            buf.put_u32(vendor_id);
        }

        self.value.encode(buf);

        let padding = (4 - (data_len % 4)) % 4;
        for _ in 0..padding {
            buf.put_u8(0);
        }
    }

    /// Decode an AVP from bytes, consuming its padding.
    ///
    /// The typed value is selected through the dictionary; unknown codes and
    /// payloads that do not parse as their declared type come back as
    /// `OctetString`.
    pub fn decode(buf: &mut Bytes) -> DiameterResult<Self> {
        if buf.remaining() < AVP_HEADER_SIZE {
            return Err(DiameterError::MalformedAvp(format!(
                "need {} header bytes, have {}",
                AVP_HEADER_SIZE,
                buf.remaining()
            )));
        }

        let code = buf.get_u32();
        let flags = buf.get_u8();
        let len_high = buf.get_u8() as usize;
        let len_low = buf.get_u16() as usize;
        let avp_len = (len_high << 16) | len_low;

        let is_vendor = flags & avp_flags::VENDOR != 0;
        let header_len = if is_vendor {
            AVP_HEADER_SIZE_VENDOR
        } else {
            AVP_HEADER_SIZE
        };

        if avp_len < header_len {
            return Err(DiameterError::MalformedAvp(format!(
                "AVP {code} length {avp_len} is less than header size {header_len}"
            )));
        }

        let vendor_id = if is_vendor {
            if buf.remaining() < 4 {
                return Err(DiameterError::MalformedAvp(format!(
                    "AVP {code} truncated before vendor id"
                )));
            }
            Some(buf.get_u32())
        } else {
            None
        };

        let data_len = avp_len - header_len;
        if buf.remaining() < data_len {
            return Err(DiameterError::MalformedAvp(format!(
                "AVP {code} payload needs {data_len} bytes, have {}",
                buf.remaining()
            )));
        }

        let payload = buf.copy_to_bytes(data_len);

        let padding = (4 - (data_len % 4)) % 4;
        if buf.remaining() >= padding {
            buf.advance(padding);
        }

        let value = match dictionary::lookup_avp(code, vendor_id.unwrap_or(0)) {
            Some(def) => parse_value(def.avp_type, &payload)
                .unwrap_or(AvpValue::OctetString(payload)),
            None => AvpValue::OctetString(payload),
        };

        Ok(Self {
            code,
            flags,
            vendor_id,
            value,
        })
    }

    /// Payload bytes of this AVP, as they would appear on the wire
    pub fn payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.value.encoded_len());
        self.value.encode(&mut buf);
        buf.freeze()
    }

    /// Get value as raw octets
    pub fn as_octets(&self) -> Option<&Bytes> {
        match &self.value {
            AvpValue::OctetString(b) => Some(b),
            _ => None,
        }
    }

    /// Get value as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            AvpValue::Utf8String(s) | AvpValue::Identity(s) | AvpValue::Uri(s) => Some(s),
            AvpValue::OctetString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get value as Unsigned32
    pub fn as_u32(&self) -> Option<u32> {
        match &self.value {
            AvpValue::Unsigned32(v) => Some(*v),
            AvpValue::Time(v) => Some(*v),
            AvpValue::Enumerated(v) => Some(*v as u32),
            AvpValue::OctetString(b) if b.len() == 4 => {
                Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            _ => None,
        }
    }

    /// Get value as Unsigned64
    pub fn as_u64(&self) -> Option<u64> {
        match &self.value {
            AvpValue::Unsigned64(v) => Some(*v),
            _ => None,
        }
    }

    /// Get value as Integer32
    pub fn as_i32(&self) -> Option<i32> {
        match &self.value {
            AvpValue::Integer32(v) | AvpValue::Enumerated(v) => Some(*v),
            _ => None,
        }
    }

    /// Get value as Integer64
    pub fn as_i64(&self) -> Option<i64> {
        match &self.value {
            AvpValue::Integer64(v) => Some(*v),
            _ => None,
        }
    }

    /// Get value as an IP address
    pub fn as_address(&self) -> Option<IpAddr> {
        match &self.value {
            AvpValue::Address(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Get value as grouped AVPs
    pub fn as_grouped(&self) -> Option<&[Avp]> {
        match &self.value {
            AvpValue::Grouped(avps) => Some(avps),
            _ => None,
        }
    }
}

impl AvpValue {
    /// Get the encoded payload length of this value
    pub fn encoded_len(&self) -> usize {
        match self {
            AvpValue::OctetString(b) => b.len(),
            AvpValue::Integer32(_)
            | AvpValue::Unsigned32(_)
            | AvpValue::Enumerated(_)
            | AvpValue::Float32(_)
            | AvpValue::Time(_) => 4,
            AvpValue::Integer64(_) | AvpValue::Unsigned64(_) | AvpValue::Float64(_) => 8,
            AvpValue::Address(addr) => match addr {
                IpAddr::V4(_) => 6,
                IpAddr::V6(_) => 18,
            },
            AvpValue::Utf8String(s) | AvpValue::Identity(s) | AvpValue::Uri(s) => s.len(),
            AvpValue::Grouped(avps) => avps.iter().map(Avp::encoded_len).sum(),
        }
    }

    /// Encode the payload to bytes (no header, no padding)
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            AvpValue::OctetString(b) => buf.put_slice(b),
            AvpValue::Integer32(v) | AvpValue::Enumerated(v) => buf.put_i32(*v),
            AvpValue::Integer64(v) => buf.put_i64(*v),
            AvpValue::Unsigned32(v) => buf.put_u32(*v),
            AvpValue::Unsigned64(v) => buf.put_u64(*v),
            AvpValue::Float32(v) => buf.put_f32(*v),
            AvpValue::Float64(v) => buf.put_f64(*v),
            AvpValue::Time(v) => buf.put_u32(*v),
            AvpValue::Address(addr) => match addr {
                IpAddr::V4(v4) => {
                    buf.put_u16(1);
                    buf.put_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    buf.put_u16(2);
                    buf.put_slice(&v6.octets());
                }
            },
            AvpValue::Utf8String(s) | AvpValue::Identity(s) | AvpValue::Uri(s) => {
                buf.put_slice(s.as_bytes())
            }
            AvpValue::Grouped(avps) => {
                for avp in avps {
                    avp.encode(buf);
                }
            }
        }
    }
}

/// Parse a payload as the given dictionary type. `None` means the payload
/// does not match the type; the caller falls back to OctetString.
fn parse_value(avp_type: AvpType, payload: &Bytes) -> Option<AvpValue> {
    match avp_type {
        AvpType::OctetString => Some(AvpValue::OctetString(payload.clone())),
        AvpType::Utf8String => std::str::from_utf8(payload)
            .ok()
            .map(|s| AvpValue::Utf8String(s.to_string())),
        AvpType::DiameterIdentity => std::str::from_utf8(payload)
            .ok()
            .map(|s| AvpValue::Identity(s.to_string())),
        AvpType::DiameterUri => std::str::from_utf8(payload)
            .ok()
            .map(|s| AvpValue::Uri(s.to_string())),
        AvpType::Integer32 => {
            let b: [u8; 4] = payload.as_ref().try_into().ok()?;
            Some(AvpValue::Integer32(i32::from_be_bytes(b)))
        }
        AvpType::Integer64 => {
            let b: [u8; 8] = payload.as_ref().try_into().ok()?;
            Some(AvpValue::Integer64(i64::from_be_bytes(b)))
        }
        AvpType::Unsigned32 => {
            let b: [u8; 4] = payload.as_ref().try_into().ok()?;
            Some(AvpValue::Unsigned32(u32::from_be_bytes(b)))
        }
        AvpType::Unsigned64 => {
            let b: [u8; 8] = payload.as_ref().try_into().ok()?;
            Some(AvpValue::Unsigned64(u64::from_be_bytes(b)))
        }
        AvpType::Float32 => {
            let b: [u8; 4] = payload.as_ref().try_into().ok()?;
            Some(AvpValue::Float32(f32::from_be_bytes(b)))
        }
        AvpType::Float64 => {
            let b: [u8; 8] = payload.as_ref().try_into().ok()?;
            Some(AvpValue::Float64(f64::from_be_bytes(b)))
        }
        AvpType::Time => {
            let b: [u8; 4] = payload.as_ref().try_into().ok()?;
            Some(AvpValue::Time(u32::from_be_bytes(b)))
        }
        AvpType::Enumerated => {
            let b: [u8; 4] = payload.as_ref().try_into().ok()?;
            Some(AvpValue::Enumerated(i32::from_be_bytes(b)))
        }
        AvpType::Address => {
            if payload.len() < 2 {
                return None;
            }
            let family = u16::from_be_bytes([payload[0], payload[1]]);
            match (family, payload.len()) {
                (1, 6) => {
                    let octets: [u8; 4] = payload[2..6].try_into().ok()?;
                    Some(AvpValue::Address(IpAddr::V4(Ipv4Addr::from(octets))))
                }
                (2, 18) => {
                    let octets: [u8; 16] = payload[2..18].try_into().ok()?;
                    Some(AvpValue::Address(IpAddr::V6(Ipv6Addr::from(octets))))
                }
                // unknown address family: keep the tag and bytes verbatim
                _ => None,
            }
        }
        AvpType::Grouped => {
            let mut inner = payload.clone();
            let mut avps = Vec::new();
            while inner.has_remaining() {
                match Avp::decode(&mut inner) {
                    Ok(avp) => avps.push(avp),
                    Err(_) => return None,
                }
            }
            Some(AvpValue::Grouped(avps))
        }
    }
}

/// Convert a Time AVP value (seconds since 1900) to a unix timestamp,
/// applying the RFC 2030 era rule: values below the 1968 cutoff belong to
/// the era starting 7 February 2036.
pub fn time_to_unix(seconds_since_1900: u32) -> u64 {
    if seconds_since_1900 < NTP_ERA_CUTOFF {
        u64::from(seconds_since_1900) + NTP_ERA1_UNIX_BASE
    } else {
        u64::from(seconds_since_1900) - NTP_UNIX_OFFSET
    }
}

/// Convert a unix timestamp to a Time AVP value. Timestamps past the 2036
/// rollover wrap into the second NTP era.
pub fn unix_to_time(unix_seconds: u64) -> u32 {
    (unix_seconds.wrapping_add(NTP_UNIX_OFFSET) & 0xffff_ffff) as u32
}

/// Find the first AVP with the given code in a list
pub fn find_avp(avps: &[Avp], code: u32) -> Option<&Avp> {
    avps.iter().find(|a| a.code == code && a.vendor_id.is_none())
}

/// Find the first AVP with the given code and vendor ID in a list
pub fn find_vendor_avp(avps: &[Avp], code: u32, vendor_id: u32) -> Option<&Avp> {
    avps.iter()
        .find(|a| a.code == code && a.vendor_id == Some(vendor_id))
}

/// Find all top-level AVPs with a given code
pub fn find_all_avps(avps: &[Avp], code: u32) -> Vec<&Avp> {
    avps.iter().filter(|a| a.code == code).collect()
}

/// Find all AVPs with the given (code, vendor) anywhere in the tree.
///
/// Grouped AVPs are searched depth-first and matches are returned in
/// document order; an intermediate group that appears several times
/// contributes its matches each time it appears.
pub fn find_avps_deep(avps: &[Avp], code: u32, vendor_id: u32) -> Vec<&Avp> {
    let mut found = Vec::new();
    collect_deep(avps, code, vendor_id, &mut found);
    found
}

fn collect_deep<'a>(avps: &'a [Avp], code: u32, vendor_id: u32, out: &mut Vec<&'a Avp>) {
    for avp in avps {
        if avp.code == code && avp.vendor_id.unwrap_or(0) == vendor_id {
            out.push(avp);
        }
        if let AvpValue::Grouped(inner) = &avp.value {
            collect_deep(inner, code, vendor_id, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::avp_code;
    use proptest::prelude::*;

    fn encode_to_bytes(avp: &Avp) -> Bytes {
        let mut buf = BytesMut::new();
        avp.encode(&mut buf);
        buf.freeze()
    }

    #[test]
    fn test_service_context_id_wire_format() {
        // Service-Context-Id (461), M flag, "32251@3gpp.org"
        let avp = Avp::mandatory(
            avp_code::SERVICE_CONTEXT_ID,
            AvpValue::Utf8String("32251@3gpp.org".to_string()),
        );
        let encoded = encode_to_bytes(&avp);
        let expected: &[u8] = &[
            0x00, 0x00, 0x01, 0xcd, 0x40, 0x00, 0x00, 0x16, 0x33, 0x32, 0x32, 0x35, 0x31, 0x40,
            0x33, 0x67, 0x70, 0x70, 0x2e, 0x6f, 0x72, 0x67, 0x00, 0x00,
        ];
        assert_eq!(encoded.as_ref(), expected);

        let mut bytes = encoded.clone();
        let decoded = Avp::decode(&mut bytes).unwrap();
        assert_eq!(decoded, avp);
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn test_avp_encode_decode_u32() {
        let avp = Avp::mandatory(avp_code::RESULT_CODE, AvpValue::Unsigned32(2001));
        let mut bytes = encode_to_bytes(&avp);
        let decoded = Avp::decode(&mut bytes).unwrap();
        assert_eq!(decoded.code, avp_code::RESULT_CODE);
        assert_eq!(decoded.as_u32(), Some(2001));
    }

    #[test]
    fn test_avp_zero_payload_is_legal() {
        let avp = Avp::mandatory(avp_code::SESSION_ID, AvpValue::Utf8String(String::new()));
        let encoded = encode_to_bytes(&avp);
        assert_eq!(encoded.len(), AVP_HEADER_SIZE);
        let mut bytes = encoded;
        let decoded = Avp::decode(&mut bytes).unwrap();
        assert_eq!(decoded.value, AvpValue::Utf8String(String::new()));
    }

    #[test]
    fn test_vendor_avp_round_trip() {
        let avp = Avp::vendor_mandatory(628, 10415, AvpValue::OctetString(Bytes::from_static(b"x")));
        assert!(avp.is_vendor_specific());
        let mut bytes = encode_to_bytes(&avp);
        let decoded = Avp::decode(&mut bytes).unwrap();
        assert_eq!(decoded.vendor_id, Some(10415));
        assert_eq!(decoded.code, 628);
    }

    #[test]
    fn test_vendor_flag_tracks_vendor_id() {
        let avp = Avp::new(1, avp_flags::VENDOR | avp_flags::MANDATORY, None, AvpValue::Unsigned32(1));
        assert!(!avp.is_vendor_specific());
        let avp = Avp::new(1, 0, Some(99), AvpValue::Unsigned32(1));
        assert!(avp.is_vendor_specific());
    }

    #[test]
    fn test_address_ipv4_round_trip() {
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        let avp = Avp::mandatory(avp_code::HOST_IP_ADDRESS, AvpValue::Address(addr));
        let encoded = encode_to_bytes(&avp);
        // 2-byte family tag + 4 address bytes
        assert_eq!(&encoded[8..10], &[0x00, 0x01]);
        let mut bytes = encoded;
        let decoded = Avp::decode(&mut bytes).unwrap();
        assert_eq!(decoded.as_address(), Some(addr));
    }

    #[test]
    fn test_address_unknown_family_preserved() {
        // Address family 8 (E.164) is not parsed; the payload must survive
        // a decode/encode round trip including the family tag.
        let payload = Bytes::from_static(&[0x00, 0x08, 0x34, 0x31, 0x37, 0x38]);
        let avp = Avp::mandatory(avp_code::HOST_IP_ADDRESS, AvpValue::OctetString(payload.clone()));
        let encoded = encode_to_bytes(&avp);
        let mut bytes = encoded.clone();
        let decoded = Avp::decode(&mut bytes).unwrap();
        assert_eq!(decoded.value, AvpValue::OctetString(payload));
        assert_eq!(encode_to_bytes(&decoded), encoded);
    }

    #[test]
    fn test_grouped_round_trip() {
        let inner = vec![
            Avp::mandatory(avp_code::VENDOR_ID, AvpValue::Unsigned32(10415)),
            Avp::mandatory(avp_code::AUTH_APPLICATION_ID, AvpValue::Unsigned32(4)),
        ];
        let avp = Avp::mandatory(
            avp_code::VENDOR_SPECIFIC_APPLICATION_ID,
            AvpValue::Grouped(inner.clone()),
        );
        let mut bytes = encode_to_bytes(&avp);
        let decoded = Avp::decode(&mut bytes).unwrap();
        assert_eq!(decoded.as_grouped(), Some(inner.as_slice()));
    }

    #[test]
    fn test_decode_truncated_avp() {
        let avp = Avp::mandatory(avp_code::RESULT_CODE, AvpValue::Unsigned32(2001));
        let encoded = encode_to_bytes(&avp);
        let mut short = encoded.slice(..6);
        assert!(matches!(
            Avp::decode(&mut short),
            Err(DiameterError::MalformedAvp(_))
        ));
    }

    #[test]
    fn test_decode_length_below_header() {
        // length field of 4 is below the 8-byte header
        let raw: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x04];
        let mut bytes = Bytes::copy_from_slice(raw);
        assert!(matches!(
            Avp::decode(&mut bytes),
            Err(DiameterError::MalformedAvp(_))
        ));
    }

    #[test]
    fn test_time_era_conversion() {
        // era 0: 2004-ish timestamps have the MSB set
        let secs = unix_to_time(1_100_000_000);
        assert!(secs >= NTP_ERA_CUTOFF);
        assert_eq!(time_to_unix(secs), 1_100_000_000);
        // era 1: post-2036 timestamps wrap below the cutoff
        let secs = unix_to_time(2_200_000_000);
        assert!(secs < NTP_ERA_CUTOFF);
        assert_eq!(time_to_unix(secs), 2_200_000_000);
    }

    #[test]
    fn test_find_avps_deep_document_order() {
        let leaf = |v: u32| Avp::mandatory(avp_code::VENDOR_ID, AvpValue::Unsigned32(v));
        let group = |avps: Vec<Avp>| {
            Avp::mandatory(avp_code::VENDOR_SPECIFIC_APPLICATION_ID, AvpValue::Grouped(avps))
        };
        // the same intermediate group shape appears twice
        let avps = vec![
            group(vec![leaf(1), group(vec![leaf(2)])]),
            leaf(3),
            group(vec![leaf(4)]),
        ];
        let found = find_avps_deep(&avps, avp_code::VENDOR_ID, 0);
        let values: Vec<u32> = found.iter().filter_map(|a| a.as_u32()).collect();
        assert_eq!(values, vec![1, 2, 3, 4]);
    }

    proptest! {
        /// Unknown AVPs round-trip bit-exactly through decode(encode(a)).
        #[test]
        fn prop_unknown_avp_round_trip(
            code in 1_000_000u32..2_000_000,
            vendor in prop::option::of(1u32..100_000),
            mandatory in any::<bool>(),
            payload in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let flags = if mandatory { avp_flags::MANDATORY } else { 0 };
            let avp = Avp::new(
                code,
                flags,
                vendor,
                AvpValue::OctetString(Bytes::from(payload)),
            );
            let mut buf = BytesMut::new();
            avp.encode(&mut buf);
            let encoded = buf.freeze();
            prop_assert_eq!(encoded.len() % 4, 0);

            let mut bytes = encoded.clone();
            let decoded = Avp::decode(&mut bytes).unwrap();
            prop_assert!(!bytes.has_remaining());
            prop_assert_eq!(&decoded, &avp);

            let mut again = BytesMut::new();
            decoded.encode(&mut again);
            prop_assert_eq!(again.freeze(), encoded);
        }
    }
}
