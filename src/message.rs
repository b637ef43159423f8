//! Diameter message header and message types
//!
//! Message format (RFC 6733):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |                 Message Length                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | command flags |                  Command-Code                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Application-ID                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Hop-by-Hop Identifier                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      End-to-End Identifier                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  AVPs ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::avp::Avp;
use crate::common::avp_code;
use crate::error::{DiameterError, DiameterResult};
use crate::DIAMETER_VERSION;

/// Diameter message header size
pub const DIAMETER_HEADER_SIZE: usize = 20;

/// Command flags
pub mod cmd_flags {
    /// Request bit
    pub const REQUEST: u8 = 0x80;
    /// Proxiable bit
    pub const PROXIABLE: u8 = 0x40;
    /// Error bit
    pub const ERROR: u8 = 0x20;
    /// Potentially re-transmitted bit
    pub const RETRANSMIT: u8 = 0x10;
    /// The low four bits are reserved and must be zero
    pub const RESERVED: u8 = 0x0f;
}

/// Diameter message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiameterHeader {
    /// Protocol version (always 1)
    pub version: u8,
    /// Message length including header and padded AVPs; recomputed on encode
    pub length: u32,
    /// Command flags
    pub flags: u8,
    /// Command code
    pub command_code: u32,
    /// Application ID
    pub application_id: u32,
    /// Hop-by-Hop identifier
    pub hop_by_hop_id: u32,
    /// End-to-End identifier
    pub end_to_end_id: u32,
}

impl DiameterHeader {
    /// Create a new request header
    pub fn new_request(command_code: u32, application_id: u32) -> Self {
        Self {
            version: DIAMETER_VERSION,
            length: DIAMETER_HEADER_SIZE as u32,
            flags: cmd_flags::REQUEST | cmd_flags::PROXIABLE,
            command_code,
            application_id,
            hop_by_hop_id: 0,
            end_to_end_id: 0,
        }
    }

    /// Create an answer header from a request header. The request bit is
    /// cleared, the proxiable bit carried over, identifiers copied.
    pub fn new_answer(request: &DiameterHeader) -> Self {
        Self {
            version: DIAMETER_VERSION,
            length: DIAMETER_HEADER_SIZE as u32,
            flags: request.flags & cmd_flags::PROXIABLE,
            command_code: request.command_code,
            application_id: request.application_id,
            hop_by_hop_id: request.hop_by_hop_id,
            end_to_end_id: request.end_to_end_id,
        }
    }

    /// Check if this is a request
    pub fn is_request(&self) -> bool {
        self.flags & cmd_flags::REQUEST != 0
    }

    /// Check if this is an answer
    pub fn is_answer(&self) -> bool {
        !self.is_request()
    }

    /// Check if this is proxiable
    pub fn is_proxiable(&self) -> bool {
        self.flags & cmd_flags::PROXIABLE != 0
    }

    /// Check if the error bit is set
    pub fn is_error(&self) -> bool {
        self.flags & cmd_flags::ERROR != 0
    }

    /// Check if the retransmit (T) bit is set
    pub fn is_retransmit(&self) -> bool {
        self.flags & cmd_flags::RETRANSMIT != 0
    }

    /// Check that the reserved flag bits are zero and the T bit is only
    /// present on requests
    pub fn has_valid_flags(&self) -> bool {
        if self.flags & cmd_flags::RESERVED != 0 {
            return false;
        }
        !(self.is_retransmit() && !self.is_request())
    }

    /// Set the error flag
    pub fn set_error(&mut self) {
        self.flags |= cmd_flags::ERROR;
    }

    /// Mark a request as potentially retransmitted
    pub fn set_retransmit(&mut self) {
        if self.is_request() {
            self.flags |= cmd_flags::RETRANSMIT;
        }
    }

    /// Encode header to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(((self.length >> 16) & 0xff) as u8);
        buf.put_u16((self.length & 0xffff) as u16);
        buf.put_u8(self.flags);
        buf.put_u8(((self.command_code >> 16) & 0xff) as u8);
        buf.put_u16((self.command_code & 0xffff) as u16);
        buf.put_u32(self.application_id);
        buf.put_u32(self.hop_by_hop_id);
        buf.put_u32(self.end_to_end_id);
    }

    /// Decode header from bytes
    pub fn decode(buf: &mut Bytes) -> DiameterResult<Self> {
        if buf.remaining() < DIAMETER_HEADER_SIZE {
            return Err(DiameterError::MalformedMessage(format!(
                "need {} header bytes, have {}",
                DIAMETER_HEADER_SIZE,
                buf.remaining()
            )));
        }

        let version = buf.get_u8();
        if version != DIAMETER_VERSION {
            return Err(DiameterError::UnsupportedVersion(version));
        }

        let len_high = buf.get_u8() as u32;
        let len_low = buf.get_u16() as u32;
        let length = (len_high << 16) | len_low;

        let flags = buf.get_u8();
        let cmd_high = buf.get_u8() as u32;
        let cmd_low = buf.get_u16() as u32;
        let command_code = (cmd_high << 16) | cmd_low;

        let application_id = buf.get_u32();
        let hop_by_hop_id = buf.get_u32();
        let end_to_end_id = buf.get_u32();

        Ok(Self {
            version,
            length,
            flags,
            command_code,
            application_id,
            hop_by_hop_id,
            end_to_end_id,
        })
    }
}

/// Diameter message (header + ordered AVPs)
#[derive(Debug, Clone, PartialEq)]
pub struct DiameterMessage {
    /// Message header
    pub header: DiameterHeader,
    /// AVPs, in wire order
    pub avps: Vec<Avp>,
}

impl DiameterMessage {
    /// Create a new message
    pub fn new(header: DiameterHeader, avps: Vec<Avp>) -> Self {
        Self { header, avps }
    }

    /// Create a new request message
    pub fn new_request(command_code: u32, application_id: u32) -> Self {
        Self {
            header: DiameterHeader::new_request(command_code, application_id),
            avps: Vec::new(),
        }
    }

    /// Create a new answer message from a request
    pub fn new_answer(request: &DiameterMessage) -> Self {
        Self {
            header: DiameterHeader::new_answer(&request.header),
            avps: Vec::new(),
        }
    }

    /// Append an AVP
    pub fn add_avp(&mut self, avp: Avp) {
        self.avps.push(avp);
    }

    /// Find the first top-level AVP by code
    pub fn find_avp(&self, code: u32) -> Option<&Avp> {
        crate::avp::find_avp(&self.avps, code)
    }

    /// Find the first top-level AVP by code and vendor ID
    pub fn find_vendor_avp(&self, code: u32, vendor_id: u32) -> Option<&Avp> {
        crate::avp::find_vendor_avp(&self.avps, code, vendor_id)
    }

    /// Find all matching AVPs anywhere in the tree, depth-first, in
    /// document order
    pub fn find_avps_deep(&self, code: u32, vendor_id: u32) -> Vec<&Avp> {
        crate::avp::find_avps_deep(&self.avps, code, vendor_id)
    }

    /// Total encoded message length, including header and AVP padding
    pub fn calculate_length(&self) -> u32 {
        let avp_len: usize = self.avps.iter().map(Avp::encoded_len).sum();
        (DIAMETER_HEADER_SIZE + avp_len) as u32
    }

    /// Encode the message; the header length field is recomputed
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.calculate_length() as usize);

        let mut header = self.header.clone();
        header.length = self.calculate_length();
        header.encode(&mut buf);

        for avp in &self.avps {
            avp.encode(&mut buf);
        }

        buf
    }

    /// Decode a message. Exactly `header.length` bytes are consumed from
    /// the input; trailing bytes are left untouched.
    pub fn decode(buf: &mut Bytes) -> DiameterResult<Self> {
        let header = DiameterHeader::decode(buf)?;

        if (header.length as usize) < DIAMETER_HEADER_SIZE {
            return Err(DiameterError::MalformedMessage(format!(
                "message length {} below header size",
                header.length
            )));
        }
        let avp_len = header.length as usize - DIAMETER_HEADER_SIZE;
        if buf.remaining() < avp_len {
            return Err(DiameterError::MalformedMessage(format!(
                "message length {} exceeds available bytes",
                header.length
            )));
        }

        let mut avp_buf = buf.copy_to_bytes(avp_len);
        let mut avps = Vec::new();

        while avp_buf.has_remaining() {
            let avp = Avp::decode(&mut avp_buf)?;
            avps.push(avp);
        }

        Ok(Self { header, avps })
    }

    /// Session-Id AVP value
    pub fn session_id(&self) -> Option<&str> {
        self.find_avp(avp_code::SESSION_ID)?.as_str()
    }

    /// Origin-Host AVP value
    pub fn origin_host(&self) -> Option<&str> {
        self.find_avp(avp_code::ORIGIN_HOST)?.as_str()
    }

    /// Origin-Realm AVP value
    pub fn origin_realm(&self) -> Option<&str> {
        self.find_avp(avp_code::ORIGIN_REALM)?.as_str()
    }

    /// Destination-Host AVP value
    pub fn destination_host(&self) -> Option<&str> {
        self.find_avp(avp_code::DESTINATION_HOST)?.as_str()
    }

    /// Destination-Realm AVP value
    pub fn destination_realm(&self) -> Option<&str> {
        self.find_avp(avp_code::DESTINATION_REALM)?.as_str()
    }

    /// Result-Code AVP value
    pub fn result_code(&self) -> Option<u32> {
        self.find_avp(avp_code::RESULT_CODE)?.as_u32()
    }

    /// Origin-State-Id AVP value
    pub fn origin_state_id(&self) -> Option<u32> {
        self.find_avp(avp_code::ORIGIN_STATE_ID)?.as_u32()
    }
}
