//! ICMP (RFC 792): echo handling and error messages

use super::ipv4::checksum;
use crate::{Error, Result};

pub const HEADER_SIZE: usize = 8;
pub const PROTOCOL_NUMBER: u8 = 1;

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_DEST_UNREACHABLE: u8 = 3;
pub const TYPE_ECHO_REQUEST: u8 = 8;
pub const TYPE_TIME_EXCEEDED: u8 = 11;

pub const CODE_NET_UNREACHABLE: u8 = 0;
pub const CODE_HOST_UNREACHABLE: u8 = 1;

/// Parsed ICMP message (zero-copy reference)
#[derive(Debug)]
pub struct IcmpPacket<'a> {
    buffer: &'a [u8],
}

impl<'a> IcmpPacket<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("ICMP message too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn icmp_type(&self) -> u8 {
        self.buffer[0]
    }

    pub fn code(&self) -> u8 {
        self.buffer[1]
    }

    /// Echo identifier; only meaningful for echo request/reply.
    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    pub fn is_echo_request(&self) -> bool {
        self.icmp_type() == TYPE_ECHO_REQUEST
    }

    pub fn is_echo(&self) -> bool {
        matches!(self.icmp_type(), TYPE_ECHO_REQUEST | TYPE_ECHO_REPLY)
    }

    pub fn checksum_valid(&self) -> bool {
        checksum(self.buffer) == 0
    }
}

pub fn set_identifier(message: &mut [u8], id: u16) {
    message[4..6].copy_from_slice(&id.to_be_bytes());
}

pub fn update_checksum(message: &mut [u8]) {
    message[2] = 0;
    message[3] = 0;
    let sum = checksum(message);
    message[2..4].copy_from_slice(&sum.to_be_bytes());
}

pub fn echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut message = vec![TYPE_ECHO_REQUEST, 0, 0, 0];
    message.extend_from_slice(&identifier.to_be_bytes());
    message.extend_from_slice(&sequence.to_be_bytes());
    message.extend_from_slice(payload);
    update_checksum(&mut message);
    message
}

/// Turn an echo request into the matching reply.
pub fn echo_reply(request: &[u8]) -> Result<Vec<u8>> {
    let parsed = IcmpPacket::parse(request)?;
    if !parsed.is_echo_request() {
        return Err(Error::InvalidPacket("not an echo request".into()));
    }
    let mut reply = request.to_vec();
    reply[0] = TYPE_ECHO_REPLY;
    update_checksum(&mut reply);
    Ok(reply)
}

/// Destination-unreachable quoting the offending IP header plus 8 payload bytes.
pub fn destination_unreachable(code: u8, original_ip: &[u8], header_len: usize) -> Vec<u8> {
    let quoted = original_ip.len().min(header_len + 8);
    let mut message = vec![TYPE_DEST_UNREACHABLE, code, 0, 0, 0, 0, 0, 0];
    message.extend_from_slice(&original_ip[..quoted]);
    update_checksum(&mut message);
    message
}
