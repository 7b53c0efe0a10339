//! UDP (RFC 768)

use std::net::Ipv4Addr;

use super::ipv4::pseudo_header_checksum;
use crate::{Error, Result};

pub const HEADER_SIZE: usize = 8;
pub const PROTOCOL_NUMBER: u8 = 17;

/// Parsed UDP header (zero-copy reference)
#[derive(Debug)]
pub struct UdpHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> UdpHeader<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("UDP header too short".into()));
        }
        let length = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;
        if length < HEADER_SIZE || length > buffer.len() {
            return Err(Error::Parse("UDP length invalid".into()));
        }
        Ok(Self {
            buffer: &buffer[..length],
        })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[HEADER_SIZE..]
    }
}

pub fn set_ports(datagram: &mut [u8], src_port: u16, dst_port: u16) {
    datagram[0..2].copy_from_slice(&src_port.to_be_bytes());
    datagram[2..4].copy_from_slice(&dst_port.to_be_bytes());
}

/// Refresh the checksum. A zero checksum means "not computed" and stays zero.
pub fn update_checksum(datagram: &mut [u8], src: Ipv4Addr, dst: Ipv4Addr) {
    if datagram[6] == 0 && datagram[7] == 0 {
        return;
    }
    datagram[6] = 0;
    datagram[7] = 0;
    let sum = match pseudo_header_checksum(src, dst, PROTOCOL_NUMBER, datagram) {
        0 => 0xffff,
        sum => sum,
    };
    datagram[6..8].copy_from_slice(&sum.to_be_bytes());
}

pub fn checksum_valid(datagram: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> bool {
    (datagram[6] == 0 && datagram[7] == 0)
        || pseudo_header_checksum(src, dst, PROTOCOL_NUMBER, datagram) == 0
}

/// Build a UDP datagram with checksum.
pub fn build(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_SIZE + payload.len()) as u16;
    let mut buf = Vec::with_capacity(length as usize);
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(&[0xff, 0xff]);
    buf.extend_from_slice(payload);
    update_checksum(&mut buf, src, dst);
    buf
}
