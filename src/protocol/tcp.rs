//! TCP (RFC 793) header access for link tracking and NAT

use std::net::Ipv4Addr;

use super::ipv4::pseudo_header_checksum;
use crate::{Error, Result};

pub const MIN_HEADER_SIZE: usize = 20;
pub const PROTOCOL_NUMBER: u8 = 6;

/// TCP control bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;

    pub fn fin(self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn rst(self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }
}

/// Parsed TCP header (zero-copy reference)
#[derive(Debug)]
pub struct TcpHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> TcpHeader<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("TCP header too short".into()));
        }
        let header_len = ((buffer[12] >> 4) as usize) * 4;
        if header_len < MIN_HEADER_SIZE || buffer.len() < header_len {
            return Err(Error::Parse("TCP data offset invalid".into()));
        }
        Ok(Self { buffer })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags(self.buffer[13])
    }
}

/// Rewrite both ports of a segment. The checksum must be refreshed afterwards.
pub fn set_ports(segment: &mut [u8], src_port: u16, dst_port: u16) {
    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
}

pub fn update_checksum(segment: &mut [u8], src: Ipv4Addr, dst: Ipv4Addr) {
    segment[16] = 0;
    segment[17] = 0;
    let sum = pseudo_header_checksum(src, dst, PROTOCOL_NUMBER, segment);
    segment[16..18].copy_from_slice(&sum.to_be_bytes());
}

pub fn checksum_valid(segment: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> bool {
    pseudo_header_checksum(src, dst, PROTOCOL_NUMBER, segment) == 0
}

/// Minimal segment builder (no options)
#[derive(Debug, Clone)]
pub struct TcpBuilder {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
}

impl TcpBuilder {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq: 0,
            ack: 0,
            flags: 0,
        }
    }

    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self.flags |= TcpFlags::ACK;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    pub fn build(self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; MIN_HEADER_SIZE];
        set_ports(&mut buf, self.src_port, self.dst_port);
        buf[4..8].copy_from_slice(&self.seq.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ack.to_be_bytes());
        buf[12] = 5 << 4;
        buf[13] = self.flags;
        buf[14..16].copy_from_slice(&64240u16.to_be_bytes());
        buf.extend_from_slice(payload);
        update_checksum(&mut buf, src, dst);
        buf
    }
}
