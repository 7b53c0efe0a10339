//! IPv4 (RFC 791) header handling and CIDR prefixes

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::L4Protocol;
use crate::{Error, Result};

pub const MIN_HEADER_SIZE: usize = 20;
pub const DEFAULT_TTL: u8 = 64;

fn ip_at(buffer: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    )
}

/// One's complement sum folded to 16 bits, not yet inverted.
fn ones_complement_sum(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum
}

/// Internet checksum (RFC 1071)
pub fn checksum(data: &[u8]) -> u16 {
    !(ones_complement_sum(0, data) as u16)
}

/// TCP/UDP checksum over the IPv4 pseudo header and the segment.
pub fn pseudo_header_checksum(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    segment: &[u8],
) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    let sum = ones_complement_sum(ones_complement_sum(0, &pseudo), segment);
    !(sum as u16)
}

/// Owned IPv4 packet that can be rewritten in place.
///
/// The buffer is trimmed to the header's total length so Ethernet padding
/// never leaks into transport checksums.
#[derive(Debug, Clone)]
pub struct Ipv4Packet {
    buffer: Vec<u8>,
    header_len: usize,
}

impl Ipv4Packet {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("IPv4 packet too short".into()));
        }
        if data[0] >> 4 != 4 {
            return Err(Error::Parse("not an IPv4 packet".into()));
        }
        let header_len = ((data[0] & 0x0f) as usize) * 4;
        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if header_len < MIN_HEADER_SIZE || total_len < header_len || data.len() < total_len {
            return Err(Error::Parse("IPv4 length fields inconsistent".into()));
        }
        Ok(Self {
            buffer: data[..total_len].to_vec(),
            header_len,
        })
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        ip_at(&self.buffer, 12)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        ip_at(&self.buffer, 16)
    }

    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.buffer[12..16].copy_from_slice(&addr.octets());
        self.update_checksum();
    }

    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.buffer[16..20].copy_from_slice(&addr.octets());
        self.update_checksum();
    }

    pub fn ttl(&self) -> u8 {
        self.buffer[8]
    }

    /// Returns false if the packet must not be forwarded any further.
    pub fn decrement_ttl(&mut self) -> bool {
        if self.buffer[8] <= 1 {
            return false;
        }
        self.buffer[8] -= 1;
        self.update_checksum();
        true
    }

    pub fn protocol(&self) -> u8 {
        self.buffer[9]
    }

    pub fn l4_protocol(&self) -> Option<L4Protocol> {
        L4Protocol::from_ip_protocol(self.protocol())
    }

    /// True for any fragment but the first one.
    pub fn is_trailing_fragment(&self) -> bool {
        u16::from_be_bytes([self.buffer[6] & 0x1f, self.buffer[7]]) != 0
    }

    pub fn is_fragment(&self) -> bool {
        self.buffer[6] & 0x20 != 0 || self.is_trailing_fragment()
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn header_checksum_valid(&self) -> bool {
        checksum(&self.buffer[..self.header_len]) == 0
    }

    pub fn update_checksum(&mut self) {
        self.buffer[10] = 0;
        self.buffer[11] = 0;
        let sum = checksum(&self.buffer[..self.header_len]);
        self.buffer[10..12].copy_from_slice(&sum.to_be_bytes());
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.header_len..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.header_len..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Builder for router-originated IPv4 packets
#[derive(Debug, Clone)]
pub struct Ipv4Builder {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    ttl: u8,
    identification: u16,
}

impl Ipv4Builder {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8) -> Self {
        Self {
            src,
            dst,
            protocol,
            ttl: DEFAULT_TTL,
            identification: 0,
        }
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn identification(mut self, id: u16) -> Self {
        self.identification = id;
        self
    }

    pub fn build(self, payload: &[u8]) -> Vec<u8> {
        let total_len = (MIN_HEADER_SIZE + payload.len()) as u16;
        let mut buf = Vec::with_capacity(total_len as usize);
        buf.push(0x45);
        buf.push(0);
        buf.extend_from_slice(&total_len.to_be_bytes());
        buf.extend_from_slice(&self.identification.to_be_bytes());
        // don't fragment
        buf.extend_from_slice(&[0x40, 0x00]);
        buf.push(self.ttl);
        buf.push(self.protocol);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.src.octets());
        buf.extend_from_slice(&self.dst.octets());
        let sum = checksum(&buf[..MIN_HEADER_SIZE]);
        buf[10..12].copy_from_slice(&sum.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }
}

/// Address with prefix length, e.g. `10.0.1.1/24`.
///
/// The host bits are preserved so the same type describes both a router
/// interface address and a destination prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(Error::Parse(format!("prefix length {prefix_len} > 32")));
        }
        Ok(Self { addr, prefix_len })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::MAX.checked_shl(32 - self.prefix_len as u32).unwrap_or(0);
        Ipv4Addr::from(bits)
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & u32::from(self.netmask()))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) | !u32::from(self.netmask()))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask());
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::Parse(format!("missing prefix length in '{s}'")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::Parse(format!("invalid IPv4 address in '{s}'")))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| Error::Parse(format!("invalid prefix length in '{s}'")))?;
        Ipv4Cidr::new(addr, prefix_len)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
