//! Ethernet II frame parsing and construction

use super::MacAddr;
use crate::{Error, Result};

/// Ethernet header size (no VLAN tag)
pub const HEADER_LEN: usize = 14;
/// Maximum Ethernet frame size without FCS
pub const MAX_FRAME_SIZE: usize = 1514;

/// Parsed Ethernet frame (zero-copy reference)
#[derive(Debug)]
pub struct Frame<'a> {
    buffer: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_LEN {
            return Err(Error::Parse("frame too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn dst_mac(&self) -> MacAddr {
        MacAddr::from_slice(&self.buffer[0..6]).unwrap_or_default()
    }

    pub fn src_mac(&self) -> MacAddr {
        MacAddr::from_slice(&self.buffer[6..12]).unwrap_or_default()
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.buffer[12], self.buffer[13]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[HEADER_LEN..]
    }
}

/// Rewrite the MAC addresses of a frame in place.
pub fn set_addresses(frame: &mut [u8], dst: MacAddr, src: MacAddr) {
    if frame.len() >= HEADER_LEN {
        frame[0..6].copy_from_slice(&dst.0);
        frame[6..12].copy_from_slice(&src.0);
    }
}

/// Builder for constructing Ethernet frames
pub struct FrameBuilder {
    dst: MacAddr,
    src: MacAddr,
    ethertype: u16,
}

impl FrameBuilder {
    pub fn new(dst: MacAddr, src: MacAddr, ethertype: u16) -> Self {
        Self { dst, src, ethertype }
    }

    pub fn build(self, payload: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(HEADER_LEN + payload.len());
        buffer.extend_from_slice(&self.dst.0);
        buffer.extend_from_slice(&self.src.0);
        buffer.extend_from_slice(&self.ethertype.to_be_bytes());
        buffer.extend_from_slice(payload);
        buffer
    }
}
