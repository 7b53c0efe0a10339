//! ARP for Ethernet/IPv4 (RFC 826)

use std::net::Ipv4Addr;

use super::ethernet::FrameBuilder;
use super::{EtherType, MacAddr};
use crate::{Error, Result};

pub const ARP_PACKET_SIZE: usize = 28;

const HTYPE_ETHERNET: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

fn ip_at(buffer: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    )
}

impl ArpPacket {
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < ARP_PACKET_SIZE {
            return Err(Error::Parse("ARP packet too short".into()));
        }
        let htype = u16::from_be_bytes([buffer[0], buffer[1]]);
        let ptype = u16::from_be_bytes([buffer[2], buffer[3]]);
        if htype != HTYPE_ETHERNET || ptype != EtherType::Ipv4 as u16 {
            return Err(Error::Parse("ARP is not Ethernet/IPv4".into()));
        }
        if buffer[4] != 6 || buffer[5] != 4 {
            return Err(Error::Parse("bad ARP address lengths".into()));
        }
        let operation = match u16::from_be_bytes([buffer[6], buffer[7]]) {
            1 => ArpOp::Request,
            2 => ArpOp::Reply,
            other => return Err(Error::Parse(format!("unknown ARP operation {other}"))),
        };

        Ok(Self {
            operation,
            sender_mac: MacAddr::from_slice(&buffer[8..14]).unwrap_or_default(),
            sender_ip: ip_at(buffer, 14),
            target_mac: MacAddr::from_slice(&buffer[18..24]).unwrap_or_default(),
            target_ip: ip_at(buffer, 24),
        })
    }

    pub fn to_bytes(&self) -> [u8; ARP_PACKET_SIZE] {
        let mut buf = [0u8; ARP_PACKET_SIZE];
        buf[0..2].copy_from_slice(&HTYPE_ETHERNET.to_be_bytes());
        buf[2..4].copy_from_slice(&(EtherType::Ipv4 as u16).to_be_bytes());
        buf[4] = 6;
        buf[5] = 4;
        buf[6..8].copy_from_slice(&(self.operation as u16).to_be_bytes());
        buf[8..14].copy_from_slice(&self.sender_mac.0);
        buf[14..18].copy_from_slice(&self.sender_ip.octets());
        buf[18..24].copy_from_slice(&self.target_mac.0);
        buf[24..28].copy_from_slice(&self.target_ip.octets());
        buf
    }

    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ArpOp::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    /// Answer a request on behalf of `ip`.
    pub fn reply_to(&self, mac: MacAddr, ip: Ipv4Addr) -> Self {
        Self {
            operation: ArpOp::Reply,
            sender_mac: mac,
            sender_ip: ip,
            target_mac: self.sender_mac,
            target_ip: self.sender_ip,
        }
    }

    /// Wrap into an Ethernet frame. Requests are broadcast, replies unicast.
    pub fn to_frame(&self) -> Vec<u8> {
        let dst = match self.operation {
            ArpOp::Request => MacAddr::BROADCAST,
            ArpOp::Reply => self.target_mac,
        };
        FrameBuilder::new(dst, self.sender_mac, EtherType::Arp as u16).build(&self.to_bytes())
    }
}
