//! DHCPv4 messages (RFC 2131, RFC 2132)

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use super::MacAddr;
use crate::{Error, Result};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

/// Fixed BOOTP header size before the magic cookie
pub const HEADER_SIZE: usize = 236;
pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
/// BOOTP minimum message length (RFC 1542)
const MIN_MESSAGE_SIZE: usize = 300;

const FLAG_BROADCAST: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootpOp {
    Request = 1,
    Reply = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => MessageType::Discover,
            2 => MessageType::Offer,
            3 => MessageType::Request,
            4 => MessageType::Decline,
            5 => MessageType::Ack,
            6 => MessageType::Nak,
            7 => MessageType::Release,
            8 => MessageType::Inform,
            _ => return None,
        })
    }
}

/// Option codes
pub mod options {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS_SERVER: u8 = 6;
    pub const BROADCAST_ADDR: u8 = 28;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_REQUEST: u8 = 55;
    pub const RENEWAL_TIME: u8 = 58;
    pub const REBINDING_TIME: u8 = 59;
    pub const END: u8 = 255;
}

/// Owned DHCP message with its options keyed by code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: BootpOp,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: MacAddr,
    pub options: BTreeMap<u8, Vec<u8>>,
}

fn ip_at(buffer: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    )
}

fn ip_option(value: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = value.get(..4)?.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

impl DhcpMessage {
    pub fn new(op: BootpOp, message_type: MessageType, xid: u32, chaddr: MacAddr) -> Self {
        let mut message = Self {
            op,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: BTreeMap::new(),
        };
        message.set_option(options::MESSAGE_TYPE, vec![message_type as u8]);
        message
    }

    /// Server reply skeleton echoing the request's transaction fields.
    pub fn reply_to(request: &DhcpMessage, message_type: MessageType) -> Self {
        let mut reply = Self::new(BootpOp::Reply, message_type, request.xid, request.chaddr);
        reply.flags = request.flags;
        reply.giaddr = request.giaddr;
        reply
    }

    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE + MAGIC_COOKIE.len() {
            return Err(Error::Parse("DHCP message too short".into()));
        }
        if buffer[HEADER_SIZE..HEADER_SIZE + 4] != MAGIC_COOKIE {
            return Err(Error::Parse("invalid DHCP magic cookie".into()));
        }
        let op = match buffer[0] {
            1 => BootpOp::Request,
            2 => BootpOp::Reply,
            other => return Err(Error::Parse(format!("invalid BOOTP op {other}"))),
        };
        if buffer[1] != 1 || buffer[2] != 6 {
            return Err(Error::Parse("DHCP hardware type is not Ethernet".into()));
        }

        let mut options = BTreeMap::new();
        let mut rest = &buffer[HEADER_SIZE + 4..];
        while let Some((&code, tail)) = rest.split_first() {
            match code {
                options::PAD => rest = tail,
                options::END => break,
                _ => {
                    let (&len, tail) = tail
                        .split_first()
                        .ok_or_else(|| Error::Parse("DHCP option length missing".into()))?;
                    let len = len as usize;
                    if tail.len() < len {
                        return Err(Error::Parse(format!("DHCP option {code} truncated")));
                    }
                    options
                        .entry(code)
                        .or_insert_with(Vec::new)
                        .extend_from_slice(&tail[..len]);
                    rest = &tail[len..];
                }
            }
        }

        Ok(Self {
            op,
            xid: u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]),
            secs: u16::from_be_bytes([buffer[8], buffer[9]]),
            flags: u16::from_be_bytes([buffer[10], buffer[11]]),
            ciaddr: ip_at(buffer, 12),
            yiaddr: ip_at(buffer, 16),
            siaddr: ip_at(buffer, 20),
            giaddr: ip_at(buffer, 24),
            chaddr: MacAddr::from_slice(&buffer[28..34]).unwrap_or_default(),
            options,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0] = self.op as u8;
        buf[1] = 1;
        buf[2] = 6;
        buf[4..8].copy_from_slice(&self.xid.to_be_bytes());
        buf[8..10].copy_from_slice(&self.secs.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ciaddr.octets());
        buf[16..20].copy_from_slice(&self.yiaddr.octets());
        buf[20..24].copy_from_slice(&self.siaddr.octets());
        buf[24..28].copy_from_slice(&self.giaddr.octets());
        buf[28..34].copy_from_slice(&self.chaddr.0);
        buf.extend_from_slice(&MAGIC_COOKIE);

        // message type leads so minimal clients find it early
        if let Some(value) = self.options.get(&options::MESSAGE_TYPE) {
            push_option(&mut buf, options::MESSAGE_TYPE, value);
        }
        for (&code, value) in self.options.iter() {
            if code != options::MESSAGE_TYPE {
                push_option(&mut buf, code, value);
            }
        }
        buf.push(options::END);
        if buf.len() < MIN_MESSAGE_SIZE {
            buf.resize(MIN_MESSAGE_SIZE, 0);
        }
        buf
    }

    pub fn set_option(&mut self, code: u8, value: Vec<u8>) {
        self.options.insert(code, value);
    }

    pub fn set_ip_option(&mut self, code: u8, ip: Ipv4Addr) {
        self.set_option(code, ip.octets().to_vec());
    }

    pub fn set_u32_option(&mut self, code: u8, value: u32) {
        self.set_option(code, value.to_be_bytes().to_vec());
    }

    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options.get(&code).map(Vec::as_slice)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.option(options::MESSAGE_TYPE)
            .and_then(|v| v.first())
            .and_then(|&t| MessageType::from_u8(t))
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.option(options::REQUESTED_IP).and_then(ip_option)
    }

    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.option(options::SERVER_ID).and_then(ip_option)
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.option(options::SUBNET_MASK).and_then(ip_option)
    }

    pub fn router(&self) -> Option<Ipv4Addr> {
        self.option(options::ROUTER).and_then(ip_option)
    }

    pub fn dns_server(&self) -> Option<Ipv4Addr> {
        self.option(options::DNS_SERVER).and_then(ip_option)
    }

    pub fn u32_option(&self, code: u8) -> Option<u32> {
        let bytes: [u8; 4] = self.option(code)?.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn lease_time(&self) -> Option<u32> {
        self.u32_option(options::LEASE_TIME)
    }

    pub fn wants_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    pub fn set_broadcast(&mut self) {
        self.flags |= FLAG_BROADCAST;
    }
}

fn push_option(buf: &mut Vec<u8>, code: u8, value: &[u8]) {
    // values longer than 255 bytes are split (RFC 3396)
    for chunk in value.chunks(255) {
        buf.push(code);
        buf.push(chunk.len() as u8);
        buf.extend_from_slice(chunk);
    }
    if value.is_empty() {
        buf.push(code);
        buf.push(0);
    }
}
