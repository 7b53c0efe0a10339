use std::io;
use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("interface {name} not found")]
    InterfaceNotFound { name: String },

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("domain {name} not found")]
    UnknownDomain { name: String },

    #[error("no next hop for {0}")]
    NoNextHop(Ipv4Addr),

    #[error("domain {name} has a static IP config")]
    IpConfigStatic { name: String },

    #[error("no free port left")]
    PortExhausted,
}

pub type Result<T> = std::result::Result<T, Error>;
