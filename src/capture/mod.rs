//! Frame I/O for attached host devices
//!
//! The router core only sees frames and interface ids; this module is the
//! boundary to the host NICs listed under `[[attach]]`.

mod af_packet;

pub use af_packet::AfPacketSocket;

use crate::Result;
use std::future::Future;

/// Raw Ethernet frame source and sink
///
/// Both directions take `&self` so one handle can be shared between a
/// reader task and the event loop.
pub trait FrameIo: Send + Sync {
    /// Host device name
    fn device(&self) -> &str;

    /// Receive one frame into `buf`, returning its length
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Send one complete frame
    fn send(&self, frame: &[u8]) -> impl Future<Output = Result<()>> + Send;
}
