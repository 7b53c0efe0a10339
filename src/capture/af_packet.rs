//! AF_PACKET socket bound to one host device

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;
use tracing::debug;

use super::FrameIo;
use crate::{Error, Result};

fn last_error() -> Error {
    Error::Io(io::Error::last_os_error())
}

/// Promiscuous raw socket; the router answers for its own MAC, not the
/// device's.
pub struct AfPacketSocket {
    fd: AsyncFd<RawFd>,
    device: String,
    ifindex: i32,
}

impl AfPacketSocket {
    pub fn bind(device: &str) -> Result<Self> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol as i32) };
        if fd < 0 {
            return Err(last_error());
        }

        match Self::configure(fd, device, protocol) {
            Ok(ifindex) => {
                let fd = AsyncFd::new(fd).map_err(|e| {
                    unsafe { libc::close(fd) };
                    Error::Io(e)
                })?;
                debug!("{}: AF_PACKET socket bound (ifindex {})", device, ifindex);
                Ok(Self {
                    fd,
                    device: device.to_string(),
                    ifindex,
                })
            }
            Err(e) => {
                unsafe { libc::close(fd) };
                Err(e)
            }
        }
    }

    fn configure(fd: RawFd, device: &str, protocol: u16) -> Result<i32> {
        let ifindex = interface_index(fd, device)?;

        let address = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: protocol,
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        let ret = unsafe {
            libc::bind(
                fd,
                &address as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if ret < 0 {
            return Err(last_error());
        }

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(last_error());
        }

        set_promiscuous(fd, ifindex, true)?;
        Ok(ifindex)
    }

    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }
}

fn interface_index(fd: RawFd, device: &str) -> Result<i32> {
    let not_found = || Error::InterfaceNotFound {
        name: device.to_string(),
    };
    let name = CString::new(device).map_err(|_| not_found())?;
    let bytes = name.as_bytes_with_nul();

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    if bytes.len() > ifr.ifr_name.len() {
        return Err(not_found());
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    if unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut ifr) } < 0 {
        return Err(not_found());
    }
    Ok(unsafe { ifr.ifr_ifru.ifru_ifindex })
}

fn set_promiscuous(fd: RawFd, ifindex: i32, enable: bool) -> Result<()> {
    let request = libc::packet_mreq {
        mr_ifindex: ifindex,
        mr_type: libc::PACKET_MR_PROMISC as u16,
        mr_alen: 0,
        mr_address: [0; 8],
    };
    let option = if enable {
        libc::PACKET_ADD_MEMBERSHIP
    } else {
        libc::PACKET_DROP_MEMBERSHIP
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            option,
            &request as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::packet_mreq>() as u32,
        )
    };
    if ret < 0 {
        return Err(last_error());
    }
    Ok(())
}

impl FrameIo for AfPacketSocket {
    fn device(&self) -> &str {
        &self.device
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let received = guard.try_io(|inner| {
                let n = unsafe { libc::recv(*inner.get_ref(), buf.as_mut_ptr() as *mut _, buf.len(), 0) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match received {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            let sent = guard.try_io(|inner| {
                let n = unsafe { libc::send(*inner.get_ref(), frame.as_ptr() as *const _, frame.len(), 0) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match sent {
                Ok(result) => {
                    let n = result?;
                    if n != frame.len() {
                        debug!("{}: short send {} of {}", self.device, n, frame.len());
                    }
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for AfPacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        *self.fd.get_ref()
    }
}

impl Drop for AfPacketSocket {
    fn drop(&mut self) {
        let fd = *self.fd.get_ref();
        let _ = set_promiscuous(fd, self.ifindex, false);
        unsafe { libc::close(fd) };
    }
}
