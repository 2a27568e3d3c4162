//! Linux TUN device
//!
//! Opens `/dev/net/tun` directly and configures the interface through the
//! classic ioctl interface. The device is created *without* `IFF_NO_PI`:
//! the tunnel wire format carries the kernel's 4-byte packet-information
//! header inside every tunneled packet, so stripping it here would mean
//! re-synthesizing it on every hop.
//!
//! Requires root or `CAP_NET_ADMIN`.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;

use tokio::io::unix::AsyncFd;

use crate::error::{Error, Result};

const TUNSETIFF: libc::c_ulong = 0x4004_54CA;
const IFF_TUN: libc::c_short = 0x0001;

/// Size of the packet-information header the kernel prepends to every
/// packet read from the device.
pub const TUN_HDR_LEN: usize = 4;

/// TUN interface configuration.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Interface name, e.g. `burrow0`. At most 15 bytes.
    pub name: String,
    /// Address assigned to the interface (the server side of the subnet).
    pub ipv4: Ipv4Addr,
    /// Subnet prefix length.
    pub prefix_len: u8,
    pub mtu: u16,
}

impl TunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() >= libc::IFNAMSIZ {
            return Err(Error::Config(format!(
                "interface name '{}' must be 1..{} bytes",
                self.name,
                libc::IFNAMSIZ
            )));
        }
        if self.name.bytes().any(|b| b == 0 || b == b'/' || b == b' ') {
            return Err(Error::Config("interface name contains invalid bytes".into()));
        }
        if self.prefix_len > 30 {
            return Err(Error::Config(format!(
                "prefix length /{} leaves no client addresses",
                self.prefix_len
            )));
        }
        if self.mtu < 576 {
            return Err(Error::Config(format!("MTU {} is too small", self.mtu)));
        }
        Ok(())
    }

    /// Netmask corresponding to the prefix length.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_to_mask(self.prefix_len))
    }
}

/// Netmask bits for a prefix length.
pub fn prefix_to_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    }
}

/// Check if the TUN kernel interface is present.
pub fn is_tun_available() -> bool {
    std::path::Path::new("/dev/net/tun").exists()
}

/// An open, configured TUN device usable from async code.
pub struct TunDevice {
    fd: AsyncFd<File>,
    name: String,
    mtu: u16,
}

impl TunDevice {
    /// Create and bring up a TUN interface.
    pub fn open(config: &TunConfig) -> Result<Self> {
        config.validate()?;
        if !is_tun_available() {
            return Err(Error::Unavailable("/dev/net/tun does not exist".into()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| Error::DeviceCreation(format!("open /dev/net/tun: {}", e)))?;

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        copy_ifname(&mut ifr, &config.name)?;
        ifr.ifr_ifru.ifru_flags = IFF_TUN;

        // SAFETY: ifr is a fully initialized ifreq and fd is a tun fd.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(Error::DeviceCreation(format!(
                "TUNSETIFF: {}",
                io::Error::last_os_error()
            )));
        }

        set_ipv4_addr(&config.name, config.ipv4, libc::SIOCSIFADDR as _)?;
        set_ipv4_addr(
            &config.name,
            config.netmask(),
            libc::SIOCSIFNETMASK as _,
        )?;
        set_mtu(&config.name, config.mtu)?;
        set_flags_up(&config.name)?;

        set_nonblocking(file.as_raw_fd())?;
        let fd = AsyncFd::new(file)?;

        log::info!(
            "created TUN device {} ({} /{}, MTU {})",
            config.name,
            config.ipv4,
            config.prefix_len,
            config.mtu
        );

        Ok(TunDevice {
            fd,
            name: config.name.clone(),
            mtu: config.mtu,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Read one packet (including the 4-byte packet-info header).
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let res = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match res {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write one packet (including the 4-byte packet-info header).
    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            let res = guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.get_ref().as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match res {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .finish()
    }
}

fn copy_ifname(ifr: &mut libc::ifreq, name: &str) -> Result<()> {
    let c_name =
        CString::new(name).map_err(|_| Error::Config("invalid interface name".into()))?;
    let bytes = c_name.as_bytes_with_nul();
    if bytes.len() > libc::IFNAMSIZ {
        return Err(Error::Config("interface name too long".into()));
    }
    // SAFETY: bytes fits in ifr_name, checked above.
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            ifr.ifr_name.as_mut_ptr() as *mut u8,
            bytes.len(),
        );
    }
    Ok(())
}

/// Run one SIOCSIF* ioctl against a throwaway AF_INET socket.
fn if_ioctl(name: &str, request: libc::c_ulong, fill: impl FnOnce(&mut libc::ifreq)) -> Result<()> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let named = copy_ifname(&mut ifr, name);
    let result = match named {
        Ok(()) => {
            fill(&mut ifr);
            let ret = unsafe { libc::ioctl(sock, request as _, &ifr) };
            if ret < 0 {
                Err(Error::Io(io::Error::last_os_error()))
            } else {
                Ok(())
            }
        }
        Err(e) => Err(e),
    };

    unsafe { libc::close(sock) };
    result
}

fn set_ipv4_addr(name: &str, addr: Ipv4Addr, request: libc::c_ulong) -> Result<()> {
    if_ioctl(name, request, |ifr| {
        // SAFETY: sockaddr_in fits inside the ifreq address union.
        unsafe {
            let sin = &mut ifr.ifr_ifru.ifru_addr as *mut libc::sockaddr as *mut libc::sockaddr_in;
            (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
            (*sin).sin_port = 0;
            (*sin).sin_addr.s_addr = u32::from(addr).to_be();
        }
    })
}

fn set_mtu(name: &str, mtu: u16) -> Result<()> {
    if_ioctl(name, libc::SIOCSIFMTU as _, |ifr| {
        ifr.ifr_ifru.ifru_mtu = libc::c_int::from(mtu);
    })
}

fn set_flags_up(name: &str) -> Result<()> {
    if_ioctl(name, libc::SIOCSIFFLAGS as _, |ifr| {
        ifr.ifr_ifru.ifru_flags = (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    })
}

fn set_nonblocking(fd: libc::c_int) -> Result<()> {
    // SAFETY: plain fcntl on an owned fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TunConfig {
        TunConfig {
            name: "burrow0".into(),
            ipv4: Ipv4Addr::new(10, 0, 0, 1),
            prefix_len: 27,
            mtu: 1130,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());

        let mut bad = config();
        bad.name = "a-name-that-is-way-too-long".into();
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.name = String::new();
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.prefix_len = 31;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.mtu = 100;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_netmask() {
        assert_eq!(config().netmask(), Ipv4Addr::new(255, 255, 255, 224));
        assert_eq!(prefix_to_mask(0), 0);
        assert_eq!(prefix_to_mask(24), 0xFFFF_FF00);
        assert_eq!(prefix_to_mask(32), u32::MAX);
    }
}
