//! TUN device support for the burrow DNS tunnel
//!
//! A thin Linux-only wrapper around `/dev/net/tun`: device creation and
//! address/MTU configuration via ioctls, async packet I/O via tokio's
//! `AsyncFd`. The kernel's 4-byte packet-information header is preserved
//! on read and expected on write, because the tunnel carries it end to end.

mod error;

#[cfg(target_os = "linux")]
mod device;

pub use error::{Error, Result};

#[cfg(target_os = "linux")]
pub use device::{is_tun_available, prefix_to_mask, TunConfig, TunDevice, TUN_HDR_LEN};
