//! Burrow wire protocol
//!
//! Everything needed to speak the burrow IP-over-DNS tunnel protocol,
//! without any I/O: the qname payload encoders, a byte-transparent DNS
//! codec, the reliable sliding-window fragmentation layer, the frame
//! headers shared by both directions, the login authenticator and the
//! raw-UDP fallback framing.

pub mod auth;
pub mod dns;
pub mod encoder;
mod error;
pub mod frame;
pub mod raw;
pub mod window;

pub use encoder::NameEncoder;
pub use error::{Error, Result};
pub use window::{Fragment, WindowBuffer, WindowDir};

/// Protocol version exchanged during the `V` handshake, compared byte-exact.
pub const PROTOCOL_VERSION: u32 = 0x0000_0502;

/// Upper bound on a single fragment body, before encoding.
pub const MAX_FRAGSIZE: usize = 4096;
