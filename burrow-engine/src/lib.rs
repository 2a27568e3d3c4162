//! Burrow tunnel server engine
//!
//! The server side of an IP-over-DNS tunnel: clients encode IP traffic into
//! DNS queries against a delegated zone, this engine answers them with the
//! return traffic and exchanges the reassembled packets with a local TUN
//! interface.
//!
//! ```text
//! ┌──────────────┐   queries    ┌─────────────────────────────┐
//! │ resolver(s)  │ ───────────► │  Server (one task)          │
//! │              │ ◄─────────── │   command dispatch           │
//! └──────────────┘   answers    │   per-user sessions          │
//!                               │   window buffers / qmem      │
//!                               │   answer cache / forwarder   │
//!                               └──────────┬──────────────────┘
//!                                          │ IP packets
//!                                     ┌────▼────┐
//!                                     │   TUN   │
//!                                     └─────────┘
//! ```

pub mod cache;
pub mod compress;
pub mod config;
mod error;
pub mod forward;
pub mod qmem;
mod server;
mod socket;
pub mod tun_io;
pub mod user;

pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
pub use tun_io::{ChannelTun, ChannelTunHandle, TunIo};
