//! TUN I/O abstraction
//!
//! The event loop only needs "read a packet" and "write a packet", so it
//! talks to the device through this trait. The real implementation wraps
//! [`burrow_tun::TunDevice`]; tests plug in a channel-backed pair instead.

use std::io;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// Packet-level access to the tunnel interface.
#[async_trait]
pub trait TunIo: Send + Sync {
    /// Read one packet, 4-byte packet-info header included.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet, 4-byte packet-info header included.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

#[cfg(target_os = "linux")]
#[async_trait]
impl TunIo for burrow_tun::TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        burrow_tun::TunDevice::recv(self, buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        burrow_tun::TunDevice::send(self, buf).await
    }
}

/// In-memory tunnel endpoint backed by channels, for tests and tooling.
pub struct ChannelTun {
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    tx: mpsc::Sender<Vec<u8>>,
}

/// The far side of a [`ChannelTun`]: inject packets the server will read,
/// collect packets the server wrote.
pub struct ChannelTunHandle {
    pub inject: mpsc::Sender<Vec<u8>>,
    pub written: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl ChannelTun {
    /// Build a connected device/handle pair.
    pub fn pair() -> (ChannelTun, ChannelTunHandle) {
        let (inject_tx, inject_rx) = mpsc::channel(64);
        let (written_tx, written_rx) = mpsc::channel(64);
        (
            ChannelTun {
                rx: Mutex::new(inject_rx),
                tx: written_tx,
            },
            ChannelTunHandle {
                inject: inject_tx,
                written: Mutex::new(written_rx),
            },
        )
    }
}

#[async_trait]
impl TunIo for ChannelTun {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(pkt) => {
                let n = pkt.len().min(buf.len());
                buf[..n].copy_from_slice(&pkt[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tun channel closed",
            )),
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tun channel closed"))?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_tun_roundtrip() {
        let (tun, handle) = ChannelTun::pair();

        handle.inject.send(b"packet in".to_vec()).await.unwrap();
        let mut buf = [0u8; 64];
        let n = tun.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"packet in");

        tun.send(b"packet out").await.unwrap();
        let got = handle.written.lock().await.recv().await.unwrap();
        assert_eq!(got, b"packet out");
    }
}
