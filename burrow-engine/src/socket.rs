//! UDP socket construction
//!
//! DNS sockets are built through `socket2` so reuse and buffer options can
//! be set before binding, then handed to tokio.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Receive/send buffer size. Bursts of retransmitting resolvers arrive
/// faster than the single-threaded loop drains them.
const UDP_BUFFER_SIZE: usize = 1 << 20;

/// Bind a non-blocking UDP socket suitable for the DNS port.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if addr.is_ipv6() {
        // keep the v6 socket v6-only; v4 has its own socket
        socket.set_only_v6(true)?;
    }
    let _ = socket.set_recv_buffer_size(UDP_BUFFER_SIZE);
    let _ = socket.set_send_buffer_size(UDP_BUFFER_SIZE);

    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let sock = bind_udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
        let local = sock.local_addr().unwrap();
        assert_ne!(local.port(), 0);

        // the socket actually moves datagrams
        let peer = bind_udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
        peer.send_to(b"hello", local).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = sock.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, peer.local_addr().unwrap());
    }
}
