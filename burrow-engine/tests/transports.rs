//! Raw-UDP fallback and forwarder tests
//!
//! The raw transport shares the DNS port: after a DNS handshake the client
//! may switch to magic-header UDP datagrams, possibly from a different
//! source address. Queries outside the topdomain are relayed to a local
//! resolver and the replies spliced back.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;

use burrow_engine::compress;
use burrow_engine::{ChannelTun, ChannelTunHandle, Config, Server};
use burrow_protocol::auth::login_hash;
use burrow_protocol::dns::{self, QueryType};
use burrow_protocol::raw::{decode_raw, encode_raw, RawCommand};
use burrow_protocol::{NameEncoder, PROTOCOL_VERSION};

const TOPDOMAIN: &str = "t.example.com";
const PASSWORD: &str = "secretpassword";

async fn start_server(forward_port: Option<u16>) -> (SocketAddr, ChannelTunHandle, watch::Sender<bool>) {
    let cfg = Config {
        topdomain: TOPDOMAIN.into(),
        password: PASSWORD.into(),
        listen: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        listen_v6: None,
        tun_device: "test0".into(),
        tun_ip: Ipv4Addr::new(10, 0, 0, 1),
        netmask: 27,
        mtu: 1130,
        ns_ip: None,
        check_ip: true,
        max_idle_time: None,
        forward_port,
    };

    let (tun, handle) = ChannelTun::pair();
    let mut server = Server::new(cfg, Box::new(tun)).expect("server bind");
    let addr = server.local_addr().unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move { server.run(stop_rx).await });

    (addr, handle, stop_tx)
}

/// Version handshake plus login over DNS; returns `(userid, seed)`.
async fn establish(sock: &UdpSocket, server: SocketAddr) -> (u8, u32) {
    let mut payload = PROTOCOL_VERSION.to_be_bytes().to_vec();
    payload.extend_from_slice(b"ab");
    let mut label = vec![b'v'];
    label.extend(NameEncoder::Base32.encode(&payload));
    let reply = query(sock, server, 500, QueryType::Null, &label).await;
    assert_eq!(&reply[..4], b"VACK");
    let seed = u32::from_be_bytes([reply[4], reply[5], reply[6], reply[7]]);
    let userid = reply[8];

    let mut payload = vec![userid];
    payload.extend_from_slice(&login_hash(PASSWORD.as_bytes(), seed as i32));
    payload.extend_from_slice(b"cd");
    let mut label = vec![b'l'];
    label.extend(NameEncoder::Base32.encode(&payload));
    let reply = query(sock, server, 501, QueryType::Null, &label).await;
    assert!(String::from_utf8_lossy(&reply).contains('-'));

    (userid, seed)
}

async fn query(
    sock: &UdpSocket,
    server: SocketAddr,
    id: u16,
    qtype: QueryType,
    first_label: &[u8],
) -> Vec<u8> {
    let mut name = first_label.to_vec();
    name.push(b'.');
    name.extend_from_slice(TOPDOMAIN.as_bytes());
    sock.send_to(&dns::encode_query(id, qtype, &name), server)
        .await
        .unwrap();

    let mut buf = vec![0u8; 65536];
    let (n, _) = timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
        .await
        .expect("timed out")
        .unwrap();
    buf.truncate(n);

    // skip to the first answer's rdata
    let mut pos = 12;
    while buf[pos] != 0 {
        pos += 1 + buf[pos] as usize;
    }
    pos += 5 + 2 + 8;
    let rdlen = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
    pos += 2;
    buf[pos..pos + rdlen].to_vec()
}

async fn recv_raw(sock: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 65536];
    let (n, _) = timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
        .await
        .expect("timed out waiting for raw frame")
        .unwrap();
    buf.truncate(n);
    buf
}

fn tun_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut p = vec![0u8, 0, 8, 0];
    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);
    p.extend_from_slice(&ip);
    p.extend_from_slice(payload);
    p
}

#[tokio::test]
async fn test_raw_login_and_ping() {
    let (server, _tun, _stop) = start_server(None).await;
    let dns_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let (userid, seed) = establish(&dns_sock, server).await;

    // raw login from a different socket
    let raw_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let challenge = login_hash(PASSWORD.as_bytes(), (seed as i32).wrapping_add(1));
    raw_sock
        .send_to(&encode_raw(RawCommand::Login, userid, &challenge), server)
        .await
        .unwrap();

    let reply = recv_raw(&raw_sock).await;
    let (cmd, uid, payload) = decode_raw(&reply).expect("not a raw frame");
    assert_eq!(cmd, RawCommand::Login);
    assert_eq!(uid, userid);
    assert_eq!(
        payload,
        &login_hash(PASSWORD.as_bytes(), (seed as i32).wrapping_sub(1))[..]
    );

    // raw keepalive gets an empty echo
    raw_sock
        .send_to(&encode_raw(RawCommand::Ping, userid, b""), server)
        .await
        .unwrap();
    let reply = recv_raw(&raw_sock).await;
    let (cmd, _, payload) = decode_raw(&reply).unwrap();
    assert_eq!(cmd, RawCommand::Ping);
    assert!(payload.is_empty());
}

#[tokio::test]
async fn test_raw_login_rejected_with_bad_hash() {
    let (server, _tun, _stop) = start_server(None).await;
    let dns_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let (userid, seed) = establish(&dns_sock, server).await;

    let raw_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    // hash with the unshifted seed must not pass
    let challenge = login_hash(PASSWORD.as_bytes(), seed as i32);
    raw_sock
        .send_to(&encode_raw(RawCommand::Login, userid, &challenge), server)
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let res = timeout(Duration::from_millis(400), raw_sock.recv_from(&mut buf)).await;
    assert!(res.is_err(), "bad raw login must be ignored");

    // and pings from the unauthenticated socket are dropped too
    raw_sock
        .send_to(&encode_raw(RawCommand::Ping, userid, b""), server)
        .await
        .unwrap();
    let res = timeout(Duration::from_millis(400), raw_sock.recv_from(&mut buf)).await;
    assert!(res.is_err());
}

#[tokio::test]
async fn test_raw_data_both_directions() {
    let (server, tun, _stop) = start_server(None).await;
    let dns_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let (userid, seed) = establish(&dns_sock, server).await;

    let raw_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let challenge = login_hash(PASSWORD.as_bytes(), (seed as i32).wrapping_add(1));
    raw_sock
        .send_to(&encode_raw(RawCommand::Login, userid, &challenge), server)
        .await
        .unwrap();
    recv_raw(&raw_sock).await;

    // upstream: compressed packet for the outside world lands on the tun
    let packet = tun_packet([10, 0, 0, 2], [198, 51, 100, 30], b"raw upstream");
    let compressed = compress::compress(&packet).unwrap();
    raw_sock
        .send_to(&encode_raw(RawCommand::Data, userid, &compressed), server)
        .await
        .unwrap();

    let written = timeout(Duration::from_secs(5), async {
        tun.written.lock().await.recv().await
    })
    .await
    .expect("packet never reached tun")
    .unwrap();
    assert_eq!(written, packet);

    // downstream: a tun packet for this user arrives as a raw frame, no
    // polling required
    let down = tun_packet([198, 51, 100, 30], [10, 0, 0, 2], b"raw downstream");
    tun.inject.send(down.clone()).await.unwrap();

    let frame = recv_raw(&raw_sock).await;
    let (cmd, uid, payload) = decode_raw(&frame).unwrap();
    assert_eq!(cmd, RawCommand::Data);
    assert_eq!(uid, userid);
    assert_eq!(compress::decompress(payload, 65536).unwrap(), down);
}

#[tokio::test]
async fn test_forwarder_splices_foreign_queries() {
    // stand-in resolver on an ephemeral port
    let resolver = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let resolver_port = resolver.local_addr().unwrap().port();

    let (server, _tun, _stop) = start_server(Some(resolver_port)).await;
    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

    // a query for an unrelated zone
    let packet = dns::encode_query(0x4242, QueryType::A, b"www.example.org");
    client.send_to(&packet, server).await.unwrap();

    // the resolver sees it verbatim
    let mut buf = vec![0u8; 4096];
    let (n, from) = timeout(Duration::from_secs(5), resolver.recv_from(&mut buf))
        .await
        .expect("query was not forwarded")
        .unwrap();
    assert_eq!(&buf[..n], &packet[..]);

    // craft a response and send it back to the forwarder socket
    let mut response = packet.clone();
    response[2] |= 0x80;
    resolver.send_to(&response, from).await.unwrap();

    // the client receives the spliced reply
    let mut buf = vec![0u8; 4096];
    let (n, reply_from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("reply was not spliced back")
        .unwrap();
    assert_eq!(&buf[..n], &response[..]);
    assert_eq!(reply_from, server);
}

#[tokio::test]
async fn test_foreign_query_dropped_without_forwarder() {
    let (server, _tun, _stop) = start_server(None).await;
    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

    let packet = dns::encode_query(0x4242, QueryType::A, b"www.example.org");
    client.send_to(&packet, server).await.unwrap();

    let mut buf = [0u8; 512];
    let res = timeout(Duration::from_millis(400), client.recv_from(&mut buf)).await;
    assert!(res.is_err(), "foreign query must be dropped silently");
}

#[tokio::test]
async fn test_ns_and_www_answers() {
    let (server, _tun, _stop) = start_server(None).await;
    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

    // NS for the topdomain itself
    let packet = dns::encode_query(7, QueryType::Ns, TOPDOMAIN.as_bytes());
    client.send_to(&packet, server).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let (n, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no NS answer")
        .unwrap();
    assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), 7);
    // one answer, one additional (the glue A record)
    assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 1);
    assert_eq!(u16::from_be_bytes([buf[10], buf[11]]), 1);
    assert!(n > 12);

    // A query for www.<topdomain> answers loopback
    let name = format!("www.{}", TOPDOMAIN);
    let packet = dns::encode_query(8, QueryType::A, name.as_bytes());
    client.send_to(&packet, server).await.unwrap();
    let (n, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no A answer")
        .unwrap();
    let rdata = &buf[n - 4..n];
    assert_eq!(rdata, &[127, 0, 0, 1]);
}
