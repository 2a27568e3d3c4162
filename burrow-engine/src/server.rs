//! Tunnel server core
//!
//! One task owns everything: the DNS sockets, the TUN device, the user
//! table and the forwarder. Each loop iteration first answers whatever
//! pending queries are due (data waiting, ACK waiting, ping owed, or
//! timeout near), then waits for the next datagram or deadline.
//!
//! Tunnel queries are recognized by the topdomain suffix; the first byte of
//! the qname selects a session command. Handshake commands (`V`, `Z`, `Y`,
//! `R`) answer synchronously; ping and data queries go through the
//! per-user query memory so lazy mode can sit on them until there is
//! something worth saying.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::watch;

use burrow_protocol::auth::{login_hash, LOGIN_HASH_LEN};
use burrow_protocol::dns::{self, DnsQuery, QueryType};
use burrow_protocol::encoder::b32_char_value;
use burrow_protocol::frame::{
    DownstreamFrame, PingInfo, PingRequest, UpstreamHeader, DOWNSTREAM_CODEC_CHECK, UPSTREAM_HDR,
    UPSTREAM_PING_LEN,
};
use burrow_protocol::raw::{self, RawCommand};
use burrow_protocol::window::Fragment;
use burrow_protocol::{NameEncoder, MAX_FRAGSIZE, PROTOCOL_VERSION};

use crate::compress;
use crate::config::Config;
use crate::error::Result;
use crate::forward::FwTable;
use crate::qmem::{Append, CachedQuery};
use crate::socket::bind_udp;
use crate::tun_io::TunIo;
use crate::user::{ConnType, UserId, UserState, UserTable};

/// Ceiling for the lazy-mode wait between loop iterations.
const MAX_WAIT: Duration = Duration::from_secs(10);

/// Tunneled packets are capped well below this after reassembly.
const MAX_PACKET: usize = 64 * 1024;

/// TUN packet-information header length.
const TUN_HDR: usize = 4;

/// Session command selected by the first qname byte (case-insensitive).
/// A leading hex digit addresses a data fragment at that user slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Version,
    Login,
    IpRequest,
    CaseCheck,
    SwitchCodec,
    Options,
    CodecCheck,
    FragsizeProbe,
    FragsizeSet,
    Ping,
    Data(u8),
}

impl Command {
    fn parse(b: u8) -> Option<Command> {
        match b.to_ascii_uppercase() {
            b'V' => Some(Command::Version),
            b'L' => Some(Command::Login),
            b'I' => Some(Command::IpRequest),
            b'Z' => Some(Command::CaseCheck),
            b'S' => Some(Command::SwitchCodec),
            b'O' => Some(Command::Options),
            b'Y' => Some(Command::CodecCheck),
            b'R' => Some(Command::FragsizeProbe),
            b'N' => Some(Command::FragsizeSet),
            b'P' => Some(Command::Ping),
            c if c.is_ascii_hexdigit() => {
                let uid = match c {
                    b'0'..=b'9' => c - b'0',
                    _ => c - b'A' + 10,
                };
                Some(Command::Data(uid))
            }
            _ => None,
        }
    }
}

/// `VACK`/`VNAK`/`VFUL` reply: tag, 32-bit payload, user id.
fn version_reply(tag: &[u8; 4], payload: u32, userid: u8) -> [u8; 9] {
    let mut out = [0u8; 9];
    out[..4].copy_from_slice(tag);
    out[4..8].copy_from_slice(&payload.to_be_bytes());
    out[8] = userid;
    out
}

enum Event {
    Dns {
        datagram: Vec<u8>,
        from: SocketAddr,
    },
    Tun {
        packet: Vec<u8>,
    },
    FwdReply {
        datagram: Vec<u8>,
    },
    Timeout,
    Stopped,
}

async fn recv_opt(
    sock: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match sock {
        Some(s) => s.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// The tunnel server. Owns all state; drive it with [`run`](Server::run).
pub struct Server {
    topdomain: Vec<u8>,
    password: Vec<u8>,
    cfg: Config,

    users: UserTable,
    fwd_table: FwTable,

    dns4: UdpSocket,
    dns6: Option<UdpSocket>,
    fwd_socket: Option<UdpSocket>,
    tun: Box<dyn TunIo>,

    /// Rotating 10-bit counter feeding the hostname-encoded answers.
    name_cmc: u16,
    started: Instant,
}

impl Server {
    /// Bind the sockets and build the session table. Must be called inside
    /// a tokio runtime.
    pub fn new(cfg: Config, tun: Box<dyn TunIo>) -> Result<Server> {
        cfg.validate()?;

        let dns4 = bind_udp(SocketAddr::new(cfg.listen, cfg.port))?;
        let dns6 = match cfg.listen_v6 {
            Some(ip) => Some(bind_udp(SocketAddr::new(IpAddr::V6(ip), cfg.port))?),
            None => None,
        };
        let fwd_socket = match cfg.forward_port {
            Some(_) => Some(bind_udp(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                0,
            ))?),
            None => None,
        };

        let users = UserTable::new(cfg.tun_ip, cfg.netmask, cfg.check_ip);

        log::info!(
            "listening on {} for topdomain {}, {} user slots",
            dns4.local_addr()?,
            cfg.topdomain,
            users.created_users()
        );

        Ok(Server {
            topdomain: cfg.topdomain.clone().into_bytes(),
            password: cfg.password.clone().into_bytes(),
            cfg,
            users,
            fwd_table: FwTable::new(),
            dns4,
            dns6,
            fwd_socket,
            tun,
            name_cmc: 0,
            started: Instant::now(),
        })
    }

    /// Address of the IPv4 DNS socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.dns4.local_addr()?)
    }

    /// Run until stopped or idle for longer than `max_idle_time`.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        loop {
            let wait = self.pump_pending().await.min(MAX_WAIT);

            let event = {
                let mut dns4_buf = vec![0u8; MAX_PACKET];
                let mut dns6_buf = vec![0u8; MAX_PACKET];
                let mut tun_buf = vec![0u8; MAX_PACKET];
                let mut fwd_buf = vec![0u8; MAX_PACKET];
                let tun_ready = !self.users.all_users_waiting_to_send(Instant::now());

                tokio::select! {
                    res = self.dns4.recv_from(&mut dns4_buf) => match res {
                        Ok((n, from)) => {
                            dns4_buf.truncate(n);
                            Event::Dns { datagram: dns4_buf, from }
                        }
                        Err(e) => {
                            log::debug!("DNS v4 recv error: {}", e);
                            continue;
                        }
                    },
                    res = recv_opt(self.dns6.as_ref(), &mut dns6_buf) => match res {
                        Ok((n, from)) => {
                            dns6_buf.truncate(n);
                            Event::Dns { datagram: dns6_buf, from }
                        }
                        Err(e) => {
                            log::debug!("DNS v6 recv error: {}", e);
                            continue;
                        }
                    },
                    res = self.tun.recv(&mut tun_buf), if tun_ready => match res {
                        Ok(n) => {
                            tun_buf.truncate(n);
                            Event::Tun { packet: tun_buf }
                        }
                        Err(e) => {
                            log::warn!("TUN read error: {}", e);
                            continue;
                        }
                    },
                    res = recv_opt(self.fwd_socket.as_ref(), &mut fwd_buf) => match res {
                        Ok((n, _)) => {
                            fwd_buf.truncate(n);
                            Event::FwdReply { datagram: fwd_buf }
                        }
                        Err(e) => {
                            log::debug!("forward recv error: {}", e);
                            continue;
                        }
                    },
                    _ = tokio::time::sleep(wait) => Event::Timeout,
                    _ = stop.changed() => Event::Stopped,
                }
            };

            match event {
                Event::Dns { datagram, from } => self.on_dns_datagram(&datagram, from).await,
                Event::Tun { packet } => self.on_tun_packet(&packet).await,
                Event::FwdReply { datagram } => self.on_forward_reply(&datagram).await,
                Event::Timeout => {
                    if self.idle_shutdown_due() {
                        log::info!("server idle for too long, shutting down");
                        return Ok(());
                    }
                }
                Event::Stopped => {
                    log::info!("stop requested");
                    return Ok(());
                }
            }
        }
    }

    fn idle_shutdown_due(&self) -> bool {
        let Some(max_idle) = self.cfg.max_idle_time else {
            return false;
        };
        let newest = self
            .users
            .ids()
            .map(|id| self.users.get(id).last_pkt)
            .max()
            .unwrap_or(self.started)
            .max(self.started);
        Instant::now().duration_since(newest) > Duration::from_secs(max_idle)
    }

    // ------------------------------------------------------------------
    // Lazy-mode pump
    // ------------------------------------------------------------------

    /// Answer every pending query that is due and report how long the loop
    /// may sleep before the next one times out.
    ///
    /// A query is due when its DNS timeout is close, when the user has
    /// fragments ready to send, a pending upstream ACK or an owed ping, or
    /// when more queries are pending than the send window can use. The
    /// number of data responses per scan is budgeted so one user cannot
    /// starve the loop.
    async fn pump_pending(&mut self) -> Duration {
        let now = Instant::now();
        let mut soonest = MAX_WAIT;

        let ids: Vec<UserId> = self.users.ids().collect();
        for id in ids {
            let u = self.users.get(id);
            if !u.is_active(now) || !u.lazy || u.qmem.num_pending() == 0 {
                continue;
            }

            let mut total = u.outgoing.window_sending(now);
            if u.qmem.num_pending() > u.outgoing.windowsize {
                total = total.max(u.qmem.num_pending() - u.outgoing.windowsize);
            }
            let mut sending = total;

            loop {
                let u = self.users.get(id);
                let Some(q) = u.qmem.next_pending().cloned() else {
                    break;
                };
                let deadline = q.received + u.dns_timeout;
                let due = sending > 0
                    || now >= deadline
                    || u.next_upstream_ack >= 0
                    || u.send_ping_next;
                if !due {
                    // queries are kept in arrival order; the first one not
                    // yet due bounds the wait for this user
                    soonest = soonest.min(deadline.duration_since(now));
                    break;
                }

                let ping = u.send_ping_next;
                self.send_data_or_ping(id, &q, ping, true, false).await;
                self.users.get_mut(id).send_ping_next = false;
                if sending > 0 {
                    sending -= 1;
                }
            }
        }

        soonest
    }

    // ------------------------------------------------------------------
    // Datagram intake
    // ------------------------------------------------------------------

    async fn on_dns_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        if let Some((cmd, uid, payload)) = raw::decode_raw(datagram) {
            self.handle_raw(cmd, uid, payload, from).await;
            return;
        }

        let q = match dns::decode_query(datagram) {
            Ok(q) => q,
            Err(e) => {
                log::debug!("dropping malformed datagram from {}: {}", from, e);
                return;
            }
        };
        log::debug!(
            "RX: client {} id {} type {:?} name {}",
            from,
            q.id,
            q.qtype,
            q.name_lossy()
        );

        let Some(domain_len) = self.tunnel_domain_len(&q.name) else {
            if self.fwd_socket.is_some() {
                self.forward_query(datagram, from).await;
            } else {
                log::debug!("query outside topdomain from {}, no forwarder", from);
            }
            return;
        };

        // convenience names for resolvers poking at the zone itself
        if q.qtype == QueryType::Ns {
            let answer = dns::encode_ns_answer(&q, &self.topdomain, self.external_ipv4());
            self.send_dns(from, &answer).await;
            return;
        }
        if q.qtype == QueryType::A && domain_len == 3 && q.name[..2].eq_ignore_ascii_case(b"ns")
        {
            let answer = dns::encode_a_answer(&q, self.external_ipv4());
            self.send_dns(from, &answer).await;
            return;
        }
        if q.qtype == QueryType::A && domain_len == 4 && q.name[..3].eq_ignore_ascii_case(b"www")
        {
            let answer = dns::encode_a_answer(&q, Ipv4Addr::LOCALHOST);
            self.send_dns(from, &answer).await;
            return;
        }

        match q.qtype {
            QueryType::Null
            | QueryType::Private
            | QueryType::Cname
            | QueryType::A
            | QueryType::Mx
            | QueryType::Srv
            | QueryType::Txt => self.handle_tunnel_query(&q, domain_len, from).await,
            _ => {}
        }
    }

    /// Length of the data part if `name` is a tunnel query: it must end
    /// with the topdomain, preceded by a dot (or be the topdomain itself).
    fn tunnel_domain_len(&self, name: &[u8]) -> Option<usize> {
        let td = &self.topdomain;
        if name.len() < td.len() {
            return None;
        }
        let dl = name.len() - td.len();
        if !name[dl..].eq_ignore_ascii_case(td) {
            return None;
        }
        if dl >= 1 && name[dl - 1] != b'.' {
            return None;
        }
        Some(dl)
    }

    async fn handle_tunnel_query(&mut self, q: &DnsQuery, domain_len: usize, from: SocketAddr) {
        if domain_len < 2 {
            return;
        }
        let data = q.name[..domain_len].to_vec();
        let cq = CachedQuery::new(q, from);

        match Command::parse(data[0]) {
            Some(Command::Version) => self.handle_version(&cq, &data, from).await,
            Some(Command::Login) => self.handle_login(&cq, &data, from).await,
            Some(Command::IpRequest) => self.handle_ip_request(&cq, &data, from).await,
            Some(Command::CaseCheck) => self.write_dns(&cq, &data, b'T').await,
            Some(Command::SwitchCodec) => self.handle_switch_codec(&cq, &data, from).await,
            Some(Command::Options) => self.handle_options(&cq, &data, from).await,
            Some(Command::CodecCheck) => self.handle_codec_check(&cq, &data).await,
            Some(Command::FragsizeProbe) => self.handle_fragsize_probe(&cq, &data, from).await,
            Some(Command::FragsizeSet) => self.handle_fragsize_set(&cq, &data, from).await,
            Some(Command::Ping) => self.handle_ping(&cq, &data, from).await,
            Some(Command::Data(uid)) => self.handle_data(&cq, uid, &data, from).await,
            None => {}
        }
    }

    // ------------------------------------------------------------------
    // Handshake commands
    // ------------------------------------------------------------------

    async fn handle_version(&mut self, cq: &CachedQuery, data: &[u8], from: SocketAddr) {
        let now = Instant::now();
        let unpacked = NameEncoder::Base32.decode(&data[1..]).unwrap_or_default();
        let version = if unpacked.len() >= 4 {
            u32::from_be_bytes([unpacked[0], unpacked[1], unpacked[2], unpacked[3]])
        } else {
            !PROTOCOL_VERSION
        };

        if version != PROTOCOL_VERSION {
            log::info!(
                "rejected client {} with version {:08x} (want {:08x})",
                from,
                version,
                PROTOCOL_VERSION
            );
            let reply = version_reply(b"VNAK", PROTOCOL_VERSION, 0);
            self.write_dns(cq, &reply, b'T').await;
            return;
        }

        let Some(id) = self.users.find_available(now) else {
            log::info!("dropping client {}, server full", from);
            let reply = version_reply(b"VFUL", self.users.created_users() as u32, 0);
            self.write_dns(cq, &reply, b'T').await;
            return;
        };

        let seed: u32 = rand::random();
        self.users.get_mut(id).reset(seed, from, cq.qtype.is_raw());
        let downenc = self.users.get(id).downenc;
        log::info!("accepted version handshake for {} from {}", id, from);
        let reply = version_reply(b"VACK", seed, id.0);
        self.write_dns(cq, &reply, downenc).await;
    }

    async fn handle_login(&mut self, cq: &CachedQuery, data: &[u8], from: SocketAddr) {
        let now = Instant::now();
        let unpacked = NameEncoder::Base32.decode(&data[1..]).unwrap_or_default();
        if unpacked.len() < 1 + LOGIN_HASH_LEN {
            self.write_dns(cq, b"BADLEN", b'T').await;
            return;
        }

        let Some(id) = self.users.check_user_and_ip(unpacked[0], from, now) else {
            log::warn!(
                "rejected login for user {} from unexpected source {}",
                unpacked[0],
                from
            );
            self.write_dns(cq, b"BADIP", b'T').await;
            return;
        };

        self.users.get_mut(id).touch();
        let seed = self.users.get(id).seed;
        let expected = login_hash(&self.password, seed as i32);

        if unpacked[1..1 + LOGIN_HASH_LEN] != expected {
            log::warn!("rejected login for {} from {}, bad password", id, from);
            self.write_dns(cq, b"LNAK", b'T').await;
            return;
        }

        self.users.get_mut(id).state = UserState::Authenticated;
        self.users.evict_same_peer(id, from);

        let u = self.users.get(id);
        let reply = format!(
            "{}-{}-{}-{}",
            self.cfg.tun_ip, u.tun_ip, self.cfg.mtu, self.cfg.netmask
        );
        let downenc = u.downenc;
        log::info!("accepted login for {} from {}, tunnel ip {}", id, from, u.tun_ip);
        self.write_dns(cq, reply.as_bytes(), downenc).await;
    }

    async fn handle_ip_request(&mut self, cq: &CachedQuery, data: &[u8], from: SocketAddr) {
        let now = Instant::now();
        let userid = b32_char_value(data[1]).unwrap_or(0xFF);
        if self
            .users
            .check_authenticated_user_and_ip(userid, from, now)
            .is_none()
        {
            self.write_dns(cq, b"BADIP", b'T').await;
            return;
        }

        let mut reply = vec![b'I'];
        match from {
            SocketAddr::V4(_) => reply.extend_from_slice(&self.external_ipv4().octets()),
            SocketAddr::V6(_) => {
                let ip = self
                    .dns6
                    .as_ref()
                    .and_then(|s| s.local_addr().ok())
                    .map(|a| a.ip());
                match ip {
                    Some(IpAddr::V6(v6)) => reply.extend_from_slice(&v6.octets()),
                    _ => reply.extend_from_slice(&[0u8; 16]),
                }
            }
        }
        self.write_dns(cq, &reply, b'T').await;
    }

    async fn handle_switch_codec(&mut self, cq: &CachedQuery, data: &[u8], from: SocketAddr) {
        let now = Instant::now();
        if data.len() < 3 {
            self.write_dns(cq, b"BADLEN", b'T').await;
            return;
        }
        let userid = b32_char_value(data[1]).unwrap_or(0xFF);
        let Some(id) = self.users.check_authenticated_user_and_ip(userid, from, now) else {
            self.write_dns(cq, b"BADIP", b'T').await;
            return;
        };

        let downenc = self.users.get(id).downenc;
        let codec = b32_char_value(data[2]).unwrap_or(0xFF);
        match NameEncoder::from_codec_id(codec) {
            Some(enc) => {
                let u = self.users.get_mut(id);
                u.upstream_encoder = enc;
                u.touch();
                log::debug!("{} switched upstream codec to {}", id, enc.name());
                self.write_dns(cq, enc.name().as_bytes(), downenc).await;
            }
            None => {
                self.write_dns(cq, b"BADCODEC", downenc).await;
            }
        }
    }

    async fn handle_options(&mut self, cq: &CachedQuery, data: &[u8], from: SocketAddr) {
        let now = Instant::now();
        if data.len() < 7 {
            self.write_dns(cq, b"BADLEN", b'T').await;
            return;
        }
        let userid = b32_char_value(data[1]).unwrap_or(0xFF);
        let Some(id) = self.users.check_authenticated_user_and_ip(userid, from, now) else {
            self.write_dns(cq, b"BADIP", b'T').await;
            return;
        };

        let numopts = data[2].wrapping_sub(b'0') as usize;
        if numopts == 0 || numopts > 9 || data.len() < numopts + 6 {
            self.write_dns(cq, b"BADLEN", b'T').await;
            return;
        }
        let opts = &data[3..3 + numopts];

        // nothing is applied until every option parsed
        let u = self.users.get(id);
        let mut lazy = u.lazy;
        let mut comp = u.down_compression;
        let mut downenc = u.downenc;
        let cur_downenc = u.downenc;
        let mut bits = 0u32;

        for &opt in opts {
            match opt.to_ascii_uppercase() {
                b'T' => {
                    downenc = b'T';
                    bits = 5;
                }
                b'S' => {
                    downenc = b'S';
                    bits = 6;
                }
                b'U' => {
                    downenc = b'U';
                    bits = 6;
                }
                b'V' => {
                    downenc = b'V';
                    bits = 7;
                }
                b'R' => {
                    downenc = b'R';
                    bits = 8;
                }
                b'L' => lazy = true,
                b'I' => lazy = false,
                b'C' => comp = true,
                b'D' => comp = false,
                _ => {
                    self.write_dns(cq, b"BADCODEC", cur_downenc).await;
                    return;
                }
            }
        }

        // NULL/PRIVATE answers carry raw bytes anyway
        if cq.qtype.is_raw() && bits == 0 {
            downenc = b'R';
            bits = 8;
        }

        let u = self.users.get_mut(id);
        if bits != 0 {
            u.downenc_bits = bits;
        }
        u.down_compression = comp;
        u.downenc = downenc;
        u.lazy = lazy;
        u.update_maxfraglen();
        u.touch();
        log::debug!(
            "{} options: downenc {} lazy {} compression {} maxfraglen {}",
            id,
            downenc as char,
            lazy,
            comp,
            self.users.get(id).outgoing.maxfraglen
        );

        let echo = opts.to_vec();
        self.write_dns(cq, &echo, downenc).await;
    }

    async fn handle_codec_check(&mut self, cq: &CachedQuery, data: &[u8]) {
        if data.len() < 6 {
            self.write_dns(cq, b"BADLEN", b'T').await;
            return;
        }
        // only probe variant 1 exists
        if b32_char_value(data[2]) != Some(1) {
            self.write_dns(cq, b"BADLEN", b'T').await;
            return;
        }

        let requested = data[1].to_ascii_uppercase();
        let compatible = match requested {
            b'T' | b'S' | b'U' | b'V' => matches!(
                cq.qtype,
                QueryType::Txt | QueryType::Srv | QueryType::Mx | QueryType::Cname | QueryType::A
            ),
            b'R' => matches!(cq.qtype, QueryType::Null | QueryType::Txt),
            _ => false,
        };

        if compatible {
            self.write_dns(cq, &DOWNSTREAM_CODEC_CHECK, requested).await;
        } else {
            self.write_dns(cq, b"BADCODEC", b'T').await;
        }
    }

    async fn handle_fragsize_probe(&mut self, cq: &CachedQuery, data: &[u8], from: SocketAddr) {
        let now = Instant::now();
        if data.len() < 16 {
            self.write_dns(cq, b"BADLEN", b'T').await;
            return;
        }
        let unpacked = NameEncoder::Base32.decode(&data[1..6]).unwrap_or_default();
        if unpacked.len() < 3 {
            self.write_dns(cq, b"BADLEN", b'T').await;
            return;
        }
        let Some(id) = self
            .users
            .check_authenticated_user_and_ip(unpacked[0], from, now)
        else {
            self.write_dns(cq, b"BADIP", b'T').await;
            return;
        };

        let downenc = self.users.get(id).downenc;
        let req_size = u16::from_be_bytes([unpacked[1], unpacked[2]]) as usize;
        if !(2..=2047).contains(&req_size) {
            self.write_dns(cq, b"BADFRAG", downenc).await;
            return;
        }

        // checkable pattern: length echo, then a stride-107 byte walk
        let mut buf = vec![0u8; req_size];
        buf[0] = (req_size >> 8) as u8;
        buf[1] = (req_size & 0xFF) as u8;
        for (k, b) in buf[2..].iter_mut().enumerate() {
            *b = (107usize * (k + 1) % 256) as u8;
        }
        self.users.get_mut(id).touch();
        self.write_dns(cq, &buf, downenc).await;
    }

    async fn handle_fragsize_set(&mut self, cq: &CachedQuery, data: &[u8], from: SocketAddr) {
        let now = Instant::now();
        let unpacked = NameEncoder::Base32.decode(&data[1..]).unwrap_or_default();
        if unpacked.len() < 3 {
            self.write_dns(cq, b"BADLEN", b'T').await;
            return;
        }
        let Some(id) = self
            .users
            .check_authenticated_user_and_ip(unpacked[0], from, now)
        else {
            self.write_dns(cq, b"BADIP", b'T').await;
            return;
        };

        let downenc = self.users.get(id).downenc;
        let fragsize = u16::from_be_bytes([unpacked[1], unpacked[2]]);
        if !(2..=2047).contains(&fragsize) {
            self.write_dns(cq, b"BADFRAG", downenc).await;
            return;
        }

        let u = self.users.get_mut(id);
        u.fragsize = fragsize;
        u.update_maxfraglen();
        u.touch();
        log::debug!(
            "{} set fragsize {} (maxfraglen {})",
            id,
            fragsize,
            self.users.get(id).outgoing.maxfraglen
        );
        self.write_dns(cq, &unpacked[1..3], downenc).await;
    }

    // ------------------------------------------------------------------
    // Ping and data
    // ------------------------------------------------------------------

    async fn handle_ping(&mut self, cq: &CachedQuery, data: &[u8], from: SocketAddr) {
        let now = Instant::now();
        // id 0 marks consumed cache entries; resolvers rewrite ids, so
        // dropping one query in 64k costs one retransmit
        if cq.id == 0 {
            return;
        }

        let unpacked = NameEncoder::Base32.decode(&data[1..]).unwrap_or_default();
        if unpacked.len() < UPSTREAM_PING_LEN {
            log::debug!("short ping from {} ({} bytes)", from, unpacked.len());
            return;
        }

        let Some(id) = self
            .users
            .check_authenticated_user_and_ip(unpacked[0], from, now)
        else {
            self.write_dns(cq, b"BADIP", b'T').await;
            return;
        };

        if let Some(answer) = self
            .users
            .get_mut(id)
            .answer_cache
            .lookup(cq.qtype, &cq.name)
        {
            log::debug!("{} ping answered from cache", id);
            let downenc = self.users.get(id).downenc;
            self.write_dns(cq, &answer, downenc).await;
            return;
        }

        let stored = match self.users.get_mut(id).qmem.append(cq.clone()) {
            Append::Duplicate => {
                log::debug!("{} duplicate ping, sending illegal reply", id);
                self.write_dns(cq, b"x", b'T').await;
                return;
            }
            Append::Refused => false,
            Append::Stored => true,
        };

        let Some(ping) = PingRequest::parse(&unpacked) else {
            return;
        };
        {
            let u = self.users.get_mut(id);
            if ping.update_timeout {
                u.dns_timeout = Duration::from_millis(u64::from(ping.timeout_ms));
            }
            u.send_ping_next = ping.respond;
            u.touch();
        }
        log::debug!(
            "{} ping: down {}/{} up {}/{} ack {} timeout {}ms respond {}",
            id,
            ping.dn_seq,
            ping.dn_winsize,
            ping.up_seq,
            ping.up_winsize,
            ping.dn_ack,
            ping.timeout_ms,
            ping.respond
        );

        self.user_process_incoming(id, ping.dn_ack).await;

        // lazy sessions leave the query pending; the pump answers it
        if !self.users.get(id).lazy && stored {
            let ping_owed = self.users.get(id).send_ping_next;
            self.send_data_or_ping(id, cq, ping_owed, true, true).await;
            self.users.get_mut(id).send_ping_next = false;
        }
    }

    async fn handle_data(&mut self, cq: &CachedQuery, uid: u8, data: &[u8], from: SocketAddr) {
        let now = Instant::now();
        if cq.id == 0 {
            return;
        }
        if data.len() < UPSTREAM_HDR + 1 {
            return;
        }

        let Some(id) = self.users.check_authenticated_user_and_ip(uid, from, now) else {
            self.write_dns(cq, b"BADIP", b'T').await;
            return;
        };

        if let Some(answer) = self
            .users
            .get_mut(id)
            .answer_cache
            .lookup(cq.qtype, &cq.name)
        {
            log::debug!("{} data query answered from cache", id);
            let downenc = self.users.get(id).downenc;
            self.write_dns(cq, &answer, downenc).await;
            return;
        }

        let stored = match self.users.get_mut(id).qmem.append(cq.clone()) {
            Append::Duplicate => {
                log::debug!("{} duplicate data query, sending illegal reply", id);
                self.write_dns(cq, b"x", b'T').await;
                return;
            }
            Append::Refused => false,
            Append::Stored => true,
        };

        // data[1] is the collision counter, ignored; five Base32 chars of
        // header follow
        let header = NameEncoder::Base32.decode(&data[2..UPSTREAM_HDR]).unwrap_or_default();
        let Some(hdr) = UpstreamHeader::parse(&header) else {
            return;
        };

        let body = match self
            .users
            .get(id)
            .upstream_encoder
            .decode(&data[UPSTREAM_HDR..])
        {
            Ok(body) => body,
            Err(e) => {
                log::debug!("{} undecodable fragment body: {}", id, e);
                return;
            }
        };
        if body.len() > MAX_FRAGSIZE {
            log::debug!("{} oversized fragment ({} bytes)", id, body.len());
            return;
        }
        log::debug!(
            "{} frag seq {} len {} ack {} c{} s{} e{}",
            id,
            hdr.seq_id,
            body.len(),
            hdr.ack_other,
            hdr.compressed as u8,
            hdr.start as u8,
            hdr.end as u8
        );

        {
            let u = self.users.get_mut(id);
            if u.next_upstream_ack >= 0 {
                // normally consumed by the next downstream frame
                log::debug!("{} overwriting unsent upstream ack {}", id, u.next_upstream_ack);
            }
            let frag = Fragment::incoming(hdr.seq_id, body, hdr.start, hdr.end, hdr.compressed);
            u.next_upstream_ack = i16::from(u.incoming.process_incoming_fragment(frag));
            u.touch();
        }

        self.user_process_incoming(id, hdr.ack_other).await;

        if !self.users.get(id).lazy && stored {
            let ping_owed = self.users.get(id).send_ping_next;
            self.send_data_or_ping(id, cq, ping_owed, true, true).await;
            self.users.get_mut(id).send_ping_next = false;
        }
    }

    /// Shared tail of the ping and data paths: apply the client's ACK,
    /// then reassemble and route anything now complete.
    async fn user_process_incoming(&mut self, id: UserId, ack: i16) {
        let packet = {
            let u = self.users.get_mut(id);
            if ack >= 0 {
                u.outgoing.ack(ack as u8);
            }
            u.outgoing.tick();
            u.incoming.reassemble_data()
        };

        if let Some((packet, compressed)) = packet {
            self.handle_full_packet(id, &packet, compressed).await;
        }
    }

    /// Route one reassembled packet: to another user's queue when the
    /// destination is inside the tunnel subnet, to the TUN device
    /// otherwise.
    async fn handle_full_packet(&mut self, id: UserId, data: &[u8], compressed: bool) {
        let decompressed;
        let packet: &[u8] = if compressed {
            match compress::decompress(data, MAX_PACKET) {
                Ok(d) => {
                    decompressed = d;
                    &decompressed
                }
                Err(e) => {
                    log::debug!("discarding packet from {}: {}", id, e);
                    return;
                }
            }
        } else {
            data
        };

        if packet.len() < TUN_HDR + 20 {
            log::debug!("runt packet from {} ({} bytes)", id, packet.len());
            return;
        }
        // IPv4 header behind the packet-info header; destination at +16
        let dst = Ipv4Addr::new(
            packet[TUN_HDR + 16],
            packet[TUN_HDR + 17],
            packet[TUN_HDR + 18],
            packet[TUN_HDR + 19],
        );

        match self.users.find_by_tun_ip(dst, Instant::now()) {
            None => {
                if let Err(e) = self.tun.send(packet).await {
                    log::warn!("TUN write failed: {}", e);
                }
            }
            Some(to) => {
                log::debug!("routing {} byte packet {} -> {}", packet.len(), id, to);
                // hand the compressed original over when the target wants
                // compression anyway
                if self.users.get(to).down_compression && compressed {
                    self.user_send_data(to, data, true).await;
                } else {
                    let uncompressed = packet.to_vec();
                    self.user_send_data(to, &uncompressed, false).await;
                }
            }
        }
    }

    /// Queue a packet for a user, converting to the session's compression
    /// setting. DNS sessions queue into the outgoing window; raw sessions
    /// send immediately.
    async fn user_send_data(&mut self, id: UserId, data: &[u8], compressed: bool) {
        let want_compression = self.users.get(id).down_compression;
        let (payload, compressed) = if want_compression && !compressed {
            match compress::compress(data) {
                Ok(c) => (c, true),
                Err(e) => {
                    log::debug!("compression failed for {}: {}", id, e);
                    return;
                }
            }
        } else if !want_compression && compressed {
            match compress::decompress(data, MAX_PACKET) {
                Ok(d) => (d, false),
                Err(e) => {
                    log::debug!("decompression failed for {}: {}", id, e);
                    return;
                }
            }
        } else {
            (data.to_vec(), compressed)
        };

        match self.users.get(id).conn {
            ConnType::DnsNull => {
                let u = self.users.get_mut(id);
                match u.outgoing.add_outgoing_data(&payload, compressed) {
                    Ok(n) => log::debug!("{} queued {} bytes in {} fragments", id, payload.len(), n),
                    Err(e) => log::debug!("{} dropping packet: {}", id, e),
                }
            }
            ConnType::RawUdp => {
                if !compressed {
                    log::warn!("sending uncompressed raw data to {}", id);
                }
                if let Some(addr) = self.users.get(id).raw_addr {
                    let frame = raw::encode_raw(RawCommand::Data, id.0, &payload);
                    self.send_dns(addr, &frame).await;
                }
            }
            ConnType::None => {}
        }
    }

    // ------------------------------------------------------------------
    // Downstream responses
    // ------------------------------------------------------------------

    /// Answer `q` with the next outgoing fragment, or a ping frame when
    /// there is no data (or a ping was explicitly owed). In lazy mode with
    /// nothing to say and `respond_now` unset, the query stays pending.
    async fn send_data_or_ping(
        &mut self,
        id: UserId,
        q: &CachedQuery,
        ping: bool,
        respond_now: bool,
        immediate: bool,
    ) {
        let now = Instant::now();
        let (frame, downenc) = {
            let u = self.users.get_mut(id);
            u.outgoing.tick();

            let mut piggyback = u.next_upstream_ack;
            let frag = u.outgoing.next_sending_fragment(now, &mut piggyback);
            u.next_upstream_ack = piggyback;

            let mut ping = ping;
            let mut ping_ack = -1i16;
            if frag.is_none() {
                if u.lazy && !respond_now {
                    return;
                }
                // no data: send a ping frame carrying the window state
                ping = true;
                ping_ack = u.next_upstream_ack;
                u.next_upstream_ack = -1;
            }

            let ping_info = ping.then(|| PingInfo {
                out_winsize: u.outgoing.windowsize as u8,
                in_winsize: u.incoming.windowsize as u8,
                out_start_seq: u.outgoing.start_seq_id,
                in_start_seq: u.incoming.start_seq_id,
            });

            let frame = DownstreamFrame {
                frag: frag.as_ref(),
                ack: ping_ack,
                ping: ping_info,
                immediate,
            }
            .encode();
            (frame, u.downenc)
        };

        self.write_dns(q, &frame, downenc).await;

        let u = self.users.get_mut(id);
        u.answer_cache.save(q, &frame);
        u.qmem.answered();
        u.outgoing.tick();
    }

    /// Encode `data` into the answer shape of `q` and send it.
    async fn write_dns(&mut self, q: &CachedQuery, data: &[u8], downenc: u8) {
        let dq = DnsQuery {
            id: q.id,
            qtype: q.qtype,
            name: q.name.clone(),
        };
        match dns::encode_data_answer(&dq, data, downenc, &mut self.name_cmc) {
            Ok(datagram) => {
                log::debug!(
                    "TX: client {} id {} {} bytes data",
                    q.from,
                    q.id,
                    data.len()
                );
                self.send_dns(q.from, &datagram).await;
            }
            Err(e) => log::warn!("cannot answer {:?} query: {}", q.qtype, e),
        }
    }

    async fn send_dns(&self, to: SocketAddr, datagram: &[u8]) {
        let sock = match (&self.dns6, to.is_ipv6()) {
            (Some(s), true) => s,
            _ => &self.dns4,
        };
        if let Err(e) = sock.send_to(datagram, to).await {
            log::warn!("send to {} failed: {}", to, e);
        }
    }

    fn external_ipv4(&self) -> Ipv4Addr {
        if let Some(ip) = self.cfg.ns_ip {
            return ip;
        }
        match self.dns4.local_addr() {
            Ok(SocketAddr::V4(a)) => *a.ip(),
            _ => Ipv4Addr::UNSPECIFIED,
        }
    }

    // ------------------------------------------------------------------
    // Raw-UDP fallback
    // ------------------------------------------------------------------

    async fn handle_raw(&mut self, cmd: RawCommand, uid: u8, payload: &[u8], from: SocketAddr) {
        let now = Instant::now();
        log::debug!("RX-raw: client {} user {} cmd {:?}", from, uid, cmd);

        match cmd {
            RawCommand::Login => {
                if payload.len() < LOGIN_HASH_LEN {
                    return;
                }
                // the raw path may come from another address; require a
                // completed DNS login but skip the address comparison
                if uid as usize >= self.users.created_users() {
                    return;
                }
                let id = UserId(uid);
                let u = self.users.get(id);
                if !u.is_active(now) || !u.is_authenticated() {
                    return;
                }

                let expected = login_hash(&self.password, (u.seed as i32).wrapping_add(1));
                if payload[..LOGIN_HASH_LEN] != expected {
                    log::warn!("bad raw login for {} from {}", id, from);
                    return;
                }

                let u = self.users.get_mut(id);
                u.touch();
                u.raw_addr = Some(from);
                u.conn = ConnType::RawUdp;
                u.authenticated_raw = true;
                let seed = u.seed;
                log::info!("{} switched to raw UDP from {}", id, from);

                let reply = login_hash(&self.password, (seed as i32).wrapping_sub(1));
                let frame = raw::encode_raw(RawCommand::Login, uid, &reply);
                self.send_dns(from, &frame).await;
            }
            RawCommand::Data => {
                let Some(id) = self.users.check_raw_user(uid, from, now) else {
                    return;
                };
                self.users.get_mut(id).touch();
                let packet = payload.to_vec();
                self.handle_full_packet(id, &packet, true).await;
            }
            RawCommand::Ping => {
                let Some(id) = self.users.check_raw_user(uid, from, now) else {
                    return;
                };
                self.users.get_mut(id).touch();
                let frame = raw::encode_raw(RawCommand::Ping, uid, b"");
                self.send_dns(from, &frame).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // TUN and forwarder
    // ------------------------------------------------------------------

    async fn on_tun_packet(&mut self, packet: &[u8]) {
        if packet.len() < TUN_HDR + 20 {
            return;
        }
        let dst = Ipv4Addr::new(
            packet[TUN_HDR + 16],
            packet[TUN_HDR + 17],
            packet[TUN_HDR + 18],
            packet[TUN_HDR + 19],
        );
        let Some(id) = self.users.find_by_tun_ip(dst, Instant::now()) else {
            return;
        };
        log::debug!("IN: {} byte packet from tun for {}", packet.len(), id);
        self.user_send_data(id, packet, false).await;
    }

    async fn forward_query(&mut self, datagram: &[u8], from: SocketAddr) {
        let Some(port) = self.cfg.forward_port else {
            return;
        };
        let Some(sock) = &self.fwd_socket else {
            return;
        };
        let Some(id) = dns::query_id(datagram) else {
            return;
        };

        self.fwd_table.put(id, from);
        let resolver = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        log::debug!("forwarding query {} from {} to {}", id, from, resolver);
        if let Err(e) = sock.send_to(datagram, resolver).await {
            log::warn!("forward to resolver failed: {}", e);
        }
    }

    async fn on_forward_reply(&mut self, datagram: &[u8]) {
        let Some(id) = dns::query_id(datagram) else {
            return;
        };
        let Some(client) = self.fwd_table.get(id, Instant::now()) else {
            log::debug!("lost sender of forwarded query {}, dropping reply", id);
            return;
        };
        log::debug!("splicing resolver reply {} back to {}", id, client);
        self.send_dns(client, datagram).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::parse(b'v'), Some(Command::Version));
        assert_eq!(Command::parse(b'V'), Some(Command::Version));
        assert_eq!(Command::parse(b'p'), Some(Command::Ping));
        assert_eq!(Command::parse(b'z'), Some(Command::CaseCheck));
        assert_eq!(Command::parse(b'0'), Some(Command::Data(0)));
        assert_eq!(Command::parse(b'9'), Some(Command::Data(9)));
        assert_eq!(Command::parse(b'a'), Some(Command::Data(10)));
        assert_eq!(Command::parse(b'F'), Some(Command::Data(15)));
        assert_eq!(Command::parse(b'x'), None);
        assert_eq!(Command::parse(b'.'), None);
    }

    #[test]
    fn test_version_reply_layout() {
        let reply = version_reply(b"VACK", 0xDEAD_BEEF, 3);
        assert_eq!(&reply[..4], b"VACK");
        assert_eq!(&reply[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(reply[8], 3);
    }
}
