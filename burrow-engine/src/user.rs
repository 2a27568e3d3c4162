//! Per-user session table
//!
//! A fixed array of session slots, one per simultaneous client. The slot
//! index doubles as the user id on the wire (one hex character), which caps
//! the table at 16. Each slot owns everything belonging to its session:
//! both window buffers, the query memory and the answer cache.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use burrow_protocol::frame::DOWNSTREAM_PING_HDR;
use burrow_protocol::window::{WindowBuffer, WindowDir, DEFAULT_WINDOW_SIZE, WINDOW_BUFFER_LEN};
use burrow_protocol::NameEncoder;

use crate::cache::AnswerCache;
use crate::qmem::QueryMemory;

/// Session slots; the wire carries the user id as one hex character.
pub const USERS: usize = 16;

/// A session without traffic for this long no longer counts as active and
/// its slot may be handed to a new client.
pub const USER_ACTIVITY_BOUND: Duration = Duration::from_secs(60);

/// Initial downstream fragment size, conservative until the client probes.
pub const INITIAL_FRAGSIZE: u16 = 100;

/// Query timeout before the client sets its own via ping.
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(2);

/// Outgoing windows keep this many slots free so a full packet's worth of
/// fragments can always be queued from the TUN side.
const WINDOW_HEADROOM: usize = 16;

/// Slot index, used on the wire as the low hex digit of data qnames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(pub u8);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Session state, advanced by the handshake commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserState {
    /// Slot unused.
    #[default]
    Free,
    /// Version accepted, login outstanding.
    Versioned,
    /// Login verified; data commands are allowed.
    Authenticated,
}

/// Transport currently carrying this user's downstream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnType {
    #[default]
    None,
    /// Data rides inside DNS answers owned by the user's queries.
    DnsNull,
    /// Data rides in raw UDP datagrams to `raw_addr`.
    RawUdp,
}

/// One session slot.
#[derive(Debug)]
pub struct User {
    pub state: UserState,
    pub conn: ConnType,
    pub authenticated_raw: bool,

    /// Source address of the last accepted DNS query.
    pub peer_addr: Option<SocketAddr>,
    /// Source address seen at raw-UDP login; may differ from `peer_addr`.
    pub raw_addr: Option<SocketAddr>,

    /// Address of this slot inside the tunnel subnet.
    pub tun_ip: Ipv4Addr,

    /// Login challenge nonce, chosen at version handshake.
    pub seed: u32,

    pub upstream_encoder: NameEncoder,
    /// Downstream encoding selector: `T`, `S`, `U`, `V` or `R`.
    pub downenc: u8,
    pub downenc_bits: u32,
    pub down_compression: bool,
    pub lazy: bool,
    pub fragsize: u16,

    pub incoming: WindowBuffer,
    pub outgoing: WindowBuffer,

    /// Cumulative upstream ACK waiting to piggyback downstream; -1 = none.
    pub next_upstream_ack: i16,
    pub send_ping_next: bool,

    pub dns_timeout: Duration,
    pub last_pkt: Instant,

    pub qmem: QueryMemory,
    pub answer_cache: AnswerCache,
}

impl User {
    fn new(tun_ip: Ipv4Addr) -> Self {
        User {
            state: UserState::Free,
            conn: ConnType::None,
            authenticated_raw: false,
            peer_addr: None,
            raw_addr: None,
            tun_ip,
            seed: 0,
            upstream_encoder: NameEncoder::Base32,
            downenc: b'T',
            downenc_bits: 5,
            down_compression: true,
            lazy: false,
            fragsize: INITIAL_FRAGSIZE,
            incoming: WindowBuffer::new(WindowDir::Receiving, WINDOW_BUFFER_LEN, 0),
            outgoing: WindowBuffer::new(WindowDir::Sending, DEFAULT_WINDOW_SIZE, 0),
            next_upstream_ack: -1,
            send_ping_next: false,
            dns_timeout: DEFAULT_DNS_TIMEOUT,
            // meaningless until reset(); Free slots never count as active
            last_pkt: Instant::now(),
            qmem: QueryMemory::new(),
            answer_cache: AnswerCache::new(),
        }
    }

    /// Hand the slot to a new client: version accepted, everything else
    /// back to defaults.
    pub fn reset(&mut self, seed: u32, peer_addr: SocketAddr, raw_downenc: bool) {
        self.state = UserState::Versioned;
        self.conn = ConnType::DnsNull;
        self.authenticated_raw = false;
        self.peer_addr = Some(peer_addr);
        self.raw_addr = None;
        self.seed = seed;
        self.upstream_encoder = NameEncoder::Base32;
        if raw_downenc {
            self.downenc = b'R';
            self.downenc_bits = 8;
        } else {
            self.downenc = b'T';
            self.downenc_bits = 5;
        }
        self.down_compression = true;
        self.lazy = false;
        self.fragsize = INITIAL_FRAGSIZE;
        self.incoming.clear();
        self.outgoing.clear();
        self.update_maxfraglen();
        self.next_upstream_ack = -1;
        self.send_ping_next = false;
        self.dns_timeout = DEFAULT_DNS_TIMEOUT;
        self.last_pkt = Instant::now();
        self.qmem.clear();
        self.answer_cache.clear();
    }

    /// Recompute the outgoing fragment ceiling from the negotiated
    /// fragsize and downstream encoding density.
    pub fn update_maxfraglen(&mut self) {
        let raw = (self.downenc_bits as usize * self.fragsize as usize) / 8;
        self.outgoing
            .set_maxfraglen(raw.saturating_sub(DOWNSTREAM_PING_HDR));
    }

    /// Active means the slot is taken and saw traffic recently.
    pub fn is_active(&self, now: Instant) -> bool {
        self.state != UserState::Free
            && now.duration_since(self.last_pkt) < USER_ACTIVITY_BOUND
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == UserState::Authenticated
    }

    pub fn touch(&mut self) {
        self.last_pkt = Instant::now();
    }
}

/// The fixed session table plus the subnet math tying slots to addresses.
#[derive(Debug)]
pub struct UserTable {
    users: Vec<User>,
    created_users: usize,
    check_ip: bool,
}

impl UserTable {
    /// Slot *i* gets the address `server_ip + 1 + i`; the subnet size caps
    /// how many slots are usable.
    pub fn new(server_ip: Ipv4Addr, netmask: u8, check_ip: bool) -> Self {
        let host_bits = 32 - u32::from(netmask.min(30));
        // network and broadcast addresses, plus the server itself
        let usable = (1u64 << host_bits).saturating_sub(3) as usize;
        let created_users = USERS.min(usable);

        let base = u32::from(server_ip);
        let users = (0..USERS)
            .map(|i| User::new(Ipv4Addr::from(base.wrapping_add(1 + i as u32))))
            .collect();

        UserTable {
            users,
            created_users,
            check_ip,
        }
    }

    pub fn created_users(&self) -> usize {
        self.created_users
    }

    pub fn get(&self, id: UserId) -> &User {
        &self.users[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: UserId) -> &mut User {
        &mut self.users[id.0 as usize]
    }

    /// Valid user ids, usable slots only.
    pub fn ids(&self) -> impl Iterator<Item = UserId> {
        (0..self.created_users as u8).map(UserId)
    }

    /// First slot not actively in use, for a new version handshake.
    pub fn find_available(&self, now: Instant) -> Option<UserId> {
        self.ids().find(|&id| !self.get(id).is_active(now))
    }

    /// Find the active, authenticated session owning a tunnel address.
    pub fn find_by_tun_ip(&self, ip: Ipv4Addr, now: Instant) -> Option<UserId> {
        self.ids().find(|&id| {
            let u = self.get(id);
            u.is_active(now) && u.is_authenticated() && u.tun_ip == ip
        })
    }

    fn slot_in_range(&self, userid: u8) -> Option<UserId> {
        if (userid as usize) < self.created_users {
            Some(UserId(userid))
        } else {
            None
        }
    }

    /// Validate a user id and the query's source address. Used by the
    /// login path, where the session exists but is not yet authenticated.
    pub fn check_user_and_ip(&self, userid: u8, from: SocketAddr, now: Instant) -> Option<UserId> {
        let id = self.slot_in_range(userid)?;
        let u = self.get(id);
        if !u.is_active(now) {
            return None;
        }
        if self.check_ip && u.peer_addr != Some(from) {
            return None;
        }
        Some(id)
    }

    /// As [`check_user_and_ip`](Self::check_user_and_ip), but the session
    /// must have completed login.
    pub fn check_authenticated_user_and_ip(
        &self,
        userid: u8,
        from: SocketAddr,
        now: Instant,
    ) -> Option<UserId> {
        let id = self.check_user_and_ip(userid, from, now)?;
        if !self.get(id).is_authenticated() {
            return None;
        }
        Some(id)
    }

    /// Raw-mode variant: the source is compared against the address the
    /// raw login came from, not the DNS one.
    pub fn check_raw_user(&self, userid: u8, from: SocketAddr, now: Instant) -> Option<UserId> {
        let id = self.slot_in_range(userid)?;
        let u = self.get(id);
        if !u.is_active(now) || !u.is_authenticated() || !u.authenticated_raw {
            return None;
        }
        if self.check_ip && u.raw_addr != Some(from) {
            return None;
        }
        Some(id)
    }

    /// Drop any other authenticated session bound to the same peer
    /// address; one client endpoint owns at most one tunnel.
    pub fn evict_same_peer(&mut self, keep: UserId, peer: SocketAddr) {
        for idx in 0..self.created_users {
            let id = UserId(idx as u8);
            if id == keep {
                continue;
            }
            let u = self.get_mut(id);
            if u.is_authenticated() && u.peer_addr == Some(peer) {
                log::info!("{} replaced by a new session from {}", id, peer);
                u.state = UserState::Free;
                u.conn = ConnType::None;
            }
        }
    }

    /// True when reading more packets from the TUN device is pointless:
    /// every active DNS user's outgoing window is too full to take a
    /// packet, and nobody is on the raw transport.
    pub fn all_users_waiting_to_send(&self, now: Instant) -> bool {
        for id in self.ids() {
            let u = self.get(id);
            if !u.is_active(now) {
                continue;
            }
            match u.conn {
                ConnType::RawUdp => return false,
                ConnType::DnsNull => {
                    if u.outgoing.available() > WINDOW_HEADROOM {
                        return false;
                    }
                }
                ConnType::None => {}
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, last)), port)
    }

    fn table() -> UserTable {
        UserTable::new(Ipv4Addr::new(10, 0, 0, 1), 27, true)
    }

    #[test]
    fn test_slot_addresses() {
        let t = table();
        assert_eq!(t.get(UserId(0)).tun_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(t.get(UserId(5)).tun_ip, Ipv4Addr::new(10, 0, 0, 7));
    }

    #[test]
    fn test_created_users_capped_by_subnet() {
        assert_eq!(table().created_users(), 16);
        let small = UserTable::new(Ipv4Addr::new(10, 0, 0, 1), 29, true);
        assert_eq!(small.created_users(), 5);
    }

    #[test]
    fn test_allocation_and_reuse() {
        let mut t = table();
        let now = Instant::now();

        let id = t.find_available(now).unwrap();
        assert_eq!(id, UserId(0));
        t.get_mut(id).reset(1234, addr(1, 5000), false);

        // slot 0 is busy now
        assert_eq!(t.find_available(now).unwrap(), UserId(1));

        // stale sessions are handed out again
        t.get_mut(id).last_pkt = now - USER_ACTIVITY_BOUND;
        assert_eq!(t.find_available(now).unwrap(), UserId(0));
    }

    #[test]
    fn test_ip_check() {
        let mut t = table();
        let now = Instant::now();
        t.get_mut(UserId(0)).reset(1, addr(1, 5000), false);

        assert!(t.check_user_and_ip(0, addr(1, 5000), now).is_some());
        // different address or port fails
        assert!(t.check_user_and_ip(0, addr(2, 5000), now).is_none());
        assert!(t.check_user_and_ip(0, addr(1, 5001), now).is_none());
        // out-of-range and free slots fail
        assert!(t.check_user_and_ip(16, addr(1, 5000), now).is_none());
        assert!(t.check_user_and_ip(1, addr(1, 5000), now).is_none());
    }

    #[test]
    fn test_ip_check_disabled_allows_roaming() {
        let mut t = UserTable::new(Ipv4Addr::new(10, 0, 0, 1), 27, false);
        let now = Instant::now();
        t.get_mut(UserId(0)).reset(1, addr(1, 5000), false);
        assert!(t.check_user_and_ip(0, addr(9, 1234), now).is_some());
    }

    #[test]
    fn test_authenticated_check() {
        let mut t = table();
        let now = Instant::now();
        t.get_mut(UserId(0)).reset(1, addr(1, 5000), false);

        assert!(t.check_authenticated_user_and_ip(0, addr(1, 5000), now).is_none());
        t.get_mut(UserId(0)).state = UserState::Authenticated;
        assert!(t.check_authenticated_user_and_ip(0, addr(1, 5000), now).is_some());
    }

    #[test]
    fn test_find_by_tun_ip_needs_auth() {
        let mut t = table();
        let now = Instant::now();
        t.get_mut(UserId(2)).reset(1, addr(1, 5000), false);

        let ip = Ipv4Addr::new(10, 0, 0, 4);
        assert!(t.find_by_tun_ip(ip, now).is_none());
        t.get_mut(UserId(2)).state = UserState::Authenticated;
        assert_eq!(t.find_by_tun_ip(ip, now), Some(UserId(2)));
    }

    #[test]
    fn test_evict_same_peer() {
        let mut t = table();
        t.get_mut(UserId(0)).reset(1, addr(1, 5000), false);
        t.get_mut(UserId(0)).state = UserState::Authenticated;
        t.get_mut(UserId(1)).reset(2, addr(1, 5000), false);
        t.get_mut(UserId(1)).state = UserState::Authenticated;

        t.evict_same_peer(UserId(1), addr(1, 5000));
        assert_eq!(t.get(UserId(0)).state, UserState::Free);
        assert_eq!(t.get(UserId(1)).state, UserState::Authenticated);
    }

    #[test]
    fn test_all_users_waiting() {
        let mut t = table();
        let now = Instant::now();
        // no active users: nothing to send to, do not read the device
        assert!(t.all_users_waiting_to_send(now));

        t.get_mut(UserId(0)).reset(1, addr(1, 5000), false);
        assert!(!t.all_users_waiting_to_send(now));

        // raw users never block the device
        t.get_mut(UserId(0)).conn = ConnType::RawUdp;
        assert!(!t.all_users_waiting_to_send(now));
    }

    #[test]
    fn test_maxfraglen_follows_encoding() {
        let mut t = table();
        t.get_mut(UserId(0)).reset(1, addr(1, 5000), false);
        let u = t.get_mut(UserId(0));
        // T encoding: 100 chars * 5 bits / 8 - 7 byte header
        assert_eq!(u.outgoing.maxfraglen, 55);

        u.downenc = b'R';
        u.downenc_bits = 8;
        u.update_maxfraglen();
        assert_eq!(u.outgoing.maxfraglen, 93);
    }
}
