//! Query memory
//!
//! Per-user ring of recently seen DNS queries. It serves two purposes at
//! once: deduplicating resolver retransmissions (an already-seen query gets
//! the one-byte "illegal" answer so the client retries with a fresh
//! collision counter), and holding on to unanswered queries so lazy mode
//! can answer them later, when data shows up or their timeout nears.
//!
//! Layout: queries live in arrival order in a ring of [`QMEM_LEN`] slots.
//! `[start, end)` spans every remembered query; the pending (not yet
//! answered) ones are the contiguous tail `[start_pending, end)`. Answered
//! queries stay behind as dedup evidence until the ring wraps over them.

use std::net::SocketAddr;
use std::time::Instant;

use burrow_protocol::dns::{DnsQuery, QueryType};

/// Remembered queries per user. Must cover at least one full send window.
pub const QMEM_LEN: usize = 16;

/// A query held for dedup and deferred answering.
#[derive(Debug, Clone)]
pub struct CachedQuery {
    pub id: u16,
    pub qtype: QueryType,
    pub name: Vec<u8>,
    pub from: SocketAddr,
    pub received: Instant,
}

impl CachedQuery {
    pub fn new(q: &DnsQuery, from: SocketAddr) -> Self {
        CachedQuery {
            id: q.id,
            qtype: q.qtype,
            name: q.name.clone(),
            from,
            received: Instant::now(),
        }
    }
}

/// Outcome of [`QueryMemory::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    /// New query, remembered and pending.
    Stored,
    /// Same `(id, type, name)` already in the ring. Send the illegal
    /// answer and drop the query.
    Duplicate,
    /// Every slot holds a pending query. The query is processed but cannot
    /// be remembered or answered later.
    Refused,
}

/// Ring of remembered queries, see module docs.
#[derive(Debug)]
pub struct QueryMemory {
    queries: Vec<Option<CachedQuery>>,
    start: usize,
    start_pending: usize,
    end: usize,
    length: usize,
    num_pending: usize,
}

impl Default for QueryMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryMemory {
    pub fn new() -> Self {
        QueryMemory {
            queries: (0..QMEM_LEN).map(|_| None).collect(),
            start: 0,
            start_pending: 0,
            end: 0,
            length: 0,
            num_pending: 0,
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.queries {
            *slot = None;
        }
        self.start = 0;
        self.start_pending = 0;
        self.end = 0;
        self.length = 0;
        self.num_pending = 0;
    }

    pub fn num_pending(&self) -> usize {
        self.num_pending
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Record an incoming query.
    pub fn append(&mut self, q: CachedQuery) -> Append {
        for i in 0..self.length {
            let idx = (self.start + i) % QMEM_LEN;
            if let Some(stored) = &self.queries[idx] {
                if stored.id == q.id && stored.qtype == q.qtype && stored.name == q.name {
                    return Append::Duplicate;
                }
            }
        }

        if self.num_pending >= QMEM_LEN {
            return Append::Refused;
        }

        if self.length < QMEM_LEN {
            self.length += 1;
        } else {
            // overwrite the oldest answered query
            self.start = (self.start + 1) % QMEM_LEN;
        }

        self.queries[self.end] = Some(q);
        self.end = (self.end + 1) % QMEM_LEN;
        self.num_pending += 1;
        Append::Stored
    }

    /// Mark the oldest pending query as answered. Exactly one call per
    /// downstream response sent from the ring.
    pub fn answered(&mut self) {
        if self.num_pending == 0 {
            log::debug!("answered() without a pending query");
            return;
        }
        self.start_pending = (self.start_pending + 1) % QMEM_LEN;
        self.num_pending -= 1;
    }

    /// The oldest pending query, if any. Not marked as answered.
    pub fn next_pending(&self) -> Option<&CachedQuery> {
        if self.num_pending == 0 {
            return None;
        }
        self.queries[self.start_pending].as_ref()
    }

    /// Pending queries, oldest first.
    pub fn pending_iter(&self) -> impl Iterator<Item = &CachedQuery> {
        (0..self.num_pending).filter_map(move |i| {
            let idx = (self.start_pending + i) % QMEM_LEN;
            self.queries[idx].as_ref()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn query(id: u16, name: &[u8]) -> CachedQuery {
        CachedQuery {
            id,
            qtype: QueryType::Null,
            name: name.to_vec(),
            from: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999),
            received: Instant::now(),
        }
    }

    #[test]
    fn test_append_and_answer() {
        let mut qmem = QueryMemory::new();
        assert_eq!(qmem.append(query(1, b"a.t")), Append::Stored);
        assert_eq!(qmem.append(query(2, b"b.t")), Append::Stored);
        assert_eq!(qmem.num_pending(), 2);

        assert_eq!(qmem.next_pending().unwrap().id, 1);
        qmem.answered();
        assert_eq!(qmem.next_pending().unwrap().id, 2);
        qmem.answered();
        assert!(qmem.next_pending().is_none());
        // answered queries are still remembered for dedup
        assert_eq!(qmem.len(), 2);
    }

    #[test]
    fn test_duplicate_never_increments_pending() {
        let mut qmem = QueryMemory::new();
        qmem.append(query(7, b"x.t"));
        assert_eq!(qmem.append(query(7, b"x.t")), Append::Duplicate);
        assert_eq!(qmem.num_pending(), 1);

        // still a duplicate after being answered
        qmem.answered();
        assert_eq!(qmem.append(query(7, b"x.t")), Append::Duplicate);
        assert_eq!(qmem.num_pending(), 0);
    }

    #[test]
    fn test_same_id_different_name_is_new() {
        let mut qmem = QueryMemory::new();
        qmem.append(query(7, b"x.t"));
        assert_eq!(qmem.append(query(7, b"y.t")), Append::Stored);
        assert_eq!(qmem.num_pending(), 2);
    }

    #[test]
    fn test_refuses_when_all_pending() {
        let mut qmem = QueryMemory::new();
        for i in 0..QMEM_LEN as u16 {
            assert_eq!(qmem.append(query(i + 1, b"q.t")), Append::Stored);
        }
        assert_eq!(qmem.append(query(999, b"q.t")), Append::Refused);
        assert_eq!(qmem.num_pending(), QMEM_LEN);
    }

    #[test]
    fn test_wraps_over_answered_queries() {
        let mut qmem = QueryMemory::new();
        for i in 0..QMEM_LEN as u16 {
            qmem.append(query(i + 1, b"q.t"));
            qmem.answered();
        }
        assert_eq!(qmem.len(), QMEM_LEN);

        // ring full of answered queries: the oldest gives way
        assert_eq!(qmem.append(query(100, b"q.t")), Append::Stored);
        assert_eq!(qmem.len(), QMEM_LEN);
        assert_eq!(qmem.num_pending(), 1);
        // the overwritten query (id 1) no longer counts as duplicate
        assert_eq!(qmem.append(query(1, b"q.t")), Append::Stored);
    }

    #[test]
    fn test_pending_iter_order() {
        let mut qmem = QueryMemory::new();
        for i in 1..=5u16 {
            qmem.append(query(i, b"q.t"));
        }
        qmem.answered();
        let ids: Vec<u16> = qmem.pending_iter().map(|q| q.id).collect();
        assert_eq!(ids, [2, 3, 4, 5]);
    }
}
