//! Per-user answer cache
//!
//! Impatient resolvers re-send a query long before our lazy-mode timeout.
//! Dropping those retransmissions leaves the resolver with silence, which
//! only makes it more aggressive; answering them with the previously sent
//! bytes keeps it happy. The client's collision counter makes genuinely
//! new queries unique, so a hit here is always a retransmission.
//!
//! The ring is small on purpose: the data-frame collision counter only has
//! 36 values, so anything past half that risks false hits.

use crate::qmem::CachedQuery;
use burrow_protocol::dns::QueryType;

/// Cached answers per user.
pub const DNSCACHE_LEN: usize = 16;

/// Largest answer worth caching.
const MAX_CACHED_ANSWER: usize = 4096;

#[derive(Debug, Clone)]
struct Entry {
    /// Query id; 0 marks a consumed entry.
    id: u16,
    qtype: QueryType,
    name: Vec<u8>,
    answer: Vec<u8>,
}

/// Fixed ring of `(query, answer bytes)` pairs, most recent first lookup.
#[derive(Debug)]
pub struct AnswerCache {
    entries: Vec<Option<Entry>>,
    last_filled: usize,
}

impl Default for AnswerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AnswerCache {
    pub fn new() -> Self {
        AnswerCache {
            entries: (0..DNSCACHE_LEN).map(|_| None).collect(),
            last_filled: 0,
        }
    }

    pub fn clear(&mut self) {
        for e in &mut self.entries {
            *e = None;
        }
        self.last_filled = 0;
    }

    /// Remember the answer sent for `q`, overwriting the oldest slot.
    pub fn save(&mut self, q: &CachedQuery, answer: &[u8]) {
        if q.id == 0 || answer.is_empty() || answer.len() > MAX_CACHED_ANSWER {
            return;
        }
        let fill = (self.last_filled + 1) % DNSCACHE_LEN;
        self.entries[fill] = Some(Entry {
            id: q.id,
            qtype: q.qtype,
            name: q.name.clone(),
            answer: answer.to_vec(),
        });
        self.last_filled = fill;
    }

    /// Look up a retransmitted query. On a hit the stored answer is
    /// returned and the entry is consumed, so the same entry never matches
    /// twice.
    pub fn lookup(&mut self, qtype: QueryType, name: &[u8]) -> Option<Vec<u8>> {
        for i in 0..DNSCACHE_LEN {
            let idx = (self.last_filled + DNSCACHE_LEN - i) % DNSCACHE_LEN;
            if let Some(entry) = &mut self.entries[idx] {
                if entry.id == 0 || entry.answer.is_empty() {
                    continue;
                }
                if entry.qtype == qtype && entry.name == name {
                    entry.id = 0;
                    return Some(entry.answer.clone());
                }
            }
        }
        None
    }
}
