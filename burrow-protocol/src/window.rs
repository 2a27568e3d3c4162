//! Sliding-window fragment buffer
//!
//! DNS transport is request/response shaped and unreliable, so each
//! direction of a session runs a small go-back-style window over an 8-bit
//! sequence space: outgoing packets are split into fragments of at most
//! `maxfraglen` bytes, fragments are retransmitted until acknowledged, and
//! incoming fragments are reordered and reassembled once a contiguous
//! start..end run is complete. One buffer instance exists per direction per
//! user.
//!
//! All sequence arithmetic is mod 256 with the window anchored at
//! `start_seq_id`; a fragment is inside the buffer iff its distance from the
//! anchor is below the buffer capacity.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Fragment slots per buffer. With an 8-bit sequence space this must stay
/// well below 128 so stale sequence numbers are distinguishable.
pub const WINDOW_BUFFER_LEN: usize = 64;

/// Default in-flight window for the sending direction.
pub const DEFAULT_WINDOW_SIZE: usize = 8;

/// How long an unacked fragment stays out before it is resent.
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(1000);

/// Distance from `from` to `to` on the 8-bit sequence circle.
pub fn seq_distance(from: u8, to: u8) -> usize {
    to.wrapping_sub(from) as usize
}

/// One unit of windowed transfer.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub seq_id: u8,
    pub data: Vec<u8>,
    /// First fragment of a packet.
    pub start: bool,
    /// Last fragment of a packet.
    pub end: bool,
    /// The reassembled packet is a zlib stream.
    pub compressed: bool,
    /// Piggybacked cumulative ACK for the opposite direction, -1 when absent.
    pub ack_other: i16,
    acked: bool,
    last_sent: Option<Instant>,
    pub retries: u32,
}

impl Fragment {
    /// Fragment received from the peer.
    pub fn incoming(seq_id: u8, data: Vec<u8>, start: bool, end: bool, compressed: bool) -> Self {
        Fragment {
            seq_id,
            data,
            start,
            end,
            compressed,
            ack_other: -1,
            acked: false,
            last_sent: None,
            retries: 0,
        }
    }
}

/// Which way this buffer moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDir {
    Sending,
    Receiving,
}

/// Ring of fragments anchored at `start_seq_id`.
///
/// Sending buffers hold only fragments not yet acknowledged, packed
/// contiguously from the anchor. Receiving buffers hold the (possibly
/// sparse) fragments of the packet currently being reassembled.
#[derive(Debug)]
pub struct WindowBuffer {
    dir: WindowDir,
    slots: Vec<Option<Fragment>>,
    start_slot: usize,
    numitems: usize,
    pub windowsize: usize,
    pub maxfraglen: usize,
    pub start_seq_id: u8,
    next_seq_id: u8,
    retransmit: Duration,
}

impl WindowBuffer {
    pub fn new(dir: WindowDir, windowsize: usize, maxfraglen: usize) -> Self {
        WindowBuffer {
            dir,
            slots: (0..WINDOW_BUFFER_LEN).map(|_| None).collect(),
            start_slot: 0,
            numitems: 0,
            windowsize: windowsize.min(WINDOW_BUFFER_LEN),
            maxfraglen,
            start_seq_id: 0,
            next_seq_id: 0,
            retransmit: RETRANSMIT_INTERVAL,
        }
    }

    /// Drop all fragments and re-anchor at sequence 0.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.start_slot = 0;
        self.numitems = 0;
        self.start_seq_id = 0;
        self.next_seq_id = 0;
    }

    pub fn direction(&self) -> WindowDir {
        self.dir
    }

    /// Free fragment slots.
    pub fn available(&self) -> usize {
        WINDOW_BUFFER_LEN - self.numitems
    }

    pub fn is_empty(&self) -> bool {
        self.numitems == 0
    }

    pub fn len(&self) -> usize {
        self.numitems
    }

    pub fn set_maxfraglen(&mut self, maxfraglen: usize) {
        self.maxfraglen = maxfraglen;
    }

    #[cfg(test)]
    fn set_retransmit(&mut self, interval: Duration) {
        self.retransmit = interval;
    }

    fn slot_at(&self, offset: usize) -> usize {
        (self.start_slot + offset) % WINDOW_BUFFER_LEN
    }

    /// Split `data` into fragments and queue them for sending. The first
    /// fragment carries `start`, the last carries `end`; sequence ids are
    /// assigned monotonically mod 256. Fails without queueing anything when
    /// the buffer lacks room for the whole packet.
    pub fn add_outgoing_data(&mut self, data: &[u8], compressed: bool) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.maxfraglen == 0 {
            return Err(Error::FragmentTooLarge {
                len: data.len(),
                max: 0,
            });
        }
        let nfrags = data.len().div_ceil(self.maxfraglen);
        if nfrags > self.available() {
            return Err(Error::WindowFull {
                needed: nfrags,
                available: self.available(),
            });
        }

        for (i, chunk) in data.chunks(self.maxfraglen).enumerate() {
            let frag = Fragment {
                seq_id: self.next_seq_id,
                data: chunk.to_vec(),
                start: i == 0,
                end: i == nfrags - 1,
                compressed,
                ack_other: -1,
                acked: false,
                last_sent: None,
                retries: 0,
            };
            let slot = self.slot_at(self.numitems);
            self.slots[slot] = Some(frag);
            self.numitems += 1;
            self.next_seq_id = self.next_seq_id.wrapping_add(1);
        }
        Ok(nfrags)
    }

    /// Number of in-window fragments due for (re)transmission.
    pub fn window_sending(&self, now: Instant) -> usize {
        let limit = self.windowsize.min(self.numitems);
        (0..limit)
            .filter(|&off| match &self.slots[self.slot_at(off)] {
                Some(f) => !f.acked && self.is_due(f, now),
                None => false,
            })
            .count()
    }

    fn is_due(&self, f: &Fragment, now: Instant) -> bool {
        match f.last_sent {
            None => true,
            Some(t) => now.duration_since(t) >= self.retransmit,
        }
    }

    /// Pick the oldest sendable fragment inside the window, stamp it as
    /// sent, and piggyback the pending upstream ACK onto it. The caller's
    /// `next_upstream_ack` is consumed (reset to -1).
    pub fn next_sending_fragment(
        &mut self,
        now: Instant,
        next_upstream_ack: &mut i16,
    ) -> Option<Fragment> {
        let limit = self.windowsize.min(self.numitems);
        let offset = (0..limit).find(|&off| match &self.slots[self.slot_at(off)] {
            Some(f) => !f.acked && self.is_due(f, now),
            None => false,
        })?;

        let slot = self.slot_at(offset);
        let frag = self.slots[slot].as_mut()?;
        if frag.last_sent.is_some() {
            frag.retries += 1;
        }
        frag.last_sent = Some(now);
        frag.ack_other = *next_upstream_ack;
        *next_upstream_ack = -1;
        Some(frag.clone())
    }

    /// Cumulative acknowledgement: every queued fragment up to and
    /// including `seq` is marked acked. Out-of-window values are ignored.
    pub fn ack(&mut self, seq: u8) {
        let dist = seq_distance(self.start_seq_id, seq);
        if dist >= self.numitems {
            return;
        }
        for off in 0..=dist {
            let idx = self.slot_at(off);
            if let Some(f) = self.slots[idx].as_mut() {
                f.acked = true;
            }
        }
    }

    /// Slide the anchor past the acknowledged prefix, releasing slots.
    pub fn tick(&mut self) {
        while self.numitems > 0 {
            let slot = self.start_slot;
            match &self.slots[slot] {
                Some(f) if f.acked => {
                    self.slots[slot] = None;
                    self.start_slot = (slot + 1) % WINDOW_BUFFER_LEN;
                    self.start_seq_id = self.start_seq_id.wrapping_add(1);
                    self.numitems -= 1;
                }
                _ => break,
            }
        }
    }

    /// Store an incoming fragment and return the cumulative ACK to echo
    /// back: the highest sequence id of the contiguous run accepted so far.
    /// Fragments behind the window (already delivered) and duplicates only
    /// re-trigger the ACK.
    pub fn process_incoming_fragment(&mut self, frag: Fragment) -> u8 {
        let dist = seq_distance(self.start_seq_id, frag.seq_id);
        if dist < WINDOW_BUFFER_LEN {
            let slot = self.slot_at(dist);
            if self.slots[slot].is_none() {
                self.slots[slot] = Some(frag);
                self.numitems += 1;
            }
        }
        self.cumulative_ack()
    }

    fn contiguous_run(&self) -> usize {
        (0..WINDOW_BUFFER_LEN)
            .take_while(|&off| self.slots[self.slot_at(off)].is_some())
            .count()
    }

    /// Sequence id of the last contiguously received fragment.
    pub fn cumulative_ack(&self) -> u8 {
        self.start_seq_id
            .wrapping_add(self.contiguous_run() as u8)
            .wrapping_sub(1)
    }

    /// If a complete packet (a contiguous start..end run at the head) is
    /// buffered, pop it out and advance the anchor past it. Returns the
    /// packet bytes and its compressed flag.
    pub fn reassemble_data(&mut self) -> Option<(Vec<u8>, bool)> {
        let run = self.contiguous_run();
        if run == 0 {
            return None;
        }

        // A head fragment without the start marker cannot begin a packet;
        // drop it to resync with the peer.
        let head_ok = self.slots[self.slot_at(0)]
            .as_ref()
            .map(|f| f.start)
            .unwrap_or(false);
        if !head_ok {
            log::debug!(
                "dropping stray fragment {} without start marker",
                self.start_seq_id
            );
            self.drop_head(1);
            return None;
        }

        let end_off = (0..run).find(|&off| {
            self.slots[self.slot_at(off)]
                .as_ref()
                .map(|f| f.end)
                .unwrap_or(false)
        })?;

        let mut packet = Vec::new();
        let mut compressed = false;
        for off in 0..=end_off {
            let slot = self.slot_at(off);
            if let Some(f) = self.slots[slot].take() {
                compressed = f.compressed;
                packet.extend_from_slice(&f.data);
            }
        }
        self.start_slot = self.slot_at(end_off + 1);
        self.start_seq_id = self.start_seq_id.wrapping_add(end_off as u8 + 1);
        self.numitems -= end_off + 1;

        Some((packet, compressed))
    }

    fn drop_head(&mut self, count: usize) {
        for off in 0..count {
            let slot = self.slot_at(off);
            if self.slots[slot].take().is_some() {
                self.numitems -= 1;
            }
        }
        self.start_slot = self.slot_at(count);
        self.start_seq_id = self.start_seq_id.wrapping_add(count as u8);
    }
}
