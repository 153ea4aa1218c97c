//! Reassembly buffer on the receiving side of a reliable channel. Besides holding
//!  fragments until their message is complete, it is the bookkeeper for everything the
//!  acks advertise: the cumulative mark, the end of the first gap, and the high-water
//!  mark.
//!
//! Dequeued slots in unordered mode become tombstones rather than disappearing, so a
//!  message handed out early (behind a gap) keeps its sequence slots visible to the
//!  cumulative machinery; a contiguous tombstone run at the front is compacted away.

use std::sync::Arc;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{trace, warn};
use crate::fragment::Fragment;
use crate::seq::{Seq, SeqMap};

pub(crate) struct ReliableReceiveQueue {
    ordered: bool,
    buffer: SeqMap<Option<Arc<Fragment>>>,
    /// fragments received so far, per multi-fragment message
    counts: FxHashMap<u16, u16>,
    /// complete message ids awaiting dequeue; unordered mode only
    ready: FxHashSet<u16>,
    /// everything up to and including this arrived
    received: Seq,
    /// end of the first gap after `received`, none while there is no gap
    next_received: Option<Seq>,
    /// highest sequence number seen at all
    last: Seq,
    /// next sequence number to hand out; ordered mode only
    cursor: Seq,
    disposed: bool,
}

impl ReliableReceiveQueue {
    pub fn new(ordered: bool) -> ReliableReceiveQueue {
        ReliableReceiveQueue {
            ordered,
            buffer: SeqMap::new(),
            counts: FxHashMap::default(),
            ready: FxHashSet::default(),
            received: Seq::ZERO,
            next_received: None,
            last: Seq::ZERO,
            cursor: Seq::ZERO.next(),
            disposed: false,
        }
    }

    pub fn received(&self) -> Seq {
        self.received
    }

    pub fn next_received(&self) -> Option<Seq> {
        self.next_received
    }

    pub fn last(&self) -> Seq {
        self.last
    }

    /// Buffer a received fragment. Returns false if it was rejected as stale or duplicate,
    ///  which the caller answers with an immediate ack.
    pub fn enqueue(&mut self, seq: Seq, fragment: Arc<Fragment>) -> bool {
        if self.disposed {
            return false;
        }
        if !seq.is_greater(self.received) {
            trace!("dropping stale fragment {}: cumulative mark is {}", seq, self.received);
            return false;
        }

        let message_id = fragment.message_id();
        let count = fragment.count();
        if !self.buffer.insert(seq, Some(fragment)) {
            trace!("dropping duplicate fragment {}", seq);
            return false;
        }

        if seq.is_greater(self.last) {
            self.last = seq;
        }
        while self.buffer.contains_key(self.received.next()) {
            self.received = self.received.next();
        }
        self.update_next_received();
        self.update_count(message_id, count);
        true
    }

    pub fn try_dequeue(&mut self) -> Option<Vec<Arc<Fragment>>> {
        if self.disposed {
            return None;
        }
        if self.ordered {
            self.try_dequeue_ordered()
        } else {
            self.try_dequeue_unordered()
        }
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.buffer.clear();
        self.counts.clear();
        self.ready.clear();
    }

    fn update_next_received(&mut self) {
        if self.received == self.last {
            self.next_received = None;
            return;
        }
        // the first gap begins right after the cumulative mark; walk to where it ends,
        //  bounded by the high-water mark
        let mut cur = self.received.next();
        while self.last.is_greater(cur) && !self.buffer.contains_key(cur) {
            cur = cur.next();
        }
        self.next_received = Some(cur);
    }

    fn update_count(&mut self, message_id: u16, count: u16) {
        if count == 1 {
            if !self.ordered {
                self.ready.insert(message_id);
            }
            return;
        }
        let seen = self.counts.entry(message_id).or_insert(0);
        *seen += 1;
        if !self.ordered && *seen == count {
            self.counts.remove(&message_id);
            self.ready.insert(message_id);
        }
    }

    /// Strict order: only the message at the read cursor may come out, and only once all
    ///  of its fragments are in.
    fn try_dequeue_ordered(&mut self) -> Option<Vec<Arc<Fragment>>> {
        let slot = self.buffer.get(self.cursor)?;
        let fragment = slot.as_ref()
            .expect("this is a bug: tombstone at the read cursor of an ordered queue");
        let message_id = fragment.message_id();
        let count = fragment.count();

        if count > 1 {
            match self.counts.get(&message_id).copied() {
                Some(seen) if seen == count => {}
                Some(seen) if seen > count => {
                    self.discard_broken(message_id);
                    return None;
                }
                _ => return None,
            }
        }
        if !self.run_is_intact(self.cursor, message_id, count) {
            self.discard_broken(message_id);
            return None;
        }
        self.counts.remove(&message_id);

        let mut fragments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let slot = self.buffer.remove(self.cursor)
                .expect("this is a bug: missing fragment slot in a validated run");
            fragments.push(slot.expect("this is a bug: tombstone in a validated run"));
            self.cursor = self.cursor.next();
        }
        Some(fragments)
    }

    /// Any complete message may come out, earliest first. Its slots stay behind as
    ///  tombstones until compaction catches up with them.
    fn try_dequeue_unordered(&mut self) -> Option<Vec<Arc<Fragment>>> {
        let (start, message_id, count) = self.buffer.entries().iter()
            .find_map(|(seq, slot)| {
                let fragment = slot.as_ref()?;
                if self.ready.contains(&fragment.message_id()) {
                    Some((*seq, fragment.message_id(), fragment.count()))
                } else {
                    None
                }
            })?;
        if !self.run_is_intact(start, message_id, count) {
            self.discard_broken(message_id);
            return None;
        }
        self.ready.remove(&message_id);

        let mut fragments = Vec::with_capacity(count as usize);
        let mut seq = start;
        for _ in 0..count {
            let slot = self.buffer.get_mut(seq)
                .expect("this is a bug: missing fragment slot in a validated run");
            fragments.push(slot.take()
                .expect("this is a bug: consumed fragment slot in a validated run"));
            seq = seq.next();
        }
        self.compact();
        Some(fragments)
    }

    /// A complete message's fragments occupy consecutive slots starting at its first
    ///  one; the count and counter map come from wire metadata, which can lie.
    fn run_is_intact(&self, start: Seq, message_id: u16, count: u16) -> bool {
        let mut cur = start;
        for _ in 0..count {
            match self.buffer.get(cur) {
                Some(Some(fragment)) if fragment.message_id() == message_id => cur = cur.next(),
                _ => return false,
            }
        }
        true
    }

    /// A message whose fragments do not sit where its metadata claims can never be
    ///  assembled. Drop every buffered trace of it instead of stalling on it.
    fn discard_broken(&mut self, message_id: u16) {
        if self.ordered {
            // step the cursor over the message's leading run
            while matches!(self.buffer.get(self.cursor), Some(Some(f)) if f.message_id() == message_id) {
                self.cursor = self.cursor.next();
            }
        }

        let seqs = self.buffer.entries().iter()
            .filter(|(_, slot)| slot.as_ref().is_some_and(|f| f.message_id() == message_id))
            .map(|(seq, _)| *seq)
            .collect::<Vec<_>>();
        warn!("fragment metadata of message {} contradicts its buffered slots - dropping {} fragments",
              message_id, seqs.len());
        for seq in seqs {
            self.buffer.remove(seq);
        }
        self.counts.remove(&message_id);
        self.ready.remove(&message_id);
        self.compact();
    }

    fn compact(&mut self) {
        let n = self.buffer.entries().iter()
            .take_while(|(_, slot)| slot.is_none())
            .count();
        if n > 0 {
            self.buffer.drain_front(n);
        }
    }
}
