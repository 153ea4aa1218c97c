//! Best-effort delivery: fragments go out exactly once with consecutive sequence numbers,
//!  the receiving side reassembles what happens to arrive. Loss is absorbed by evicting
//!  whatever can no longer become a complete message, so the buffer stays bounded under
//!  arbitrary loss.

use std::sync::Arc;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};
use crate::config::UnreliableChannelConfig;
use crate::context::{ChannelId, PeerId, TransportLink};
use crate::envelope::UnreliableDataEnvelope;
use crate::fragment::Fragment;
use crate::seq::{Seq, SeqMap};

/// Send and receive state for one peer on one unreliable channel.
pub(crate) struct UnreliableConnection {
    channel: ChannelId,
    peer: PeerId,
    config: UnreliableChannelConfig,
    send_seq: Seq,
    queue: UnreliableReceiveQueue,
    scratch: Vec<u8>,
}

impl UnreliableConnection {
    pub fn new(channel: ChannelId, peer: PeerId, config: &UnreliableChannelConfig) -> UnreliableConnection {
        UnreliableConnection {
            channel,
            peer,
            config: config.clone(),
            send_seq: Seq::ZERO,
            queue: UnreliableReceiveQueue::new(config),
            scratch: Vec::new(),
        }
    }

    /// Send a message's fragments, fire and forget: one packet per fragment, with
    ///  consecutive sequence numbers. References are released as soon as the transport
    ///  took the bytes.
    pub fn send_message(&mut self, ctx: &dyn TransportLink, fragments: Vec<Arc<Fragment>>) {
        for fragment in fragments {
            self.send_seq = self.send_seq.next();
            let envelope = UnreliableDataEnvelope {
                channel: self.channel,
                seq: self.send_seq,
                fragment,
            };

            self.scratch.clear();
            envelope.ser(&mut self.scratch);
            if !ctx.send_packet(self.peer, &self.scratch, self.config.encrypt) {
                warn!("transport rejected packet {} to peer {}", self.send_seq, self.peer);
            }
        }
    }

    pub fn on_data(&mut self, envelope: UnreliableDataEnvelope) {
        self.queue.enqueue(envelope.seq, envelope.fragment);
    }

    /// next complete message, as its fragments in order
    pub fn try_read(&mut self) -> Option<Vec<Arc<Fragment>>> {
        self.queue.try_dequeue()
    }

    pub fn dispose(&mut self) {
        self.queue.dispose();
    }
}

/// Reassembly buffer on the receiving side of an unreliable channel. Fragments are kept
///  sorted by sequence number; a message is handed out once all of its fragments are
///  present, and is dropped as a whole when it cannot become complete any more.
struct UnreliableReceiveQueue {
    ordered: bool,
    max_buffer_size: usize,
    buffer: SeqMap<Arc<Fragment>>,
    /// fragments received so far, per incomplete message
    counts: FxHashMap<u16, u16>,
    /// message ids with all fragments present, awaiting dequeue
    ready: FxHashSet<u16>,
    last_dequeued: Seq,
    disposed: bool,
}

impl UnreliableReceiveQueue {
    fn new(config: &UnreliableChannelConfig) -> UnreliableReceiveQueue {
        UnreliableReceiveQueue {
            ordered: config.ordered,
            max_buffer_size: config.max_buffer_size,
            buffer: SeqMap::new(),
            counts: FxHashMap::default(),
            ready: FxHashSet::default(),
            // nothing dequeued yet: serially before every early sequence number
            last_dequeued: Seq::MAX,
            disposed: false,
        }
    }

    fn enqueue(&mut self, seq: Seq, fragment: Arc<Fragment>) {
        if self.disposed {
            return;
        }
        if self.ordered && self.last_dequeued.is_greater_or_equal(seq) {
            trace!("dropping late fragment {}: already handed out {}", seq, self.last_dequeued);
            return;
        }

        let message_id = fragment.message_id();
        let count = fragment.count();
        if !self.buffer.insert(seq, fragment) {
            trace!("dropping duplicate fragment {}", seq);
            return;
        }

        if count == 1 {
            self.ready.insert(message_id);
        } else {
            let seen = self.counts.entry(message_id).or_insert(0);
            *seen += 1;
            if *seen == count {
                self.counts.remove(&message_id);
                self.ready.insert(message_id);
            }
        }

        self.evict_for_room();
    }

    fn try_dequeue(&mut self) -> Option<Vec<Arc<Fragment>>> {
        if self.disposed {
            return None;
        }
        if self.ordered {
            self.purge_stale();
        }

        // earliest complete message in sequence order
        let (start, message_id, count) = self.buffer.entries().iter()
            .find(|(_, fragment)| self.ready.contains(&fragment.message_id()))
            .map(|(seq, fragment)| (*seq, fragment.message_id(), fragment.count()))?;
        if !self.run_is_intact(start, message_id, count) {
            self.discard_broken(message_id);
            return None;
        }

        self.ready.remove(&message_id);
        if self.ordered {
            self.last_dequeued = start;
        }

        let mut fragments = Vec::with_capacity(count as usize);
        let mut seq = start;
        for _ in 0..count {
            let fragment = self.buffer.remove(seq)
                .expect("this is a bug: missing fragment slot in a validated run");
            fragments.push(fragment);
            seq = seq.next();
        }
        Some(fragments)
    }

    /// A complete message's fragments occupy consecutive slots starting at its first
    ///  one; the count and counter map come from wire metadata, which can lie.
    fn run_is_intact(&self, start: Seq, message_id: u16, count: u16) -> bool {
        let mut cur = start;
        for _ in 0..count {
            match self.buffer.get(cur) {
                Some(fragment) if fragment.message_id() == message_id => cur = cur.next(),
                _ => return false,
            }
        }
        true
    }

    /// A message whose fragments do not sit where its metadata claims can never be
    ///  assembled. Drop every buffered trace of it instead of stalling on it.
    fn discard_broken(&mut self, message_id: u16) {
        let seqs = self.buffer.entries().iter()
            .filter(|(_, fragment)| fragment.message_id() == message_id)
            .map(|(seq, _)| *seq)
            .collect::<Vec<_>>();
        warn!("fragment metadata of message {} contradicts its buffered slots - dropping {} fragments",
              message_id, seqs.len());
        for seq in seqs {
            self.buffer.remove(seq);
        }
        self.counts.remove(&message_id);
        self.ready.remove(&message_id);
    }

    /// Evict oldest-first while the buffer is over capacity. Whole messages only, and
    ///  never one that is complete and waiting to be dequeued.
    fn evict_for_room(&mut self) {
        while self.buffer.len() >= self.max_buffer_size {
            // a single message may legitimately span more than the whole buffer
            if self.counts.len() + self.ready.len() <= 1 {
                break;
            }
            let Some((seq, fragment)) = self.buffer.first() else {
                break;
            };
            let message_id = fragment.message_id();
            if self.ready.contains(&message_id) {
                break;
            }

            debug!("receive buffer is full: evicting incomplete message {} at {}", message_id, seq);
            self.remove_front_run(message_id);
            self.counts.remove(&message_id);
        }
    }

    /// drop buffered fragments whose delivery window has closed, i.e. at or before the
    ///  last dequeued message's start
    fn purge_stale(&mut self) {
        let mut n = 0;
        for (seq, fragment) in self.buffer.entries() {
            if !self.last_dequeued.is_greater_or_equal(*seq) {
                break;
            }
            self.counts.remove(&fragment.message_id());
            self.ready.remove(&fragment.message_id());
            n += 1;
        }
        if n > 0 {
            trace!("purging {} stale fragments at or before {}", n, self.last_dequeued);
            self.buffer.drain_front(n);
        }
    }

    fn remove_front_run(&mut self, message_id: u16) {
        let mut n = 0;
        for (_, fragment) in self.buffer.entries() {
            if fragment.message_id() != message_id {
                break;
            }
            n += 1;
        }
        self.buffer.drain_front(n);
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.buffer.clear();
        self.counts.clear();
        self.ready.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use crate::context::MockTransportLink;
    use crate::fragment;
    use crate::fragment_pool::FragmentPool;
    use super::*;

    fn new_pool() -> Arc<FragmentPool> {
        Arc::new(FragmentPool::new(16, 64))
    }

    fn config(ordered: bool, max_buffer_size: usize) -> UnreliableChannelConfig {
        UnreliableChannelConfig { max_buffer_size, encrypt: false, ordered }
    }

    fn new_queue(ordered: bool, max_buffer_size: usize) -> UnreliableReceiveQueue {
        UnreliableReceiveQueue::new(&config(ordered, max_buffer_size))
    }

    fn message(pool: &Arc<FragmentPool>, message_id: u16, len: usize) -> Vec<Arc<Fragment>> {
        let payload = vec![message_id as u8; len];
        fragment::split(pool, message_id, &payload).unwrap()
    }

    fn enqueue_all(queue: &mut UnreliableReceiveQueue, first_seq: u16, fragments: &[Arc<Fragment>]) {
        let mut seq = Seq::from_raw(first_seq);
        for fragment in fragments {
            queue.enqueue(seq, fragment.clone());
            seq = seq.next();
        }
    }

    #[test]
    fn test_single_fragment_message_is_delivered() {
        let pool = new_pool();
        let mut queue = new_queue(false, 64);
        let msg = message(&pool, 1, 5);

        queue.enqueue(Seq::from_raw(1), msg[0].clone());

        let delivered = queue.try_dequeue().unwrap();
        assert_eq!(fragment::join(&delivered), fragment::join(&msg));
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn test_multi_fragment_message_waits_for_completeness() {
        let pool = new_pool();
        let mut queue = new_queue(false, 64);
        let msg = message(&pool, 1, 40); // 3 fragments at capacity 16

        queue.enqueue(Seq::from_raw(3), msg[2].clone());
        assert!(queue.try_dequeue().is_none());
        queue.enqueue(Seq::from_raw(1), msg[0].clone());
        assert!(queue.try_dequeue().is_none());
        queue.enqueue(Seq::from_raw(2), msg[1].clone());

        let delivered = queue.try_dequeue().unwrap();
        assert_eq!(delivered.len(), 3);
        assert_eq!(fragment::join(&delivered), fragment::join(&msg));
    }

    #[test]
    fn test_duplicate_sequence_is_dropped() {
        let pool = new_pool();
        let mut queue = new_queue(false, 64);
        let first = message(&pool, 1, 5);
        let second = message(&pool, 2, 5);

        queue.enqueue(Seq::from_raw(1), first[0].clone());
        drop(first);
        assert_eq!(pool.pooled_count(), 0); // the queue keeps its reference

        queue.enqueue(Seq::from_raw(1), second[0].clone());
        drop(second);
        assert_eq!(pool.pooled_count(), 1); // the duplicate was dropped, not buffered

        let delivered = queue.try_dequeue().unwrap();
        assert_eq!(delivered[0].message_id(), 1);
    }

    #[test]
    fn test_ordered_rejects_late_arrivals() {
        let pool = new_pool();
        let mut queue = new_queue(true, 64);

        let b = message(&pool, 2, 5);
        queue.enqueue(Seq::from_raw(2), b[0].clone());
        assert!(queue.try_dequeue().is_some());

        let a = message(&pool, 1, 5);
        queue.enqueue(Seq::from_raw(1), a[0].clone());
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn test_ordered_purges_overtaken_messages() {
        let pool = new_pool();
        let mut queue = new_queue(true, 64);

        // message 1 spans seqs 1+2 but only its first fragment arrives
        let a = message(&pool, 1, 20);
        queue.enqueue(Seq::from_raw(1), a[0].clone());

        let b = message(&pool, 2, 5);
        queue.enqueue(Seq::from_raw(3), b[0].clone());

        let delivered = queue.try_dequeue().unwrap();
        assert_eq!(delivered[0].message_id(), 2);

        // the straggler is now late and the buffered half can never complete
        queue.enqueue(Seq::from_raw(2), a[1].clone());
        assert!(queue.try_dequeue().is_none());

        drop(a);
        drop(b);
        drop(delivered);
        assert_eq!(pool.pooled_count(), 3);
    }

    #[test]
    fn test_ordered_purge_crosses_the_sequence_wrap() {
        let pool = new_pool();
        let mut queue = new_queue(true, 64);
        // long-lived channel: delivery has almost reached the numeric wrap
        queue.last_dequeued = Seq::from_raw(0xFFFC);

        // message 1 spans 0xFFFE+0xFFFF but only its first fragment arrives
        let a = message(&pool, 1, 20);
        queue.enqueue(Seq::from_raw(0xFFFE), a[0].clone());
        let b = message(&pool, 2, 5);
        queue.enqueue(Seq::from_raw(1), b[0].clone());

        let delivered = queue.try_dequeue().unwrap();
        assert_eq!(delivered[0].message_id(), 2);

        // the straggler from before the wrap is late now, and the buffered half
        //  is purged even though its raw sequence number is the larger one
        queue.enqueue(Seq::from_raw(0xFFFF), a[1].clone());
        assert!(queue.try_dequeue().is_none());
        assert_eq!(queue.buffer.len(), 0);

        drop(a);
        drop(b);
        drop(delivered);
        assert_eq!(pool.pooled_count(), 3);
    }

    #[test]
    fn test_unordered_delivers_late_completions() {
        let pool = new_pool();
        let mut queue = new_queue(false, 64);

        let a = message(&pool, 1, 20);
        queue.enqueue(Seq::from_raw(1), a[0].clone());

        let b = message(&pool, 2, 5);
        queue.enqueue(Seq::from_raw(3), b[0].clone());

        assert_eq!(queue.try_dequeue().unwrap()[0].message_id(), 2);

        queue.enqueue(Seq::from_raw(2), a[1].clone());
        let delivered = queue.try_dequeue().unwrap();
        assert_eq!(delivered[0].message_id(), 1);
        assert_eq!(fragment::join(&delivered), fragment::join(&a));
    }

    #[test]
    fn test_eviction_drops_oldest_incomplete_message() {
        let pool = new_pool();
        let mut queue = new_queue(false, 4);

        let a = message(&pool, 1, 20);
        queue.enqueue(Seq::from_raw(1), a[0].clone());
        let b = message(&pool, 2, 20);
        queue.enqueue(Seq::from_raw(3), b[0].clone());
        let c = message(&pool, 3, 20);
        enqueue_all(&mut queue, 5, &c);

        // inserting c's second fragment hit the limit and evicted the oldest message
        assert_eq!(queue.buffer.len(), 3);
        assert!(!queue.counts.contains_key(&1));

        assert_eq!(queue.try_dequeue().unwrap()[0].message_id(), 3);
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn test_eviction_spares_complete_front_message() {
        let pool = new_pool();
        let mut queue = new_queue(false, 2);

        let a = message(&pool, 1, 5);
        queue.enqueue(Seq::from_raw(1), a[0].clone());
        let b = message(&pool, 2, 20);
        queue.enqueue(Seq::from_raw(2), b[0].clone());

        // over the limit, but the front message is ready for the application
        assert_eq!(queue.buffer.len(), 2);
        assert_eq!(queue.try_dequeue().unwrap()[0].message_id(), 1);
    }

    #[test]
    fn test_eviction_drops_the_lone_incomplete_front_message() {
        let pool = new_pool();
        let mut queue = new_queue(false, 2);

        // message 1 spans seqs 1+2; the complete message behind it fills the buffer
        let a = message(&pool, 1, 20);
        queue.enqueue(Seq::from_raw(1), a[0].clone());
        let b = message(&pool, 2, 5);
        queue.enqueue(Seq::from_raw(3), b[0].clone());

        // room had to be made, and the complete message is untouchable: the
        //  incomplete front goes, as does its straggler when it shows up
        assert_eq!(queue.buffer.len(), 1);
        queue.enqueue(Seq::from_raw(2), a[1].clone());
        assert_eq!(queue.buffer.len(), 1);

        assert_eq!(queue.try_dequeue().unwrap()[0].message_id(), 2);
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn test_single_oversized_message_is_not_evicted() {
        let pool = new_pool();
        let mut queue = new_queue(false, 2);
        let a = message(&pool, 1, 40);

        enqueue_all(&mut queue, 1, &a);

        let delivered = queue.try_dequeue().unwrap();
        assert_eq!(delivered.len(), 3);
        assert_eq!(fragment::join(&delivered), fragment::join(&a));
    }

    #[test]
    fn test_contradictory_fragment_metadata_is_discarded() {
        let pool = new_pool();
        let mut queue = new_queue(false, 64);

        // count says 2, yet the fragments arrive at sequences 1 and 5
        let broken = message(&pool, 1, 20);
        queue.enqueue(Seq::from_raw(1), broken[0].clone());
        queue.enqueue(Seq::from_raw(5), broken[1].clone());
        drop(broken);

        assert!(queue.try_dequeue().is_none());
        assert_eq!(pool.pooled_count(), 2);

        // later traffic is unaffected
        let honest = message(&pool, 2, 5);
        queue.enqueue(Seq::from_raw(3), honest[0].clone());
        assert_eq!(queue.try_dequeue().unwrap()[0].message_id(), 2);
    }

    #[test]
    fn test_disposed_queue_releases_and_rejects() {
        let pool = new_pool();
        let mut queue = new_queue(false, 64);

        let a = message(&pool, 1, 5);
        queue.enqueue(Seq::from_raw(1), a[0].clone());
        drop(a);
        assert_eq!(pool.pooled_count(), 0);

        queue.dispose();
        assert_eq!(pool.pooled_count(), 1);

        let b = message(&pool, 2, 5);
        queue.enqueue(Seq::from_raw(2), b[0].clone());
        drop(b);
        assert_eq!(pool.pooled_count(), 2);
        assert!(queue.try_dequeue().is_none());

        queue.dispose(); // idempotent
    }

    #[test]
    fn test_send_assigns_consecutive_sequences() {
        let pool = new_pool();
        let config = config(false, 64);
        let mut connection = UnreliableConnection::new(ChannelId::from_raw(7), PeerId::from_raw(1), &config);

        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut link = MockTransportLink::new();
        let captured = sent.clone();
        link.expect_send_packet()
            .times(3)
            .returning(move |_, packet, _| {
                captured.lock().unwrap().push(packet.to_vec());
                true
            });

        let payload = (0..40).collect::<Vec<u8>>();
        connection.send_message(&link, fragment::split(&pool, 5, &payload).unwrap());
        assert_eq!(pool.pooled_count(), 3); // sender holds nothing back

        let sent = sent.lock().unwrap();
        let mut reassembled = Vec::new();
        for (i, packet) in sent.iter().enumerate() {
            let envelope = UnreliableDataEnvelope::deser(&mut packet.as_slice(), &pool).unwrap();
            assert_eq!(envelope.channel, ChannelId::from_raw(7));
            assert_eq!(envelope.seq, Seq::from_raw(i as u16 + 1));
            assert_eq!(envelope.fragment.message_id(), 5);
            reassembled.extend_from_slice(envelope.fragment.data());
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_send_receive_round_trip() {
        let pool = new_pool();
        let config = config(false, 64);
        let mut sender = UnreliableConnection::new(ChannelId::from_raw(7), PeerId::from_raw(1), &config);
        let mut receiver = UnreliableConnection::new(ChannelId::from_raw(7), PeerId::from_raw(2), &config);

        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut link = MockTransportLink::new();
        let captured = sent.clone();
        link.expect_send_packet()
            .returning(move |_, packet, _| {
                captured.lock().unwrap().push(packet.to_vec());
                true
            });

        let payload = (0..50).map(|i| i as u8).collect::<Vec<u8>>();
        sender.send_message(&link, fragment::split(&pool, 1, &payload).unwrap());

        for packet in sent.lock().unwrap().iter() {
            let envelope = UnreliableDataEnvelope::deser(&mut packet.as_slice(), &pool).unwrap();
            receiver.on_data(envelope);
        }

        let delivered = receiver.try_read().unwrap();
        assert_eq!(fragment::join(&delivered), payload);
        assert!(receiver.try_read().is_none());
    }
}
