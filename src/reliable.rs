//! Acknowledged delivery: every fragment stays in flight until the peer's cumulative ack
//!  covers it. A fixed window bounds how much may be in flight at once; anything the
//!  window rejects waits its turn with its sequence number already assigned.
//!
//! Retransmission is three-tiered. Acks piggyback on data packets for free; gap
//!  information in explicit acks triggers fast resends. A coarse per-tick resend of
//!  the oldest in-flight packets catches everything else. A peer that makes no ack
//!  progress at all for the configured timeout is reported for disconnect, once, after
//!  which the connection is dead.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use crate::config::ReliableChannelConfig;
use crate::context::{ChannelId, PeerId, TransportLink};
use crate::envelope::{ReliableAckEnvelope, ReliableDataEnvelope};
use crate::fragment::Fragment;
use crate::reliable_queue::ReliableReceiveQueue;
use crate::seq::Seq;

/// acks ride on outgoing data anyway; a standalone ack is only rushed out if the last
///  one is older than this
const ACK_DEBOUNCE: Duration = Duration::from_millis(100);

struct InFlight {
    seq: Seq,
    fragment: Arc<Fragment>,
}

/// Send and receive state for one peer on one reliable channel.
pub(crate) struct ReliableConnection {
    channel: ChannelId,
    peer: PeerId,
    config: ReliableChannelConfig,
    send_seq: Seq,
    /// sent and not yet acknowledged, in sequence order
    ack_wait: VecDeque<InFlight>,
    /// held back by the window, in sequence order
    send_wait: VecDeque<InFlight>,
    queue: ReliableReceiveQueue,
    /// counts down while packets are in flight; any cumulative ack progress resets it
    timeout_remaining: Duration,
    /// accumulated update time, the clock behind ack debouncing
    clock: Duration,
    last_ack_sent: Duration,
    ack_pending: bool,
    timed_out: bool,
    disposed: bool,
    scratch: Vec<u8>,
}

impl ReliableConnection {
    pub fn new(channel: ChannelId, peer: PeerId, config: &ReliableChannelConfig) -> ReliableConnection {
        ReliableConnection {
            channel,
            peer,
            config: config.clone(),
            send_seq: Seq::ZERO,
            ack_wait: VecDeque::new(),
            send_wait: VecDeque::new(),
            queue: ReliableReceiveQueue::new(config.ordered),
            timeout_remaining: config.timeout,
            clock: Duration::ZERO,
            last_ack_sent: Duration::ZERO,
            ack_pending: false,
            timed_out: false,
            disposed: false,
            scratch: Vec::new(),
        }
    }

    /// Send a message's fragments. Whatever fits the in-flight window goes out
    ///  immediately, the rest queues with its sequence numbers already assigned.
    pub fn send_message(&mut self, ctx: &dyn TransportLink, fragments: Vec<Arc<Fragment>>) {
        if self.disposed || self.timed_out {
            debug!("dropping send to peer {}: the connection is defunct", self.peer);
            return;
        }

        for fragment in fragments {
            self.send_seq = self.send_seq.next();
            let entry = InFlight { seq: self.send_seq, fragment };

            if self.ack_wait.len() < self.config.max_window_size {
                self.send_data(ctx, entry.seq, &entry.fragment);
                self.ack_wait.push_back(entry);
            } else {
                trace!("window to peer {} is full: holding back {}", self.peer, entry.seq);
                self.send_wait.push_back(entry);
            }
        }
    }

    pub fn on_data(&mut self, ctx: &dyn TransportLink, envelope: ReliableDataEnvelope) {
        if self.disposed || self.timed_out {
            return;
        }

        self.handle_cumulative_ack(ctx, envelope.ack);

        let accepted = self.queue.enqueue(envelope.seq, envelope.fragment);
        if !accepted || self.clock - self.last_ack_sent > ACK_DEBOUNCE {
            // a rejected packet means the peer is missing our ack state; resync right away
            self.send_ack(ctx);
        } else {
            self.ack_pending = true;
        }
    }

    pub fn on_ack(&mut self, ctx: &dyn TransportLink, envelope: ReliableAckEnvelope) {
        if self.disposed || self.timed_out {
            return;
        }

        self.handle_cumulative_ack(ctx, envelope.received);

        if let Some(next_received) = envelope.next_received {
            // everything in flight below the end of the peer's first gap is known lost
            let to_resend = self.ack_wait.iter()
                .take(self.config.max_window_size)
                .take_while(|entry| next_received.is_greater(entry.seq))
                .map(|entry| (entry.seq, entry.fragment.clone()))
                .collect::<Vec<_>>();
            if !to_resend.is_empty() {
                trace!("fast resend of {} packets below {} to peer {}", to_resend.len(), next_received, self.peer);
                for (seq, fragment) in &to_resend {
                    self.send_data(ctx, *seq, fragment);
                }
            }
        }
    }

    /// next complete message, as its fragments in order
    pub fn try_read(&mut self) -> Option<Vec<Arc<Fragment>>> {
        self.queue.try_dequeue()
    }

    /// Periodic tick: coarse retransmission and the debounced ack flush. The peer
    ///  timeout also counts down here; time advances only through the deltas passed in.
    pub fn update(&mut self, ctx: &dyn TransportLink, delta: Duration) {
        if self.disposed || self.timed_out {
            return;
        }
        self.clock += delta;

        // resend a quarter of the window's oldest unacked packets per tick; enough to
        //  make progress under loss without flooding
        let n = (self.config.max_window_size / 4).min(self.ack_wait.len());
        if n > 0 {
            let to_resend = self.ack_wait.iter()
                .take(n)
                .map(|entry| (entry.seq, entry.fragment.clone()))
                .collect::<Vec<_>>();
            trace!("resending {} oldest in-flight packets to peer {}", to_resend.len(), self.peer);
            for (seq, fragment) in &to_resend {
                self.send_data(ctx, *seq, fragment);
            }
        }

        if self.ack_pending {
            self.send_ack(ctx);
        }

        // the timeout only runs while something is waiting for an ack
        if self.ack_wait.is_empty() {
            self.timeout_remaining = self.config.timeout;
        } else if self.timeout_remaining > delta {
            self.timeout_remaining -= delta;
        } else {
            self.timed_out = true;
            warn!("peer {} on channel {} made no ack progress for {:?}: giving up", self.peer, self.channel, self.config.timeout);
            ctx.disconnect_peer(self.channel, self.peer, "ack timeout");
        }
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.ack_wait.clear();
        self.send_wait.clear();
        self.queue.dispose();
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.ack_wait.len()
    }

    /// Drop everything the cumulative ack covers off the head of the in-flight list,
    ///  then promote held-back packets into the freed window space, sending each.
    fn handle_cumulative_ack(&mut self, ctx: &dyn TransportLink, acked: Seq) {
        while let Some(head) = self.ack_wait.front() {
            if head.seq.is_greater(acked) {
                break;
            }
            trace!("peer {} acknowledged {}", self.peer, head.seq);
            self.ack_wait.pop_front();
            self.timeout_remaining = self.config.timeout;
        }

        while self.ack_wait.len() < self.config.max_window_size {
            let Some(entry) = self.send_wait.pop_front() else {
                break;
            };
            self.send_data(ctx, entry.seq, &entry.fragment);
            self.ack_wait.push_back(entry);
        }
    }

    fn send_data(&mut self, ctx: &dyn TransportLink, seq: Seq, fragment: &Arc<Fragment>) {
        let envelope = ReliableDataEnvelope {
            channel: self.channel,
            seq,
            ack: self.queue.received(),
            fragment: fragment.clone(),
        };
        self.scratch.clear();
        envelope.ser(&mut self.scratch);
        if !ctx.send_packet(self.peer, &self.scratch, self.config.encrypt) {
            warn!("transport rejected packet {} to peer {}", seq, self.peer);
        }
    }

    fn send_ack(&mut self, ctx: &dyn TransportLink) {
        let envelope = ReliableAckEnvelope {
            channel: self.channel,
            received: self.queue.received(),
            next_received: self.queue.next_received(),
            last: self.queue.last(),
        };
        self.scratch.clear();
        envelope.ser(&mut self.scratch);
        ctx.send_packet(self.peer, &self.scratch, self.config.encrypt);
        self.last_ack_sent = self.clock;
        self.ack_pending = false;
    }
}
