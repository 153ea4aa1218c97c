//! This transport layer runs over UDP and provides two delivery qualities (best-effort and
//!  acknowledged/retransmitted), multiplexed over independent *channels*, each channel keeping
//!  its own sequencing and buffering state per remote peer.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data as opposed
//!   to streams of bytes)
//!   * messages larger than one MTU-sized packet are split into *fragments* and reassembled on
//!     the receiving side - this layer takes care of chunking, buffering and re-assembly
//!   * fragment buffers are pooled and reused to keep the send/receive hot path free of
//!     allocation
//! * Several logical streams ('channels') are multiplexed over one physical connection, each
//!   with its own quality of service
//!   * *reliable* channels retransmit until acknowledged: sliding send window, cumulative +
//!     selective acknowledgement, piggybacked acks on data packets
//!   * *unreliable* channels buffer just enough to reassemble multi-fragment messages, with a
//!     hard bound and whole-message eviction under pressure
//!   * both kinds can be configured for strict in-order delivery or for completion order
//! * Sequence numbers are 16 bits and wrap around, so 0 follows after FFFF; all ordering
//!   decisions use serial arithmetic that tolerates the wrap
//! * No handshake, no connection state machine in here: peers, sockets, encryption and
//!   timers live in an outer layer behind a narrow collaborator interface
//!   * packets handed out carry an `encrypt` flag for the outer layer's encryption step;
//!     inbound packets arrive already decrypted and authenticated
//!   * the only failure escalated out of this layer is a reliable ack timeout, reported as a
//!     disconnect for that peer
//! * Everything here is synchronous and non-blocking; timeouts advance by explicit delta time
//!   fed from a periodic update call, which makes them deterministic and testable
//!
//! ## Wire format
//!
//! All numbers are little-endian. A fragment travels as:
//!
//! ```ascii
//! 0: message id (u16) - identifies the logical message, scoped per sender+channel
//! 2: length (u16)     - total fragment count of the message; 1 means 'not split'
//! 4: index (u16)      - position of this fragment within the message
//! 6: data size (u16)  - valid payload bytes in this fragment
//! 8: data
//! ```
//!
//! Unreliable data packet:
//!
//! ```ascii
//! 0: channel id (u16)
//! 2: type tag (u8) = 1
//! 3: sequence (u16)
//! 5: fragment (see above)
//! ```
//!
//! Reliable data packet:
//!
//! ```ascii
//! 0: channel id (u16)
//! 2: type tag (u8) = 2
//! 3: sequence (u16)
//! 5: piggyback ack (u16) - the sender's current cumulative receive sequence, refreshed on
//!     every (re)send so retransmits carry the newest value
//! 7: fragment (see above)
//! ```
//!
//! Reliable ack packet:
//!
//! ```ascii
//! 0: channel id (u16)
//! 2: type tag (u8) = 3
//! 3: received sequence (u16)      - cumulative: highest sequence with no gap before it
//! 5: next received sequence (u16) - end of the first gap after it, FFFF if there is no gap;
//!     everything in flight serially below this value is fast-resent without waiting for the
//!     coarse retransmit timer
//! 7: last sequence (u16)          - highest sequence observed at all
//! ```
//!
//! ## Reliability
//!
//! Each reliable channel keeps, per peer, a send window of at most `max_window_size`
//!  unacknowledged packets; further sends queue up and are promoted as acks free window space.
//!  Acknowledgement is cumulative with a selective fast-retransmit hint (see the ack packet
//!  above), debounced so that at most one ack per debounce interval is sent unless an enqueue
//!  was rejected. A coarse retransmit of the oldest quarter window runs on every update tick.
//!  If no ack progress happens for the configured timeout while packets are in flight, the
//!  peer is presumed unreachable and reported to the outer layer exactly once.
//!
//! NB: delivery is at-least-once, with duplicates rejected by sequence. It is not exactly-once.
//!
//! ## Related
//!
//! * ENet - channels with per-channel reliability flags over UDP, fixed MTU fragmentation;
//!   closest in spirit to this layer
//! * QUIC - connection based with enforced TLS, one stream per message; much heavier machinery
//! * SCTP - multi-streaming and partial reliability, but kernel-level and connection oriented

pub mod config;
pub mod context;
pub mod envelope;
pub mod fragment;
pub mod fragment_buffer;
pub mod fragment_pool;
pub mod message;
pub mod multiplexer;
pub mod seq;
mod reliable;
mod reliable_queue;
mod unreliable;

#[cfg(test)]
mod test_util;
