#[cfg(test)] use mockall::automock;
use std::fmt::{Display, Formatter};

/// Opaque identifier of a remote peer. The channel layer never interprets it, it is only
///  used as a key and passed back to the packet transport.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PeerId(u64);

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerId {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ChannelId(u16);

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ChannelId {
    /// reliable, ordered channel bound at construction
    pub const DEFAULT_RELIABLE: ChannelId = ChannelId(1);
    /// unreliable, unordered channel bound at construction
    pub const DEFAULT_UNRELIABLE: ChannelId = ChannelId(2);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }
}

/// This is an abstraction for the packet transport underneath the channel layer, introduced
///  to decouple channel logic from socket details and to facilitate mocking the I/O part
///  away for testing.
///
/// NB: Implementations are called while channel-internal locks are held, so they must not
///  call back into the channel multiplexer synchronously. Queue the work and do it from the
///  application's own context instead.
#[cfg_attr(test, automock)]
pub trait TransportLink: Send + Sync + 'static {
    /// Hand a finished packet to the transport for sending. `encrypt` forwards the channel's
    ///  configuration, the channel layer itself sends plaintext either way.
    ///
    /// The return value reports whether the transport accepted the packet. Channel logic
    ///  treats a rejected packet like one lost on the wire.
    fn send_packet(&self, to: PeerId, packet: &[u8], encrypt: bool) -> bool;

    /// Report a peer that exceeded the channel's timeout without acknowledging. It is up to
    ///  the transport what to do about it, typically dropping the connection.
    fn disconnect_peer(&self, channel: ChannelId, peer: PeerId, reason: &str);
}
