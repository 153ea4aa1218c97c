use std::sync::Mutex;
use crate::context::{ChannelId, PeerId, TransportLink};

/// Packet transport double for unit tests: records outgoing packets and disconnect
///  requests instead of touching a socket, so tests can shuttle packets between two
///  endpoints by hand (and drop or reorder them on the way).
#[derive(Default)]
pub struct LoopbackLink {
    sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
    disconnects: Mutex<Vec<(ChannelId, PeerId, String)>>,
}

impl LoopbackLink {
    pub fn new() -> LoopbackLink {
        LoopbackLink::default()
    }

    /// returns sent packets, clearing the internal buffer
    pub fn take_sent(&self) -> Vec<(PeerId, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn disconnects(&self) -> Vec<(ChannelId, PeerId, String)> {
        self.disconnects.lock().unwrap().clone()
    }
}

impl TransportLink for LoopbackLink {
    fn send_packet(&self, to: PeerId, packet: &[u8], _encrypt: bool) -> bool {
        self.sent.lock().unwrap().push((to, packet.to_vec()));
        true
    }

    fn disconnect_peer(&self, channel: ChannelId, peer: PeerId, reason: &str) {
        self.disconnects.lock().unwrap().push((channel, peer, reason.to_string()));
    }
}

/// convenience method for unit test code: a payload of the given length whose bytes are
///  derived from `index`, so different indexes give tell-apart payloads
pub fn test_payload(index: u16, len: usize) -> Vec<u8> {
    (0..len).map(|i| (index as usize).wrapping_add(i) as u8).collect()
}
