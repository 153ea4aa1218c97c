//! Wire framing for everything a channel puts on a UDP wire. Every packet starts with the
//!  channel id and a packet kind byte, the layout after that depends on the kind.
//!
//! Envelopes are value types: they borrow nothing, fragments travel inside them as `Arc`
//!  references, so decoding allocates nothing beyond a pooled fragment buffer.

use std::sync::Arc;
use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::context::ChannelId;
use crate::fragment::Fragment;
use crate::fragment_pool::FragmentPool;
use crate::seq::Seq;

/// channel id (2 bytes) plus packet kind (1 byte)
pub const PACKET_HEADER_SIZE: usize = 3;

/// Wire marker for 'no gap' in an ack packet. NB: this coincides with a valid sequence
///  number; if the first gap really ends at 0xffff the fast resend for that round is
///  skipped and the regular resend timer covers it.
const NO_GAP_MARKER: u16 = u16::MAX;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PacketKind {
    UnreliableData = 1,
    ReliableData = 2,
    ReliableAck = 3,
}

/// Channel id and packet kind without consuming the packet, for dispatch to the right
///  channel before the channel-specific decoder runs.
pub fn peek_header(packet: &[u8]) -> anyhow::Result<(ChannelId, PacketKind)> {
    if packet.len() < PACKET_HEADER_SIZE {
        bail!("packet is too short for a channel header: {} bytes", packet.len());
    }
    let channel = ChannelId::from_raw(u16::from_le_bytes([packet[0], packet[1]]));
    let kind = PacketKind::try_from_primitive(packet[2])?;
    Ok((channel, kind))
}

fn ser_packet_header(channel: ChannelId, kind: PacketKind, buf: &mut impl BufMut) {
    buf.put_u16_le(channel.to_raw());
    buf.put_u8(kind.into());
}

fn deser_packet_header(expected: PacketKind, buf: &mut impl Buf) -> anyhow::Result<ChannelId> {
    let channel = ChannelId::from_raw(buf.try_get_u16_le()?);
    let kind = PacketKind::try_from_primitive(buf.try_get_u8()?)?;
    if kind != expected {
        bail!("expected a {:?} packet, got {:?}", expected, kind);
    }
    Ok(channel)
}

/// one fragment on an unreliable channel, fire and forget
#[derive(Debug, Clone)]
pub struct UnreliableDataEnvelope {
    pub channel: ChannelId,
    pub seq: Seq,
    pub fragment: Arc<Fragment>,
}

impl UnreliableDataEnvelope {
    pub fn ser(&self, buf: &mut impl BufMut) {
        ser_packet_header(self.channel, PacketKind::UnreliableData, buf);
        buf.put_u16_le(self.seq.to_raw());
        self.fragment.write_to(buf);
    }

    pub fn deser(buf: &mut impl Buf, pool: &Arc<FragmentPool>) -> anyhow::Result<UnreliableDataEnvelope> {
        let channel = deser_packet_header(PacketKind::UnreliableData, buf)?;
        let seq = Seq::from_raw(buf.try_get_u16_le()?);
        let fragment = Arc::new(Fragment::read_from(buf, pool)?);
        Ok(UnreliableDataEnvelope { channel, seq, fragment })
    }
}

/// One fragment on a reliable channel. `ack` piggybacks the sender's current receive
///  state so a busy two-way connection rarely needs standalone ack packets.
#[derive(Debug, Clone)]
pub struct ReliableDataEnvelope {
    pub channel: ChannelId,
    pub seq: Seq,
    pub ack: Seq,
    pub fragment: Arc<Fragment>,
}

impl ReliableDataEnvelope {
    pub fn ser(&self, buf: &mut impl BufMut) {
        ser_packet_header(self.channel, PacketKind::ReliableData, buf);
        buf.put_u16_le(self.seq.to_raw());
        buf.put_u16_le(self.ack.to_raw());
        self.fragment.write_to(buf);
    }

    pub fn deser(buf: &mut impl Buf, pool: &Arc<FragmentPool>) -> anyhow::Result<ReliableDataEnvelope> {
        let channel = deser_packet_header(PacketKind::ReliableData, buf)?;
        let seq = Seq::from_raw(buf.try_get_u16_le()?);
        let ack = Seq::from_raw(buf.try_get_u16_le()?);
        let fragment = Arc::new(Fragment::read_from(buf, pool)?);
        Ok(ReliableDataEnvelope { channel, seq, ack, fragment })
    }
}

/// Acknowledgement state of a reliable channel's receiving side. `received` is cumulative
///  (everything up to and including it arrived), `next_received` is the end of the first
///  gap after that (if any) so the sender can resend the gap without waiting for the
///  timer, and `last` is the highest sequence number seen so far.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReliableAckEnvelope {
    pub channel: ChannelId,
    pub received: Seq,
    pub next_received: Option<Seq>,
    pub last: Seq,
}

impl ReliableAckEnvelope {
    pub fn ser(&self, buf: &mut impl BufMut) {
        ser_packet_header(self.channel, PacketKind::ReliableAck, buf);
        buf.put_u16_le(self.received.to_raw());
        buf.put_u16_le(match self.next_received {
            Some(seq) => seq.to_raw(),
            None => NO_GAP_MARKER,
        });
        buf.put_u16_le(self.last.to_raw());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ReliableAckEnvelope> {
        let channel = deser_packet_header(PacketKind::ReliableAck, buf)?;
        let received = Seq::from_raw(buf.try_get_u16_le()?);
        let next_received = match buf.try_get_u16_le()? {
            NO_GAP_MARKER => None,
            raw => Some(Seq::from_raw(raw)),
        };
        let last = Seq::from_raw(buf.try_get_u16_le()?);
        Ok(ReliableAckEnvelope { channel, received, next_received, last })
    }
}
