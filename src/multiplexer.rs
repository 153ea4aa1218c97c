//! The multiplexer is the crate's front door: it owns the channel registry, the shared
//!  fragment pool and the message writer/reader pair, routes inbound packets to the right
//!  per-peer connection state (creating it lazily on first contact), and fans application
//!  sends out into fragments on the chosen channel.
//!
//! Locking is two-level: the channel registry has a short-lived lock for looking up or
//!  creating a connection, and each connection has its own mutex for the actual protocol
//!  work. The registry lock is never held while a connection is locked, so traffic on one
//!  peer cannot stall lookups for another.

use std::collections::hash_map::Entry;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::debug;
use crate::config::{ReliableChannelConfig, TransportConfig, UnreliableChannelConfig};
use crate::context::{ChannelId, PeerId, TransportLink};
use crate::envelope::{peek_header, PacketKind, ReliableAckEnvelope, ReliableDataEnvelope, UnreliableDataEnvelope};
use crate::fragment;
use crate::fragment::Fragment;
use crate::fragment_pool::FragmentPool;
use crate::message::{Message, MessageReader, MessageWriter};
use crate::reliable::ReliableConnection;
use crate::unreliable::UnreliableConnection;

/// Channel ids up to and including this value are reserved. The two default channels live
///  there, and future protocol-level channels will too.
const RESERVED_CHANNELS: u16 = 100;

/// delivery quality and configuration for a channel being bound
pub enum ChannelKind {
    Reliable(ReliableChannelConfig),
    Unreliable(UnreliableChannelConfig),
}

impl ChannelKind {
    fn validate(&self) -> anyhow::Result<()> {
        match self {
            ChannelKind::Reliable(config) => config.validate(),
            ChannelKind::Unreliable(config) => config.validate(),
        }
    }
}

/// a bound channel: its configuration plus lazily created per-peer connection state
enum BoundChannel {
    Reliable {
        config: ReliableChannelConfig,
        peers: FxHashMap<PeerId, Arc<Mutex<ReliableConnection>>>,
    },
    Unreliable {
        config: UnreliableChannelConfig,
        peers: FxHashMap<PeerId, Arc<Mutex<UnreliableConnection>>>,
    },
}

impl BoundChannel {
    fn new(kind: ChannelKind) -> BoundChannel {
        match kind {
            ChannelKind::Reliable(config) => BoundChannel::Reliable {
                config,
                peers: FxHashMap::default(),
            },
            ChannelKind::Unreliable(config) => BoundChannel::Unreliable {
                config,
                peers: FxHashMap::default(),
            },
        }
    }

    fn dispose_connections(&mut self) {
        match self {
            BoundChannel::Reliable { peers, .. } => {
                for connection in peers.values() {
                    connection.lock().unwrap().dispose();
                }
            }
            BoundChannel::Unreliable { peers, .. } => {
                for connection in peers.values() {
                    connection.lock().unwrap().dispose();
                }
            }
        }
    }
}

/// a connection handle independent of the channel's delivery quality
enum AnyConnection {
    Reliable(Arc<Mutex<ReliableConnection>>),
    Unreliable(Arc<Mutex<UnreliableConnection>>),
}

/// One multiplexer per transport endpoint. All methods take `&self` and are safe to call
///  from several threads; see the module documentation for the locking structure.
pub struct ChannelMultiplexer {
    pool: Arc<FragmentPool>,
    channels: Mutex<FxHashMap<ChannelId, BoundChannel>>,
    /// message ids only disambiguate interleaved fragments, wrapping is fine
    next_message_id: AtomicU16,
    writer: Mutex<MessageWriter>,
    reader: Arc<Mutex<MessageReader>>,
    disposed: AtomicBool,
}

impl ChannelMultiplexer {
    /// Set up a multiplexer with the two default channels bound: [ChannelId::DEFAULT_RELIABLE]
    ///  and [ChannelId::DEFAULT_UNRELIABLE], configured from the given transport config.
    pub fn new(config: TransportConfig) -> anyhow::Result<ChannelMultiplexer> {
        config.validate()?;
        let pool = Arc::new(FragmentPool::new(config.fragment_capacity, config.pool_capacity));

        let mut channels = FxHashMap::default();
        channels.insert(ChannelId::DEFAULT_RELIABLE, BoundChannel::new(ChannelKind::Reliable(config.default_reliable)));
        channels.insert(ChannelId::DEFAULT_UNRELIABLE, BoundChannel::new(ChannelKind::Unreliable(config.default_unreliable)));

        Ok(ChannelMultiplexer {
            writer: Mutex::new(MessageWriter::new(&pool)),
            reader: Arc::new(Mutex::new(MessageReader::new())),
            pool,
            channels: Mutex::new(channels),
            next_message_id: AtomicU16::new(1),
            disposed: AtomicBool::new(false),
        })
    }

    /// Bind an application channel. Ids up to [RESERVED_CHANNELS] are refused, as is an id
    ///  that is already bound.
    pub fn bind(&self, channel: ChannelId, kind: ChannelKind) -> anyhow::Result<()> {
        if self.disposed.load(Ordering::Relaxed) {
            bail!("the multiplexer is disposed");
        }
        if channel.to_raw() <= RESERVED_CHANNELS {
            bail!("channel ids up to {} are reserved, cannot bind {}", RESERVED_CHANNELS, channel);
        }
        kind.validate()?;

        let mut channels = self.channels.lock().unwrap();
        match channels.entry(channel) {
            Entry::Occupied(_) => bail!("channel {} is already bound", channel),
            Entry::Vacant(e) => {
                e.insert(BoundChannel::new(kind));
                Ok(())
            }
        }
    }

    /// Unbind an application channel, disposing all its per-peer state. Buffered messages
    ///  that were not read yet are gone.
    pub fn unbind(&self, channel: ChannelId) -> anyhow::Result<()> {
        if channel.to_raw() <= RESERVED_CHANNELS {
            bail!("channel {} is reserved, cannot unbind it", channel);
        }

        let removed = self.channels.lock().unwrap().remove(&channel);
        match removed {
            Some(mut bound) => {
                bound.dispose_connections();
                Ok(())
            }
            None => bail!("channel {} is not bound", channel),
        }
    }

    /// Send a payload as one message on the given channel.
    pub fn send(&self, ctx: &dyn TransportLink, channel: ChannelId, to: PeerId, payload: &[u8]) -> anyhow::Result<()> {
        self.send_with(ctx, channel, to, |writer| io::Write::write_all(writer, payload))
    }

    /// Send a message written by the caller through the writer's [io::Write] / [io::Seek]
    ///  implementations. The message goes out with whatever length the closure produced,
    ///  a message of length zero still travels (as a single empty fragment).
    pub fn send_with(
        &self,
        ctx: &dyn TransportLink,
        channel: ChannelId,
        to: PeerId,
        write: impl FnOnce(&mut MessageWriter) -> io::Result<()>,
    ) -> anyhow::Result<()> {
        let fragments = self.pack_message(write)?;
        self.dispatch(ctx, channel, to, fragments)
    }

    /// Send the same payload to several peers. The message is fragmented once, per-peer
    ///  work is limited to sequencing and packet assembly.
    pub fn broadcast(&self, ctx: &dyn TransportLink, channel: ChannelId, to: &[PeerId], payload: &[u8]) -> anyhow::Result<()> {
        let fragments = self.pack_message(|writer| io::Write::write_all(writer, payload))?;
        for peer in to {
            self.dispatch(ctx, channel, *peer, fragments.clone())?;
        }
        Ok(())
    }

    /// Feed a received packet into the channel it addresses. Malformed packets, packets for
    ///  unbound channels and packets whose kind does not match the channel's delivery
    ///  quality are logged and dropped; a UDP transport gets those from stray senders.
    pub fn on_receive(&self, ctx: &dyn TransportLink, from: PeerId, packet: &[u8]) {
        let (channel, kind) = match peek_header(packet) {
            Ok(header) => header,
            Err(e) => {
                debug!("dropping malformed packet from peer {}: {:#}", from, e);
                return;
            }
        };
        let connection = match self.connection(channel, from) {
            Ok(connection) => connection,
            Err(_) => {
                debug!("dropping packet from peer {} for unbound channel {}", from, channel);
                return;
            }
        };

        let mut buf = packet;
        match (kind, connection) {
            (PacketKind::UnreliableData, AnyConnection::Unreliable(connection)) => {
                match UnreliableDataEnvelope::deser(&mut buf, &self.pool) {
                    Ok(envelope) => connection.lock().unwrap().on_data(envelope),
                    Err(e) => debug!("dropping malformed packet from peer {}: {:#}", from, e),
                }
            }
            (PacketKind::ReliableData, AnyConnection::Reliable(connection)) => {
                match ReliableDataEnvelope::deser(&mut buf, &self.pool) {
                    Ok(envelope) => connection.lock().unwrap().on_data(ctx, envelope),
                    Err(e) => debug!("dropping malformed packet from peer {}: {:#}", from, e),
                }
            }
            (PacketKind::ReliableAck, AnyConnection::Reliable(connection)) => {
                match ReliableAckEnvelope::deser(&mut buf) {
                    Ok(envelope) => connection.lock().unwrap().on_ack(ctx, envelope),
                    Err(e) => debug!("dropping malformed packet from peer {}: {:#}", from, e),
                }
            }
            (kind, _) => {
                debug!("dropping {:?} packet from peer {}: channel {} has a different delivery quality", kind, from, channel);
            }
        }
    }

    /// Poll all channels for the next complete message. The returned handle shares the
    ///  multiplexer's read buffer and is valid until the next call, so consume it first.
    pub fn try_read(&self) -> Option<Message> {
        for (channel, peer, connection) in self.snapshot() {
            let fragments = match &connection {
                AnyConnection::Reliable(c) => c.lock().unwrap().try_read(),
                AnyConnection::Unreliable(c) => c.lock().unwrap().try_read(),
            };

            if let Some(fragments) = fragments {
                let mut reader = self.reader.lock().unwrap();
                reader.set(channel, peer, fragments);
                drop(reader);
                return Some(Message::new(&self.reader));
            }
        }
        None
    }

    /// Advance time on all reliable connections: coarse retransmission, pending acks and
    ///  the ack timeout all run off the deltas passed in here. Call this periodically, the
    ///  resolution of the deltas is the resolution of the timeouts.
    pub fn update(&self, ctx: &dyn TransportLink, delta: Duration) {
        for (_, _, connection) in self.snapshot() {
            if let AnyConnection::Reliable(connection) = connection {
                connection.lock().unwrap().update(ctx, delta);
            }
        }
    }

    /// Drop all state for a peer on all channels, e.g. after the transport disconnected it.
    ///  A packet arriving from the same peer later starts from scratch.
    pub fn remove_peer(&self, peer: PeerId) {
        let mut removed = Vec::new();
        {
            let mut channels = self.channels.lock().unwrap();
            for bound in channels.values_mut() {
                match bound {
                    BoundChannel::Reliable { peers, .. } => {
                        if let Some(connection) = peers.remove(&peer) {
                            removed.push(AnyConnection::Reliable(connection));
                        }
                    }
                    BoundChannel::Unreliable { peers, .. } => {
                        if let Some(connection) = peers.remove(&peer) {
                            removed.push(AnyConnection::Unreliable(connection));
                        }
                    }
                }
            }
        }

        for connection in removed {
            match connection {
                AnyConnection::Reliable(c) => c.lock().unwrap().dispose(),
                AnyConnection::Unreliable(c) => c.lock().unwrap().dispose(),
            }
        }
    }

    /// Tear down all channels, releasing buffered fragments to the pool. Idempotent; sends
    ///  fail and received packets are dropped afterwards.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::Relaxed) {
            return;
        }

        let all = {
            let mut channels = self.channels.lock().unwrap();
            channels.drain().map(|(_, bound)| bound).collect::<Vec<_>>()
        };
        for mut bound in all {
            bound.dispose_connections();
        }
    }

    fn pack_message(&self, write: impl FnOnce(&mut MessageWriter) -> io::Result<()>) -> anyhow::Result<Vec<Arc<Fragment>>> {
        if self.disposed.load(Ordering::Relaxed) {
            bail!("the multiplexer is disposed");
        }

        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let mut writer = self.writer.lock().unwrap();
        writer.reset(message_id);
        write(&mut writer)?;
        let fragments = writer.take_fragments();
        drop(writer);

        if fragments.is_empty() {
            return fragment::split(&self.pool, message_id, &[]);
        }
        Ok(fragments)
    }

    fn dispatch(&self, ctx: &dyn TransportLink, channel: ChannelId, to: PeerId, fragments: Vec<Arc<Fragment>>) -> anyhow::Result<()> {
        match self.connection(channel, to)? {
            AnyConnection::Reliable(connection) => connection.lock().unwrap().send_message(ctx, fragments),
            AnyConnection::Unreliable(connection) => connection.lock().unwrap().send_message(ctx, fragments),
        }
        Ok(())
    }

    /// the connection for a peer on a channel, created on first contact
    fn connection(&self, channel: ChannelId, peer: PeerId) -> anyhow::Result<AnyConnection> {
        let mut channels = self.channels.lock().unwrap();
        let Some(bound) = channels.get_mut(&channel) else {
            bail!("channel {} is not bound", channel);
        };

        Ok(match bound {
            BoundChannel::Reliable { config, peers } => AnyConnection::Reliable(
                peers.entry(peer)
                    .or_insert_with(|| Arc::new(Mutex::new(ReliableConnection::new(channel, peer, config))))
                    .clone()
            ),
            BoundChannel::Unreliable { config, peers } => AnyConnection::Unreliable(
                peers.entry(peer)
                    .or_insert_with(|| Arc::new(Mutex::new(UnreliableConnection::new(channel, peer, config))))
                    .clone()
            ),
        })
    }

    fn snapshot(&self) -> Vec<(ChannelId, PeerId, AnyConnection)> {
        let channels = self.channels.lock().unwrap();
        let mut all = Vec::new();
        for (&id, bound) in channels.iter() {
            match bound {
                BoundChannel::Reliable { peers, .. } => {
                    for (&peer, connection) in peers {
                        all.push((id, peer, AnyConnection::Reliable(connection.clone())));
                    }
                }
                BoundChannel::Unreliable { peers, .. } => {
                    for (&peer, connection) in peers {
                        all.push((id, peer, AnyConnection::Unreliable(connection.clone())));
                    }
                }
            }
        }
        all
    }
}
