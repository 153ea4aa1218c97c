use std::time::Duration;
use anyhow::bail;

pub struct TransportConfig {
    /// This is the fragment payload size, i.e. the maximum number of message bytes per UDP
    ///  packet. The implied packet size (payload plus channel framing) must be supported by
    ///  all network connections between peers since fragments are never split further.
    ///
    /// In an ideal world, we would configure the MTU (or even discover it) and derive the
    ///  fragment size from that, but there is some uncertainty involved (e.g. optional IP
    ///  headers that may be introduced by some network hardware). Therefor the responsibility
    ///  of choosing a payload size that fits the network is left with the application.
    ///
    /// Choosing this value too big causes packets to be dropped, choosing it too small wastes
    ///  bandwidth.
    pub fragment_capacity: usize,

    /// This is the number of fragment buffers that will be pooled at a given time - buffers
    ///  in excess of this number are discarded when they are returned.
    pub pool_capacity: usize,

    /// configuration for the pre-bound default reliable channel
    pub default_reliable: ReliableChannelConfig,
    /// configuration for the pre-bound default unreliable channel
    pub default_unreliable: UnreliableChannelConfig,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            fragment_capacity: 1024,
            pool_capacity: 64,
            default_reliable: ReliableChannelConfig::default(),
            default_unreliable: UnreliableChannelConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fragment_capacity < 32 {
            bail!("fragment capacity is too small");
        }
        if self.fragment_capacity > u16::MAX as usize {
            bail!("fragment capacity must fit the 16 bit wire encoding");
        }
        if self.pool_capacity == 0 {
            bail!("pool capacity must not be zero");
        }
        self.default_reliable.validate()?;
        self.default_unreliable.validate()?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct ReliableChannelConfig {
    /// This is the maximum number of *fragments* (not bytes) in flight to a given peer,
    ///  i.e. sent but not yet acknowledged. Fragments in excess of the window are held
    ///  back and sent as acks free up room.
    pub max_window_size: usize,

    /// request encryption from the packet transport
    pub encrypt: bool,

    /// If set, received messages are handed out strictly in send order, waiting for
    ///  retransmissions of anything missing in between. If unset, every message is handed
    ///  out as soon as it is complete.
    pub ordered: bool,

    /// Time without acknowledgement after which a peer on this channel is given up and
    ///  reported for disconnect.
    pub timeout: Duration,
}

impl Default for ReliableChannelConfig {
    fn default() -> ReliableChannelConfig {
        ReliableChannelConfig {
            max_window_size: 32,
            encrypt: true,
            ordered: true,
            timeout: Duration::from_secs(10),
        }
    }
}

impl ReliableChannelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_window_size == 0 {
            bail!("send window must not be zero");
        }
        // sequence comparisons are only well defined while live entries span less than
        //  half the 16 bit sequence space
        if self.max_window_size >= 0x8000 {
            bail!("send window must be smaller than half the sequence number space");
        }
        if self.timeout.is_zero() {
            bail!("timeout must not be zero");
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct UnreliableChannelConfig {
    /// This is the maximum number of received fragments buffered per peer while waiting for
    ///  messages to become complete. When the buffer is full, the oldest incomplete messages
    ///  are evicted to make room.
    pub max_buffer_size: usize,

    /// request encryption from the packet transport
    pub encrypt: bool,

    /// If set, messages that arrive out of order are dropped rather than handed out late.
    pub ordered: bool,
}

impl Default for UnreliableChannelConfig {
    fn default() -> UnreliableChannelConfig {
        UnreliableChannelConfig {
            max_buffer_size: 64,
            encrypt: true,
            ordered: false,
        }
    }
}

impl UnreliableChannelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_buffer_size == 0 {
            bail!("receive buffer must not be zero");
        }
        if self.max_buffer_size >= 0x8000 {
            bail!("receive buffer must be smaller than half the sequence number space");
        }
        Ok(())
    }
}
