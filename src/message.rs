//! Messages are built and consumed as `std::io` streams so that applications never deal
//!  with the fragment layout themselves. [MessageWriter] splits written bytes into pooled
//!  fragments on the fly (including random access via [std::io::Seek]), [MessageReader]
//!  reads a reassembled fragment list back as one contiguous stream.
//!
//! A [Message] is a cheap handle into the reader that an application can keep around
//!  briefly; it revalidates on every access so a handle that outlives its message fails
//!  loudly instead of serving bytes of a newer message.

use std::io;
use std::io::SeekFrom;
use std::sync::{Arc, Mutex};
use anyhow::bail;
use crate::context::{ChannelId, PeerId};
use crate::fragment;
use crate::fragment::Fragment;
use crate::fragment_pool::FragmentPool;

/// Builds one outgoing message as a list of pooled fragments. All fragments except the
///  last are always full, so splitting happens as a side effect of writing and the
///  fragment list is ready to send the moment the application is done.
///
/// The writer is reused between messages: [MessageWriter::reset] hands the previous
///  fragments back and starts over under a new message id.
pub struct MessageWriter {
    pool: Arc<FragmentPool>,
    message_id: u16,
    fragments: Vec<Fragment>,
    position: usize,
}

impl MessageWriter {
    pub fn new(pool: &Arc<FragmentPool>) -> MessageWriter {
        MessageWriter {
            pool: pool.clone(),
            message_id: 0,
            fragments: Vec::new(),
            position: 0,
        }
    }

    /// Release the current fragments and start over for a new message. The released
    ///  buffers go back to the pool right away.
    pub fn reset(&mut self, message_id: u16) {
        self.fragments.clear();
        self.message_id = message_id;
        self.position = 0;
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn len(&self) -> usize {
        match self.fragments.last() {
            None => 0,
            Some(tail) => (self.fragments.len() - 1) * self.pool.fragment_capacity() + tail.data().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Grow (zero filling) or shrink the message to an exact length. Shrinking below the
    ///  current position moves the position to the new end.
    pub fn set_len(&mut self, new_len: usize) -> io::Result<()> {
        if new_len < self.len() {
            self.truncate_to(new_len);
        } else if new_len > self.len() {
            self.grow_to(new_len)?;
        }
        self.position = self.position.min(new_len);
        Ok(())
    }

    /// Stamp every fragment with its final index and count and hand the list over for
    ///  sending. The writer is empty afterwards. NB: a message without any written bytes
    ///  yields no fragments at all.
    pub fn take_fragments(&mut self) -> Vec<Arc<Fragment>> {
        let count = self.fragments.len() as u16; // bounded in push_fragment
        for (index, fragment) in self.fragments.iter_mut().enumerate() {
            fragment.set_position(index as u16, count);
        }
        self.position = 0;
        self.fragments.drain(..).map(Arc::new).collect()
    }

    fn push_fragment(&mut self) -> io::Result<()> {
        if self.fragments.len() >= u16::MAX as usize {
            return Err(io::Error::other("message is too large: the fragment count must fit 16 bits"));
        }
        self.fragments.push(Fragment::new(&self.pool, self.message_id));
        Ok(())
    }

    fn truncate_to(&mut self, new_len: usize) {
        let capacity = self.pool.fragment_capacity();
        let needed = new_len.div_ceil(capacity);
        // dropped fragments hand their buffers back to the pool
        self.fragments.truncate(needed);
        if let Some(tail) = self.fragments.last_mut() {
            tail.buf_mut().truncate(new_len - (needed - 1) * capacity);
        }
    }

    fn grow_to(&mut self, new_len: usize) -> io::Result<()> {
        let capacity = self.pool.fragment_capacity();
        let needed = new_len.div_ceil(capacity);
        while self.fragments.len() < needed {
            if let Some(tail) = self.fragments.last_mut() {
                tail.buf_mut().extend_zeroed(capacity);
            }
            self.push_fragment()?;
        }
        let tail_len = new_len - (needed - 1) * capacity;
        if let Some(tail) = self.fragments.last_mut() {
            tail.buf_mut().extend_zeroed(tail_len);
        }
        Ok(())
    }

    fn move_to(&mut self, position: usize) -> io::Result<()> {
        // seeking past the end grows the message right away, zero filled, so the write
        //  path can rely on position <= len
        if position > self.len() {
            self.grow_to(position)?;
        }
        self.position = position;
        Ok(())
    }
}

impl io::Write for MessageWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let capacity = self.pool.fragment_capacity();

        let mut remaining = buf;
        while !remaining.is_empty() {
            let index = self.position / capacity;
            let offset = self.position % capacity;
            if index == self.fragments.len() {
                // position is at the end, on a fragment boundary
                self.push_fragment()?;
            }

            let n = remaining.len().min(capacity - offset);
            self.fragments[index].buf_mut().write_at(offset, &remaining[..n]);
            self.position += n;
            remaining = &remaining[n..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for MessageWriter {
    fn seek(&mut self, style: SeekFrom) -> io::Result<u64> {
        let (base_pos, offset) = match style {
            SeekFrom::Start(n) => {
                self.move_to(n as usize)?;
                return Ok(n);
            }
            SeekFrom::End(n) => (self.len() as u64, n),
            SeekFrom::Current(n) => (self.position as u64, n),
        };
        match base_pos.checked_add_signed(offset) {
            Some(n) => {
                self.move_to(n as usize)?;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}

/// Streams a received message's fragment list back as contiguous bytes. There is one
///  reader per channel multiplexer, refilled via [MessageReader::set] for every message
///  that is handed out; it keeps the fragments alive until the next refill.
pub struct MessageReader {
    channel: ChannelId,
    peer: PeerId,
    fragments: Vec<Arc<Fragment>>,
    len: usize,
    fragment_index: usize,
    offset: usize,
    revision: u8,
}

impl MessageReader {
    pub fn new() -> MessageReader {
        MessageReader {
            channel: ChannelId::from_raw(0),
            peer: PeerId::from_raw(0),
            fragments: Vec::new(),
            len: 0,
            fragment_index: 0,
            offset: 0,
            revision: 0,
        }
    }

    /// Move on to the next message. The previous message's fragments are released, and
    ///  the revision bump invalidates all [Message] handles still pointing here.
    pub fn set(&mut self, channel: ChannelId, peer: PeerId, fragments: Vec<Arc<Fragment>>) {
        self.len = fragments.iter().map(|f| f.data().len()).sum();
        self.channel = channel;
        self.peer = peer;
        self.fragments = fragments;
        self.fragment_index = 0;
        self.offset = 0;
        self.revision = self.revision.wrapping_add(1);
    }

    /// release the fragments without a successor message
    pub fn clear(&mut self) {
        self.set(self.channel, self.peer, Vec::new());
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn revision(&self) -> u8 {
        self.revision
    }

    /// the whole message as one buffer, independent of the read position
    pub fn assemble(&self) -> Vec<u8> {
        fragment::join(&self.fragments)
    }
}

impl Default for MessageReader {
    fn default() -> Self {
        MessageReader::new()
    }
}

impl io::Read for MessageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let Some(fragment) = self.fragments.get(self.fragment_index) else {
                break;
            };
            let data = fragment.data();
            if self.offset >= data.len() {
                self.fragment_index += 1;
                self.offset = 0;
                continue;
            }
            let n = (data.len() - self.offset).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&data[self.offset..self.offset + n]);
            done += n;
            self.offset += n;
        }
        Ok(done)
    }
}

/// A received message as handed to the application: source peer, channel, length, and
///  access to the payload through the shared reader.
///
/// The handle stays valid until the next message is read from the multiplexer; after
///  that every payload access fails rather than returning foreign bytes.
pub struct Message {
    channel: ChannelId,
    peer: PeerId,
    len: usize,
    revision: u8,
    reader: Arc<Mutex<MessageReader>>,
}

impl Message {
    pub(crate) fn new(reader: &Arc<Mutex<MessageReader>>) -> Message {
        let locked = reader.lock().unwrap();
        Message {
            channel: locked.channel(),
            peer: locked.peer(),
            len: locked.len(),
            revision: locked.revision(),
            reader: reader.clone(),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// the whole payload as one freshly allocated buffer
    pub fn assemble(&self) -> anyhow::Result<Vec<u8>> {
        let reader = self.reader.lock().unwrap();
        self.check_fresh(&reader)?;
        Ok(reader.assemble())
    }

    /// Copy the whole payload into the caller's buffer, returning the number of bytes
    ///  copied. The buffer must have room for the full message.
    pub fn copy_to(&self, out: &mut [u8]) -> anyhow::Result<usize> {
        let reader = self.reader.lock().unwrap();
        self.check_fresh(&reader)?;
        if out.len() < self.len {
            bail!("target buffer is too small: {} bytes for a message of {}", out.len(), self.len);
        }

        let mut done = 0;
        for fragment in reader.fragments.iter() {
            let data = fragment.data();
            out[done..done + data.len()].copy_from_slice(data);
            done += data.len();
        }
        Ok(done)
    }

    /// Read the next chunk of the payload, advancing the shared read position. Returns 0
    ///  at the end of the message.
    pub fn read(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let mut reader = self.reader.lock().unwrap();
        self.check_fresh(&reader)?;
        Ok(io::Read::read(&mut *reader, buf)?)
    }

    fn check_fresh(&self, reader: &MessageReader) -> anyhow::Result<()> {
        if reader.revision() != self.revision {
            bail!("stale message handle: the reader moved on to a newer message");
        }
        Ok(())
    }
}
