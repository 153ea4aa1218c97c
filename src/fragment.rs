//! One fragment is one wire-sized chunk of a logical message. Messages larger than the
//!  fragment capacity are split into several fragments and reassembled at the receiver;
//!  the metadata carried by every fragment (message id, index, total count) is what the
//!  reassembly queues work with.
//!
//! Fragments are shared as `Arc<Fragment>`: sender queues, reassembly buffers and the message
//!  reader all hold references, and the backing buffer goes back to the pool when the last
//!  reference is dropped. A `Fragment` is only mutable while it is being built (splitting,
//!  streamed writing, decoding), before it is wrapped in the `Arc`.

use std::fmt::{Debug, Formatter};
use std::mem;
use std::sync::Arc;
use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::fragment_buffer::FragmentBuf;
use crate::fragment_pool::FragmentPool;

/// size of the fragment metadata on the wire
pub const FRAGMENT_HEADER_SIZE: usize = 8;

pub struct Fragment {
    message_id: u16,
    index: u16,
    count: u16,
    buf: FragmentBuf,
    pool: Arc<FragmentPool>,
}

impl Fragment {
    /// a fresh unsplit fragment ('1 of 1') with an empty pooled buffer
    pub fn new(pool: &Arc<FragmentPool>, message_id: u16) -> Fragment {
        Fragment {
            message_id,
            index: 0,
            count: 1,
            buf: pool.get(),
            pool: pool.clone(),
        }
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// position of this fragment within its message
    pub fn index(&self) -> u16 {
        self.index
    }

    /// total number of fragments of this message; 1 means 'not split'
    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn data(&self) -> &[u8] {
        self.buf.as_ref()
    }

    pub fn data_size(&self) -> u16 {
        // fragment capacity is bounded to u16 when the pool is built
        self.buf.len() as u16
    }

    pub(crate) fn set_position(&mut self, index: u16, count: u16) {
        self.index = index;
        self.count = count;
    }

    pub(crate) fn buf_mut(&mut self) -> &mut FragmentBuf {
        &mut self.buf
    }

    pub fn write_to(&self, out: &mut impl BufMut) {
        out.put_u16_le(self.message_id);
        out.put_u16_le(self.count);
        out.put_u16_le(self.index);
        out.put_u16_le(self.data_size());
        out.put_slice(self.data());
    }

    pub fn read_from(buf: &mut impl Buf, pool: &Arc<FragmentPool>) -> anyhow::Result<Fragment> {
        let message_id = buf.try_get_u16_le()?;
        let count = buf.try_get_u16_le()?;
        let index = buf.try_get_u16_le()?;
        let data_size = buf.try_get_u16_le()? as usize;

        if data_size > pool.fragment_capacity() {
            bail!("fragment data size {} exceeds the fragment capacity {} - dropping", data_size, pool.fragment_capacity());
        }
        if buf.remaining() < data_size {
            bail!("fragment payload is truncated: {} declared but {} on the wire", data_size, buf.remaining());
        }

        let mut fragment = Fragment::new(pool, message_id);
        fragment.index = index;
        fragment.count = count;
        fragment.buf.extend_zeroed(data_size);
        buf.copy_to_slice(fragment.buf.as_mut());
        Ok(fragment)
    }
}

impl Drop for Fragment {
    fn drop(&mut self) {
        self.pool.put_back(mem::take(&mut self.buf));
    }
}

impl Debug for Fragment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FRAG{{msg={} {}/{} {}B}}", self.message_id, self.index, self.count, self.buf.len())
    }
}

/// Split a payload into pooled fragments of at most the pool's fragment capacity. At least
///  one fragment is always produced: an empty payload becomes one fragment with data size 0.
///
/// Index and count are stamped in a second pass - the total count is only known once
///  splitting is done.
pub fn split(pool: &Arc<FragmentPool>, message_id: u16, payload: &[u8]) -> anyhow::Result<Vec<Arc<Fragment>>> {
    let capacity = pool.fragment_capacity();
    let mut fragments = Vec::with_capacity(payload.len() / capacity + 1);

    let mut remaining = payload;
    loop {
        let n = remaining.len().min(capacity);
        let mut fragment = Fragment::new(pool, message_id);
        fragment.buf.put_slice(&remaining[..n]);
        fragments.push(fragment);
        remaining = &remaining[n..];

        if remaining.is_empty() {
            break;
        }
    }

    let count = fragments.len();
    if count > u16::MAX as usize {
        bail!("message is too large: it would need {} fragments, the wire format allows {}", count, u16::MAX);
    }
    for (index, fragment) in fragments.iter_mut().enumerate() {
        fragment.set_position(index as u16, count as u16);
    }

    Ok(fragments.into_iter().map(Arc::new).collect())
}

/// Join a complete, ordered fragment list back into a contiguous byte buffer.
///
/// The list is only borrowed: ownership is not touched, every holder drops its own
///  references separately.
pub fn join(fragments: &[Arc<Fragment>]) -> Vec<u8> {
    let total = fragments.iter().map(|f| f.data().len()).sum();
    let mut result = Vec::with_capacity(total);
    for fragment in fragments {
        result.extend_from_slice(fragment.data());
    }
    result
}
