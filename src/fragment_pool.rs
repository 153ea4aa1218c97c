use std::sync::Mutex;
use tracing::{debug, trace};
use crate::fragment_buffer::FragmentBuf;

/// A bounded pool of reusable fragment buffers, shared by everything that allocates fragments
///  (splitter, message writer, packet decoders).
///
/// The pool is safe for concurrent get / put_back from the update thread and the application
///  thread without any outer lock. It is explicitly constructed and passed around as an
///  `Arc<FragmentPool>` - there is no process-wide instance.
///
/// The bound keeps the pool from growing without limit under load: buffers returned beyond
///  `max_pool_size` are simply dropped and reclaimed by the allocator.
pub struct FragmentPool {
    fragment_capacity: usize,
    buffers: Mutex<Vec<FragmentBuf>>,
}

impl FragmentPool {
    pub fn new(fragment_capacity: usize, max_pool_size: usize) -> FragmentPool {
        assert!(fragment_capacity <= u16::MAX as usize,
                "fragment capacity {} does not fit the u16 wire encoding",
                fragment_capacity);

        FragmentPool {
            fragment_capacity,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    /// the capacity of every buffer in this pool, i.e. the fragment payload size on the wire
    pub fn fragment_capacity(&self) -> usize {
        self.fragment_capacity
    }

    pub fn get(&self) -> FragmentBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        FragmentBuf::new(self.fragment_capacity)
    }

    pub fn put_back(&self, mut buffer: FragmentBuf) {
        assert_eq!(buffer.capacity(), self.fragment_capacity,
                   "returned buffer does not have the regular fragment capacity of {} bytes",
                   self.fragment_capacity);

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    pub fn pooled_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
