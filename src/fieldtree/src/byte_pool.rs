//! Bucketed, thread-safe buffer leasing (spec §4.A).
//!
//! Buckets are indexed by the next power-of-two at or above the requested
//! size; each bucket is a free-list of previously leased, truncated buffers
//! behind its own mutex. Returning a buffer never changes which bucket future
//! callers see it from, and `return_buffer` is idempotent for an empty
//! buffer (`capacity() == 0` buffers are simply dropped rather than pooled).

use std::sync::Mutex;

const MIN_BUCKET_SHIFT: u32 = 4; // smallest bucket holds 16-byte buffers
const NUM_BUCKETS: usize = 28; // covers up to 2^(4+28) bytes, ample for in-process containers

pub struct BytePool {
    buckets: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl BytePool {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        for _ in 0..NUM_BUCKETS {
            buckets.push(Mutex::new(Vec::new()));
        }
        BytePool { buckets }
    }

    fn bucket_index(min_size: usize) -> usize {
        let size = min_size.max(1).next_power_of_two();
        let shift = size.trailing_zeros();
        shift.saturating_sub(MIN_BUCKET_SHIFT) as usize
    }

    fn bucket_capacity(bucket: usize) -> usize {
        1usize << (bucket as u32 + MIN_BUCKET_SHIFT)
    }

    /// Lease a buffer whose capacity is at least `min_size`. The returned
    /// buffer's length is always `min_size`-or-more zeroed bytes up to its
    /// capacity; callers treat `buffer.len()` as logical length and must not
    /// assume bytes beyond what they write are meaningful.
    pub fn rent(&self, min_size: usize) -> Vec<u8> {
        let bucket = Self::bucket_index(min_size).min(self.buckets.len() - 1);
        let capacity = Self::bucket_capacity(bucket).max(min_size);

        let mut free_list = self.buckets[bucket].lock().unwrap();
        let mut buffer = free_list.pop().unwrap_or_default();
        drop(free_list);

        if buffer.capacity() < capacity {
            buffer = Vec::with_capacity(capacity);
        }
        buffer.clear();
        buffer.resize(capacity, 0);
        buffer
    }

    /// Return a buffer to its bucket for reuse. Bucketing is based on
    /// capacity, not the length the caller happened to leave it at.
    pub fn return_buffer(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() == 0 {
            return;
        }
        buffer.clear();
        let bucket = Self::bucket_index(buffer.capacity()).min(self.buckets.len() - 1);
        self.buckets[bucket].lock().unwrap().push(buffer);
    }
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_returns_capacity_at_least_requested() {
        let pool = BytePool::new();
        let buf = pool.rent(100);
        assert!(buf.len() >= 100);
    }

    #[test]
    fn returned_buffer_is_reused() {
        let pool = BytePool::new();
        let buf = pool.rent(64);
        let capacity = buf.capacity();
        pool.return_buffer(buf);
        let buf2 = pool.rent(64);
        assert_eq!(buf2.capacity(), capacity);
    }

    #[test]
    fn return_buffer_idempotent_for_empty_buffer() {
        let pool = BytePool::new();
        pool.return_buffer(Vec::new());
        pool.return_buffer(Vec::new());
    }
}
