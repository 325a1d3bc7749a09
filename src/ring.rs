//! Fixed-capacity circular store of samples.
//!
//! One slot of the backing array is always left empty so that a full ring
//! and an empty ring have different cursor positions. The ring does no
//! locking; [`SynchronizedBuffer`](crate::sync_buffer::SynchronizedBuffer)
//! owns one and mutates it only under its lock.

/// Scalar sample type carried through the pipeline
pub type Sample = f32;

/// A window of samples, the unit of transfer between stages
pub type Window = Vec<Sample>;

/// Circular buffer of samples with non-destructive reads
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<Sample>,
    start: usize,
    end: usize,
}

impl RingBuffer {
    /// Create a ring able to hold `window_size` samples
    pub fn new(window_size: usize) -> Self {
        Self {
            data: vec![0.0; window_size + 1],
            start: 0,
            end: 0,
        }
    }

    /// Length of the backing array, including the reserved slot
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of occupied samples
    pub fn size(&self) -> usize {
        if self.end >= self.start {
            self.end - self.start
        } else {
            self.data.len() - self.start + self.end
        }
    }

    /// Number of samples that can still be written
    pub fn remaining_capacity(&self) -> usize {
        self.data.len() - self.size() - 1
    }

    /// Whether no samples are stored
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Copy `data` in at the end cursor. Fails without mutation if it does not fit.
    pub fn put(&mut self, data: &[Sample]) -> bool {
        if data.len() > self.remaining_capacity() {
            return false;
        }
        let cap = self.data.len();
        let first = data.len().min(cap - self.end);
        self.data[self.end..self.end + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.data[..rest].copy_from_slice(&data[first..]);
        self.end = (self.end + data.len()) % cap;
        true
    }

    /// Copy `out.len()` samples starting `offset` past the start cursor.
    ///
    /// The cursors are left untouched; use [`advance_start`](Self::advance_start)
    /// to release samples.
    pub fn get(&self, out: &mut [Sample], offset: usize) -> bool {
        if offset + out.len() > self.size() {
            return false;
        }
        let cap = self.data.len();
        let from = (self.start + offset) % cap;
        let first = out.len().min(cap - from);
        out[..first].copy_from_slice(&self.data[from..from + first]);
        let rest = out.len() - first;
        out[first..].copy_from_slice(&self.data[..rest]);
        true
    }

    /// Release `n` samples from the front
    pub fn advance_start(&mut self, n: usize) -> bool {
        if n > self.size() {
            return false;
        }
        self.start = (self.start + n) % self.data.len();
        true
    }

    /// Reallocate to hold `window_size` samples. Discards all stored data.
    pub fn set_capacity(&mut self, window_size: usize) {
        self.data = vec![0.0; window_size + 1];
        self.start = 0;
        self.end = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_advance() {
        let mut ring = RingBuffer::new(4);
        assert_eq!(ring.remaining_capacity(), 4);
        assert!(ring.put(&[1.0, 2.0, 3.0]));
        assert_eq!(ring.size(), 3);

        let mut out = [0.0; 2];
        assert!(ring.get(&mut out, 1));
        assert_eq!(out, [2.0, 3.0]);
        // peek does not consume
        assert_eq!(ring.size(), 3);

        assert!(ring.advance_start(2));
        assert_eq!(ring.size(), 1);
        assert!(ring.get(&mut out[..1], 0));
        assert_eq!(out[0], 3.0);
    }

    #[test]
    fn test_full_ring_rejects_put() {
        let mut ring = RingBuffer::new(3);
        assert!(ring.put(&[1.0, 2.0, 3.0]));
        assert_eq!(ring.remaining_capacity(), 0);
        assert!(!ring.put(&[4.0]));
        assert_eq!(ring.size(), 3);
    }

    #[test]
    fn test_wraparound() {
        let mut ring = RingBuffer::new(4);
        assert!(ring.put(&[1.0, 2.0, 3.0]));
        assert!(ring.advance_start(3));
        assert!(ring.put(&[4.0, 5.0, 6.0, 7.0]));
        assert_eq!(ring.size(), 4);

        let mut out = [0.0; 4];
        assert!(ring.get(&mut out, 0));
        assert_eq!(out, [4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_get_past_end_fails() {
        let mut ring = RingBuffer::new(4);
        assert!(ring.put(&[1.0, 2.0]));
        let mut out = [0.0; 2];
        assert!(!ring.get(&mut out, 1));
        assert!(!ring.advance_start(3));
    }

    #[test]
    fn test_zero_length_ops() {
        let mut ring = RingBuffer::new(2);
        assert!(ring.put(&[]));
        assert!(ring.get(&mut [], 0));
        assert!(ring.advance_start(0));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_set_capacity_discards() {
        let mut ring = RingBuffer::new(2);
        assert!(ring.put(&[1.0, 2.0]));
        ring.set_capacity(8);
        assert_eq!(ring.capacity(), 9);
        assert_eq!(ring.size(), 0);
        assert_eq!(ring.remaining_capacity(), 8);
    }
}
