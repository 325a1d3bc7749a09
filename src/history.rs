//! Bounded history of recent windows, used by stages that combine the last
//! few inputs.

/// Fixed-depth circular history, oldest entry first.
///
/// Once full, each `put` overwrites the oldest entry.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    slots: Vec<Option<T>>,
    start: usize,
    len: usize,
}

impl<T> BoundedHistory<T> {
    /// Create an empty history holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            start: 0,
            len: 0,
        }
    }

    /// Append an entry, evicting the oldest when full
    pub fn put(&mut self, item: T) {
        let cap = self.slots.len();
        if self.len < cap {
            self.slots[(self.start + self.len) % cap] = Some(item);
            self.len += 1;
        } else {
            self.slots[self.start] = Some(item);
            self.start = (self.start + 1) % cap;
        }
    }

    /// The `i`-th oldest entry, if stored
    pub fn get(&self, i: usize) -> Option<&T> {
        if i >= self.len {
            return None;
        }
        self.slots[(self.start + i) % self.slots.len()].as_ref()
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.start = 0;
        self.len = 0;
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }
}
