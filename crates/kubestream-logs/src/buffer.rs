use std::collections::VecDeque;

/// Fixed capacity ring buffer keeping the most recent entries
///
/// Owned by a single request; wrap it yourself if it must be shared.
#[derive(Clone, Debug)]
pub struct RingBuffer<T> {
    /// Internal storage
    entries: VecDeque<T>,

    /// Maximum capacity
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a new buffer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a new entry, evicting oldest if at capacity
    pub fn push(&mut self, entry: T) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Clear all entries, keeping the allocation
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Consume the buffer, oldest entry first
    pub fn into_vec(self) -> Vec<T> {
        self.entries.into()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Ordered copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}
