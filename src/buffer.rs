use std::ops::Deref;

const DEFAULT_CAPACITY: usize = 16 * 1024;

/// Growable byte buffer with O(1) consumption from the front.
///
/// Valid bytes live in `data[start..end]`. Consumed space at the front is
/// reclaimed lazily by [`Buffer::make_room`] when an append would not fit.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            start: 0,
            end: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn append(&mut self, data: &[u8]) {
        let needed = data.len();

        if self.end + needed > self.data.capacity() {
            self.make_room(needed);
        }
        if self.end + needed > self.data.len() {
            self.data.resize(self.end + needed, 0);
        }

        self.data[self.end..self.end + needed].copy_from_slice(data);
        self.end += needed;
    }

    /// Drops `n` bytes from the front. Panics if `n > len()`.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "cannot consume more bytes than available");

        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Position of the first `\r\n`, relative to the front.
    pub fn find_crlf(&self) -> Option<usize> {
        self.data().windows(2).position(|w| w == b"\r\n")
    }

    // Either slide live bytes back to the front or reallocate.
    fn make_room(&mut self, needed: usize) {
        let current_len = self.len();
        let available_at_end = self.data.capacity() - self.end;

        if self.start + available_at_end >= needed {
            if current_len > 0 {
                self.data.copy_within(self.start..self.end, 0);
            }
        } else {
            let new_capacity = (self.data.capacity() * 2).max(current_len + needed);
            let mut new_data = Vec::with_capacity(new_capacity);
            new_data.extend_from_slice(&self.data[self.start..self.end]);
            self.data = new_data;
        }
        self.start = 0;
        self.end = current_len;
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}
