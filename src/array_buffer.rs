//! Growable byte buffer with read/write cursors.
//!
//! Layout of the backing allocation:
//!
//! ```text
//! [ discarded | active (committed, readable) | available (writable) ]
//! ```
//!
//! The read loop accumulates transport bytes into the available region,
//! commits them, and discards whole frames once parsed. The write pipeline
//! does the same in reverse: frames are written into the available region,
//! committed, and the active region is flushed to the transport in one write.

/// Resizable byte buffer tracking an active and an available region.
#[derive(Debug, Default)]
pub struct ArrayBuffer {
    bytes: Vec<u8>,
    active_start: usize,
    available_start: usize,
}

impl ArrayBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity],
            active_start: 0,
            available_start: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn active_len(&self) -> usize {
        self.available_start - self.active_start
    }

    pub fn available_len(&self) -> usize {
        self.bytes.len() - self.available_start
    }

    pub fn is_empty(&self) -> bool {
        self.active_len() == 0
    }

    pub fn active_span(&self) -> &[u8] {
        &self.bytes[self.active_start..self.available_start]
    }

    pub fn available_span(&mut self) -> &mut [u8] {
        &mut self.bytes[self.available_start..]
    }

    /// Mark `n` bytes written into the available region as active.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.available_len());
        self.available_start += n;
    }

    /// Drop `n` bytes from the front of the active region.
    pub fn discard(&mut self, n: usize) {
        debug_assert!(n <= self.active_len());
        if n == self.active_len() {
            self.active_start = 0;
            self.available_start = 0;
        } else {
            self.active_start += n;
        }
    }

    /// Make sure at least `n` bytes are writable. Compacts the active region to
    /// the front when that suffices, otherwise grows by doubling.
    pub fn ensure_available_space(&mut self, n: usize) {
        if n <= self.available_len() {
            return;
        }

        let active_len = self.active_len();
        if n <= self.active_start + self.available_len() {
            self.bytes.copy_within(self.active_start..self.available_start, 0);
            self.active_start = 0;
            self.available_start = active_len;
            return;
        }

        let desired = active_len + n;
        let mut new_size = self.bytes.len().max(1);
        while new_size < desired {
            new_size *= 2;
        }

        let mut grown = vec![0; new_size];
        grown[..active_len].copy_from_slice(self.active_span());
        self.bytes = grown;
        self.active_start = 0;
        self.available_start = active_len;
    }

    pub fn clear(&mut self) {
        self.active_start = 0;
        self.available_start = 0;
    }
}
