//! Small-integer id allocation with reuse.

use std::collections::BTreeSet;

/// Issues dense integer ids and recycles freed ones, smallest first.
///
/// Used for request ids within one endpoint and for connection ids within
/// one server.
#[derive(Debug, Default)]
pub struct IdAllocator {
    issued: u64,
    free: BTreeSet<u64>,
}

impl IdAllocator {
    /// Create an empty allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            issued: 0,
            free: BTreeSet::new(),
        }
    }

    /// Returns the smallest freed id, or the next never-issued id.
    pub fn allocate(&mut self) -> u64 {
        if let Some(id) = self.free.pop_first() {
            return id;
        }

        let id = self.issued;
        self.issued += 1;
        id
    }

    /// Returns `id` to the pool. Ids that are not currently allocated are ignored.
    pub fn free(&mut self, id: u64) {
        if id < self.issued {
            self.free.insert(id);
        }
    }

    /// Whether `id` is currently held by someone.
    #[must_use]
    pub fn is_allocated(&self, id: u64) -> bool {
        id < self.issued && !self.free.contains(&id)
    }

    /// Number of ids currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        usize::try_from(self.issued).unwrap_or(usize::MAX) - self.free.len()
    }
}
