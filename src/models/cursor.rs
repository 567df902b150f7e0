//! Resumable position inside a transfer plan.

use serde::{Deserialize, Serialize};

/// Index into the plan's entry list plus a byte offset into the current
/// entry.
///
/// Persisted verbatim after every chunk. The chunk loop always reloads it
/// from the store at the start of a pass and never trusts an in-memory copy
/// from an earlier invocation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkCursor {
    /// True while a pass is walking the plan (false before the first pass
    /// and once the plan is exhausted).
    pub is_processing: bool,

    /// Position of the current entry in the plan.
    pub index: usize,

    /// Bytes of the current entry already moved.
    pub offset: u64,
}

impl ChunkCursor {
    /// Move forward inside the current entry.
    pub fn advance(&mut self, bytes: u64) {
        self.offset = self.offset.saturating_add(bytes);
    }

    /// Move to the start of the next entry.
    pub fn next_entry(&mut self) {
        self.index += 1;
        self.offset = 0;
    }

    /// Whether the cursor has walked past the last of `len` entries.
    pub fn is_exhausted(&self, len: usize) -> bool {
        self.index >= len
    }
}
