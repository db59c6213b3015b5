use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// User-visible MD options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MdOptions: u32 {
        /// Remote peers may PUT into the MD.
        const OP_PUT = 1 << 0;
        /// Remote peers may GET from the MD.
        const OP_GET = 1 << 1;
        /// The buffer is a page vector rather than a contiguous range.
        const KIOV = 1 << 8;
        /// `max_size` bounds each operation; the MD is exhausted once
        /// less than `max_size` bytes remain.
        const MAX_SIZE = 1 << 7;
        /// `bulk_handle` names the MD that is actually used for DMA.
        const BULK_HANDLE = 1 << 11;
        /// The buffer lives in device memory.
        const GPU_ADDR = 1 << 13;
        /// Waive the `max_iov` ceiling.
        const GNILND = 1 << 10;
    }
}

bitflags! {
    /// Internal lifecycle flags; set during the MD's life, never cleared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MdFlags: u32 {
        /// Unlink has begun; handle lookups fail from here on.
        const ZOMBIE = 1 << 0;
        /// Release the MD once it is exhausted.
        const AUTO_UNLINK = 1 << 1;
        /// Explicitly unlinked by its owner.
        const ABORTED = 1 << 2;
        const GPU = 1 << 3;
    }
}

impl MdOptions {
    pub const OP_MASK: Self = Self::OP_PUT.union(Self::OP_GET);
}

/// Remaining operation budget of an MD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Threshold {
    Infinite,
    Ops(u32),
}

impl Threshold {
    pub fn is_infinite(self) -> bool {
        matches!(self, Threshold::Infinite)
    }

    pub fn is_exhausted(self) -> bool {
        matches!(self, Threshold::Ops(0))
    }

    pub(crate) fn consume(&mut self) {
        if let Threshold::Ops(n) = self {
            *n = n.saturating_sub(1);
        }
    }
}

/// Whether an MD (or match entry) goes away on its own when exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnlinkPolicy {
    Retain,
    Unlink,
}
