//! Failpoint IDs compiled into the MD layer

/// MD allocation fails with `OutOfMemory`.
pub const FAIL_MD_ALLOC: u32 = 0xe001;

/// Attach fails after the MD is built with `fail_err` (default `-EIO`).
pub const FAIL_MD_ATTACH: u32 = 0xe002;

/// Unlink sleeps `fail_val` milliseconds before taking the partition lock.
pub const FAIL_MD_UNLINK_PAUSE: u32 = 0xe003;

/// Race point between dropping the partition lock and calling the handler
/// of a completed operation.
pub const FAIL_MD_HANDLER_RACE: u32 = 0xe004;
