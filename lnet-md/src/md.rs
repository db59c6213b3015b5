//! Memory descriptors: the user description and the internal record

use crate::alloc::KiovStorage;
use crate::event::{Event, EventHandler};
use crate::handle::MdHandle;
use crate::options::{MdFlags, MdOptions, Threshold};
use crate::page::Kiov;
use crate::portal::{MatchEntry, RsptId};
use serde::{Deserialize, Serialize};

/// Buffer an MD describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdBuffer {
    /// `length` bytes of virtual memory starting at `start`
    Contiguous { start: usize, length: usize },
    /// Caller-built page vector
    Kiov(Vec<Kiov>),
}

/// User-supplied MD description; consumed by attach/bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdDesc {
    pub buffer: MdBuffer,
    pub options: MdOptions,
    pub threshold: Threshold,
    /// Only meaningful with `MAX_SIZE`
    pub max_size: i64,
    pub user_ptr: u64,
    /// Only meaningful with `BULK_HANDLE`
    pub bulk_handle: Option<MdHandle>,
}

impl MdDesc {
    pub fn contiguous(start: usize, length: usize) -> Self {
        Self::with_buffer(MdBuffer::Contiguous { start, length })
    }

    /// Page-vector MD; sets the `KIOV` option.
    pub fn kiov(kiov: Vec<Kiov>) -> Self {
        let mut desc = Self::with_buffer(MdBuffer::Kiov(kiov));
        desc.options = MdOptions::KIOV;
        desc
    }

    fn with_buffer(buffer: MdBuffer) -> Self {
        Self {
            buffer,
            options: MdOptions::empty(),
            threshold: Threshold::Infinite,
            max_size: 0,
            user_ptr: 0,
            bulk_handle: None,
        }
    }

    pub fn options(mut self, options: MdOptions) -> Self {
        self.options |= options;
        self
    }

    pub fn threshold(mut self, threshold: Threshold) -> Self {
        self.threshold = threshold;
        self
    }

    /// Sets `max_size` and the `MAX_SIZE` option.
    pub fn max_size(mut self, max_size: i64) -> Self {
        self.max_size = max_size;
        self.options |= MdOptions::MAX_SIZE;
        self
    }

    pub fn user_ptr(mut self, user_ptr: u64) -> Self {
        self.user_ptr = user_ptr;
        self
    }

    /// Sets the companion DMA MD and the `BULK_HANDLE` option.
    pub fn bulk_handle(mut self, handle: MdHandle) -> Self {
        self.bulk_handle = Some(handle);
        self.options |= MdOptions::BULK_HANDLE;
        self
    }
}

/// User-visible view of a live MD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdInfo {
    pub handle: MdHandle,
    pub start: usize,
    pub length: usize,
    pub offset: usize,
    pub max_size: usize,
    pub options: MdOptions,
    pub threshold: Threshold,
    pub niov: usize,
    pub user_ptr: u64,
}

/// Internal MD record, owned by its partition container.
#[derive(Debug)]
pub(crate) struct Libmd {
    /// Cookie assigned at publication; in-flight references use it
    pub key: MdHandle,
    /// Cookie user lookups must match; `INVALID` once unlinking starts
    pub handle: MdHandle,
    /// Position in the container's active list
    pub seq: u64,
    pub start: usize,
    pub length: usize,
    pub offset: usize,
    pub max_size: usize,
    pub options: MdOptions,
    pub threshold: Threshold,
    pub refcount: u32,
    pub flags: MdFlags,
    pub handler: Option<EventHandler>,
    /// Handler calls running with the partition lock dropped
    pub handling: u32,
    /// Terminal event held back until `handling` drains
    pub deferred: Option<Event>,
    pub user_ptr: u64,
    pub bulk_handle: Option<MdHandle>,
    pub kiov: KiovStorage,
    pub me: Option<MatchEntry>,
    pub rspt: Option<RsptId>,
}

impl Libmd {
    pub(crate) fn new(kiov: KiovStorage, desc: &MdDesc, length: usize) -> Self {
        let mut flags = MdFlags::empty();
        if desc.options.contains(MdOptions::GPU_ADDR) {
            flags |= MdFlags::GPU;
        }
        Self {
            key: MdHandle::INVALID,
            handle: MdHandle::INVALID,
            seq: 0,
            start: match desc.buffer {
                MdBuffer::Contiguous { start, .. } => start,
                MdBuffer::Kiov(_) => 0,
            },
            length,
            offset: 0,
            max_size: if desc.options.contains(MdOptions::MAX_SIZE) {
                desc.max_size.max(0) as usize
            } else {
                0
            },
            // the built MD is always a page vector
            options: desc.options | MdOptions::KIOV,
            threshold: desc.threshold,
            refcount: 0,
            flags,
            handler: None,
            handling: 0,
            deferred: None,
            user_ptr: desc.user_ptr,
            bulk_handle: desc.bulk_handle,
            kiov,
            me: None,
            rspt: None,
        }
    }

    pub(crate) fn niov(&self) -> usize {
        self.kiov.len()
    }

    /// No further operation fits: the threshold ran out, or fewer than
    /// `max_size` bytes remain.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.threshold.is_exhausted()
            || (self.options.contains(MdOptions::MAX_SIZE)
                && self.offset + self.max_size > self.length)
    }

    /// Idle and either already unlinking or auto-unlink and exhausted.
    pub(crate) fn is_unlinkable(&self) -> bool {
        if self.refcount != 0 {
            return false;
        }
        if self.flags.contains(MdFlags::ZOMBIE) {
            return true;
        }
        self.flags.contains(MdFlags::AUTO_UNLINK) && self.is_exhausted()
    }

    pub(crate) fn info(&self) -> MdInfo {
        MdInfo {
            handle: self.key,
            start: self.start,
            length: self.length,
            offset: self.offset,
            max_size: self.max_size,
            options: self.options,
            threshold: self.threshold,
            niov: self.niov(),
            user_ptr: self.user_ptr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::bare_md;

    #[test]
    fn test_desc_builders_set_options() {
        let desc = MdDesc::contiguous(0x1000, 64)
            .options(MdOptions::OP_PUT)
            .max_size(16)
            .bulk_handle(MdHandle::from_raw(5));
        assert!(desc
            .options
            .contains(MdOptions::OP_PUT | MdOptions::MAX_SIZE | MdOptions::BULK_HANDLE));
        assert!(!desc.options.contains(MdOptions::KIOV));
        assert!(MdDesc::kiov(vec![]).options.contains(MdOptions::KIOV));
    }

    #[test]
    fn test_exhaustion() {
        let mut md = bare_md();
        md.length = 100;
        assert!(!md.is_exhausted());

        md.threshold = Threshold::Ops(0);
        assert!(md.is_exhausted());

        md.threshold = Threshold::Infinite;
        md.options |= MdOptions::MAX_SIZE;
        md.max_size = 40;
        md.offset = 60;
        assert!(!md.is_exhausted());
        md.offset = 61;
        assert!(md.is_exhausted());
    }

    #[test]
    fn test_unlinkable() {
        let mut md = bare_md();
        md.threshold = Threshold::Ops(0);
        assert!(!md.is_unlinkable());

        md.flags |= MdFlags::AUTO_UNLINK;
        assert!(md.is_unlinkable());

        md.refcount = 1;
        assert!(!md.is_unlinkable());

        md.refcount = 0;
        md.threshold = Threshold::Infinite;
        md.flags = MdFlags::ZOMBIE;
        assert!(md.is_unlinkable());
    }
}
