//! Events delivered to MD handlers

use crate::handle::MdHandle;
use crate::md::Libmd;
use crate::options::MdOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Operation an in-flight reference was taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Put,
    Get,
    Reply,
    Send,
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Put,
    Get,
    Reply,
    Send,
    Ack,
    Unlink,
}

impl From<OpKind> for EventKind {
    fn from(kind: OpKind) -> Self {
        match kind {
            OpKind::Put => EventKind::Put,
            OpKind::Get => EventKind::Get,
            OpKind::Reply => EventKind::Reply,
            OpKind::Send => EventKind::Send,
            OpKind::Ack => EventKind::Ack,
        }
    }
}

/// What a handler learns about its MD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub md_handle: MdHandle,
    pub md_start: usize,
    pub md_options: MdOptions,
    pub md_user_ptr: u64,
    /// Bytes moved by the operation (0 for unlink)
    pub mlength: usize,
    /// Offset within the MD where the operation landed
    pub offset: usize,
    /// 0 or a negative errno
    pub status: i32,
    /// Last event for this MD; the handler will not be called again
    pub unlinked: bool,
}

impl Event {
    /// Dedicated unlink event for an MD with no operation in flight.
    pub(crate) fn unlink(md: &Libmd) -> Self {
        Self {
            kind: EventKind::Unlink,
            md_handle: md.key,
            md_start: md.start,
            md_options: md.options,
            md_user_ptr: md.user_ptr,
            mlength: 0,
            offset: 0,
            status: 0,
            unlinked: true,
        }
    }

    pub(crate) fn completion(
        md: &Libmd,
        kind: OpKind,
        offset: usize,
        mlength: usize,
        status: i32,
        unlinked: bool,
    ) -> Self {
        Self {
            kind: kind.into(),
            md_handle: md.key,
            md_start: md.start,
            md_options: md.options,
            md_user_ptr: md.user_ptr,
            mlength,
            offset,
            status,
            unlinked,
        }
    }
}

type HandlerFn = dyn Fn(&Event) + Send + Sync;

/// Callback attached to an MD. Clones share identity, which is what
/// [`crate::MdLayer::assert_handler_unused`] compares.
#[derive(Clone)]
pub struct EventHandler(Arc<HandlerFn>);

impl EventHandler {
    pub fn new(f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn same_as(&self, other: &EventHandler) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }

    pub(crate) fn call(&self, event: &Event) {
        (self.0)(event)
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventHandler({:p})", Arc::as_ptr(&self.0))
    }
}
