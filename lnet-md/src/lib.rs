//! Memory descriptors for a portals-style networking layer
//!
//! An MD describes a region of memory the network may read or write: a
//! validated page vector plus the rules for consuming it (operation
//! threshold, per-operation size cap, auto-unlink). MDs are either
//! attached to a portal match entry, to receive incoming PUT/GET, or bound
//! free-floating for locally initiated sends and replies.
//!
//! # Architecture
//!
//! ```text
//!   MdDesc ──► kiov::plan/fill ──► MdAllocator ──► Container[cpt]
//!                                                    │ (handle cookie)
//!   attach/bind ─────────────────────────────────────┘
//!   begin_op ─► OpRef ─► complete ─► EventHandler
//!   unlink ───► ZOMBIE ─► last complete ─► released
//! ```
//!
//! State is sharded by CPU partition; each partition has one lock guarding
//! its MDs. The portal engine and the response tracker are external and
//! reached through the [`Portal`] and [`ResponseTracker`] traits.

mod alloc;
mod config;
mod error;
mod event;
pub mod failpoints;
mod handle;
mod kiov;
mod lifecycle;
mod md;
mod options;
mod page;
mod portal;

#[cfg(test)]
mod test_utils;

pub use alloc::{md_size, AllocStats, SizeClass};
pub use config::{MdConfig, MAX_CPTS};
pub use error::{MdError, Result};
pub use event::{Event, EventHandler, EventKind, OpKind};
pub use handle::{MdHandle, MAX_SLOTS};
pub use lifecycle::{CptHint, MdLayer, MdStats, OpRef};
pub use md::{MdBuffer, MdDesc, MdInfo};
pub use options::{MdFlags, MdOptions, Threshold, UnlinkPolicy};
pub use page::{HostPageMap, Kiov, Page, PageMap};
pub use portal::{DelayedMsg, MatchEntry, NullPortal, NullTracker, Portal, ResponseTracker, RsptId};
