//! Interfaces of the portal matching engine and the response tracker
//!
//! Both live outside this crate. The MD layer calls them with the owning
//! partition lock held (except the delayed-message dispositions), so
//! implementations must not call back into [`crate::MdLayer`] from those
//! methods.

use crate::handle::MdHandle;
use crate::md::MdInfo;
use crate::options::UnlinkPolicy;
use serde::{Deserialize, Serialize};

/// A portal match entry, identified by the portal engine's own id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEntry {
    pub id: u64,
    /// Partition the entry (and any MD attached to it) lives in
    pub cpt: usize,
    pub portal: u32,
    pub match_bits: u64,
    pub ignore_bits: u64,
    /// Whether the entry is torn down together with its MD
    pub unlink: UnlinkPolicy,
}

/// A message the portal engine parked until a matching MD showed up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedMsg {
    pub id: u64,
    pub initiator: u64,
    pub match_bits: u64,
    /// Requested length in bytes
    pub rlength: usize,
}

/// Response-tracker identity recorded on an MD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RsptId(pub u64);

pub trait Portal: Send + Sync {
    /// Attach a freshly published MD to `me`. Parked messages the MD now
    /// matches go to `matches`, ones it rejects go to `drops`.
    /// Partition lock held.
    fn attach_md(
        &self,
        me: &MatchEntry,
        md: &MdInfo,
        matches: &mut Vec<DelayedMsg>,
        drops: &mut Vec<DelayedMsg>,
    );

    /// Detach the MD from `me`. Partition lock held.
    fn detach_md(&self, me: &MatchEntry, md: MdHandle);

    /// Tear down `me`. Partition lock held, or called on an attach error
    /// path where the MD layer owns the entry.
    fn me_unlink(&self, me: &MatchEntry);

    /// Reject parked messages. Called without locks.
    fn drop_delayed(&self, msgs: Vec<DelayedMsg>, reason: &str);

    /// Receive parked messages into their new MD. Called without locks.
    fn recv_delayed(&self, msgs: Vec<DelayedMsg>);
}

pub trait ResponseTracker: Send + Sync {
    /// Drop the tracker's link to `md`. Partition `cpt` lock held.
    fn detach(&self, rspt: RsptId, md: MdHandle, cpt: usize);
}

/// Portal for layers that only bind free-floating MDs.
#[derive(Debug, Default)]
pub struct NullPortal;

impl Portal for NullPortal {
    fn attach_md(&self, _: &MatchEntry, _: &MdInfo, _: &mut Vec<DelayedMsg>, _: &mut Vec<DelayedMsg>) {}

    fn detach_md(&self, _: &MatchEntry, _: MdHandle) {}

    fn me_unlink(&self, _: &MatchEntry) {}

    fn drop_delayed(&self, _: Vec<DelayedMsg>, _: &str) {}

    fn recv_delayed(&self, _: Vec<DelayedMsg>) {}
}

#[derive(Debug, Default)]
pub struct NullTracker;

impl ResponseTracker for NullTracker {
    fn detach(&self, _: RsptId, _: MdHandle, _: usize) {}
}
