//! Shared fixtures for unit tests

use crate::alloc::MdAllocator;
use crate::config::MdConfig;
use crate::handle::MdHandle;
use crate::md::{Libmd, MdDesc, MdInfo};
use crate::page::{Page, PageMap};
use crate::portal::{DelayedMsg, MatchEntry, Portal, ResponseTracker, RsptId};
use fail_inject::FailInjector;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

pub const PAGE: usize = 4096;

/// A private injector per test, so armed failpoints never leak across
/// tests running in parallel.
pub fn faults() -> &'static FailInjector {
    Box::leak(Box::new(FailInjector::with_tick(std::time::Duration::from_millis(5))))
}

/// Unpublished MD with an empty page vector.
pub fn bare_md() -> Box<Libmd> {
    let allocator = MdAllocator::new(&MdConfig::default(), faults());
    let storage = allocator.alloc(0).unwrap();
    Box::new(Libmd::new(storage, &MdDesc::contiguous(0, 0), 0))
}

/// Deterministic page map: page = address / 4096, NUMA placement from an
/// explicit table.
#[derive(Default)]
pub struct FakePageMap {
    numa: HashMap<Page, u32>,
    unmapped: HashSet<Page>,
}

impl FakePageMap {
    pub const VMALLOC_START: usize = 0xffff_c900_0000_0000;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn vmalloc_page(addr: usize) -> Page {
        Page(((addr - Self::VMALLOC_START) / PAGE) as u64 | (1 << 63))
    }

    pub fn set_node(&mut self, page: Page, node: u32) {
        self.numa.insert(page, node);
    }

    pub fn unmap(&mut self, page: Page) {
        self.unmapped.insert(page);
    }
}

impl PageMap for FakePageMap {
    fn page_size(&self) -> usize {
        PAGE
    }

    fn is_vmalloc(&self, addr: usize) -> bool {
        addr >= Self::VMALLOC_START
    }

    fn page_of(&self, addr: usize, vmalloc: bool) -> Option<Page> {
        let page = if vmalloc {
            Self::vmalloc_page(addr)
        } else {
            Page((addr / PAGE) as u64)
        };
        (!self.unmapped.contains(&page)).then_some(page)
    }

    fn numa_of(&self, page: Page) -> Option<u32> {
        self.numa.get(&page).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalCall {
    Attach(u64, MdHandle),
    Detach(u64, MdHandle),
    MeUnlink(u64),
}

/// Portal that records every call and parks nothing.
#[derive(Default)]
pub struct RecordingPortal {
    calls: Mutex<Vec<PortalCall>>,
}

impl RecordingPortal {
    pub fn calls(&self) -> Vec<PortalCall> {
        self.calls.lock().clone()
    }
}

impl Portal for RecordingPortal {
    fn attach_md(&self, me: &MatchEntry, md: &MdInfo, _: &mut Vec<DelayedMsg>, _: &mut Vec<DelayedMsg>) {
        self.calls.lock().push(PortalCall::Attach(me.id, md.handle));
    }

    fn detach_md(&self, me: &MatchEntry, md: MdHandle) {
        self.calls.lock().push(PortalCall::Detach(me.id, md));
    }

    fn me_unlink(&self, me: &MatchEntry) {
        self.calls.lock().push(PortalCall::MeUnlink(me.id));
    }

    fn drop_delayed(&self, _: Vec<DelayedMsg>, _: &str) {}

    fn recv_delayed(&self, _: Vec<DelayedMsg>) {}
}

#[derive(Default)]
pub struct RecordingTracker {
    detached: Mutex<Vec<(RsptId, MdHandle)>>,
}

impl RecordingTracker {
    pub fn detached(&self) -> Vec<(RsptId, MdHandle)> {
        self.detached.lock().clone()
    }
}

impl ResponseTracker for RecordingTracker {
    fn detach(&self, rspt: RsptId, md: MdHandle, _cpt: usize) {
        self.detached.lock().push((rspt, md));
    }
}
