//! MD lifecycle: attach, bind, operation accounting, unlink and teardown
//!
//! ```text
//!   build ──► live ──(attach | bind)──► linked
//!                                         │  begin_op: refcount += 1
//!            unlink / exhausted ──────────┤
//!                                         ▼
//!                                  ZOMBIE (handle invalid)
//!                                         │  last complete: refcount → 0
//!                                         ▼
//!                                      released
//! ```
//!
//! All MD state is guarded by the owning partition's lock. Handlers run
//! with no lock held and are counted in `Libmd::handling`. Unlink waits
//! on the partition condvar while a handler of an idle MD runs. A
//! terminal completion never waits: its event is parked on the MD and
//! delivered by the last handler call to return, so a handler may
//! complete further operations on its own MD.

use crate::alloc::{AllocStats, MdAllocator};
use crate::config::MdConfig;
use crate::error::{MdError, Result};
use crate::event::{Event, EventHandler, OpKind};
use crate::failpoints::{FAIL_MD_ATTACH, FAIL_MD_HANDLER_RACE, FAIL_MD_UNLINK_PAUSE};
use crate::handle::{Container, MdHandle};
use crate::kiov;
use crate::md::{Libmd, MdDesc, MdInfo};
use crate::options::{MdFlags, MdOptions, UnlinkPolicy};
use crate::page::{Kiov, PageMap};
use crate::portal::{MatchEntry, NullTracker, Portal, ResponseTracker, RsptId};
use fail_inject::FailInjector;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Partition hint for placing work near an MD's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CptHint {
    Any,
    Partition(usize),
}

/// Reference held by an operation in flight against an MD. Hand it back
/// to [`MdLayer::complete`] exactly once.
#[derive(Debug)]
#[must_use = "an in-flight operation must be completed"]
pub struct OpRef {
    key: MdHandle,
    kind: OpKind,
    offset: usize,
    mlength: usize,
}

impl OpRef {
    pub fn md(&self) -> MdHandle {
        self.key
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn mlength(&self) -> usize {
        self.mlength
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdStats {
    /// Linked MDs (zombies included) per partition
    pub active: Vec<usize>,
    pub alloc: AllocStats,
}

impl MdStats {
    pub fn total_active(&self) -> usize {
        self.active.iter().sum()
    }
}

struct Partition {
    container: Mutex<Container>,
    /// Signalled whenever a handler call finishes
    handling: Condvar,
}

impl Partition {
    fn new(cpt: usize) -> Self {
        Self {
            container: Mutex::new(Container::new(cpt)),
            handling: Condvar::new(),
        }
    }
}

/// The MD layer: partitioned MD tables plus their external collaborators.
pub struct MdLayer {
    config: MdConfig,
    pages: Arc<dyn PageMap>,
    portal: Arc<dyn Portal>,
    tracker: Arc<dyn ResponseTracker>,
    allocator: Arc<MdAllocator>,
    partitions: Vec<Partition>,
    next_cpt: AtomicUsize,
    faults: &'static FailInjector,
}

impl MdLayer {
    /// Create the layer with the process-wide fault injector and no
    /// response tracker.
    pub fn new(
        config: MdConfig,
        pages: Arc<dyn PageMap>,
        portal: Arc<dyn Portal>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let faults = fail_inject::global();
        let allocator = Arc::new(MdAllocator::new(&config, faults));
        let partitions = (0..config.ncpts).map(Partition::new).collect();

        info!(
            "MD layer: {} partitions, max_iov={}, mtu={}, small MD <= {} bytes",
            config.ncpts, config.max_iov, config.mtu, config.small_md_threshold
        );

        Ok(Self {
            config,
            pages,
            portal,
            tracker: Arc::new(NullTracker),
            allocator,
            partitions,
            next_cpt: AtomicUsize::new(0),
            faults,
        })
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ResponseTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Use a private fault injector instead of the process-wide one.
    pub fn with_faults(mut self, faults: &'static FailInjector) -> Self {
        self.faults = faults;
        self.allocator = Arc::new(MdAllocator::new(&self.config, faults));
        self
    }

    pub fn config(&self) -> &MdConfig {
        &self.config
    }

    pub fn ncpts(&self) -> usize {
        self.partitions.len()
    }

    fn partition(&self, cpt: usize) -> Option<&Partition> {
        self.partitions.get(cpt)
    }

    /// Validate `desc`, allocate the MD and fill its page vector. Nothing
    /// is allocated unless the description is valid and within `limit`.
    fn build(&self, desc: &MdDesc, limit: Option<usize>) -> Result<Box<Libmd>> {
        let plan = kiov::plan(desc, self.pages.as_ref(), self.config.max_iov)?;
        if let Some(limit) = limit {
            if plan.length > limit {
                return Err(MdError::invalid(format!(
                    "transfer size {} exceeds {} max",
                    plan.length, limit
                )));
            }
        }

        let mut storage = self.allocator.alloc(plan.niov)?;
        if let Err(e) = kiov::fill(&mut storage, desc, self.pages.as_ref()) {
            self.allocator.free(storage);
            return Err(e);
        }
        Ok(Box::new(Libmd::new(storage, desc, plan.length)))
    }

    fn free_md(&self, md: Box<Libmd>) {
        let md = *md;
        self.allocator.free(md.kiov);
    }

    /// Tear down a match entry whose ownership came in with a failed
    /// attach.
    fn dispose_me(&self, me: &MatchEntry) {
        match self.partition(me.cpt) {
            Some(part) => {
                let _guard = part.container.lock();
                self.portal.me_unlink(me);
            }
            None => self.portal.me_unlink(me),
        }
    }

    /// Build an MD and attach it to `me`. Ownership of `me` passes to this
    /// call: on any error the entry is unlinked as well.
    ///
    /// Messages the portal engine had parked are delivered after the
    /// partition lock is dropped, rejected ones first.
    pub fn attach(
        &self,
        me: MatchEntry,
        desc: MdDesc,
        policy: UnlinkPolicy,
        handler: Option<EventHandler>,
    ) -> Result<MdHandle> {
        if !desc.options.intersects(MdOptions::OP_MASK) {
            self.dispose_me(&me);
            return Err(MdError::invalid("no OP_PUT or OP_GET on attached MD"));
        }
        if me.cpt >= self.partitions.len() {
            self.dispose_me(&me);
            return Err(MdError::invalid(format!("match entry on unknown cpt {}", me.cpt)));
        }

        let mut md = match self.build(&desc, None) {
            Ok(md) => md,
            Err(e) => {
                self.dispose_me(&me);
                return Err(e);
            }
        };

        if let Some(errno) = self.faults.check_err(FAIL_MD_ATTACH, -libc::EIO) {
            self.free_md(md);
            self.dispose_me(&me);
            return Err(MdError::Injected(errno));
        }

        md.handler = handler;
        if policy == UnlinkPolicy::Unlink {
            md.flags |= MdFlags::AUTO_UNLINK;
        }
        md.me = Some(me.clone());
        let niov = md.niov();
        let mut info = md.info();

        let part = &self.partitions[me.cpt];
        let mut matches = Vec::new();
        let mut drops = Vec::new();
        let handle = {
            let mut container = part.container.lock();
            let handle = match container.publish(md) {
                Ok(handle) => handle,
                Err(md) => {
                    self.portal.me_unlink(&me);
                    drop(container);
                    self.free_md(md);
                    return Err(MdError::OutOfMemory { niov });
                }
            };
            info.handle = handle;
            self.portal.attach_md(&me, &info, &mut matches, &mut drops);
            handle
        };

        debug!(
            "attached md {} to me {} ({} bytes, {} fragments)",
            handle, me.id, info.length, niov
        );

        if !drops.is_empty() {
            self.portal.drop_delayed(drops, "Bad match");
        }
        if !matches.is_empty() {
            self.portal.recv_delayed(matches);
        }
        Ok(handle)
    }

    /// Build a free-floating MD for locally initiated operations.
    pub fn bind(
        &self,
        desc: MdDesc,
        policy: UnlinkPolicy,
        handler: Option<EventHandler>,
    ) -> Result<MdHandle> {
        if desc.options.intersects(MdOptions::OP_MASK) {
            return Err(MdError::invalid("OP_PUT/OP_GET illegal on free-floating MD"));
        }

        let mut md = self.build(&desc, Some(self.config.mtu))?;
        md.handler = handler;
        if policy == UnlinkPolicy::Unlink {
            md.flags |= MdFlags::AUTO_UNLINK;
        }
        let niov = md.niov();

        let cpt = self.next_cpt.fetch_add(1, Ordering::Relaxed) % self.partitions.len();
        let mut container = self.partitions[cpt].container.lock();
        match container.publish(md) {
            Ok(handle) => {
                debug!("bound md {} on cpt {} ({} fragments)", handle, cpt, niov);
                Ok(handle)
            }
            Err(md) => {
                drop(container);
                self.free_md(md);
                Err(MdError::OutOfMemory { niov })
            }
        }
    }

    /// Unlink an MD. Returns at once even when operations are still in
    /// flight; the last completion then carries the unlinked flag.
    /// Otherwise the handler gets a dedicated unlink event.
    pub fn unlink(&self, handle: MdHandle) -> Result<()> {
        let part = self
            .partition(handle.cpt())
            .ok_or(MdError::NotFound(handle))?;

        if self.faults.precheck(FAIL_MD_UNLINK_PAUSE) {
            let ms = u64::from(self.faults.val());
            self.faults.timeout(FAIL_MD_UNLINK_PAUSE, ms);
        }

        let mut container = part.container.lock();
        let (delivery, rspt) = loop {
            let md = container
                .lookup(handle)
                .ok_or(MdError::NotFound(handle))?;
            if md.refcount == 0 && md.handling > 0 {
                // the handler may unlink or exhaust the MD, so resolve again
                part.handling.wait(&mut container);
                continue;
            }

            md.flags |= MdFlags::ABORTED;
            let mut delivery = None;
            if md.refcount == 0 {
                if let Some(handler) = &md.handler {
                    delivery = Some((handler.clone(), Event::unlink(md)));
                }
            }
            break (delivery, md.rspt.take());
        };

        if let Some(rspt) = rspt {
            self.tracker.detach(rspt, handle, handle.cpt());
        }
        self.unlink_locked(&mut container, handle);
        drop(container);

        if let Some((handler, event)) = delivery {
            handler.call(&event);
        }
        Ok(())
    }

    /// First call marks the MD a zombie, detaches it from its match entry
    /// and invalidates its handle. The MD is released once no operation
    /// holds a reference and no handler call is running. Partition lock
    /// held.
    fn unlink_locked(&self, container: &mut Container, key: MdHandle) {
        let md = container
            .get(key)
            .unwrap_or_else(|| panic!("unlink of released md {}", key));

        let first = !md.flags.contains(MdFlags::ZOMBIE);
        if first {
            md.flags |= MdFlags::ZOMBIE;
            if let Some(me) = md.me.take() {
                self.portal.detach_md(&me, key);
                if me.unlink == UnlinkPolicy::Unlink {
                    self.portal.me_unlink(&me);
                }
            }
        }
        let refcount = md.refcount;
        let handling = md.handling;
        if first {
            container.invalidate(key);
        }

        if refcount != 0 {
            debug!("queueing unlink of md {} ({} refs)", key, refcount);
            return;
        }
        if handling != 0 {
            debug!("md {} released after {} handler calls return", key, handling);
            return;
        }

        let md = container.release(key);
        assert!(md.rspt.is_none(), "md {} released with a response tracker", key);
        assert!(md.deferred.is_none(), "md {} released with an undelivered event", key);
        debug!("unlinked md {}", key);
        self.free_md(md);
    }

    /// Commit an operation of `rlength` bytes against a live MD: advance
    /// its offset, consume one unit of threshold and take a reference.
    pub fn begin_op(&self, handle: MdHandle, kind: OpKind, rlength: usize) -> Result<OpRef> {
        let part = self
            .partition(handle.cpt())
            .ok_or(MdError::NotFound(handle))?;
        let mut container = part.container.lock();
        let md = container
            .lookup(handle)
            .ok_or(MdError::NotFound(handle))?;

        if md.is_exhausted() {
            return Err(MdError::invalid(format!("md {} is exhausted", handle)));
        }
        if md.me.is_some() {
            let needed = match kind {
                OpKind::Put => MdOptions::OP_PUT,
                OpKind::Get => MdOptions::OP_GET,
                _ => MdOptions::empty(),
            };
            if !md.options.contains(needed) {
                return Err(MdError::invalid(format!("md {} does not allow {:?}", handle, kind)));
            }
        }

        let limit = if md.options.contains(MdOptions::MAX_SIZE) {
            md.max_size
        } else {
            md.length - md.offset
        };
        if rlength > limit {
            return Err(MdError::invalid(format!(
                "{} bytes do not fit md {} ({} allowed)",
                rlength, handle, limit
            )));
        }

        let offset = md.offset;
        md.offset += rlength;
        md.threshold.consume();
        md.refcount += 1;
        Ok(OpRef {
            key: md.key,
            kind,
            offset,
            mlength: rlength,
        })
    }

    /// Completion hook: drop the operation's reference and deliver its
    /// event. Returns true when this completion unlinked the MD, in which
    /// case the event carries `unlinked` and no separate unlink event
    /// follows.
    pub fn complete(&self, op: OpRef, status: i32) -> bool {
        let cpt = op.key.cpt();
        let part = &self.partitions[cpt];
        let mut container = part.container.lock();

        let md = container
            .get(op.key)
            .unwrap_or_else(|| panic!("completion for released md {}", op.key));
        md.refcount = md
            .refcount
            .checked_sub(1)
            .unwrap_or_else(|| panic!("md {} refcount underflow", op.key));

        let unlink = md.is_unlinkable();
        let mut delivery = None;
        if let Some(handler) = md.handler.clone() {
            let status = if md.flags.contains(MdFlags::ABORTED) && status == 0 {
                -libc::ETIMEDOUT
            } else {
                status
            };
            let event = Event::completion(md, op.kind, op.offset, op.mlength, status, unlink);
            if unlink && md.handling > 0 {
                // the unlinked event must be the handler's last call
                md.deferred = Some(event);
            } else {
                if !unlink {
                    md.handling += 1;
                }
                delivery = Some((handler, event));
            }
        }

        if unlink || (md.refcount == 0 && md.threshold.is_infinite()) {
            if let Some(rspt) = md.rspt.take() {
                self.tracker.detach(rspt, op.key, cpt);
            }
        }

        if unlink {
            self.unlink_locked(&mut container, op.key);
        }
        drop(container);

        if let Some((handler, event)) = delivery {
            self.faults.race(FAIL_MD_HANDLER_RACE);
            handler.call(&event);
            if !unlink {
                self.handler_returned(part, op.key);
            }
        }
        unlink
    }

    /// Drop the handler count taken by `complete`. The last call out
    /// releases a drained MD and delivers its parked terminal event.
    fn handler_returned(&self, part: &Partition, key: MdHandle) {
        let mut container = part.container.lock();
        let md = container
            .get(key)
            .unwrap_or_else(|| panic!("handler returned for released md {}", key));
        md.handling = md
            .handling
            .checked_sub(1)
            .unwrap_or_else(|| panic!("md {} handler count underflow", key));
        if md.handling > 0 {
            return;
        }

        let parked = md
            .deferred
            .take()
            .and_then(|event| md.handler.clone().map(|handler| (handler, event)));
        if parked.is_some() {
            self.unlink_locked(&mut container, key);
        }
        part.handling.notify_all();
        drop(container);

        if let Some((handler, event)) = parked {
            handler.call(&event);
        }
    }

    /// Record the response tracker waiting on this MD.
    pub fn track_response(&self, handle: MdHandle, rspt: RsptId) -> Result<()> {
        let part = self
            .partition(handle.cpt())
            .ok_or(MdError::NotFound(handle))?;
        let mut container = part.container.lock();
        let md = container
            .lookup(handle)
            .ok_or(MdError::NotFound(handle))?;
        md.rspt = Some(rspt);
        Ok(())
    }

    pub fn md_info(&self, handle: MdHandle) -> Result<MdInfo> {
        self.with_md(handle, |md| md.info())
    }

    pub fn kiov(&self, handle: MdHandle) -> Result<Vec<Kiov>> {
        self.with_md(handle, |md| md.kiov.to_vec())
    }

    fn with_md<T>(&self, handle: MdHandle, f: impl FnOnce(&Libmd) -> T) -> Result<T> {
        let part = self
            .partition(handle.cpt())
            .ok_or(MdError::NotFound(handle))?;
        let mut container = part.container.lock();
        container
            .lookup(handle)
            .map(|md| f(md))
            .ok_or(MdError::NotFound(handle))
    }

    /// Partition closest to the memory at `offset` in the MD, following
    /// the bulk-handle indirection to the MD that is really DMA'd.
    pub fn cpt_of(&self, handle: MdHandle, offset: usize) -> CptHint {
        let Some(part) = self.partition(handle.cpt()) else {
            return CptHint::Any;
        };
        let bulk = {
            let mut container = part.container.lock();
            let Some(md) = container.lookup(handle) else {
                return CptHint::Any;
            };
            match md.bulk_handle {
                Some(bulk) if md.options.contains(MdOptions::BULK_HANDLE) && !bulk.is_invalid() => {
                    bulk
                }
                _ => return self.cpt_of_kiov(md, offset),
            }
        };

        // one partition lock at a time
        let Some(part) = self.partition(bulk.cpt()) else {
            return CptHint::Any;
        };
        let mut container = part.container.lock();
        match container.lookup(bulk) {
            Some(md) => self.cpt_of_kiov(md, offset),
            None => CptHint::Any,
        }
    }

    fn cpt_of_kiov(&self, md: &Libmd, mut offset: usize) -> CptHint {
        if md.flags.contains(MdFlags::GPU) || md.kiov.is_empty() {
            return CptHint::Any;
        }
        for frag in md.kiov.iter() {
            if offset < frag.len {
                return match self.pages.numa_of(frag.page) {
                    Some(node) => CptHint::Partition(node as usize % self.partitions.len()),
                    None => CptHint::Any,
                };
            }
            offset -= frag.len;
        }
        warn!("offset {} goes beyond kiov of md {}", offset, md.key);
        CptHint::Any
    }

    /// Abort if any linked MD still calls `handler`. Owners run this
    /// before they tear the handler down.
    pub fn assert_handler_unused(&self, handler: &EventHandler) {
        for (cpt, part) in self.partitions.iter().enumerate() {
            let container = part.container.lock();
            let user = container
                .iter()
                .find(|md| md.handler.as_ref().is_some_and(|h| h.same_as(handler)))
                .map(|md| md.key);
            if let Some(key) = user {
                panic!("{:?} still used by md {} on cpt {}", handler, key, cpt);
            }
        }
    }

    pub fn stats(&self) -> MdStats {
        MdStats {
            active: self
                .partitions
                .iter()
                .map(|part| part.container.lock().len())
                .collect(),
            alloc: self.allocator.stats(),
        }
    }
}

impl Drop for MdLayer {
    fn drop(&mut self) {
        for (cpt, part) in self.partitions.iter().enumerate() {
            let leaked = part.container.lock().drain();
            if !leaked.is_empty() {
                warn!("{} MDs still linked on cpt {} at shutdown", leaked.len(), cpt);
            }
            for md in leaked {
                self.free_md(md);
            }
        }
    }
}
