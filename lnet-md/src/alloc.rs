//! MD memory management
//!
//! Two size classes, picked by the size the MD would occupy with its page
//! vector inline:
//! - small: fixed-capacity slots recycled through a free pool
//! - large: exact-size heap allocations
//!
//! The allocator only manages memory; it never looks at MD state.

use crate::config::MdConfig;
use crate::error::{MdError, Result};
use crate::failpoints::FAIL_MD_ALLOC;
use crate::md::Libmd;
use crate::page::Kiov;
use fail_inject::FailInjector;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::mem::size_of;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes an MD with `niov` fragments occupies when the vector is inline.
pub const fn md_size(niov: usize) -> usize {
    size_of::<Libmd>() + niov * size_of::<Kiov>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeClass {
    Small,
    Large,
}

/// Zero-initialised page-vector storage of one MD.
#[derive(Debug)]
pub(crate) struct KiovStorage {
    class: SizeClass,
    kiov: Vec<Kiov>,
}

impl KiovStorage {
    #[cfg(test)]
    pub(crate) fn class(&self) -> SizeClass {
        self.class
    }
}

impl Deref for KiovStorage {
    type Target = [Kiov];

    fn deref(&self) -> &[Kiov] {
        &self.kiov
    }
}

impl DerefMut for KiovStorage {
    fn deref_mut(&mut self) -> &mut [Kiov] {
        &mut self.kiov
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStats {
    pub small_allocs: u64,
    pub small_frees: u64,
    pub large_allocs: u64,
    pub large_frees: u64,
    pub cached: usize,
}

impl AllocStats {
    pub fn live(&self) -> u64 {
        (self.small_allocs + self.large_allocs).saturating_sub(self.small_frees + self.large_frees)
    }
}

pub struct MdAllocator {
    threshold: usize,
    small_niov: usize,
    cache_limit: usize,
    pool: Mutex<Vec<Vec<Kiov>>>,
    small_allocs: AtomicU64,
    small_frees: AtomicU64,
    large_allocs: AtomicU64,
    large_frees: AtomicU64,
    faults: &'static FailInjector,
}

impl MdAllocator {
    pub fn new(config: &MdConfig, faults: &'static FailInjector) -> Self {
        let small_niov = config.small_md_threshold.saturating_sub(md_size(0)) / size_of::<Kiov>();
        Self {
            threshold: config.small_md_threshold,
            small_niov,
            cache_limit: config.small_pool_cache,
            pool: Mutex::new(Vec::new()),
            small_allocs: AtomicU64::new(0),
            small_frees: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            large_frees: AtomicU64::new(0),
            faults,
        }
    }

    pub fn class_of(&self, niov: usize) -> SizeClass {
        if md_size(niov) <= self.threshold {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }

    pub(crate) fn alloc(&self, niov: usize) -> Result<KiovStorage> {
        if self.faults.check(FAIL_MD_ALLOC) {
            return Err(MdError::OutOfMemory { niov });
        }

        let class = self.class_of(niov);
        let mut kiov = match class {
            SizeClass::Small => match self.pool.lock().pop() {
                Some(slot) => slot,
                None => Self::reserve(self.small_niov, niov)?,
            },
            SizeClass::Large => Self::reserve(niov, niov)?,
        };
        kiov.resize(niov, Kiov::default());

        match class {
            SizeClass::Small => self.small_allocs.fetch_add(1, Ordering::Release),
            SizeClass::Large => self.large_allocs.fetch_add(1, Ordering::Release),
        };
        debug!("alloc md: niov={} class={:?}", niov, class);
        Ok(KiovStorage { class, kiov })
    }

    fn reserve(capacity: usize, niov: usize) -> Result<Vec<Kiov>> {
        let mut kiov = Vec::new();
        kiov.try_reserve_exact(capacity)
            .map_err(|_| MdError::OutOfMemory { niov })?;
        Ok(kiov)
    }

    pub(crate) fn free(&self, storage: KiovStorage) {
        let KiovStorage { class, mut kiov } = storage;
        match class {
            SizeClass::Small => {
                kiov.clear();
                let mut pool = self.pool.lock();
                if pool.len() < self.cache_limit {
                    pool.push(kiov);
                }
                self.small_frees.fetch_add(1, Ordering::Release);
            }
            SizeClass::Large => {
                self.large_frees.fetch_add(1, Ordering::Release);
            }
        }
    }

    /// Counter snapshot. Frees are read before allocations, so every
    /// free counted has its allocation counted too.
    pub fn stats(&self) -> AllocStats {
        let small_frees = self.small_frees.load(Ordering::Acquire);
        let large_frees = self.large_frees.load(Ordering::Acquire);
        AllocStats {
            small_allocs: self.small_allocs.load(Ordering::Acquire),
            small_frees,
            large_allocs: self.large_allocs.load(Ordering::Acquire),
            large_frees,
            cached: self.pool.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failpoints::FAIL_MD_ALLOC;
    use crate::page::Page;
    use crate::test_utils::faults;
    use std::sync::atomic::AtomicBool;

    fn allocator() -> MdAllocator {
        MdAllocator::new(&MdConfig::default(), faults())
    }

    #[test]
    fn test_size_class_selection() {
        let a = allocator();
        assert_eq!(a.class_of(0), SizeClass::Small);
        assert_eq!(a.class_of(1), SizeClass::Small);
        assert_eq!(a.class_of(2), SizeClass::Large);
        assert_eq!(a.class_of(256), SizeClass::Large);
    }

    #[test]
    fn test_alloc_is_zeroed_and_sized() {
        let a = allocator();
        for niov in [0, 1, 7] {
            let s = a.alloc(niov).unwrap();
            assert_eq!(s.len(), niov);
            assert!(s.iter().all(|k| *k == Kiov::default()));
            a.free(s);
        }
        let stats = a.stats();
        assert_eq!(stats.small_allocs, 2);
        assert_eq!(stats.large_allocs, 1);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn test_small_slots_are_recycled_clean() {
        let a = allocator();
        let mut s = a.alloc(1).unwrap();
        s[0] = Kiov::new(Page(9), 10, 20);
        a.free(s);
        assert_eq!(a.stats().cached, 1);

        let s = a.alloc(1).unwrap();
        assert_eq!(a.stats().cached, 0);
        assert_eq!(s[0], Kiov::default());
        assert_eq!(s.class(), SizeClass::Small);
        a.free(s);
    }

    #[test]
    fn test_pool_cache_is_bounded() {
        let config = MdConfig {
            small_pool_cache: 2,
            ..Default::default()
        };
        let a = MdAllocator::new(&config, faults());
        let slots: Vec<_> = (0..4).map(|_| a.alloc(1).unwrap()).collect();
        for s in slots {
            a.free(s);
        }
        let stats = a.stats();
        assert_eq!(stats.cached, 2);
        assert_eq!(stats.small_frees, 4);
    }

    #[test]
    fn test_injected_alloc_failure() {
        let fi = faults();
        let a = MdAllocator::new(&MdConfig::default(), fi);
        fi.set_loc(u64::from(FAIL_MD_ALLOC) | fail_inject::loc::ONCE);
        assert_eq!(a.alloc(3).unwrap_err(), MdError::OutOfMemory { niov: 3 });
        let s = a.alloc(3).unwrap();
        a.free(s);
        assert_eq!(a.stats().live(), 0);
        assert_eq!(a.stats().large_allocs, 1);
    }

    #[test]
    fn test_stats_during_concurrent_churn() {
        let a = allocator();
        let done = AtomicBool::new(false);
        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|t| {
                    let a = &a;
                    scope.spawn(move || {
                        for i in 0..2000 {
                            let s = a.alloc(if (i + t) % 3 == 0 { 5 } else { 1 }).unwrap();
                            a.free(s);
                        }
                    })
                })
                .collect();
            let reader = scope.spawn(|| {
                let mut reads = 0u64;
                loop {
                    let stats = a.stats();
                    let allocs = stats.small_allocs + stats.large_allocs;
                    assert!(stats.small_frees + stats.large_frees <= allocs);
                    assert_eq!(stats.live(), allocs - stats.small_frees - stats.large_frees);
                    reads += 1;
                    if done.load(Ordering::Acquire) {
                        return reads;
                    }
                }
            });
            for w in workers {
                w.join().unwrap();
            }
            done.store(true, Ordering::Release);
            assert!(reader.join().unwrap() > 0);
        });

        let stats = a.stats();
        assert_eq!(stats.small_allocs + stats.large_allocs, 8000);
        assert_eq!(stats.live(), 0);
    }
}
