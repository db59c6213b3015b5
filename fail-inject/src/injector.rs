//! Failpoint evaluation
//!
//! A [`FailInjector`] owns one `fail_loc` word plus its value, error code
//! and hit counter. Call sites ask it whether to take their failure branch.
//! Evaluation is wait-free apart from the timed variant, which sleeps.

use crate::loc::{FailLoc, SetMode, FAILED, FAILED_BIT, ONCE, ONCE_BIT, RAND, SKIP, SOME, VAL_ANY};
use log::info;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Sleep granularity of [`FailInjector::timeout_set`].
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Fault-injection state: one fail location and its evaluation mode.
pub struct FailInjector {
    loc: AtomicU64,
    val: AtomicU32,
    err: AtomicI32,
    count: AtomicU32,
    pub(crate) race_state: Mutex<i32>,
    pub(crate) race_waitq: Condvar,
    tick: Duration,
}

impl Default for FailInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl FailInjector {
    /// Disabled injector (`fail_loc == 0`).
    pub const fn new() -> Self {
        Self::with_tick(DEFAULT_TICK)
    }

    /// Disabled injector whose timed sleeps poll `fail_loc` every `tick`.
    pub const fn with_tick(tick: Duration) -> Self {
        Self {
            loc: AtomicU64::new(0),
            val: AtomicU32::new(0),
            err: AtomicI32::new(0),
            count: AtomicU32::new(0),
            race_state: parking_lot::const_mutex(0),
            race_waitq: Condvar::new(),
            tick,
        }
    }

    pub fn loc(&self) -> FailLoc {
        FailLoc(self.loc.load(Ordering::SeqCst))
    }

    /// Replace `fail_loc`. A change wakes every racer parked in
    /// [`FailInjector::race`] so clearing the word releases them.
    pub fn set_loc(&self, loc: u64) {
        let old = self.loc.swap(loc, Ordering::SeqCst);
        if old != loc {
            let mut state = self.race_state.lock();
            *state = 1;
            self.race_waitq.notify_all();
        }
    }

    pub fn val(&self) -> u32 {
        self.val.load(Ordering::SeqCst)
    }

    pub fn set_val(&self, val: u32) {
        self.val.store(val, Ordering::SeqCst);
    }

    pub fn err(&self) -> i32 {
        self.err.load(Ordering::SeqCst)
    }

    pub fn set_err(&self, err: i32) {
        self.err.store(err, Ordering::SeqCst);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Disarm everything and zero the hit counter.
    pub fn clear(&self) {
        self.set_loc(0);
        self.val.store(0, Ordering::SeqCst);
        self.err.store(0, Ordering::SeqCst);
        self.count.store(0, Ordering::SeqCst);
    }

    /// Cheap test run before full evaluation: is `id` armed at all?
    #[inline]
    pub fn precheck(&self, id: u32) -> bool {
        self.loc().matches(id)
    }

    /// True when the caller should take the failure branch for `id`.
    pub fn check(&self, id: u32) -> bool {
        self.check_set(id, 0, SetMode::NoSet)
    }

    /// Fire only when `fail_val` is `value` or the wildcard.
    pub fn check_value(&self, id: u32, value: u32) -> bool {
        self.check_set(id, value, SetMode::Value)
    }

    pub fn check_orset(&self, id: u32, value: u64) -> bool {
        self.check_set_loc(id, value, SetMode::OrSet)
    }

    pub fn check_reset(&self, id: u32, value: u64) -> bool {
        self.check_set_loc(id, value, SetMode::Reset)
    }

    /// Error code to inject at `id`: `fail_err` when set, else `default`.
    pub fn check_err(&self, id: u32, default: i32) -> Option<i32> {
        if !self.check(id) {
            return None;
        }
        match self.err() {
            0 => Some(default),
            err => Some(err),
        }
    }

    /// Evaluate failpoint `id`; `value` is compared with `fail_val` in
    /// [`SetMode::Value`] and applied to `fail_loc` otherwise.
    pub fn check_set(&self, id: u32, value: u32, mode: SetMode) -> bool {
        self.check_set_loc(id, u64::from(value), mode)
    }

    fn check_set_loc(&self, id: u32, value: u64, mode: SetMode) -> bool {
        if !self.precheck(id) {
            return false;
        }
        let fired = self.evaluate(id, value, mode);
        if fired {
            info!("*** fail_loc={}, val={} ***", self.loc(), self.val());
        }
        fired
    }

    fn evaluate(&self, id: u32, value: u64, mode: SetMode) -> bool {
        assert!(u64::from(id) & ONCE == 0, "fail id {:#x} carries ONCE", id);

        if self.loc().has(FAILED | ONCE) {
            self.count.store(0, Ordering::SeqCst);
            return false;
        }

        let val = self.val();

        if self.loc().has(RAND) && (val < 2 || rand::thread_rng().gen_range(0..val) > 0) {
            return false;
        }

        if self.loc().has(SKIP) && self.count.fetch_add(1, Ordering::SeqCst) + 1 <= val {
            return false;
        }

        if mode == SetMode::Value && val != VAL_ANY && u64::from(val) != value {
            return false;
        }

        let loc = self.loc();
        if loc.has(SOME) && (!loc.has(ONCE) || val <= 1) {
            let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= val {
                self.set_bit(ONCE_BIT);
                self.count.store(0, Ordering::SeqCst);
                // lost the race to reach fail_val
                if count > val {
                    return false;
                }
            }
        }

        if mode == SetMode::OrSet && value & ONCE != 0 {
            self.set_bit(ONCE_BIT);
        }

        if self.test_and_set_bit(FAILED_BIT) && self.loc().has(ONCE) {
            return false;
        }

        match mode {
            SetMode::NoSet | SetMode::Value => {}
            SetMode::OrSet => {
                self.loc.fetch_or(value & !(FAILED | ONCE), Ordering::SeqCst);
            }
            SetMode::Reset => {
                self.loc.store(value, Ordering::SeqCst);
                self.count.store(0, Ordering::SeqCst);
            }
        }

        true
    }

    /// [`FailInjector::check_set`], then sleep `ms` milliseconds when it
    /// fired. The sleep ends early once `fail_loc` is cleared.
    pub fn timeout_set(&self, id: u32, value: u32, ms: u64, mode: SetMode) -> bool {
        let till = Instant::now() + Duration::from_millis(ms);
        let fired = self.check_set(id, value, mode);
        if fired && ms > 0 {
            info!("fail_timeout id {:#x} sleeping for {}ms", id, ms);
            loop {
                let now = Instant::now();
                if now >= till {
                    break;
                }
                thread::sleep(self.tick.min(till - now));
                if !self.loc().is_active() {
                    info!("fail_timeout id {:#x} interrupted", id);
                    break;
                }
            }
            if self.loc().is_active() {
                info!("fail_timeout id {:#x} awake", id);
            }
        }
        fired
    }

    pub fn timeout(&self, id: u32, ms: u64) -> bool {
        self.timeout_set(id, 0, ms, SetMode::NoSet)
    }

    fn set_bit(&self, bit: u32) {
        self.loc.fetch_or(1 << bit, Ordering::SeqCst);
    }

    fn test_and_set_bit(&self, bit: u32) -> bool {
        let mask = 1u64 << bit;
        self.loc.fetch_or(mask, Ordering::SeqCst) & mask != 0
    }
}
