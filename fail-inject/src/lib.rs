//! Fault injection for the MD layer and its consumers
//!
//! A process-wide fail location (`fail_loc`) names one failpoint and how it
//! is evaluated:
//! - plain: fail every time the call site is reached
//! - `ONCE`: fail the first time only, across all threads
//! - `RAND`: fail with probability `1 / fail_val`
//! - `SKIP`: pass the first `fail_val` hits, then fail
//! - `SOME`: fail `fail_val` times
//!
//! Call sites use the free functions below, which consult [`global()`].
//! Components that need isolated state (tests, embedded layers) hold their
//! own [`FailInjector`].

mod control;
mod injector;
pub mod loc;
mod race;

pub use control::{FailError, FailParams};
pub use injector::{FailInjector, DEFAULT_TICK};
pub use loc::{FailLoc, SetMode};

static GLOBAL: FailInjector = FailInjector::new();

/// The process-wide injector. Zero (disabled) until someone writes it.
pub fn global() -> &'static FailInjector {
    &GLOBAL
}

/// Evaluate failpoint `id` against the process-wide state.
pub fn fail_check(id: u32, value: u32, mode: SetMode) -> bool {
    GLOBAL.check_set(id, value, mode)
}

/// [`fail_check`] that sleeps `ms` milliseconds when it fires.
pub fn fail_timeout(id: u32, value: u32, ms: u64, mode: SetMode) -> bool {
    GLOBAL.timeout_set(id, value, ms, mode)
}

pub fn fail_race(id: u32) {
    GLOBAL.race(id)
}

pub fn set_param(name: &str, value: &str) -> Result<(), FailError> {
    GLOBAL.set_param(name, value)
}

pub fn get_param(name: &str) -> Result<String, FailError> {
    GLOBAL.get_param(name)
}
