//! Race points
//!
//! Two code paths rendezvous through `race_state`: one parks until the
//! state reaches a target, the other writes the state and wakes everyone.
//! Tests use this to hold one path at a chosen point until another path
//! reaches its own.

use crate::injector::FailInjector;
use crate::loc::SetMode;
use log::info;

impl FailInjector {
    /// Two-sided race point on `id`. The caller for which the failpoint
    /// fires parks; any later caller at an armed `id` wakes it. Arm with
    /// `ONCE` so exactly one side parks.
    pub fn race(&self, id: u32) {
        if !self.precheck(id) {
            return;
        }
        let mut state = self.race_state.lock();
        if self.check_set(id, 0, SetMode::NoSet) {
            *state = 0;
            info!("fail_race id {:#x} sleeping", id);
            while *state == 0 {
                self.race_waitq.wait(&mut state);
            }
            info!("fail_race id {:#x} awake", id);
        } else {
            info!("fail_race id {:#x} waking", id);
            *state = 1;
            self.race_waitq.notify_all();
        }
    }

    /// Park until [`FailInjector::race_wakeup`] runs, if `id` fires.
    pub fn race_wait(&self, id: u32) {
        if !self.precheck(id) {
            return;
        }
        let mut state = self.race_state.lock();
        if self.check_set(id, 0, SetMode::NoSet) {
            *state = 0;
            info!("fail_race id {:#x} waiting", id);
            while *state == 0 {
                self.race_waitq.wait(&mut state);
            }
        }
    }

    /// Release a [`FailInjector::race_wait`] parked on `id`.
    pub fn race_wakeup(&self, id: u32) {
        if self.precheck(id) {
            info!("fail_race id {:#x} waking", id);
            self.race_set(1);
        }
    }

    pub fn race_state(&self) -> i32 {
        *self.race_state.lock()
    }

    /// Publish `state` and wake every waiter.
    pub fn race_set(&self, state: i32) {
        let mut guard = self.race_state.lock();
        *guard = state;
        self.race_waitq.notify_all();
    }

    /// Park until `race_state == target`.
    pub fn race_wait_for(&self, target: i32) {
        let mut state = self.race_state.lock();
        while *state != target {
            self.race_waitq.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::loc::{FAILED, ONCE};
    use crate::FailInjector;
    use crossbeam_channel::bounded;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const ID: u32 = 0x0e10;

    #[test]
    fn test_race_parks_first_caller_until_second() {
        let fi = Arc::new(FailInjector::new());
        fi.set_loc(u64::from(ID) | ONCE);

        let (tx, rx) = bounded(1);
        let first = {
            let fi = Arc::clone(&fi);
            thread::spawn(move || {
                fi.race(ID);
                tx.send(()).unwrap();
            })
        };

        while !fi.loc().has(FAILED) {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        fi.race(ID);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        first.join().unwrap();
    }

    #[test]
    fn test_clearing_loc_releases_racer() {
        let fi = Arc::new(FailInjector::new());
        fi.set_loc(u64::from(ID) | ONCE);
        let first = {
            let fi = Arc::clone(&fi);
            thread::spawn(move || fi.race(ID))
        };
        while !fi.loc().has(FAILED) {
            thread::sleep(Duration::from_millis(1));
        }
        fi.set_loc(0);
        first.join().unwrap();
    }

    #[test]
    fn test_race_wait_and_wakeup() {
        let fi = Arc::new(FailInjector::new());
        fi.set_loc(u64::from(ID) | ONCE);
        let waiter = {
            let fi = Arc::clone(&fi);
            thread::spawn(move || fi.race_wait(ID))
        };
        while !fi.loc().has(FAILED) {
            thread::sleep(Duration::from_millis(1));
        }
        fi.race_wakeup(ID);
        waiter.join().unwrap();
        assert_eq!(fi.race_state(), 1);
    }

    #[test]
    fn test_race_wait_for_target_state() {
        let fi = Arc::new(FailInjector::new());
        let waiter = {
            let fi = Arc::clone(&fi);
            thread::spawn(move || fi.race_wait_for(3))
        };
        fi.race_set(2);
        thread::sleep(Duration::from_millis(10));
        assert!(!waiter.is_finished());
        fi.race_set(3);
        waiter.join().unwrap();
    }

    #[test]
    fn test_unarmed_race_is_noop() {
        let fi = FailInjector::new();
        fi.race(ID);
        fi.race_wait(ID);
        fi.race_wakeup(ID);
        assert_eq!(fi.race_state(), 0);
    }
}
