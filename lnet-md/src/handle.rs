//! Handle cookies and the per-partition MD container
//!
//! A cookie packs the owning partition, a slot index and the slot's
//! generation:
//!
//! ```text
//!  63            32 31            8 7      0
//! ┌────────────────┬───────────────┬────────┐
//! │   generation   │     slot      │  cpt   │
//! └────────────────┴───────────────┴────────┘
//! ```
//!
//! The generation moves on when a slot is released, so a stale cookie
//! never resolves to the slot's next occupant.

use crate::md::Libmd;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const CPT_BITS: u32 = 8;
const SLOT_BITS: u32 = 24;
const SLOT_SHIFT: u32 = CPT_BITS;
const GEN_SHIFT: u32 = CPT_BITS + SLOT_BITS;

/// Most slots a single partition can hold.
pub const MAX_SLOTS: usize = 1 << SLOT_BITS;

/// Opaque 64-bit MD handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MdHandle(u64);

impl MdHandle {
    /// Never resolves to an MD.
    pub const INVALID: Self = Self(u64::MAX);

    fn new(cpt: usize, slot: u32, generation: u32) -> Self {
        Self((u64::from(generation) << GEN_SHIFT) | (u64::from(slot) << SLOT_SHIFT) | cpt as u64)
    }

    pub fn from_raw(cookie: u64) -> Self {
        Self(cookie)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Partition that owns the MD, readable without any lock.
    pub fn cpt(self) -> usize {
        (self.0 & ((1 << CPT_BITS) - 1)) as usize
    }

    fn slot(self) -> usize {
        ((self.0 >> SLOT_SHIFT) & ((1 << SLOT_BITS) - 1)) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> GEN_SHIFT) as u32
    }

    pub fn is_invalid(self) -> bool {
        self == Self::INVALID
    }
}

impl fmt::Debug for MdHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "MdHandle::INVALID")
        } else {
            write!(f, "MdHandle({:#x})", self.0)
        }
    }
}

impl fmt::Display for MdHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

struct Slot {
    generation: u32,
    md: Option<Box<Libmd>>,
}

/// MDs of one partition. Every method expects the partition lock held.
pub(crate) struct Container {
    cpt: usize,
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Live MDs in publication order: sequence number -> slot
    active: BTreeMap<u64, u32>,
    next_seq: u64,
}

impl Container {
    pub(crate) fn new(cpt: usize) -> Self {
        Self {
            cpt,
            slots: Vec::new(),
            free: Vec::new(),
            active: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Give `md` a cookie and link it into the active list. Hands the MD
    /// back when the partition has no slot left.
    pub(crate) fn publish(&mut self, mut md: Box<Libmd>) -> Result<MdHandle, Box<Libmd>> {
        assert!(md.handle.is_invalid(), "md published twice");

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None if self.slots.len() < MAX_SLOTS => {
                self.slots.push(Slot {
                    generation: 1,
                    md: None,
                });
                (self.slots.len() - 1) as u32
            }
            None => return Err(md),
        };

        let entry = &mut self.slots[slot as usize];
        let handle = MdHandle::new(self.cpt, slot, entry.generation);
        md.handle = handle;
        md.key = handle;
        md.seq = self.next_seq;
        self.active.insert(self.next_seq, slot);
        self.next_seq += 1;
        entry.md = Some(md);
        Ok(handle)
    }

    /// Resolve a user handle. Fails for invalidated (zombie) MDs.
    pub(crate) fn lookup(&mut self, handle: MdHandle) -> Option<&mut Libmd> {
        self.get(handle).filter(|md| md.handle == handle)
    }

    /// Resolve an internal reference; still succeeds after invalidation
    /// and until the MD is released.
    pub(crate) fn get(&mut self, key: MdHandle) -> Option<&mut Libmd> {
        if key.is_invalid() || key.cpt() != self.cpt {
            return None;
        }
        let slot = self.slots.get_mut(key.slot())?;
        if slot.generation != key.generation() {
            return None;
        }
        slot.md.as_deref_mut()
    }

    /// Make every later [`Container::lookup`] of this MD fail. The MD
    /// stays on the active list until released.
    pub(crate) fn invalidate(&mut self, key: MdHandle) {
        if let Some(md) = self.get(key) {
            md.handle = MdHandle::INVALID;
        }
    }

    /// Unlink the MD from the container and retire its cookie.
    pub(crate) fn release(&mut self, key: MdHandle) -> Box<Libmd> {
        let slot_idx = key.slot();
        let slot = self
            .slots
            .get_mut(slot_idx)
            .filter(|s| s.generation == key.generation())
            .unwrap_or_else(|| panic!("release of unknown md {}", key));
        let md = slot
            .md
            .take()
            .unwrap_or_else(|| panic!("release of empty slot {}", key));

        slot.generation = match slot.generation.wrapping_add(1) {
            0 | u32::MAX => 1,
            g => g,
        };
        self.free.push(slot_idx as u32);
        let removed = self.active.remove(&md.seq);
        assert_eq!(removed, Some(slot_idx as u32), "active list corrupt at {}", key);
        md
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    /// Live MDs in publication order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Libmd> + '_ {
        self.active
            .values()
            .filter_map(move |&slot| self.slots[slot as usize].md.as_deref())
    }

    pub(crate) fn drain(&mut self) -> Vec<Box<Libmd>> {
        let keys: Vec<MdHandle> = self.iter().map(|md| md.key).collect();
        keys.into_iter().map(|key| self.release(key)).collect()
    }
}
