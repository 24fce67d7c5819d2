//! A fixed-capacity concurrent open-addressing hash.
//!
//! Entries are single `AtomicU64` slots holding `(value << key_bits) | key`;
//! the all-ones pattern marks an empty slot, so keys must stay below
//! `2^key_bits - 1` and values below `2^(64 - key_bits)`. The key width is
//! picked once at construction from the key-space size (32, 36 or 40 bits)
//! and the per-frame kernels read it once, so the hot probe loops stay
//! branch-free on the layout.
//!
//! `insert` is a CAS loop and linearizable per key. `delete` simply empties
//! the slot, which can break probe chains for other keys; it is only legal
//! while draining, and the engine drains the hash completely at the end of
//! every frame.
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Error, Result};

const EMPTY: u64 = u64::MAX;
const MIN_CAPACITY: usize = 128;

/// Supported key widths of the packed hash entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyBits {
    K32,
    K36,
    K40,
}

impl KeyBits {
    /// Smallest supported width whose key space holds `num_keys` keys (the
    /// all-ones pattern is reserved for empty slots).
    pub(crate) fn pick(num_keys: u64) -> Result<Self> {
        for kb in [KeyBits::K32, KeyBits::K36, KeyBits::K40] {
            if num_keys < (1u64 << kb.bits()) - 1 {
                return Ok(kb);
            }
        }
        Err(Error::CapacityExceeded {
            what: "hash keys",
            count: num_keys,
            limit: (1 << 40) - 1,
        }
        .bt())
    }

    pub(crate) fn bits(self) -> u32 {
        match self {
            KeyBits::K32 => 32,
            KeyBits::K36 => 36,
            KeyBits::K40 => 40,
        }
    }
}

pub(crate) struct StateHash {
    slots: Vec<AtomicU64>,
    key_bits: u32,
    key_mask: u64,
    bucket_mask: usize,
}

impl StateHash {
    pub(crate) fn new(min_capacity: usize, key_bits: KeyBits) -> Self {
        let capacity = min_capacity.max(MIN_CAPACITY).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || AtomicU64::new(EMPTY));
        let key_bits = key_bits.bits();
        Self {
            slots,
            key_bits,
            key_mask: (1u64 << key_bits) - 1,
            bucket_mask: capacity - 1,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Largest representable value, exclusive.
    pub(crate) fn value_limit(&self) -> u64 {
        1u64 << (64 - self.key_bits)
    }

    /// Reallocates with at least `min_capacity` slots. Only legal while the
    /// hash is empty; the engine resizes between frames.
    pub(crate) fn resize(&mut self, min_capacity: usize) {
        debug_assert!(self.slots.iter().all(|s| s.load(Ordering::Relaxed) == EMPTY));
        let capacity = min_capacity.max(MIN_CAPACITY).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || AtomicU64::new(EMPTY));
        self.slots = slots;
        self.bucket_mask = capacity - 1;
    }

    #[inline]
    fn bucket(&self, key: u64) -> usize {
        // Fibonacci hashing spreads the packed sequential keys.
        (key.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 32) as usize & self.bucket_mask
    }

    /// Inserts `key -> value`; returns true when the key was newly inserted,
    /// false when it was already present (the stored value is left as is).
    pub(crate) fn insert(&self, key: u64, value: u64) -> bool {
        debug_assert!(key < self.key_mask);
        debug_assert!(value < self.value_limit());
        let entry = (value << self.key_bits) | key;
        let mut i = self.bucket(key);
        // A lost CAS race re-examines the same slot once, so allow two
        // iterations per slot before declaring the table over-full.
        for _ in 0..=2 * self.slots.len() {
            let cur = self.slots[i].load(Ordering::Acquire);
            if cur == EMPTY {
                match self.slots[i].compare_exchange(
                    EMPTY,
                    entry,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return true,
                    Err(actual) => {
                        if actual & self.key_mask == key {
                            return false;
                        }
                        // Someone else claimed the slot; try the next one.
                    }
                }
            } else if cur & self.key_mask == key {
                return false;
            } else {
                i = (i + 1) & self.bucket_mask;
            }
        }
        unreachable!("state hash is sized to hold one entry per candidate arc")
    }

    pub(crate) fn find(&self, key: u64) -> Option<u64> {
        let mut i = self.bucket(key);
        for _ in 0..=self.slots.len() {
            let cur = self.slots[i].load(Ordering::Acquire);
            if cur == EMPTY {
                return None;
            }
            if cur & self.key_mask == key {
                return Some(cur >> self.key_bits);
            }
            i = (i + 1) & self.bucket_mask;
        }
        None
    }

    /// Overwrites the value stored for an existing key. Each key has a single
    /// writer per frame, so a plain store suffices. Returns false on a miss.
    pub(crate) fn replace_value(&self, key: u64, value: u64) -> bool {
        debug_assert!(value < self.value_limit());
        let mut i = self.bucket(key);
        for _ in 0..=self.slots.len() {
            let cur = self.slots[i].load(Ordering::Acquire);
            if cur == EMPTY {
                return false;
            }
            if cur & self.key_mask == key {
                self.slots[i].store((value << self.key_bits) | key, Ordering::Release);
                return true;
            }
            i = (i + 1) & self.bucket_mask;
        }
        false
    }

    /// Removes `key`. Only legal while draining the whole table.
    pub(crate) fn delete(&self, key: u64) {
        let mut i = self.bucket(key);
        for _ in 0..=self.slots.len() {
            let cur = self.slots[i].load(Ordering::Acquire);
            if cur == EMPTY {
                return;
            }
            if cur & self.key_mask == key {
                self.slots[i].store(EMPTY, Ordering::Release);
                return;
            }
            i = (i + 1) & self.bucket_mask;
        }
    }

    /// Number of live entries; the engine asserts this is zero between
    /// frames.
    pub(crate) fn num_entries(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) != EMPTY)
            .count()
    }
}
