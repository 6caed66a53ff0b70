//! A single hash-table generation: fixed-size flat slot array plus
//! migration bookkeeping. Immutable after publish except for the
//! designated atomic fields (`pc`'s counters/cursors, `halt_gen_id`, and
//! the slot words themselves).

use alloc::boxed::Box;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::slot::{self, Slot, SlotView};
use crate::config::LFHT_MIN_TABLE_SIZE_LOG2;
use crate::pc::PerCpu;

pub(crate) struct ElemsDeleted {
    pub elems: AtomicI64,
    pub deleted: AtomicI64,
}

impl ElemsDeleted {
    fn new() -> Self {
        Self { elems: AtomicI64::new(0), deleted: AtomicI64::new(0) }
    }
}

pub(crate) struct MigCursor {
    /// Monotonically decreasing; claimed via CAS by migrators.
    pub mig_next: AtomicI64,
    /// Count of slots left to migrate in this shard's chunk.
    pub mig_left: AtomicI64,
    /// Lower bound of this shard's chunk (exclusive).
    pub mig_last: i64,
}

impl MigCursor {
    fn new() -> Self {
        Self { mig_next: AtomicI64::new(0), mig_left: AtomicI64::new(0), mig_last: 0 }
    }
}

pub(crate) struct Table {
    pub gen_id: u64,
    pub size_log2: u32,
    pub common_mask: u64,
    pub common_bits: u64,
    pub slots: Box<[Slot]>,
    pub counts: PerCpu<ElemsDeleted>,
    pub mig: PerCpu<MigCursor>,
    /// Monotonically increasing; migration out of this table is paused
    /// once it reaches or exceeds the current main table's `gen_id`.
    pub halt_gen_id: AtomicU64,
    pub max: usize,
    pub max_with_deleted: usize,
    pub max_probe: usize,
}

fn thresholds(size: usize) -> (usize, usize, usize) {
    // Load factor thresholds and probe bound, proportioned the way the
    // source design sizes them off size_log2 (roughly 80%/90% and a
    // logarithmic probe bound).
    let max = (size * 4) / 5;
    let max_with_deleted = (size * 9) / 10;
    let max_probe = (usize::BITS - size.leading_zeros()) as usize * 2 + 4;
    (max, max_with_deleted, max_probe)
}

impl Table {
    pub fn new(gen_id: u64, size_log2: u32, common_mask: u64, common_bits: u64) -> Self {
        let size_log2 = size_log2.max(LFHT_MIN_TABLE_SIZE_LOG2);
        let size = 1usize << size_log2;
        let slots = (0..size).map(|_| Slot::empty()).collect::<alloc::vec::Vec<_>>().into_boxed_slice();
        let (max, max_with_deleted, max_probe) = thresholds(size);
        Self {
            gen_id,
            size_log2,
            common_mask,
            common_bits,
            slots,
            counts: PerCpu::new(ElemsDeleted::new),
            mig: PerCpu::new(MigCursor::new),
            halt_gen_id: AtomicU64::new(0),
            max,
            max_with_deleted,
            max_probe,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn index_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.size() - 1)
    }

    pub fn total_elems(&self) -> i64 {
        (0..self.counts.n_buckets()).map(|i| self.counts.get(i).elems.load(Ordering::Relaxed)).sum()
    }

    pub fn total_deleted(&self) -> i64 {
        (0..self.counts.n_buckets()).map(|i| self.counts.get(i).deleted.load(Ordering::Relaxed)).sum()
    }

    pub fn total_mig_left(&self) -> i64 {
        (0..self.mig.n_buckets()).map(|i| self.mig.get(i).mig_left.load(Ordering::Relaxed)).sum()
    }

    /// Outcome of a single open-addressed insertion attempt.
    pub fn inner_add(&self, hash: u64, payload: u64, hash_extra_bits: bool, is_migrator: bool) -> InnerAddOutcome {
        let start = self.index_of(hash);
        let mut perfect_hint = true;
        for step in 0..self.max_probe.min(self.size()) {
            let idx = (start + step) & (self.size() - 1);
            let slot = &self.slots[idx];
            loop {
                let word = slot.load(Ordering::Acquire);
                match slot::decode(word) {
                    SlotView::Value { .. } => {
                        perfect_hint = false;
                        break;
                    }
                    SlotView::MigPointer { .. } => {
                        return InnerAddOutcome::BecomeSecondary;
                    }
                    SlotView::Empty | SlotView::Tombstone { src: false } => {
                        let was_tombstone = matches!(slot::decode(word), SlotView::Tombstone { .. });
                        let new_word = slot::encode_value(
                            payload,
                            perfect_hint && hash_extra_bits,
                            is_migrator,
                            false,
                        );
                        match slot.compare_exchange(word, new_word, Ordering::AcqRel, Ordering::Acquire) {
                            Ok(_) => {
                                if was_tombstone {
                                    self.counts.my().deleted.fetch_sub(1, Ordering::Relaxed);
                                }
                                return InnerAddOutcome::Ok { index: idx };
                            }
                            Err(_) => continue, // re-examine same slot
                        }
                    }
                    SlotView::Tombstone { src: true } => {
                        // Latent-delete source mid-migration: don't touch.
                        perfect_hint = false;
                        break;
                    }
                }
            }
        }
        InnerAddOutcome::NoSpace
    }

    /// Like `inner_add`, but for a value that was deleted in the source
    /// table before migration could move it. Claims the next open slot on
    /// `hash`'s probe chain and writes a plain tombstone instead of a live
    /// value, so the deleted key doesn't reappear in the destination.
    pub fn inner_add_tombstone(&self, hash: u64) -> InnerAddOutcome {
        let start = self.index_of(hash);
        for step in 0..self.max_probe.min(self.size()) {
            let idx = (start + step) & (self.size() - 1);
            let slot = &self.slots[idx];
            loop {
                let word = slot.load(Ordering::Acquire);
                match slot::decode(word) {
                    SlotView::Value { .. } => break,
                    SlotView::MigPointer { .. } => return InnerAddOutcome::BecomeSecondary,
                    SlotView::Tombstone { .. } => return InnerAddOutcome::Ok { index: idx },
                    SlotView::Empty => {
                        let new_word = slot::encode_tombstone(false);
                        match slot.compare_exchange(word, new_word, Ordering::AcqRel, Ordering::Acquire) {
                            Ok(_) => {
                                self.counts.my().deleted.fetch_add(1, Ordering::Relaxed);
                                return InnerAddOutcome::Ok { index: idx };
                            }
                            Err(_) => continue,
                        }
                    }
                }
            }
        }
        InnerAddOutcome::NoSpace
    }

    /// Look up a slot matching `matches(payload)` scanning from `hash`'s
    /// home slot up to `max_probe` slots. Returns the first hit.
    pub fn lookup_from(&self, hash: u64, mut matches: impl FnMut(u64) -> bool) -> Option<u64> {
        let start = self.index_of(hash);
        for step in 0..self.max_probe.min(self.size()) {
            let idx = (start + step) & (self.size() - 1);
            let word = self.slots[idx].load(Ordering::Acquire);
            match slot::decode(word) {
                SlotView::Value { payload, del: false, .. } => {
                    if matches(payload) {
                        return Some(payload);
                    }
                }
                SlotView::Empty => return None,
                SlotView::Value { del: true, .. } | SlotView::Tombstone { .. } | SlotView::MigPointer { .. } => {}
            }
        }
        None
    }
}

pub(crate) enum InnerAddOutcome {
    Ok { index: usize },
    BecomeSecondary,
    NoSpace,
}
