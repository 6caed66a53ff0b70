//! Background incremental migration: moving live entries out of an older
//! generation into the current main table, piggybacked on `add`.
//!
//! Simplification recorded in `DESIGN.md`: migration here always targets
//! the oldest secondary table and moves entries directly into whichever
//! table is main at the moment — legal because a migration pointer may
//! name any later generation, not only the next-adjacent one. Chained
//! resolution (a destination that is itself migrated out again before the
//! source finishes) is collapsed to "abandon this slot, it will be retried
//! on a later pass" rather than the source's full multi-step chase-and-
//! resolve protocol. A value deleted in `src` before migration reaches it
//! is not abandoned, though: its home slot in `dst` is claimed as a
//! tombstone so the deleted key can't reappear there.

use core::sync::atomic::Ordering;

use super::slot::{self, SlotView};
use super::table::{InnerAddOutcome, Table};

fn increase_to_u64(cell: &core::sync::atomic::AtomicU64, v: u64) {
    let mut cur = cell.load(Ordering::Relaxed);
    while cur < v {
        match cell.compare_exchange_weak(cur, v, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => cur = actual,
        }
    }
}

/// Assign each per-CPU bucket an even chunk of `[0, src.size())` to claim
/// migration work from, counting down.
pub(super) fn init_migration_cursors(src: &Table) {
    let n = src.mig.n_buckets().max(1);
    let size = src.size();
    let chunk = size.div_ceil(n);
    for i in 0..n {
        let lo = (i * chunk).min(size);
        let hi = ((i + 1) * chunk).min(size);
        let bucket = src.mig.get(i);
        bucket.mig_next.store(hi as i64, Ordering::Relaxed);
        bucket.mig_left.store((hi - lo) as i64, Ordering::Relaxed);
        // `mig_last` isn't atomic (set once at cursor setup, before any
        // migrator can observe it — no concurrent writer exists yet).
        unsafe {
            let ptr = bucket as *const _ as *mut super::table::MigCursor;
            (*ptr).mig_last = lo as i64;
        }
    }
}

/// Encode the probe offset of `dst_idx` relative to `hash`'s home slot in
/// `dst`, in the bit layout `decode_probe_addr` expects.
fn encode_probe_addr(dst: &Table, hash: u64, dst_idx: usize) -> u64 {
    let home = dst.index_of(hash);
    ((dst_idx + dst.size() - home) % dst.size()) as u64
}

/// Claim one slot index from `src`'s per-CPU migration cursor, trying the
/// caller's own bucket first, then XOR-walking the rest.
fn claim_slot(src: &Table) -> Option<usize> {
    for bucket in src.mig.xor_walk() {
        let mut next = bucket.mig_next.load(Ordering::Acquire);
        loop {
            if next <= bucket.mig_last {
                break;
            }
            let candidate = next - 1;
            match bucket.mig_next.compare_exchange(
                next,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    bucket.mig_left.fetch_sub(1, Ordering::Relaxed);
                    return Some(candidate as usize);
                }
                Err(actual) => next = actual,
            }
        }
    }
    None
}

/// Migrate one claimed slot from `src` to `dst`. Returns `true` if a slot
/// was claimed and processed (regardless of outcome), `false` if `src` has
/// no more slots to claim anywhere.
pub(super) fn migrate_one(
    src: &Table,
    dst: &Table,
    rehash: &dyn Fn(u64) -> u64,
) -> bool {
    let Some(idx) = claim_slot(src) else { return false };
    let slot = &src.slots[idx];

    loop {
        let word = slot.load(Ordering::Acquire);
        match slot::decode(word) {
            SlotView::Empty => {
                let tomb = slot::encode_tombstone(false);
                if slot.compare_exchange(word, tomb, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                    return true;
                }
            }
            SlotView::Tombstone { .. } | SlotView::MigPointer { .. } => {
                // Already resolved by an earlier pass (e.g. halt/resume).
                return true;
            }
            SlotView::Value { payload, src: already_src, del, .. } => {
                if already_src {
                    return true; // another migrator owns this slot
                }
                let marked = slot::with_src(word);
                if slot.compare_exchange(word, marked, Ordering::AcqRel, Ordering::Acquire).is_err() {
                    continue; // lost race (e.g. concurrent delete); re-examine
                }

                if del {
                    // Deleted in `src` before migration could move it: there
                    // is nothing live to carry over. Claim the same home
                    // slot in `dst` as a tombstone rather than resurrecting
                    // the value there.
                    let new_hash = rehash(super::from_payload(payload));
                    match dst.inner_add_tombstone(new_hash) {
                        InnerAddOutcome::Ok { .. } => {
                            let tomb = slot::encode_tombstone(false);
                            let _ = slot.compare_exchange(marked, tomb, Ordering::AcqRel, Ordering::Acquire);
                        }
                        InnerAddOutcome::BecomeSecondary => {
                            let _ = slot.compare_exchange(marked, word, Ordering::AcqRel, Ordering::Acquire);
                        }
                        InnerAddOutcome::NoSpace => {
                            increase_to_u64(&src.halt_gen_id, dst.gen_id);
                            let _ = slot.compare_exchange(marked, word, Ordering::AcqRel, Ordering::Acquire);
                        }
                    }
                    return true;
                }

                let new_hash = rehash(super::from_payload(payload));
                match dst.inner_add(new_hash, payload, true, true) {
                    InnerAddOutcome::Ok { index: dpos } => {
                        let gen_offset = (dst.gen_id - src.gen_id) as u16;
                        let probe_addr = encode_probe_addr(dst, new_hash, dpos);
                        let mig_word = slot::encode_mig_pointer(gen_offset, probe_addr);
                        let _ = slot.compare_exchange(marked, mig_word, Ordering::AcqRel, Ordering::Acquire);

                        let dslot = &dst.slots[dpos];
                        let dword = dslot.load(Ordering::Acquire);
                        if let SlotView::Value { .. } = slot::decode(dword) {
                            let cleared = slot::clear_ephem_set_hazard(dword);
                            if dslot.compare_exchange(dword, cleared, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                                let final_word = slot::clear_hazard(cleared);
                                let _ = dslot.compare_exchange(
                                    cleared,
                                    final_word,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                );
                            }
                        }

                        src.counts.my().elems.fetch_sub(1, Ordering::Relaxed);
                        dst.counts.my().elems.fetch_add(1, Ordering::Relaxed);
                    }
                    InnerAddOutcome::BecomeSecondary => {
                        let _ = slot.compare_exchange(marked, word, Ordering::AcqRel, Ordering::Acquire);
                    }
                    InnerAddOutcome::NoSpace => {
                        increase_to_u64(&src.halt_gen_id, dst.gen_id);
                        let _ = slot.compare_exchange(marked, word, Ordering::AcqRel, Ordering::Acquire);
                    }
                }
                return true;
            }
        }
    }
}
