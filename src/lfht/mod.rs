//! Lock-free open-addressed hash table (LFHT) with background migration.
//!
//! A stack of table generations (newest on top), each a flat open-addressed
//! slot array. Growth, rehash, and "remask" events push a new generation
//! without blocking readers or writers of the old one; `add` piggybacks a
//! few migration steps onto every call so the old generation drains over
//! time instead of needing a stop-the-world copy.
//!
//! Every public operation runs inside an EPOCH bracket: a table generation
//! or a migrated-out slot is only ever freed once no bracket that could
//! have observed it is still open.
//!
//! Stored values are limited to 57 significant bits — the low 7 are
//! reserved for the slot's tag bits (see `slot.rs`), so callers pass keys
//! that are either naturally narrow or have free low bits (e.g. aligned
//! pointers or dense indices), and `add`/lookups shift in and out of that
//! space transparently.

mod migrate;
mod slot;
mod table;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::epoch::{self, Cookie};
use crate::nbsl::{Nbsl, Node};
use table::{InnerAddOutcome, Table};

const VALUE_SHIFT: u32 = 7;
const VALUE_BITS: u32 = 64 - VALUE_SHIFT;
const VALUE_MASK: u64 = (1u64 << VALUE_BITS) - 1;

#[inline]
fn to_payload(value: u64) -> u64 {
    debug_assert!(value <= VALUE_MASK, "value exceeds LFHT's 57-bit payload width");
    value << VALUE_SHIFT
}

#[inline]
fn from_payload(payload: u64) -> u64 {
    payload >> VALUE_SHIFT
}

struct BracketGuard(Cookie);

impl BracketGuard {
    fn new() -> Self {
        Self(epoch::bracket_enter())
    }
}

impl Drop for BracketGuard {
    fn drop(&mut self) {
        epoch::bracket_leave(self.0);
    }
}

/// Why a new generation was introduced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GenReason {
    /// The table crossed its load-factor ceiling: grow.
    Double,
    /// Too many probe-chain-clogging tombstones: same size, fresh slots.
    Rehash,
    /// A value violated the table's common-bits assumption. Structurally
    /// supported but never triggered while `common_mask` stays `0` (see
    /// the module-level note in `DESIGN.md`).
    #[allow(dead_code)]
    Remask,
}

type RehashFn = dyn Fn(u64) -> u64 + Send + Sync;

/// A lock-free, open-addressed hash table with incremental background
/// migration across growth/rehash events.
pub struct Lfht {
    generations: Nbsl<Table>,
    rehash_fn: Box<RehashFn>,
    first_size_log2: AtomicU32,
}

impl Lfht {
    /// Build an empty table. `rehash_fn` recomputes a value's hash when
    /// it's migrated into a differently-sized generation, since only the
    /// stored value (not the original `hash` argument to `add`) survives
    /// into the slot. Callers should insert with `hash = rehash_fn(value)`
    /// so a value's home bucket is reproducible purely from its value
    /// across every generation it migrates through.
    pub fn new(rehash_fn: impl Fn(u64) -> u64 + Send + Sync + 'static) -> Self {
        Self::with_capacity(rehash_fn, 1usize << crate::config::LFHT_MIN_TABLE_SIZE_LOG2)
    }

    /// Like [`Lfht::new`], but hints an initial capacity for the first
    /// generation (rounded up to the configured minimum).
    pub fn with_capacity(rehash_fn: impl Fn(u64) -> u64 + Send + Sync + 'static, capacity: usize) -> Self {
        let size_log2 = usize::BITS - capacity.max(1).next_power_of_two().leading_zeros() - 1;
        Self {
            generations: Nbsl::new(),
            rehash_fn: Box::new(rehash_fn),
            first_size_log2: AtomicU32::new(size_log2),
        }
    }

    fn oldest_to_newest(&self) -> Vec<*mut Node<Table>> {
        let mut v = Vec::new();
        let mut cur = self.generations.first();
        while let Some(n) = cur {
            v.push(n);
            cur = self.generations.next_after(n);
        }
        v.reverse();
        v
    }

    fn push_generation(&self, old_node: *mut Node<Table>, reason: GenReason, sample: u64) -> bool {
        let old = unsafe { &(*old_node).data };
        let (size_log2, common_mask, common_bits) = match reason {
            GenReason::Double => (old.size_log2 + 1, old.common_mask, old.common_bits),
            GenReason::Rehash => (old.size_log2, old.common_mask, old.common_bits),
            GenReason::Remask => {
                let mask = old.common_mask | (sample ^ old.common_bits);
                (old.size_log2, mask, old.common_bits & mask)
            }
        };
        let table = Table::new(old.gen_id + 1, size_log2, common_mask, common_bits);
        let node = Node::new_boxed(table);
        match self.generations.push(old_node, node) {
            Ok(()) => {
                migrate::init_migration_cursors(old);
                true
            }
            Err(_) => false,
        }
    }

    fn migrate_some(&self, main_node: *mut Node<Table>) {
        let oldest = match self.oldest_to_newest().first().copied() {
            Some(n) if n != main_node => n,
            _ => return,
        };
        let src = unsafe { &(*oldest).data };
        let dst = unsafe { &(*main_node).data };
        if src.halt_gen_id.load(Ordering::Relaxed) >= dst.gen_id {
            return;
        }
        for _ in 0..crate::config::MIGRATE_PACE_DEFAULT {
            if !migrate::migrate_one(src, dst, &*self.rehash_fn) {
                break;
            }
        }
        if src.total_mig_left() <= 0 && src.total_elems() <= src.total_deleted() {
            let _ = self.generations.del(oldest);
            // Safety: once unlinked, no new bracket can reach `oldest`
            // through the generation stack; readers already inside a
            // bracket that observed it keep it alive until their epoch
            // quiesces.
            unsafe { epoch::free_deferred(oldest) };
        }
    }

    /// Insert `value` under `hash`. Always succeeds (growing as needed).
    pub fn add(&self, hash: u64, value: u64) -> bool {
        let _guard = BracketGuard::new();
        let payload = to_payload(value);
        loop {
            let main_node = self.generations.top();
            if main_node.is_null() {
                let size_log2 = self.first_size_log2.load(Ordering::Relaxed);
                let table = Table::new(1, size_log2, 0, 0);
                let _ = self.generations.push(core::ptr::null_mut(), Node::new_boxed(table));
                continue;
            }
            let main = unsafe { &(*main_node).data };

            if (payload & main.common_mask) != main.common_bits {
                self.push_generation(main_node, GenReason::Remask, payload);
                continue;
            }

            main.counts.my().elems.fetch_add(1, Ordering::Relaxed);
            match main.inner_add(hash, payload, true, false) {
                InnerAddOutcome::Ok { .. } => {
                    self.migrate_some(main_node);
                    return true;
                }
                InnerAddOutcome::BecomeSecondary => {
                    main.counts.my().elems.fetch_sub(1, Ordering::Relaxed);
                    continue;
                }
                InnerAddOutcome::NoSpace => {
                    main.counts.my().elems.fetch_sub(1, Ordering::Relaxed);
                    let elems = main.total_elems();
                    let reason = if elems + 1 > main.max as i64 { GenReason::Double } else { GenReason::Rehash };
                    self.push_generation(main_node, reason, payload);
                    continue;
                }
            }
        }
    }

    /// Find the first live value matching `matches(value)`, scanning
    /// generations oldest to newest.
    pub fn get_first(&self, hash: u64, mut matches: impl FnMut(u64) -> bool) -> Option<u64> {
        let _guard = BracketGuard::new();
        for node in self.oldest_to_newest() {
            let table = unsafe { &(*node).data };
            if let Some(p) = table.lookup_from(hash, |payload| matches(from_payload(payload))) {
                return Some(from_payload(p));
            }
        }
        None
    }

    /// Collect every live value matching `matches(value)` under `hash`,
    /// across all generations, oldest to newest.
    pub fn iterate_values(&self, hash: u64, mut matches: impl FnMut(u64) -> bool) -> Vec<u64> {
        let _guard = BracketGuard::new();
        let mut out = Vec::new();
        for node in self.oldest_to_newest() {
            let table = unsafe { &(*node).data };
            let start = table.index_of(hash);
            for step in 0..table.max_probe.min(table.size()) {
                let idx = (start + step) & (table.size() - 1);
                let word = table.slots[idx].load(Ordering::Acquire);
                match slot::decode(word) {
                    slot::SlotView::Value { payload, del: false, .. } => {
                        let v = from_payload(payload);
                        if matches(v) {
                            out.push(v);
                        }
                    }
                    slot::SlotView::Empty => break,
                    slot::SlotView::Value { del: true, .. }
                    | slot::SlotView::Tombstone { .. }
                    | slot::SlotView::MigPointer { .. } => {}
                }
            }
        }
        out
    }

    /// Remove the first live value matching `matches(value)` under `hash`.
    /// Returns the removed value.
    pub fn delete_by_key(&self, hash: u64, mut matches: impl FnMut(u64) -> bool) -> Option<u64> {
        let _guard = BracketGuard::new();
        for node in self.oldest_to_newest() {
            let table = unsafe { &(*node).data };
            let start = table.index_of(hash);
            for step in 0..table.max_probe.min(table.size()) {
                let idx = (start + step) & (table.size() - 1);
                let slot = &table.slots[idx];
                loop {
                    let word = slot.load(Ordering::Acquire);
                    match slot::decode(word) {
                        slot::SlotView::Value { payload, del: false, .. } => {
                            if !matches(from_payload(payload)) {
                                break;
                            }
                            let tomb = slot::with_del(word);
                            match slot.compare_exchange(word, tomb, Ordering::AcqRel, Ordering::Acquire) {
                                Ok(_) => {
                                    table.counts.my().deleted.fetch_add(1, Ordering::Relaxed);
                                    table.counts.my().elems.fetch_sub(1, Ordering::Relaxed);
                                    return Some(from_payload(payload));
                                }
                                Err(_) => continue,
                            }
                        }
                        slot::SlotView::Empty => break,
                        _ => break,
                    }
                }
            }
        }
        None
    }

    /// A stable position produced by [`Lfht::iterate_all`], allowing
    /// [`Lfht::delete_at`] to remove exactly the slot last visited.
    pub fn first_cursor(&self) -> LfhtCursor {
        LfhtCursor { generations: self.oldest_to_newest(), gen_idx: 0, slot_idx: 0, last: None }
    }

    /// Advance `cursor` to the next live value in table-generation then
    /// slot-index order, returning it if found.
    pub fn iterate_all(&self, cursor: &mut LfhtCursor) -> Option<u64> {
        let _guard = BracketGuard::new();
        while cursor.gen_idx < cursor.generations.len() {
            let node = cursor.generations[cursor.gen_idx];
            let table = unsafe { &(*node).data };
            while cursor.slot_idx < table.size() {
                let idx = cursor.slot_idx;
                cursor.slot_idx += 1;
                let word = table.slots[idx].load(Ordering::Acquire);
                if let slot::SlotView::Value { payload, del: false, .. } = slot::decode(word) {
                    cursor.last = Some((node, idx));
                    return Some(from_payload(payload));
                }
            }
            cursor.gen_idx += 1;
            cursor.slot_idx = 0;
        }
        None
    }

    /// Remove the slot `cursor` is currently positioned on (the last value
    /// returned by `iterate_all`). No-op if the cursor hasn't produced a
    /// value yet or that slot was already removed.
    pub fn delete_at(&self, cursor: &mut LfhtCursor) -> bool {
        let _guard = BracketGuard::new();
        let Some((node, idx)) = cursor.last.take() else { return false };
        let table = unsafe { &(*node).data };
        let slot = &table.slots[idx];
        loop {
            let word = slot.load(Ordering::Acquire);
            match slot::decode(word) {
                slot::SlotView::Value { del: false, .. } => {
                    let tomb = slot::with_del(word);
                    match slot.compare_exchange(word, tomb, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(_) => {
                            table.counts.my().deleted.fetch_add(1, Ordering::Relaxed);
                            table.counts.my().elems.fetch_sub(1, Ordering::Relaxed);
                            return true;
                        }
                        Err(_) => continue,
                    }
                }
                _ => return false,
            }
        }
    }

    /// Drop every generation and start fresh. Old generations are freed
    /// through deferred reclamation, not immediately, since readers may
    /// still be mid-bracket against them.
    pub fn clear(&self) {
        let _guard = BracketGuard::new();
        while let Some(node) = self.generations.pop() {
            let raw = Box::into_raw(node);
            unsafe { epoch::free_deferred(raw) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    fn identity_rehash(h: u64) -> u64 {
        h
    }

    #[test]
    fn add_then_get_first() {
        let t = Lfht::new(identity_rehash);
        assert!(t.add(42, 7));
        assert_eq!(t.get_first(42, |v| v == 7), Some(7));
        assert_eq!(t.get_first(42, |v| v == 8), None);
    }

    #[test]
    fn delete_by_key_removes_value() {
        let t = Lfht::new(identity_rehash);
        t.add(1, 100);
        assert_eq!(t.delete_by_key(1, |v| v == 100), Some(100));
        assert_eq!(t.get_first(1, |v| v == 100), None);
        assert_eq!(t.delete_by_key(1, |v| v == 100), None);
    }

    #[test]
    fn grows_across_many_inserts() {
        let t = Lfht::new(identity_rehash);
        for i in 0..2000u64 {
            assert!(t.add(i, i));
        }
        for i in 0..2000u64 {
            assert_eq!(t.get_first(i, |v| v == i), Some(i));
        }
    }

    #[test]
    fn iterate_all_visits_every_inserted_value() {
        let t = Lfht::new(identity_rehash);
        for i in 0..64u64 {
            t.add(i, i);
        }
        let mut cursor = t.first_cursor();
        let mut seen = Vec::new();
        while let Some(v) = t.iterate_all(&mut cursor) {
            seen.push(v);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..64u64).collect::<Vec<_>>());
    }

    #[test]
    fn delete_at_removes_cursor_position() {
        let t = Lfht::new(identity_rehash);
        for i in 0..16u64 {
            t.add(i, i);
        }
        let mut cursor = t.first_cursor();
        let first = t.iterate_all(&mut cursor).unwrap();
        assert!(t.delete_at(&mut cursor));
        assert_eq!(t.get_first(first, |v| v == first), None);
    }

    #[test]
    fn clear_empties_table() {
        let t = Lfht::new(identity_rehash);
        for i in 0..32u64 {
            t.add(i, i);
        }
        t.clear();
        assert_eq!(t.get_first(0, |_| true), None);
    }

    #[test]
    fn concurrent_inserts_are_all_visible() {
        let t = Arc::new(Lfht::new(identity_rehash));
        let threads = 8;
        let per_thread = 500u64;
        let handles: Vec<_> = (0..threads)
            .map(|tid| {
                let t = Arc::clone(&t);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        let v = tid * per_thread + i;
                        t.add(v, v);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for tid in 0..threads {
            for i in 0..per_thread {
                let v = tid * per_thread + i;
                assert_eq!(t.get_first(v, move |x| x == v), Some(v));
            }
        }
    }
}

/// Cursor over every live slot across every generation, used by
/// [`Lfht::iterate_all`] / [`Lfht::delete_at`].
pub struct LfhtCursor {
    generations: Vec<*mut Node<Table>>,
    gen_idx: usize,
    slot_idx: usize,
    last: Option<(*mut Node<Table>, usize)>,
}
