//! Per-slot word encoding.
//!
//! The source design elides common bits across stored values and reuses
//! the freed high bits for flags (`mig_bit`/`src_bit`/`del_bit`/
//! `ephem_bit`/`hazard_bit`/`perfect_bit`), since it targets a language
//! with no tagged unions. Per design note 9 ("pointer tagging for in-slot
//! metadata"), the memory-safe rendition here is the tagged union it
//! recommends: a plain `u64` with seven flag bits low (six real flags plus
//! a `PRESENT` bit that keeps a live value's word from ever colliding with
//! the all-zero `Empty` encoding), payload bits high. The
//! `common_mask`/`common_bits` invariant on stored values is still computed
//! and enforced at the table level (`table.rs`); slots just don't need to
//! physically elide the shared bits to satisfy it.

use core::sync::atomic::{AtomicU64, Ordering};

const TAG_BITS: u32 = 7;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

const MIG: u64 = 1 << 0;
const SRC: u64 = 1 << 1;
const DEL: u64 = 1 << 2;
const EPHEM: u64 = 1 << 3;
const HAZARD: u64 = 1 << 4;
const PERFECT: u64 = 1 << 5;
/// Always set on a live `Value` word. Without it, a payload of `0` with
/// every other flag clear would encode as the all-zero word, indistinguishable
/// from `Empty` — this bit guarantees a `Value` word is never `0`.
const PRESENT: u64 = 1 << 6;

/// A decoded view of a slot word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotView {
    Empty,
    /// Plain or latent tombstone. `src` means the slot is also a
    /// migration source whose latent delete the migrator must resolve.
    Tombstone { src: bool },
    Value { payload: u64, perfect: bool, ephem: bool, hazard: bool, src: bool, del: bool },
    /// `mig_bit` set: readers must follow this to `dst_gen_offset`/`probe_addr`.
    MigPointer { dst_gen_offset: u16, probe_addr: u64 },
}

/// Target-generation offset occupies the low 10 bits of the payload when
/// `mig_bit` is set; offset 0 is reserved for post-migration tombstones.
const GEN_OFFSET_BITS: u32 = 10;
const GEN_OFFSET_MASK: u64 = (1 << GEN_OFFSET_BITS) - 1;

pub fn encode_empty() -> u64 {
    0
}

pub fn encode_tombstone(src: bool) -> u64 {
    DEL | if src { SRC } else { 0 }
}

pub fn encode_value(payload: u64, perfect: bool, ephem: bool, hazard: bool) -> u64 {
    debug_assert_eq!(payload & TAG_MASK, 0, "payload must not overlap tag bits");
    payload
        | PRESENT
        | if perfect { PERFECT } else { 0 }
        | if ephem { EPHEM } else { 0 }
        | if hazard { HAZARD } else { 0 }
}

pub fn encode_mig_pointer(dst_gen_offset: u16, probe_addr: u64) -> u64 {
    debug_assert!(dst_gen_offset as u64 <= GEN_OFFSET_MASK);
    let payload = ((dst_gen_offset as u64) | (probe_addr << GEN_OFFSET_BITS)) << TAG_BITS;
    payload | MIG
}

pub fn decode(word: u64) -> SlotView {
    if word == 0 {
        return SlotView::Empty;
    }
    if word & MIG != 0 {
        let payload = word >> TAG_BITS;
        let dst_gen_offset = (payload & GEN_OFFSET_MASK) as u16;
        let probe_addr = payload >> GEN_OFFSET_BITS;
        return SlotView::MigPointer { dst_gen_offset, probe_addr };
    }
    if word & DEL != 0 && (word & !(DEL | SRC)) == 0 {
        return SlotView::Tombstone { src: word & SRC != 0 };
    }
    SlotView::Value {
        payload: word & !TAG_MASK,
        perfect: word & PERFECT != 0,
        ephem: word & EPHEM != 0,
        hazard: word & HAZARD != 0,
        src: word & SRC != 0,
        del: word & DEL != 0,
    }
}

pub fn with_src(word: u64) -> u64 {
    word | SRC
}

pub fn with_del(word: u64) -> u64 {
    word | DEL
}

pub fn clear_ephem_set_hazard(word: u64) -> u64 {
    (word & !EPHEM) | HAZARD
}

pub fn clear_hazard(word: u64) -> u64 {
    word & !HAZARD
}

/// An atomic slot in a table's flat array.
pub struct Slot(AtomicU64);

impl Slot {
    pub const fn empty() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> u64 {
        self.0.load(order)
    }

    #[inline]
    pub fn compare_exchange(&self, current: u64, new: u64, success: Ordering, failure: Ordering) -> Result<u64, u64> {
        self.0.compare_exchange(current, new, success, failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trips() {
        let payload = 0xABCD_0000_u64 << TAG_BITS >> TAG_BITS << TAG_BITS; // aligned sample
        let w = encode_value(payload, true, false, false);
        match decode(w) {
            SlotView::Value { payload: p, perfect, ephem, hazard, .. } => {
                assert_eq!(p, payload);
                assert!(perfect);
                assert!(!ephem);
                assert!(!hazard);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn mig_pointer_round_trips() {
        for offset in [1u16, 5, 1000] {
            for probe in [0u64, 1, 12345] {
                let w = encode_mig_pointer(offset, probe);
                match decode(w) {
                    SlotView::MigPointer { dst_gen_offset, probe_addr } => {
                        assert_eq!(dst_gen_offset, offset);
                        assert_eq!(probe_addr, probe);
                    }
                    other => panic!("unexpected decode: {other:?}"),
                }
            }
        }
    }

    #[test]
    fn tombstone_round_trips() {
        assert_eq!(decode(encode_tombstone(false)), SlotView::Tombstone { src: false });
        assert_eq!(decode(encode_tombstone(true)), SlotView::Tombstone { src: true });
    }

    #[test]
    fn empty_is_zero() {
        assert_eq!(decode(0), SlotView::Empty);
    }
}
