//! mmtel on-disk layout — SSOT for both the producer (writer) and the
//! out-of-band collector (reader).
//!
//! These types define the mmap layout of a telemetry transport file. Any
//! field change here MUST maintain `#[repr(C)]` ABI stability; independent
//! readers decode these bytes without linking this crate.
//!
//! A transport file is a 64-byte file header followed by up to
//! [`MAX_SECTIONS`] sections, each either a ring buffer or a dictionary:
//!
//! ```text
//! offset 0            64
//! ┌──────────────────┬───────────────┬───────────────┬─────┬──────────────┐
//! │ FileHeader       │ section 0     │ section 1     │ ... │ section K-1  │
//! │ epoch, offsets   │ (ring / dict) │ (ring / dict) │     │ (dict last)  │
//! └──────────────────┴───────────────┴───────────────┴─────┴──────────────┘
//! ```
//!
//! All multi-byte integers are little-endian and naturally aligned. The
//! header structs are meaningful only when reinterpreted at an 8-byte
//! aligned offset of a shared mapping; their atomic fields are then the
//! cross-process synchronization points.

pub mod headers;
pub mod varint;

pub use headers::{
    DictHeader, FileHeader, RingHeader, AVAIL_CELL_SIZE, DICT_HEADER_SIZE, FILE_HEADER_SIZE,
    MAX_SECTIONS, RING_HEADER_SIZE, UNPUBLISHED,
};
pub use varint::{VarintError, MAX_VARINT_LEN};

/// Ring slot position for a monotonic claim index.
#[inline]
pub fn slot_of(index: i64, num_slots: u64) -> usize {
    debug_assert!(num_slots.is_power_of_two());
    (index as u64 & (num_slots - 1)) as usize
}

/// Wrap count of a claim index, as stored in the availability cell.
///
/// Computed on the full 64-bit index before truncating to the 32-bit cell,
/// so indices past `u32::MAX` still produce distinct successive generations.
#[inline]
pub fn generation_of(index: i64, log2_slots: u32) -> i32 {
    ((index as u64) >> log2_slots) as i32
}

/// Total byte length of a ring section: header, availability array, slots.
#[inline]
pub fn ring_section_len(num_slots: u64, slot_size: u64) -> u64 {
    RING_HEADER_SIZE as u64 + AVAIL_CELL_SIZE as u64 * num_slots + slot_size * num_slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_and_generation_wrap() {
        // 8 slots, shift 3
        assert_eq!(slot_of(0, 8), 0);
        assert_eq!(slot_of(7, 8), 7);
        assert_eq!(slot_of(8, 8), 0);
        assert_eq!(slot_of(15, 8), 7);
        assert_eq!(generation_of(7, 3), 0);
        assert_eq!(generation_of(8, 3), 1);
        assert_eq!(generation_of(15, 3), 1);
        assert_eq!(generation_of(16, 3), 2);
    }

    #[test]
    fn generation_uses_full_index_width() {
        // An index past u32::MAX must not alias generation 0.
        let idx = 1_i64 << 32;
        assert_eq!(generation_of(idx, 2), (1_u64 << 30) as i32);
        assert_ne!(generation_of(idx, 2), generation_of(0, 2));
    }

    #[test]
    fn degenerate_single_slot_ring() {
        // num_slots = 1: every index maps to position 0, generation = index.
        assert_eq!(slot_of(41, 1), 0);
        assert_eq!(generation_of(41, 0), 41);
    }

    #[test]
    fn ring_section_len_accounts_for_all_parts() {
        // 4 slots of 8 bytes: 32 header + 16 availability + 32 slots.
        assert_eq!(ring_section_len(4, 8), 80);
    }
}
