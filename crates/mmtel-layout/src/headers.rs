//! Section header structs reinterpreted in place on a shared mapping.
//!
//! Immutable fields (`num_slots`, `slot_size`, section offsets) are written
//! once during initialization, before the file's epoch is published, and
//! never change afterwards. They are still typed as atomics so that every
//! access to shared bytes goes through an atomic operation; mixing plain and
//! atomic access to the same cross-process memory is undefined behavior.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64};

/// Maximum number of sections a single transport file can carry.
///
/// Bounded by the fixed file header: 8 bytes of epoch, six 8-byte section
/// offset slots, 8 bytes of start time.
pub const MAX_SECTIONS: usize = 6;

/// Compile-time file header size.
pub const FILE_HEADER_SIZE: usize = std::mem::size_of::<FileHeader>();

/// Compile-time ring header size.
pub const RING_HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();

/// Compile-time dictionary header size.
pub const DICT_HEADER_SIZE: usize = std::mem::size_of::<DictHeader>();

/// Size of one availability cell (i32 generation).
pub const AVAIL_CELL_SIZE: usize = std::mem::size_of::<AtomicI32>();

/// Initial value of every availability cell and of both ring indices.
pub const UNPUBLISHED: i32 = -1;

// ---------------------------------------------------------------------------
// FileHeader — occupies the first 64 bytes of the file
// ---------------------------------------------------------------------------

/// Transport file header.
///
/// Layout (64 bytes total):
/// ```text
/// offset  field                  size
/// ------  --------------------   ----
///  0      epoch                   8   (0 = uninitialized)
///  8      section_offsets        48   (6 × u64 absolute offsets, unused = 0)
/// 56      start_time_unix_nano    8   (informational)
/// ```
///
/// The epoch is the initialization barrier: the writer release-stores it
/// last, so any attacher that acquire-loads a nonzero epoch observes fully
/// initialized section headers. Any later change of the observed epoch
/// invalidates all cached reader state.
#[repr(C)]
pub struct FileHeader {
    pub epoch: AtomicU64,
    pub section_offsets: [AtomicU64; MAX_SECTIONS],
    pub start_time_unix_nano: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == 64);
const _: () = assert!(std::mem::align_of::<FileHeader>() == 8);

// ---------------------------------------------------------------------------
// RingHeader — first 32 bytes of a ring section
// ---------------------------------------------------------------------------

/// Ring buffer section header.
///
/// Layout (32 bytes, followed by `4 * num_slots` bytes of availability
/// cells, then `slot_size * num_slots` bytes of slot bodies):
/// ```text
/// offset  field          size
/// ------  ------------   ----
///  0      num_slots       8   (power of two)
///  8      slot_size       8   (bytes per slot)
/// 16      reader_index    8   (i64, -1 initial; highest consumed index)
/// 24      writer_index    8   (i64, -1 initial; highest claimed index)
/// ```
///
/// `writer_index` is advanced by producer CAS; `reader_index` is written by
/// the single consumer with release ordering. A slot at position
/// `i & (num_slots - 1)` is readable iff its availability cell equals
/// `i >> log2(num_slots)`.
#[repr(C)]
pub struct RingHeader {
    pub num_slots: AtomicU64,
    pub slot_size: AtomicU64,
    pub reader_index: AtomicI64,
    pub writer_index: AtomicI64,
}

const _: () = assert!(std::mem::size_of::<RingHeader>() == 32);
const _: () = assert!(std::mem::align_of::<RingHeader>() == 8);

// ---------------------------------------------------------------------------
// DictHeader — first 64 bytes of a dictionary section
// ---------------------------------------------------------------------------

/// Dictionary section header.
///
/// Layout (64 bytes, followed by varint-length-prefixed entry bodies):
/// ```text
/// offset  field          size
/// ------  ------------   ----
///  0      end             8   (absolute file offset of the next free byte)
///  8      num_entries     8   (advisory; may lag the true count)
/// 16      reserved       48   (zero)
/// ```
///
/// `end` starts at `section_offset + 64` and only grows; committed entry
/// offsets never move for the lifetime of an epoch. Offset 0 lies inside
/// the file header and is reserved as a null reference.
#[repr(C)]
pub struct DictHeader {
    pub end: AtomicU64,
    pub num_entries: AtomicU64,
    _reserved: [u8; 48],
}

const _: () = assert!(std::mem::size_of::<DictHeader>() == 64);
const _: () = assert!(std::mem::align_of::<DictHeader>() == 8);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn header_sizes_are_wire_exact() {
        assert_eq!(FILE_HEADER_SIZE, 64);
        assert_eq!(RING_HEADER_SIZE, 32);
        assert_eq!(DICT_HEADER_SIZE, 64);
        assert_eq!(AVAIL_CELL_SIZE, 4);
    }

    #[test]
    fn file_header_field_offsets() {
        let hdr = FileHeader {
            epoch: AtomicU64::new(0),
            section_offsets: Default::default(),
            start_time_unix_nano: AtomicU64::new(0),
        };
        let base = &hdr as *const FileHeader as usize;
        assert_eq!(&hdr.epoch as *const _ as usize - base, 0);
        assert_eq!(&hdr.section_offsets as *const _ as usize - base, 8);
        assert_eq!(&hdr.start_time_unix_nano as *const _ as usize - base, 56);
    }

    #[test]
    fn ring_header_field_offsets() {
        let hdr = RingHeader {
            num_slots: AtomicU64::new(8),
            slot_size: AtomicU64::new(64),
            reader_index: AtomicI64::new(-1),
            writer_index: AtomicI64::new(-1),
        };
        let base = &hdr as *const RingHeader as usize;
        assert_eq!(&hdr.num_slots as *const _ as usize - base, 0);
        assert_eq!(&hdr.slot_size as *const _ as usize - base, 8);
        assert_eq!(&hdr.reader_index as *const _ as usize - base, 16);
        assert_eq!(&hdr.writer_index as *const _ as usize - base, 24);
        assert_eq!(hdr.reader_index.load(Ordering::Relaxed), -1);
    }
}
