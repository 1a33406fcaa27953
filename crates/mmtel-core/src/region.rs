//! Typed views over mapped file sections.
//!
//! Each section gets its own mapping, created from the offsets recorded in
//! the file header. The header structs from `mmtel-layout` are reinterpreted
//! in place; their atomic fields are the only synchronization between the
//! producer and collector processes. Mappings are never handed out as
//! pointers past the lifetime of the owning handle.

use std::fs::File;
use std::sync::atomic::AtomicI32;

use memmap2::{MmapMut, MmapOptions};
use mmtel_layout::{FileHeader, RingHeader, FILE_HEADER_SIZE, RING_HEADER_SIZE};

use crate::error::{Result, TransportError};

// ---------------------------------------------------------------------------
// HeaderMap — the first 64 bytes of the file
// ---------------------------------------------------------------------------

/// Mapping of the transport file header.
///
/// Shared (via `Arc`) by every section handle of one writer or reader, so
/// each operation can revalidate the epoch it was built against.
pub(crate) struct HeaderMap {
    map: MmapMut,
}

impl HeaderMap {
    pub(crate) fn map(file: &File) -> Result<Self> {
        let map = unsafe { MmapOptions::new().len(FILE_HEADER_SIZE).map_mut(file)? };
        Ok(Self { map })
    }

    /// The header reinterpreted in place.
    pub(crate) fn raw(&self) -> &FileHeader {
        // Safety: the mapping is exactly FILE_HEADER_SIZE bytes of shared,
        // writable, page-aligned memory; FileHeader is repr(C) with only
        // atomic fields.
        unsafe { &*(self.map.as_ptr() as *const FileHeader) }
    }

    pub(crate) fn epoch_acquire(&self) -> u64 {
        self.raw().epoch.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Fail if the file's epoch no longer matches the handle's cached one.
    pub(crate) fn check_epoch(&self, cached: u64) -> Result<()> {
        let observed = self.epoch_acquire();
        if observed == cached {
            Ok(())
        } else {
            Err(TransportError::VersionMismatch { cached, observed })
        }
    }
}

// ---------------------------------------------------------------------------
// RingMap — one ring buffer section
// ---------------------------------------------------------------------------

/// Mapping of a ring section: 32-byte header, availability array, slots.
///
/// Ring sections have a fixed extent and are never remapped, so the mutable
/// base pointer captured at construction stays valid for the mapping's
/// lifetime.
pub(crate) struct RingMap {
    map: MmapMut,
    base: *mut u8,
}

// The mapping is shared memory coordinated purely through the atomic header
// and availability cells; slot bytes are only touched under the claim/publish
// protocol.
unsafe impl Send for RingMap {}
unsafe impl Sync for RingMap {}

impl RingMap {
    pub(crate) fn map(file: &File, offset: u64, len: u64) -> Result<Self> {
        let mut map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len as usize)
                .map_mut(file)?
        };
        let base = map.as_mut_ptr();
        Ok(Self { map, base })
    }

    /// The section header reinterpreted in place.
    pub(crate) fn header(&self) -> &RingHeader {
        // Safety: the section offset is 64-byte aligned by the placement
        // plan and the mapping covers at least RING_HEADER_SIZE bytes.
        unsafe { &*(self.base as *const RingHeader) }
    }

    /// The availability array: one generation cell per slot position.
    pub(crate) fn availability(&self, num_slots: usize) -> &[AtomicI32] {
        debug_assert!(RING_HEADER_SIZE + num_slots * 4 <= self.map.len());
        // Safety: cells start right after the header (offset 32, 4-byte
        // aligned) and the mapping extends over all of them.
        unsafe {
            std::slice::from_raw_parts(
                self.base.add(RING_HEADER_SIZE) as *const AtomicI32,
                num_slots,
            )
        }
    }

    /// Copy `src` into the mapping at `offset`.
    ///
    /// Safety: the caller must hold the claim on the slot covering
    /// `offset..offset + src.len()`; the claim/publish protocol is what
    /// keeps concurrent producers out of each other's ranges.
    pub(crate) unsafe fn write_bytes(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.map.len());
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len());
    }

    /// Borrow `len` bytes of the mapping at `offset`.
    ///
    /// Safety: the caller must know no producer is writing this range; for
    /// slot bodies that means the slot is published and unconsumed.
    pub(crate) unsafe fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.map.len());
        std::slice::from_raw_parts(self.base.add(offset), len)
    }
}
