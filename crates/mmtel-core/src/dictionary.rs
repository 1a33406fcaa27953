//! Append-only dictionary over a mapped section.
//!
//! Entries are varint-length-prefixed byte strings appended at the offset
//! reserved by a fetch-add on the section's `end` field. Returned offsets
//! are absolute file positions, stable for the lifetime of an epoch, and are
//! what ring records embed to reference interned data.
//!
//! Reservation is wait-free. Growth is not: when an entry does not fit the
//! mapped extent the file is extended and the section remapped under a write
//! lock, while plain appends share a read lock. Offsets never move, so a
//! handle that remaps late still resolves every committed entry.

use std::fs::File;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};

use memmap2::{MmapMut, MmapOptions};
use mmtel_config::DictionarySpec;
use mmtel_layout::{varint, DictHeader, VarintError, DICT_HEADER_SIZE, MAX_VARINT_LEN};
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::region::HeaderMap;

/// File growth granularity.
const PAGE: u64 = 4096;

/// A remappable mapping of one dictionary section.
struct DictMap {
    map: MmapMut,
    base: *mut u8,
    len: usize,
}

// Coordinated through the atomic section header plus the surrounding
// RwLock; entry ranges are disjoint by reservation.
unsafe impl Send for DictMap {}
unsafe impl Sync for DictMap {}

impl DictMap {
    fn map(file: &File, offset: u64, len: u64) -> Result<Self> {
        let mut map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len as usize)
                .map_mut(file)?
        };
        let base = map.as_mut_ptr();
        Ok(Self {
            map,
            base,
            len: len as usize,
        })
    }

    fn header(&self) -> &DictHeader {
        // Safety: the section offset is 64-byte aligned and the mapping
        // always covers the 64-byte header.
        unsafe { &*(self.base as *const DictHeader) }
    }

    /// Safety: the caller must own the reserved range.
    unsafe fn write_bytes(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.map.len());
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len());
    }

    /// Safety: the caller must know no producer is writing this range.
    unsafe fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.map.len());
        std::slice::from_raw_parts(self.base.add(offset), len)
    }
}

// ---------------------------------------------------------------------------
// DictWriter
// ---------------------------------------------------------------------------

/// Producer side of a dictionary section. Shareable across threads.
pub struct DictWriter {
    file: File,
    header: Arc<HeaderMap>,
    epoch: u64,
    section_offset: u64,
    max_capacity: Option<u64>,
    map: RwLock<DictMap>,
}

impl DictWriter {
    pub(crate) fn new(
        file: File,
        header: Arc<HeaderMap>,
        epoch: u64,
        section_offset: u64,
        spec: &DictionarySpec,
        mapped_len: u64,
    ) -> Result<Self> {
        let map = DictMap::map(&file, section_offset, mapped_len)?;
        Ok(Self {
            file,
            header,
            epoch,
            section_offset,
            max_capacity: spec.max_capacity,
            map: RwLock::new(map),
        })
    }

    /// Reset the section header to an empty dictionary.
    ///
    /// Runs during file initialization, before the epoch is published.
    pub(crate) fn reset(&self) {
        let guard = self.lock_read();
        let hdr = guard.header();
        hdr.end.store(
            self.section_offset + DICT_HEADER_SIZE as u64,
            Ordering::Relaxed,
        );
        hdr.num_entries.store(0, Ordering::Relaxed);
    }

    /// First byte offset past the section header; the earliest valid entry
    /// offset.
    pub fn body_start(&self) -> u64 {
        self.section_offset + DICT_HEADER_SIZE as u64
    }

    /// Append a length-prefixed entry, returning its stable absolute offset.
    ///
    /// Reservation is a single fetch-add; concurrent appends land in
    /// disjoint ranges. Growth is attempted at most once and its failure
    /// propagates (`CapacityExceeded` on the configured limit, `Io` when the
    /// filesystem refuses).
    pub fn append(&self, body: &[u8]) -> Result<u64> {
        self.header.check_epoch(self.epoch)?;

        let mut prefix = [0_u8; MAX_VARINT_LEN];
        let prefix_len = varint::encode(body.len() as u64, &mut prefix);
        let total = (prefix_len + body.len()) as u64;

        // Reserve [base, base + total). AcqRel so a reader bounding offsets
        // by `end` sees every earlier reservation.
        let base = {
            let guard = self.lock_read();
            guard.header().end.fetch_add(total, Ordering::AcqRel)
        };
        let rel = base - self.section_offset;
        let rel_end = rel + total;

        {
            let guard = self.lock_read();
            if rel_end <= guard.len as u64 {
                self.commit(&guard, rel as usize, &prefix[..prefix_len], body);
                return Ok(base);
            }
        }

        let mut guard = self.map.write().expect("dictionary mapping lock poisoned");
        if rel_end > guard.len as u64 {
            self.grow(&mut guard, rel_end)?;
        }
        self.commit(&guard, rel as usize, &prefix[..prefix_len], body);
        Ok(base)
    }

    /// Advisory entry count; may lag appends still in flight.
    pub fn num_entries(&self) -> u64 {
        self.lock_read().header().num_entries.load(Ordering::Acquire)
    }

    /// Absolute offset of the next free byte (reservations included).
    pub fn reserved_end(&self) -> u64 {
        self.lock_read().header().end.load(Ordering::Acquire)
    }

    fn commit(&self, guard: &DictMap, rel: usize, prefix: &[u8], body: &[u8]) {
        // Safety: [rel, rel + prefix + body) was reserved by our fetch-add.
        unsafe {
            guard.write_bytes(rel, prefix);
            guard.write_bytes(rel + prefix.len(), body);
        }
        guard.header().num_entries.fetch_add(1, Ordering::Release);
    }

    /// Extend the file and remap so the section covers `needed_rel` bytes.
    fn grow(&self, guard: &mut DictMap, needed_rel: u64) -> Result<()> {
        let doubled = (guard.len as u64).saturating_mul(2).max(needed_rel);
        let mut new_len = (doubled + PAGE - 1) & !(PAGE - 1);
        if let Some(cap) = self.max_capacity {
            let limit = DICT_HEADER_SIZE as u64 + cap;
            if needed_rel > limit {
                return Err(TransportError::CapacityExceeded {
                    needed: needed_rel,
                    limit,
                });
            }
            new_len = new_len.min(limit);
        }
        self.file.set_len(self.section_offset + new_len)?;
        let remapped = DictMap::map(&self.file, self.section_offset, new_len)?;
        debug!(
            section_offset = self.section_offset,
            old_len = guard.len,
            new_len,
            "Grew dictionary mapping"
        );
        *guard = remapped;
        Ok(())
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, DictMap> {
        self.map.read().expect("dictionary mapping lock poisoned")
    }
}

// ---------------------------------------------------------------------------
// DictReader
// ---------------------------------------------------------------------------

/// Consumer side of a dictionary section.
///
/// Reads are valid for any offset published through a ring slot; the
/// happens-before edge is the slot's availability store, not anything the
/// dictionary does itself.
pub struct DictReader {
    file: File,
    header: Arc<HeaderMap>,
    epoch: u64,
    section_offset: u64,
    map: RwLock<DictMap>,
}

impl DictReader {
    pub(crate) fn new(
        file: File,
        header: Arc<HeaderMap>,
        epoch: u64,
        section_offset: u64,
        mapped_len: u64,
    ) -> Result<Self> {
        let map = DictMap::map(&file, section_offset, mapped_len)?;
        Ok(Self {
            file,
            header,
            epoch,
            section_offset,
            map: RwLock::new(map),
        })
    }

    /// Decode the entry at `offset`, returning a copy of its payload.
    ///
    /// An entry that extends past this handle's mapping triggers one remap
    /// to the current file length before failing: the writer may have grown
    /// the file since attach.
    pub fn read(&self, offset: u64) -> Result<Vec<u8>> {
        self.header.check_epoch(self.epoch)?;

        let body_start = self.section_offset + DICT_HEADER_SIZE as u64;
        if offset < body_start {
            return Err(TransportError::DecodeError {
                offset,
                detail: "offset precedes the dictionary body".to_string(),
            });
        }

        for pass in 0..2 {
            {
                let guard = self.map.read().expect("dictionary mapping lock poisoned");
                let end = guard.header().end.load(Ordering::Acquire);
                if offset >= end {
                    return Err(TransportError::DecodeError {
                        offset,
                        detail: format!("offset at or beyond dictionary end {end}"),
                    });
                }
                let rel = (offset - self.section_offset) as usize;
                if rel < guard.len {
                    // Safety: committed entries are immutable; uncommitted
                    // bytes are unreachable through published offsets.
                    let tail = unsafe { guard.read_bytes(rel, guard.len - rel) };
                    match varint::decode(tail) {
                        Ok((len, prefix_len)) if prefix_len + len as usize <= tail.len() => {
                            return Ok(tail[prefix_len..prefix_len + len as usize].to_vec());
                        }
                        // Entry runs past the mapping; fall through to remap.
                        Ok(_) | Err(VarintError::Truncated(_)) => {}
                        Err(VarintError::Overlong) => {
                            return Err(TransportError::DecodeError {
                                offset,
                                detail: "malformed length prefix".to_string(),
                            });
                        }
                    }
                }
            }
            if pass == 0 && !self.try_remap()? {
                break;
            }
        }
        Err(TransportError::DecodeError {
            offset,
            detail: "entry extends past the mapped region".to_string(),
        })
    }

    /// Absolute offset of the next free byte, as recorded in the section.
    pub fn reserved_end(&self) -> u64 {
        self.map
            .read()
            .expect("dictionary mapping lock poisoned")
            .header()
            .end
            .load(Ordering::Acquire)
    }

    /// Remap to the current file length. Returns true if the mapping grew.
    fn try_remap(&self) -> Result<bool> {
        let file_len = self.file.metadata()?.len();
        let new_len = file_len.saturating_sub(self.section_offset);
        let mut guard = self.map.write().expect("dictionary mapping lock poisoned");
        if new_len > guard.len as u64 {
            let remapped = DictMap::map(&self.file, self.section_offset, new_len)?;
            debug!(
                section_offset = self.section_offset,
                old_len = guard.len,
                new_len,
                "Remapped dictionary after file growth"
            );
            *guard = remapped;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
