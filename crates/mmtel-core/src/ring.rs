//! Lock-free MPSC ring buffer over a mapped section.
//!
//! Producers claim monotonic indices with a CAS on `writer_index`, write the
//! slot body, then release-store the index's generation into the slot's
//! availability cell. The single consumer probes the cell for the expected
//! generation before touching the body, so it never observes torn or stale
//! bytes. A claim is refused while `candidate - reader_index > num_slots`,
//! which keeps producers from overwriting anything unread.
//!
//! Neither side blocks on the OS; blocking variants retry under a
//! caller-supplied [`WaitStrategy`].

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use mmtel_config::{RingSpec, SlotBody};
use mmtel_layout::{generation_of, slot_of, varint, MAX_VARINT_LEN, RING_HEADER_SIZE, UNPUBLISHED};

use crate::error::{Result, TransportError};
use crate::region::{HeaderMap, RingMap};
use crate::wait::WaitStrategy;

/// Set all ring header fields and availability cells to their initial state.
///
/// Runs before the file's epoch is published, so plain relaxed stores are
/// enough; the epoch release-store is the barrier attachers synchronize on.
pub(crate) fn initialize_ring(map: &RingMap, spec: &RingSpec) {
    let hdr = map.header();
    hdr.num_slots.store(spec.num_slots, Ordering::Relaxed);
    hdr.slot_size.store(spec.slot_size, Ordering::Relaxed);
    hdr.reader_index.store(-1, Ordering::Relaxed);
    hdr.writer_index.store(-1, Ordering::Relaxed);
    for cell in map.availability(spec.num_slots as usize) {
        cell.store(UNPUBLISHED, Ordering::Relaxed);
    }
}

/// Compare the on-file ring parameters against the expected spec.
pub(crate) fn verify_ring(map: &RingMap, spec: &RingSpec, section: usize) -> Result<()> {
    let hdr = map.header();
    let num_slots = hdr.num_slots.load(Ordering::Relaxed);
    if num_slots != spec.num_slots {
        return Err(TransportError::LayoutMismatch {
            section,
            detail: format!("num_slots is {num_slots}, expected {}", spec.num_slots),
        });
    }
    let slot_size = hdr.slot_size.load(Ordering::Relaxed);
    if slot_size != spec.slot_size {
        return Err(TransportError::LayoutMismatch {
            section,
            detail: format!("slot_size is {slot_size}, expected {}", spec.slot_size),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RingWriter
// ---------------------------------------------------------------------------

/// Producer side of one ring section.
///
/// Safe to share across threads: claims are serialized by the CAS on
/// `writer_index` and each claimed index owns a disjoint slot range until
/// published.
pub struct RingWriter {
    map: RingMap,
    header: Arc<HeaderMap>,
    epoch: u64,
    num_slots: u64,
    slot_size: u64,
    log2_slots: u32,
    body: SlotBody,
    first_slot_offset: usize,
}

impl RingWriter {
    pub(crate) fn new(map: RingMap, header: Arc<HeaderMap>, epoch: u64, spec: &RingSpec) -> Self {
        Self {
            map,
            header,
            epoch,
            num_slots: spec.num_slots,
            slot_size: spec.slot_size,
            log2_slots: spec.num_slots.ilog2(),
            body: spec.body,
            first_slot_offset: RING_HEADER_SIZE + spec.num_slots as usize * 4,
        }
    }

    /// Claim the next monotonic index, or `None` when the ring is saturated.
    ///
    /// Losing the CAS to another producer is not saturation; the claim is
    /// retried against the fresh index.
    pub fn try_claim(&self) -> Result<Option<u64>> {
        self.header.check_epoch(self.epoch)?;
        let hdr = self.map.header();
        loop {
            let claimed = hdr.writer_index.load(Ordering::Relaxed);
            let candidate = claimed + 1;
            let reader = hdr.reader_index.load(Ordering::Acquire);
            if candidate - reader > self.num_slots as i64 {
                return Ok(None);
            }
            if hdr
                .writer_index
                .compare_exchange(claimed, candidate, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(Some(candidate as u64));
            }
        }
    }

    /// Claim under a wait strategy, retrying while the ring is full.
    pub fn claim_blocking<W: WaitStrategy>(&self, strategy: &mut W) -> Result<u64> {
        let mut attempt = 0;
        loop {
            if let Some(index) = self.try_claim()? {
                return Ok(index);
            }
            if !strategy.wait(attempt) {
                return Err(TransportError::Timeout {
                    attempts: attempt + 1,
                });
            }
            attempt += 1;
        }
    }

    /// Frame `body` into the slot claimed as `index`.
    ///
    /// Callers of the raw claim/write/publish sequence should size-check
    /// with [`check_body`](Self::check_body) before claiming: a claimed
    /// index that is never published stalls the reader at that position.
    pub fn write_slot(&self, index: u64, body: &[u8]) -> Result<()> {
        self.check_body(body)?;
        let offset = self.slot_offset(index);
        match self.body {
            SlotBody::Fixed => {
                // Safety: `index` was claimed by the caller; no other
                // producer writes this range until it is consumed and
                // reclaimed a full generation later.
                unsafe { self.map.write_bytes(offset, body) };
            }
            SlotBody::LengthPrefixed => {
                let mut prefix = [0_u8; MAX_VARINT_LEN];
                let prefix_len = varint::encode(body.len() as u64, &mut prefix);
                // Safety: as above; prefix and payload stay inside one slot.
                unsafe {
                    self.map.write_bytes(offset, &prefix[..prefix_len]);
                    self.map.write_bytes(offset + prefix_len, body);
                }
            }
        }
        Ok(())
    }

    /// Mark the claimed `index` readable.
    ///
    /// The release store is the happens-before edge covering every byte the
    /// producer wrote into the slot (and into the dictionary, for bodies
    /// that reference dictionary offsets).
    pub fn publish(&self, index: u64) {
        let idx = index as i64;
        let generation = generation_of(idx, self.log2_slots);
        self.availability()[slot_of(idx, self.num_slots)].store(generation, Ordering::Release);
    }

    /// Claim, frame and publish in one call.
    ///
    /// Fails with `RingFull` when no slot can be claimed and with
    /// `PayloadTooLarge` before claiming anything.
    pub fn try_write(&self, body: &[u8]) -> Result<u64> {
        self.check_body(body)?;
        match self.try_claim()? {
            Some(index) => {
                self.write_slot(index, body)?;
                self.publish(index);
                Ok(index)
            }
            None => Err(TransportError::RingFull),
        }
    }

    /// Like [`try_write`](Self::try_write), retrying claims under `strategy`.
    pub fn write_blocking<W: WaitStrategy>(&self, body: &[u8], strategy: &mut W) -> Result<u64> {
        self.check_body(body)?;
        let index = self.claim_blocking(strategy)?;
        self.write_slot(index, body)?;
        self.publish(index);
        Ok(index)
    }

    /// Whether `body` fits one slot under this ring's framing.
    pub fn check_body(&self, body: &[u8]) -> Result<()> {
        let fits = match self.body {
            SlotBody::Fixed => body.len() as u64 == self.slot_size,
            SlotBody::LengthPrefixed => {
                (varint::encoded_len(body.len() as u64) + body.len()) as u64 <= self.slot_size
            }
        };
        if fits {
            Ok(())
        } else {
            Err(TransportError::PayloadTooLarge {
                len: body.len(),
                slot_size: self.slot_size,
            })
        }
    }

    pub fn num_slots(&self) -> u64 {
        self.num_slots
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    fn availability(&self) -> &[AtomicI32] {
        self.map.availability(self.num_slots as usize)
    }

    fn slot_offset(&self, index: u64) -> usize {
        self.first_slot_offset + slot_of(index as i64, self.num_slots) * self.slot_size as usize
    }
}

// ---------------------------------------------------------------------------
// RingReader
// ---------------------------------------------------------------------------

/// Consumer side of one ring section. At most one per ring, per contract;
/// the mutating operations take `&mut self` to keep one process honest.
pub struct RingReader {
    map: RingMap,
    header: Arc<HeaderMap>,
    epoch: u64,
    num_slots: u64,
    slot_size: u64,
    log2_slots: u32,
    body: SlotBody,
    first_slot_offset: usize,
}

impl RingReader {
    pub(crate) fn new(map: RingMap, header: Arc<HeaderMap>, epoch: u64, spec: &RingSpec) -> Self {
        Self {
            map,
            header,
            epoch,
            num_slots: spec.num_slots,
            slot_size: spec.slot_size,
            log2_slots: spec.num_slots.ilog2(),
            body: spec.body,
            first_slot_offset: RING_HEADER_SIZE + spec.num_slots as usize * 4,
        }
    }

    /// The next index that may be consumed, if its slot is published.
    pub fn try_next_readable(&self) -> Result<Option<u64>> {
        self.header.check_epoch(self.epoch)?;
        let hdr = self.map.header();
        let next = hdr.reader_index.load(Ordering::Acquire) + 1;
        let expected = generation_of(next, self.log2_slots);
        let cell = &self.availability()[slot_of(next, self.num_slots)];
        if cell.load(Ordering::Acquire) == expected {
            Ok(Some(next as u64))
        } else {
            Ok(None)
        }
    }

    /// Copy out the body of a readable slot.
    ///
    /// `index` must come from [`try_next_readable`](Self::try_next_readable)
    /// and not yet be consumed; the slot bytes are stable until
    /// [`advance_reader`](Self::advance_reader) passes them.
    pub fn read_body(&self, index: u64) -> Result<Vec<u8>> {
        let offset = self.slot_offset(index);
        // Safety: the availability check proved the producer's release
        // store, and an unconsumed slot cannot be reclaimed.
        let slot = unsafe { self.map.read_bytes(offset, self.slot_size as usize) };
        match self.body {
            SlotBody::Fixed => Ok(slot.to_vec()),
            SlotBody::LengthPrefixed => {
                let (len, prefix_len) =
                    varint::decode(slot).map_err(|e| TransportError::DecodeError {
                        offset: index,
                        detail: format!("slot length prefix: {e}"),
                    })?;
                let end = prefix_len + len as usize;
                if end > slot.len() {
                    return Err(TransportError::DecodeError {
                        offset: index,
                        detail: format!("length {len} overruns {}-byte slot", self.slot_size),
                    });
                }
                Ok(slot[prefix_len..end].to_vec())
            }
        }
    }

    /// Record `index` as consumed, releasing its position to producers.
    pub fn advance_reader(&mut self, index: u64) {
        self.map
            .header()
            .reader_index
            .store(index as i64, Ordering::Release);
    }

    /// Probe, copy and advance in one call.
    pub fn try_read(&mut self) -> Result<Option<Vec<u8>>> {
        match self.try_next_readable()? {
            Some(index) => {
                let body = self.read_body(index)?;
                self.advance_reader(index);
                Ok(Some(body))
            }
            None => Ok(None),
        }
    }

    /// Read under a wait strategy, retrying while the ring is empty.
    pub fn read_blocking<W: WaitStrategy>(&mut self, strategy: &mut W) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            if let Some(body) = self.try_read()? {
                return Ok(body);
            }
            if !strategy.wait(attempt) {
                return Err(TransportError::Timeout {
                    attempts: attempt + 1,
                });
            }
            attempt += 1;
        }
    }

    /// Highest consumed index, or `None` before the first read.
    pub fn reader_index(&self) -> Option<u64> {
        let index = self.map.header().reader_index.load(Ordering::Acquire);
        (index >= 0).then_some(index as u64)
    }

    pub fn num_slots(&self) -> u64 {
        self.num_slots
    }

    fn availability(&self) -> &[AtomicI32] {
        self.map.availability(self.num_slots as usize)
    }

    fn slot_offset(&self, index: u64) -> usize {
        self.first_slot_offset + slot_of(index as i64, self.num_slots) * self.slot_size as usize
    }
}
