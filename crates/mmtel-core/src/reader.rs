//! Collector-side handle over one transport file.
//!
//! A reader attaches to a file some writer initialized, verifies the layout
//! against its own descriptor, and caches the epoch it saw. Every section
//! operation revalidates that epoch; once it moves, the handle is dead and
//! the caller re-attaches. The reader is stateless across restarts apart
//! from `reader_index`, which lives in the file itself, so a fresh reader
//! resumes exactly where a crashed one stopped.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use mmtel_config::{LayoutDescriptor, SectionSpec};
use mmtel_layout::FILE_HEADER_SIZE;
use tracing::info;

use crate::dictionary::DictReader;
use crate::error::{Result, TransportError};
use crate::region::{HeaderMap, RingMap};
use crate::ring::{verify_ring, RingReader};
use crate::writer::{mapped_dict_len, open_rw};

enum ReaderSection {
    Ring(RingReader),
    Dictionary(DictReader),
}

/// Consumer handle: at most one per transport file, per contract.
pub struct Reader {
    path: PathBuf,
    header: Arc<HeaderMap>,
    epoch: u64,
    sections: Vec<ReaderSection>,
}

impl Reader {
    /// Attach to an initialized file, verifying its layout.
    ///
    /// # Errors
    ///
    /// `Uninitialized` when no writer has published an epoch yet (the
    /// caller decides whether to wait and retry); `LayoutMismatch` when the
    /// file disagrees with `descriptor` (the reader never re-initializes).
    pub fn attach(path: &Path, descriptor: &LayoutDescriptor) -> Result<Self> {
        let plan = descriptor.plan()?;
        // Read-write: the reader owns `reader_index`.
        let file = open_rw(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FILE_HEADER_SIZE as u64 {
            return Err(TransportError::Uninitialized);
        }
        let header = Arc::new(HeaderMap::map(&file)?);
        let epoch = header.epoch_acquire();
        if epoch == 0 {
            return Err(TransportError::Uninitialized);
        }
        if file_len < plan.initial_file_len {
            return Err(TransportError::LayoutMismatch {
                section: 0,
                detail: format!(
                    "file length {file_len} below the {} bytes this layout needs",
                    plan.initial_file_len
                ),
            });
        }

        let raw = header.raw();
        let mut sections = Vec::with_capacity(plan.sections.len());
        for (index, planned) in plan.sections.iter().enumerate() {
            let recorded = raw.section_offsets[index].load(Ordering::Relaxed);
            if recorded != planned.offset {
                return Err(TransportError::LayoutMismatch {
                    section: index,
                    detail: format!("section offset is {recorded}, expected {}", planned.offset),
                });
            }
            let section = match &planned.spec {
                SectionSpec::Ring(spec) => {
                    let map = RingMap::map(&file, planned.offset, planned.initial_len)?;
                    verify_ring(&map, spec, index)?;
                    ReaderSection::Ring(RingReader::new(map, Arc::clone(&header), epoch, spec))
                }
                SectionSpec::Dictionary(_) => {
                    let mapped_len = mapped_dict_len(&file, planned)?;
                    let dict = DictReader::new(
                        file.try_clone()?,
                        Arc::clone(&header),
                        epoch,
                        planned.offset,
                        mapped_len,
                    )?;
                    // Only the lower bound: the writer may legitimately grow
                    // the file (and `end`) while we attach.
                    let end = dict.reserved_end();
                    let body_start = planned.offset + mmtel_layout::DICT_HEADER_SIZE as u64;
                    if end < body_start {
                        return Err(TransportError::LayoutMismatch {
                            section: index,
                            detail: format!("dictionary end {end} precedes its body {body_start}"),
                        });
                    }
                    ReaderSection::Dictionary(dict)
                }
            };
            sections.push(section);
        }

        info!(path = %path.display(), epoch, "Attached transport reader");
        Ok(Self {
            path: path.to_path_buf(),
            header,
            epoch,
            sections,
        })
    }

    /// Ring reader for section `index`.
    ///
    /// Mutable: the consume cursor is single-owner by contract.
    pub fn ring(&mut self, index: usize) -> Result<&mut RingReader> {
        match self.sections.get_mut(index) {
            Some(ReaderSection::Ring(ring)) => Ok(ring),
            Some(ReaderSection::Dictionary(_)) => Err(TransportError::LayoutMismatch {
                section: index,
                detail: "section is a dictionary, not a ring".to_string(),
            }),
            None => Err(TransportError::LayoutMismatch {
                section: index,
                detail: "no such section".to_string(),
            }),
        }
    }

    /// Dictionary reader for section `index`.
    pub fn dictionary(&self, index: usize) -> Result<&DictReader> {
        match self.sections.get(index) {
            Some(ReaderSection::Dictionary(dict)) => Ok(dict),
            Some(ReaderSection::Ring(_)) => Err(TransportError::LayoutMismatch {
                section: index,
                detail: "section is a ring, not a dictionary".to_string(),
            }),
            None => Err(TransportError::LayoutMismatch {
                section: index,
                detail: "no such section".to_string(),
            }),
        }
    }

    /// The epoch this reader attached under.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the writer re-initialized the file behind this handle.
    ///
    /// Once true, every section operation fails with `VersionMismatch`;
    /// discard this reader and attach a new one.
    pub fn has_epoch_changed(&self) -> bool {
        self.header.epoch_acquire() != self.epoch
    }

    /// Wall-clock nanoseconds the writer recorded at initialization.
    pub fn start_time_unix_nano(&self) -> u64 {
        self.header
            .raw()
            .start_time_unix_nano
            .load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
