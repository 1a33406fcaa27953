//! Producer-side handle over one transport file.
//!
//! The writer owns initialization: it sizes the file, lays out the sections
//! recorded in the file header, and release-stores the epoch last, so an
//! attacher that observes a nonzero epoch sees fully initialized sections.
//! A restarting writer may re-open a compatible file in place (keeping the
//! epoch and whatever the reader had consumed) or re-initialize under a
//! fresh epoch, which invalidates every attached reader.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use mmtel_config::{LayoutDescriptor, PlannedSection, SectionPlan, SectionSpec};
use mmtel_layout::MAX_SECTIONS;
use tracing::{info, warn};

use crate::dictionary::DictWriter;
use crate::error::{Result, TransportError};
use crate::region::{HeaderMap, RingMap};
use crate::ring::{initialize_ring, verify_ring, RingWriter};

enum WriterSection {
    Ring(RingWriter),
    Dictionary(DictWriter),
}

/// Producer handle: owns the mapping and all section writers.
///
/// Shareable across producer threads through `&self`; claims and dictionary
/// reservations are already multi-producer safe.
pub struct Writer {
    path: PathBuf,
    header: Arc<HeaderMap>,
    epoch: u64,
    sections: Vec<WriterSection>,
}

impl Writer {
    /// Create (or take over) the file at `path` under a fresh epoch.
    ///
    /// Any previous content is superseded: sections are re-initialized and
    /// attached readers will observe the epoch change.
    pub fn create(path: &Path, descriptor: &LayoutDescriptor) -> Result<Self> {
        let plan = descriptor.plan()?;
        let file = open_rw(path)?;
        ensure_len(&file, plan.initial_file_len)?;
        let header = Arc::new(HeaderMap::map(&file)?);
        let previous = header.epoch_acquire();
        Self::initialize(path, file, header, &plan, previous)
    }

    /// Attach to a compatible file, or re-initialize it when it is absent,
    /// uninitialized, or laid out differently than `descriptor`.
    pub fn open(path: &Path, descriptor: &LayoutDescriptor) -> Result<Self> {
        let plan = descriptor.plan()?;
        let file = open_rw(path)?;
        ensure_len(&file, plan.initial_file_len)?;
        let header = Arc::new(HeaderMap::map(&file)?);
        let epoch = header.epoch_acquire();
        if epoch == 0 {
            return Self::initialize(path, file, header, &plan, 0);
        }
        match Self::attach_sections(&file, &header, &plan, epoch) {
            Ok(sections) => {
                info!(path = %path.display(), epoch, "Attached writer to existing transport file");
                Ok(Self {
                    path: path.to_path_buf(),
                    header,
                    epoch,
                    sections,
                })
            }
            Err(error @ TransportError::LayoutMismatch { .. }) => {
                warn!(path = %path.display(), %error, "Transport layout mismatch; re-initializing");
                Self::initialize(path, file, header, &plan, epoch)
            }
            Err(error) => Err(error),
        }
    }

    /// Ring writer for section `index`.
    pub fn ring(&self, index: usize) -> Result<&RingWriter> {
        match self.sections.get(index) {
            Some(WriterSection::Ring(ring)) => Ok(ring),
            Some(WriterSection::Dictionary(_)) => Err(TransportError::LayoutMismatch {
                section: index,
                detail: "section is a dictionary, not a ring".to_string(),
            }),
            None => Err(TransportError::LayoutMismatch {
                section: index,
                detail: "no such section".to_string(),
            }),
        }
    }

    /// Dictionary writer for section `index`.
    pub fn dictionary(&self, index: usize) -> Result<&DictWriter> {
        match self.sections.get(index) {
            Some(WriterSection::Dictionary(dict)) => Ok(dict),
            Some(WriterSection::Ring(_)) => Err(TransportError::LayoutMismatch {
                section: index,
                detail: "section is a ring, not a dictionary".to_string(),
            }),
            None => Err(TransportError::LayoutMismatch {
                section: index,
                detail: "no such section".to_string(),
            }),
        }
    }

    /// The epoch this writer published (or attached to).
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Wall-clock nanoseconds recorded at initialization.
    pub fn start_time_unix_nano(&self) -> u64 {
        self.header
            .raw()
            .start_time_unix_nano
            .load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lay the sections out and publish a fresh epoch last.
    fn initialize(
        path: &Path,
        file: File,
        header: Arc<HeaderMap>,
        plan: &SectionPlan,
        previous_epoch: u64,
    ) -> Result<Self> {
        let epoch = fresh_epoch(previous_epoch);
        let raw = header.raw();

        // Fail handles of the previous epoch fast while sections are being
        // rebuilt underneath them.
        raw.epoch.store(0, Ordering::SeqCst);

        let mut sections = Vec::with_capacity(plan.sections.len());
        for (index, planned) in plan.sections.iter().enumerate() {
            raw.section_offsets[index].store(planned.offset, Ordering::Relaxed);
            sections.push(Self::init_section(&file, &header, planned, epoch)?);
        }
        for index in plan.sections.len()..MAX_SECTIONS {
            raw.section_offsets[index].store(0, Ordering::Relaxed);
        }
        raw.start_time_unix_nano
            .store(unix_nanos(), Ordering::Relaxed);

        // The barrier: attachers that acquire a nonzero epoch see every
        // store above.
        raw.epoch.store(epoch, Ordering::Release);

        info!(
            path = %path.display(),
            epoch,
            sections = plan.sections.len(),
            "Initialized transport file"
        );
        Ok(Self {
            path: path.to_path_buf(),
            header,
            epoch,
            sections,
        })
    }

    fn init_section(
        file: &File,
        header: &Arc<HeaderMap>,
        planned: &PlannedSection,
        epoch: u64,
    ) -> Result<WriterSection> {
        match &planned.spec {
            SectionSpec::Ring(spec) => {
                let map = RingMap::map(file, planned.offset, planned.initial_len)?;
                initialize_ring(&map, spec);
                Ok(WriterSection::Ring(RingWriter::new(
                    map,
                    Arc::clone(header),
                    epoch,
                    spec,
                )))
            }
            SectionSpec::Dictionary(spec) => {
                let mapped_len = mapped_dict_len(file, planned)?;
                let dict = DictWriter::new(
                    file.try_clone()?,
                    Arc::clone(header),
                    epoch,
                    planned.offset,
                    spec,
                    mapped_len,
                )?;
                dict.reset();
                Ok(WriterSection::Dictionary(dict))
            }
        }
    }

    fn attach_sections(
        file: &File,
        header: &Arc<HeaderMap>,
        plan: &SectionPlan,
        epoch: u64,
    ) -> Result<Vec<WriterSection>> {
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
            sections.push(Self::attach_section(file, header, planned, index, epoch)?);
        }
        if plan.sections.len() < MAX_SECTIONS {
            let extra = raw.section_offsets[plan.sections.len()].load(Ordering::Relaxed);
            if extra != 0 {
                return Err(TransportError::LayoutMismatch {
                    section: plan.sections.len(),
                    detail: format!("unexpected extra section at offset {extra}"),
                });
            }
        }
        Ok(sections)
    }

    fn attach_section(
        file: &File,
        header: &Arc<HeaderMap>,
        planned: &PlannedSection,
        index: usize,
        epoch: u64,
    ) -> Result<WriterSection> {
        match &planned.spec {
            SectionSpec::Ring(spec) => {
                let map = RingMap::map(file, planned.offset, planned.initial_len)?;
                verify_ring(&map, spec, index)?;
                Ok(WriterSection::Ring(RingWriter::new(
                    map,
                    Arc::clone(header),
                    epoch,
                    spec,
                )))
            }
            SectionSpec::Dictionary(spec) => {
                let mapped_len = mapped_dict_len(file, planned)?;
                let dict = DictWriter::new(
                    file.try_clone()?,
                    Arc::clone(header),
                    epoch,
                    planned.offset,
                    spec,
                    mapped_len,
                )?;
                let end = dict.reserved_end();
                // A corrupt `end` would make the next reservation extend the
                // file to wherever the garbage points.
                if end < dict.body_start() || end > planned.offset + mapped_len {
                    return Err(TransportError::LayoutMismatch {
                        section: index,
                        detail: format!(
                            "dictionary end {end} outside [{}, {}]",
                            dict.body_start(),
                            planned.offset + mapped_len
                        ),
                    });
                }
                Ok(WriterSection::Dictionary(dict))
            }
        }
    }
}

/// Choose a nonzero epoch strictly above the previous one; wall-clock nanos
/// when the clock cooperates.
fn fresh_epoch(previous: u64) -> u64 {
    unix_nanos().max(previous.saturating_add(1)).max(1)
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub(crate) fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn ensure_len(file: &File, want: u64) -> Result<()> {
    if file.metadata()?.len() < want {
        file.set_len(want)?;
    }
    Ok(())
}

/// A dictionary section maps at least its planned extent, or the full grown
/// tail of the file when a previous run extended it.
pub(crate) fn mapped_dict_len(file: &File, planned: &PlannedSection) -> Result<u64> {
    let file_len = file.metadata()?.len();
    Ok(planned
        .initial_len
        .max(file_len.saturating_sub(planned.offset)))
}
