//! # mmtel-config
//!
//! Layout descriptors for mmtel transport files.
//!
//! A descriptor is the only configuration surface of the substrate: an
//! ordered list of sections (ring buffers and at most one trailing
//! dictionary) that, together with a filesystem path, fully determines a
//! transport file. Descriptors are plain serde types and can be loaded from
//! TOML:
//!
//! ```toml
//! [[sections]]
//! kind = "ring"
//! num_slots = 1024
//! slot_size = 512
//! body = "length_prefixed"
//!
//! [[sections]]
//! kind = "dictionary"
//! initial_capacity = 4096
//! ```

pub mod logging;
pub mod testing;

use std::path::Path;

use mmtel_layout::{ring_section_len, DICT_HEADER_SIZE, FILE_HEADER_SIZE, MAX_SECTIONS};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default number of slots in a ring section.
pub const DEFAULT_NUM_SLOTS: u64 = 1024;
/// Default size in bytes of one ring slot.
pub const DEFAULT_SLOT_SIZE: u64 = 512;
/// Default initial dictionary body capacity in bytes.
pub const DEFAULT_DICT_CAPACITY: u64 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid layout: {0}")]
    InvalidLayout(String),
}

/// How a ring section frames its slot bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotBody {
    /// Every slot carries exactly `slot_size` raw bytes.
    Fixed,
    /// Slots carry a varint length prefix plus payload, up to `slot_size`.
    LengthPrefixed,
}

/// Parameters of one ring buffer section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingSpec {
    /// Slot count; must be a power of two.
    pub num_slots: u64,
    /// Bytes per slot.
    pub slot_size: u64,
    /// Slot framing mode.
    pub body: SlotBody,
}

impl Default for RingSpec {
    fn default() -> Self {
        Self {
            num_slots: DEFAULT_NUM_SLOTS,
            slot_size: DEFAULT_SLOT_SIZE,
            body: SlotBody::LengthPrefixed,
        }
    }
}

/// Parameters of a dictionary section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DictionarySpec {
    /// Initial body capacity in bytes (the mapped area past the header).
    pub initial_capacity: u64,
    /// Optional hard cap on body capacity; growth past it fails.
    pub max_capacity: Option<u64>,
}

impl Default for DictionarySpec {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_DICT_CAPACITY,
            max_capacity: None,
        }
    }
}

/// One section of a transport file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SectionSpec {
    Ring(RingSpec),
    Dictionary(DictionarySpec),
}

impl SectionSpec {
    /// Short kind name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            SectionSpec::Ring(_) => "ring",
            SectionSpec::Dictionary(_) => "dictionary",
        }
    }
}

/// Ordered section list describing one transport file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LayoutDescriptor {
    pub sections: Vec<SectionSpec>,
}

impl LayoutDescriptor {
    /// Load a descriptor from a TOML file.
    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let descriptor = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), sections = descriptor.sections.len(), "Loaded layout descriptor");
        Ok(descriptor)
    }

    /// Parse a descriptor from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let descriptor: Self = toml::from_str(text)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// The conventional four-section telemetry file: spans, logs and metric
    /// measurement rings followed by a dictionary for interned resources,
    /// scopes and strings.
    pub fn telemetry_default() -> Self {
        Self {
            sections: vec![
                SectionSpec::Ring(RingSpec::default()),
                SectionSpec::Ring(RingSpec::default()),
                SectionSpec::Ring(RingSpec::default()),
                SectionSpec::Dictionary(DictionarySpec::default()),
            ],
        }
    }

    /// Check structural rules without computing placement.
    ///
    /// # Errors
    ///
    /// `InvalidLayout` when the descriptor is empty, exceeds the section
    /// limit, contains a non-power-of-two or zero-sized ring, or places a
    /// dictionary anywhere but last.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sections.is_empty() {
            return Err(ConfigError::InvalidLayout(
                "descriptor has no sections".to_string(),
            ));
        }
        if self.sections.len() > MAX_SECTIONS {
            return Err(ConfigError::InvalidLayout(format!(
                "{} sections exceeds the limit of {MAX_SECTIONS}",
                self.sections.len()
            )));
        }
        let last = self.sections.len() - 1;
        for (index, section) in self.sections.iter().enumerate() {
            match section {
                SectionSpec::Ring(ring) => {
                    if ring.num_slots == 0 || !ring.num_slots.is_power_of_two() {
                        return Err(ConfigError::InvalidLayout(format!(
                            "section {index}: num_slots {} is not a power of two",
                            ring.num_slots
                        )));
                    }
                    if ring.slot_size == 0 {
                        return Err(ConfigError::InvalidLayout(format!(
                            "section {index}: slot_size must be nonzero"
                        )));
                    }
                }
                SectionSpec::Dictionary(dict) => {
                    // The dictionary grows by extending the file, so nothing
                    // may be laid out after it.
                    if index != last {
                        return Err(ConfigError::InvalidLayout(format!(
                            "section {index}: dictionary must be the final section"
                        )));
                    }
                    if let Some(max) = dict.max_capacity {
                        if max < dict.initial_capacity {
                            return Err(ConfigError::InvalidLayout(format!(
                                "section {index}: max_capacity {max} below initial_capacity {}",
                                dict.initial_capacity
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate and assign every section its absolute file offset.
    ///
    /// Section offsets are rounded up to 64-byte boundaries so that every
    /// header field and availability cell stays naturally aligned; the gaps
    /// are dead bytes, and readers locate sections through the file header
    /// rather than by summing lengths.
    pub fn plan(&self) -> Result<SectionPlan, ConfigError> {
        self.validate()?;
        let mut offset = FILE_HEADER_SIZE as u64;
        let mut sections = Vec::with_capacity(self.sections.len());
        for spec in &self.sections {
            offset = align64(offset);
            let initial_len = match spec {
                SectionSpec::Ring(ring) => ring_section_len(ring.num_slots, ring.slot_size),
                SectionSpec::Dictionary(dict) => DICT_HEADER_SIZE as u64 + dict.initial_capacity,
            };
            sections.push(PlannedSection {
                spec: *spec,
                offset,
                initial_len,
            });
            offset += initial_len;
        }
        Ok(SectionPlan {
            sections,
            initial_file_len: offset,
        })
    }
}

#[inline]
fn align64(offset: u64) -> u64 {
    (offset + 63) & !63
}

/// A section with its assigned absolute file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedSection {
    pub spec: SectionSpec,
    /// Absolute byte offset of the section header within the file.
    pub offset: u64,
    /// Section length at initialization (dictionaries grow past this).
    pub initial_len: u64,
}

/// Placement plan for a whole transport file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionPlan {
    pub sections: Vec<PlannedSection>,
    /// File length covering the header and every section's initial extent.
    pub initial_file_len: u64,
}
