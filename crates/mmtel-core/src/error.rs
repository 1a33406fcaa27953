//! Error taxonomy of the transport substrate.
//!
//! Every failure is reported synchronously to the caller of the operation
//! that hit it; the substrate never retries internally. `VersionMismatch`
//! is fatal for the handle that observed it; the caller must re-attach.

use thiserror::Error;

/// Errors that can occur on a transport file operation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid layout descriptor: {0}")]
    Config(#[from] mmtel_config::ConfigError),

    /// The file's epoch is zero: no writer has initialized it yet.
    #[error("transport file is uninitialized")]
    Uninitialized,

    /// The attached file disagrees with the expected layout.
    #[error("layout mismatch in section {section}: {detail}")]
    LayoutMismatch { section: usize, detail: String },

    /// The file was re-initialized behind this handle.
    #[error("epoch changed from {cached} to {observed}; re-attach required")]
    VersionMismatch { cached: u64, observed: u64 },

    /// No slot can be claimed until the reader drains.
    #[error("ring is full")]
    RingFull,

    /// The encoded body does not fit one slot.
    #[error("payload of {len} bytes does not fit a {slot_size}-byte slot")]
    PayloadTooLarge { len: usize, slot_size: u64 },

    /// The dictionary cannot be grown any further.
    #[error("dictionary cannot grow to {needed} bytes (limit {limit})")]
    CapacityExceeded { needed: u64, limit: u64 },

    /// Malformed length prefix or truncated payload.
    #[error("cannot decode entry at offset {offset}: {detail}")]
    DecodeError { offset: u64, detail: String },

    /// A bounded wait strategy gave up.
    #[error("gave up waiting after {attempts} attempts")]
    Timeout { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, TransportError>;
