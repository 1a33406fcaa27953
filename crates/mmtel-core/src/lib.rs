//! # mmtel-core
//!
//! Memory-mapped telemetry transport substrate.
//!
//! An instrumented producer process and an out-of-band collector share one
//! or more mapped files instead of a socket. Producers write span, log and
//! measurement records into lock-free ring buffers and intern supporting
//! data (resources, scopes, strings) in an append-only dictionary; the
//! collector drains the rings and resolves dictionary offsets at its own
//! pace. Because every byte lives in file-backed pages, a producer crash
//! (OOM included) leaves all published records recoverable by whoever opens
//! the file next.
//!
//! ## File anatomy
//!
//! ```text
//! ┌───────────────┬──────────────────────────────┬──────────────────────┐
//! │ file header   │ ring sections                │ dictionary section   │
//! │ epoch,        │ 32 B header + availability   │ 64 B header +        │
//! │ section       │ cells + fixed-size slots     │ varint-prefixed      │
//! │ offsets       │ (MPSC, claim/publish)        │ entries (grow-only)  │
//! └───────────────┴──────────────────────────────┴──────────────────────┘
//! ```
//!
//! Coordination is purely atomic operations on the mapped bytes: producers
//! CAS a claim index and release-store a per-slot generation; the single
//! consumer acquire-loads the generation before touching slot bytes. No
//! locks cross the process boundary, so a dead process never wedges the
//! other side.
//!
//! ## Handles
//!
//! [`Writer`] initializes or re-attaches to a file described by a
//! [`LayoutDescriptor`] and hands out [`RingWriter`] / [`DictWriter`]
//! sections; [`Reader`] attaches, verifies layout and epoch, and hands out
//! [`RingReader`] / [`DictReader`]. An epoch change fails every operation
//! with [`TransportError::VersionMismatch`] until the caller re-attaches.

mod dictionary;
mod error;
mod reader;
mod region;
mod ring;
mod wait;
mod writer;

pub use dictionary::{DictReader, DictWriter};
pub use error::{Result, TransportError};
pub use reader::Reader;
pub use ring::{RingReader, RingWriter};
pub use wait::{BoundedSpin, SpinYield, WaitStrategy};
pub use writer::Writer;

// Descriptor types callers need to construct handles.
pub use mmtel_config::{
    DictionarySpec, LayoutDescriptor, RingSpec, SectionSpec, SlotBody,
};
