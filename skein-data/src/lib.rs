//! Data structures shared between the skein crates: content digests, target
//! labels, and per-path file metadata.
//!
//! Everything here is plain data. These types are hashed, compared and
//! serialized by every layer of the build, so they deliberately have no
//! behavior beyond construction, display and fingerprinting.

#![warn(rust_2018_idioms)]

pub mod digest;
pub mod file;
pub mod label;

pub use crate::digest::{ContentHasher, Digest, Fingerprint, HashFunction};
pub use crate::file::{FileKind, FileState};
pub use crate::label::{Label, LabelError, TargetPattern};
