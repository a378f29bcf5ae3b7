//! skein: a hermetic, incrementally-rebuilding build tool.
//!
//! The core is an incremental keyed evaluator (`skein-graph`) with the build
//! expressed as functions over it: file state, directory listings, globs,
//! packages, configured targets, and action execution. The action cache
//! layer decides whether a declared action must run at all, rehydrating its
//! outputs from local or remote content-addressed storage when it need not.
//!
//! `BuildSession` is the embedding surface; the `skein` binary is a thin
//! command-line driver over it.

#![warn(rust_2018_idioms)]

pub mod build;
pub mod cmd;
pub mod config;
pub mod daemon;
pub mod workspace;

pub use crate::build::{BuildOutcome, BuildSession};
pub use crate::config::Config;
pub use crate::workspace::Workspace;

/// The version of this build of skein.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
