//! Per-path resolved file state.
//!
//! `FileState` is the value the build graph records for a path. It carries
//! exactly enough to decide equality-for-invalidation cheaply: a digest when
//! one has been computed, and a (size, mtime, inode) proxy otherwise.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::digest::{ContentHasher, Digest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Absent,
}

/// Stat-level change proxy for a path: enough to notice "modified since"
/// without reading content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatProxy {
    pub mtime_millis: u64,
    /// Inode number where the platform has one, 0 otherwise.
    pub inode: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileState {
    Regular {
        size: u64,
        proxy: StatProxy,
        /// Computed lazily; `None` until someone needed the content hash.
        digest: Option<Digest>,
    },
    Directory {
        proxy: StatProxy,
    },
    Symlink {
        /// The textual link target, part of the symlink's identity.
        target: PathBuf,
        proxy: StatProxy,
    },
    Absent,
    /// An output known only by digest, bytes held in a blob store.
    Remote {
        digest: Digest,
        /// Milliseconds since the epoch after which the remote entry may be
        /// gone. `None` means no known expiry.
        expires_at_millis: Option<u64>,
    },
}

impl FileState {
    pub fn kind(&self) -> FileKind {
        match self {
            FileState::Regular { .. } | FileState::Remote { .. } => FileKind::Regular,
            FileState::Directory { .. } => FileKind::Directory,
            FileState::Symlink { .. } => FileKind::Symlink,
            FileState::Absent => FileKind::Absent,
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match self {
            FileState::Regular { digest, .. } => digest.as_ref(),
            FileState::Remote { digest, .. } => Some(digest),
            _ => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, FileState::Remote { .. })
    }

    pub fn size(&self) -> Option<u64> {
        match self {
            FileState::Regular { size, .. } => Some(*size),
            FileState::Remote { digest, .. } => Some(digest.size),
            _ => None,
        }
    }

    /// Equality for invalidation. Uses digests when both sides have them,
    /// falling back to the stat proxy. Distinct kinds never compare equal.
    pub fn version_equals(&self, other: &FileState) -> bool {
        use FileState::*;
        match (self, other) {
            (
                Regular { size: s1, proxy: p1, digest: d1 },
                Regular { size: s2, proxy: p2, digest: d2 },
            ) => match (d1, d2) {
                (Some(d1), Some(d2)) => d1 == d2,
                _ => s1 == s2 && p1 == p2,
            },
            (Directory { proxy: p1 }, Directory { proxy: p2 }) => p1 == p2,
            (Symlink { target: t1, .. }, Symlink { target: t2, .. }) => t1 == t2,
            (Absent, Absent) => true,
            (Remote { digest: d1, .. }, Remote { digest: d2, .. }) => d1 == d2,
            // A remote output that now exists locally with the same digest is
            // still the same content.
            (Remote { digest, .. }, Regular { digest: Some(d), .. })
            | (Regular { digest: Some(d), .. }, Remote { digest, .. }) => digest == d,
            _ => false,
        }
    }

    /// Feeds a type-discriminated fingerprint of this state into `hasher`.
    ///
    /// Regular files contribute their content digest (which must have been
    /// computed by the time anything fingerprints them); directories and
    /// symlinks contribute a kind tag plus their identity proxy.
    pub fn fingerprint_into(&self, hasher: &mut ContentHasher) {
        match self {
            FileState::Regular { digest: Some(d), .. } => {
                hasher.input_str("f").input_str(&d.hex).input_u64(d.size);
            }
            FileState::Regular { size, proxy, digest: None } => {
                hasher.input_str("f?").input_u64(*size).input_u64(proxy.mtime_millis);
            }
            FileState::Directory { proxy } => {
                hasher.input_str("d").input_u64(proxy.mtime_millis).input_u64(proxy.inode);
            }
            FileState::Symlink { target, .. } => {
                hasher.input_str("l").input_str(&target.to_string_lossy());
            }
            FileState::Absent => {
                hasher.input_str("-");
            }
            FileState::Remote { digest, .. } => {
                hasher.input_str("f").input_str(&digest.hex).input_u64(digest.size);
            }
        }
    }
}
