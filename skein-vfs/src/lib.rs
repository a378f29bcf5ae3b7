//! Filesystem view for the skein build tool.
//!
//! Turns raw filesystem state into `FileState` values the build graph can
//! depend on cheaply. All access goes through the `FileLoader` seam; the real
//! loader wraps `std::fs`, and `memory::MemoryLoader` backs tests.
//!
//! Digests are computed lazily and cached next to the stat that produced
//! them: a cached digest is reused only while the (size, mtime, inode) proxy
//! still matches, so a modified file always gets re-digested.

#![warn(rust_2018_idioms)]

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use log::trace;

use skein_data::{ContentHasher, Digest, FileKind, FileState, HashFunction};
use skein_data::file::StatProxy;

pub mod memory;
pub mod scan;

pub use crate::scan::{StatSweepScanner, WorkspaceScanner};

/// One directory child, as reported by `list_dir`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// The seam between the build and the operating system.
///
/// `stat` never reads file content. `digest_hint` is the optional fast path
/// for platforms that store precomputed checksums out of band (e.g. in
/// xattrs); the default has none.
pub trait FileLoader: Send + Sync + 'static {
    fn stat(&self, path: &Path) -> io::Result<FileState>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Children of a directory, sorted by name.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;
    fn digest_hint(&self, _path: &Path) -> Option<Digest> {
        None
    }
}

/// `FileLoader` over the real filesystem.
pub struct RealFileLoader;

impl FileLoader for RealFileLoader {
    fn stat(&self, path: &Path) -> io::Result<FileState> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileState::Absent),
            Err(e) => return Err(e),
        };
        let proxy = proxy_of(&meta);
        if meta.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            return Ok(FileState::Symlink { target, proxy });
        }
        if meta.is_dir() {
            return Ok(FileState::Directory { proxy });
        }
        Ok(FileState::Regular { size: meta.len(), proxy, digest: None })
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let kind = if file_type.is_symlink() {
                FileKind::Symlink
            } else if file_type.is_dir() {
                FileKind::Directory
            } else {
                FileKind::Regular
            };
            entries.push(DirEntry { name: entry.file_name().to_string_lossy().into_owned(), kind });
        }
        entries.sort();
        Ok(entries)
    }
}

fn proxy_of(meta: &fs::Metadata) -> StatProxy {
    let mtime_millis = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    StatProxy { mtime_millis, inode: inode_of(meta) }
}

#[cfg(unix)]
fn inode_of(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &fs::Metadata) -> u64 {
    0
}

#[derive(Clone)]
struct CachedDigest {
    size: u64,
    proxy: StatProxy,
    digest: Digest,
}

/// The filesystem view. Owns a loader and the lazy digest cache.
pub struct Vfs<L = RealFileLoader> {
    loader: L,
    hash: HashFunction,
    digests: Mutex<HashMap<PathBuf, CachedDigest>>,
}

impl Vfs<RealFileLoader> {
    pub fn new(hash: HashFunction) -> Vfs<RealFileLoader> {
        Vfs::with_loader(RealFileLoader, hash)
    }
}

impl<L: FileLoader> Vfs<L> {
    pub fn with_loader(loader: L, hash: HashFunction) -> Vfs<L> {
        Vfs { loader, hash, digests: Mutex::new(HashMap::new()) }
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Stats a path. A previously computed digest is attached when the stat
    /// proxy still matches it.
    pub fn stat(&self, path: &Path) -> io::Result<FileState> {
        let state = self.loader.stat(path)?;
        if let FileState::Regular { size, proxy, .. } = state {
            let digests = self.digests.lock().unwrap();
            if let Some(cached) = digests.get(path) {
                if cached.size == size && cached.proxy == proxy {
                    return Ok(FileState::Regular {
                        size,
                        proxy,
                        digest: Some(cached.digest.clone()),
                    });
                }
            }
        }
        Ok(state)
    }

    /// Stats a path and, for regular files, computes the content digest.
    pub fn stat_with_digest(&self, path: &Path) -> io::Result<FileState> {
        let state = self.stat(path)?;
        match state {
            FileState::Regular { size, proxy, digest: None } => {
                let digest = self.compute_digest(path, size, proxy)?;
                Ok(FileState::Regular { size, proxy, digest: Some(digest) })
            }
            other => Ok(other),
        }
    }

    /// Content digest of a regular file; errors on any other kind.
    pub fn digest(&self, path: &Path) -> io::Result<Digest> {
        match self.stat_with_digest(path)? {
            FileState::Regular { digest: Some(d), .. } => Ok(d),
            FileState::Absent => {
                Err(io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display())))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a {:?}, not a regular file", path.display(), other.kind()),
            )),
        }
    }

    pub fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.loader.read(path)
    }

    pub fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        self.loader.list_dir(path)
    }

    fn compute_digest(&self, path: &Path, size: u64, proxy: StatProxy) -> io::Result<Digest> {
        if let Some(hint) = self.loader.digest_hint(path) {
            if hint.function == self.hash && hint.size == size {
                trace!("digest hint hit for {}", path.display());
                self.digests.lock().unwrap().insert(
                    path.to_owned(),
                    CachedDigest { size, proxy, digest: hint.clone() },
                );
                return Ok(hint);
            }
        }
        let bytes = self.loader.read(path)?;
        let mut hasher = ContentHasher::new(self.hash);
        hasher.input_raw(&bytes);
        let digest = hasher.finish_digest();
        self.digests
            .lock()
            .unwrap()
            .insert(path.to_owned(), CachedDigest { size, proxy, digest: digest.clone() });
        Ok(digest)
    }

    /// Forgets cached digests for the given paths (e.g. after they were
    /// reported changed). Unknown paths are ignored.
    pub fn forget(&self, paths: &[PathBuf]) {
        let mut digests = self.digests.lock().unwrap();
        for path in paths {
            digests.remove(path);
        }
    }

    pub fn clear(&self) {
        self.digests.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    #[test]
    fn stat_and_digest_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.txt");
        fs::write(&file, b"hi\n").unwrap();

        let vfs = Vfs::new(HashFunction::Sha256);
        match vfs.stat(&file).unwrap() {
            FileState::Regular { size, digest, .. } => {
                assert_eq!(size, 3);
                assert!(digest.is_none());
            }
            other => panic!("unexpected state {:?}", other),
        }
        let digest = vfs.digest(&file).unwrap();
        assert_eq!(digest, Digest::of_bytes(HashFunction::Sha256, b"hi\n"));

        // The digest is now cached and attached by plain stats.
        match vfs.stat(&file).unwrap() {
            FileState::Regular { digest: Some(d), .. } => assert_eq!(d, digest),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn modified_file_is_redigested() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.txt");
        fs::write(&file, b"one").unwrap();

        let vfs = Vfs::new(HashFunction::Sha256);
        let first = vfs.digest(&file).unwrap();

        // Rewrite with different content and a different length so the stat
        // proxy is guaranteed to differ even on coarse clocks.
        let mut f = fs::OpenOptions::new().write(true).truncate(true).open(&file).unwrap();
        f.write_all(b"three!").unwrap();
        drop(f);

        let second = vfs.digest(&file).unwrap();
        assert_ne!(first, second);
        assert_eq!(second, Digest::of_bytes(HashFunction::Sha256, b"three!"));
    }

    #[test]
    fn absent_paths_stat_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = Vfs::new(HashFunction::Sha256);
        assert_eq!(vfs.stat(&dir.path().join("nope")).unwrap(), FileState::Absent);
    }

    #[test]
    fn listings_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), b"").unwrap();
        fs::write(dir.path().join("a.txt"), b"").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let vfs = Vfs::new(HashFunction::Sha256);
        let entries = vfs.list_dir(dir.path()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(entries[2].kind, FileKind::Directory);
    }
}
