//! In-memory `FileLoader` for tests.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use skein_data::file::StatProxy;
use skein_data::{FileKind, FileState};

use crate::{DirEntry, FileLoader};

#[derive(Debug, Clone)]
enum Entry {
    File { bytes: Vec<u8>, mtime: u64 },
    Dir,
    Symlink { target: PathBuf },
}

/// A loader over a flat path map. Directories exist when added explicitly or
/// implied by a child.
#[derive(Default)]
pub struct MemoryLoader {
    entries: Mutex<BTreeMap<PathBuf, Entry>>,
}

impl MemoryLoader {
    pub fn new() -> MemoryLoader {
        MemoryLoader::default()
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) {
        self.add_file_at(path, bytes, 1);
    }

    /// Adds a file with an explicit mtime, letting tests change content
    /// "later" than an earlier version.
    pub fn add_file_at(&self, path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>, mtime: u64) {
        let path = path.into();
        self.add_parents(&path);
        self.entries
            .lock()
            .unwrap()
            .insert(path, Entry::File { bytes: bytes.into(), mtime });
    }

    pub fn add_dir(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.add_parents(&path);
        self.entries.lock().unwrap().insert(path, Entry::Dir);
    }

    pub fn add_symlink(&self, path: impl Into<PathBuf>, target: impl Into<PathBuf>) {
        let path = path.into();
        self.add_parents(&path);
        self.entries.lock().unwrap().insert(path, Entry::Symlink { target: target.into() });
    }

    pub fn remove(&self, path: &Path) {
        let mut entries = self.entries.lock().unwrap();
        let doomed: Vec<PathBuf> = entries
            .keys()
            .filter(|p| *p == path || p.starts_with(path))
            .cloned()
            .collect();
        for p in doomed {
            entries.remove(&p);
        }
    }

    fn add_parents(&self, path: &Path) {
        let mut entries = self.entries.lock().unwrap();
        let mut cur = path.parent();
        while let Some(dir) = cur {
            if dir.as_os_str().is_empty() {
                break;
            }
            entries.entry(dir.to_owned()).or_insert(Entry::Dir);
            cur = dir.parent();
        }
    }
}

impl FileLoader for MemoryLoader {
    fn stat(&self, path: &Path) -> io::Result<FileState> {
        let entries = self.entries.lock().unwrap();
        Ok(match entries.get(path) {
            None => FileState::Absent,
            Some(Entry::File { bytes, mtime }) => FileState::Regular {
                size: bytes.len() as u64,
                proxy: StatProxy { mtime_millis: *mtime, inode: 0 },
                digest: None,
            },
            Some(Entry::Dir) => {
                FileState::Directory { proxy: StatProxy { mtime_millis: 0, inode: 0 } }
            }
            Some(Entry::Symlink { target }) => FileState::Symlink {
                target: target.clone(),
                proxy: StatProxy { mtime_millis: 0, inode: 0 },
            },
        })
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(path) {
            Some(Entry::File { bytes, .. }) => Ok(bytes.clone()),
            Some(_) => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file")),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(path) {
            Some(Entry::Dir) => {}
            Some(_) => return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a directory")),
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory")),
        }
        let mut out = Vec::new();
        for (p, entry) in entries.iter() {
            if p.parent() == Some(path) {
                let kind = match entry {
                    Entry::File { .. } => FileKind::Regular,
                    Entry::Dir => FileKind::Directory,
                    Entry::Symlink { .. } => FileKind::Symlink,
                };
                out.push(DirEntry { name: p.file_name().unwrap().to_string_lossy().into_owned(), kind });
            }
        }
        out.sort();
        Ok(out)
    }
}
