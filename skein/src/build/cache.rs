//! The on-disk action cache.
//!
//! Layout under the cache root:
//!   `ac/<xx>/<hex>.json` -- one JSON record per action key, mapping declared
//!   output paths to their metadata.
//!   `cas/<xx>/<hex>` -- content-addressed blobs, keyed by hex digest.
//!
//! Writers take an OS-level lock file next to the record and land content
//! with a temp-file rename, so concurrent skein processes sharing one cache
//! never observe torn records. Stale locks from crashed holders are broken
//! after a timeout.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};
use walkdir::WalkDir;

use skein_data::{Digest, FileState, HashFunction};
use skein_data::file::StatProxy;
use skein_data::Fingerprint;

const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    File,
    Tree,
    Symlink,
}

/// Serialized metadata of one action output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMeta {
    pub kind: OutputKind,
    /// Content digest; regular files only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub digest: Option<Digest>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub symlink_target: Option<String>,
    /// Tree outputs: child path (relative to the tree root) to digest.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub children: BTreeMap<String, Digest>,
}

impl OutputMeta {
    pub fn file(digest: Digest) -> OutputMeta {
        OutputMeta { kind: OutputKind::File, digest: Some(digest), symlink_target: None, children: BTreeMap::new() }
    }

    pub fn symlink(target: String) -> OutputMeta {
        OutputMeta { kind: OutputKind::Symlink, digest: None, symlink_target: Some(target), children: BTreeMap::new() }
    }

    pub fn tree(children: BTreeMap<String, Digest>) -> OutputMeta {
        OutputMeta { kind: OutputKind::Tree, digest: None, symlink_target: None, children }
    }

    /// The file state this metadata describes, independent of disk.
    pub fn as_remote_state(&self, expires_at_millis: Option<u64>) -> Option<FileState> {
        match self.kind {
            OutputKind::File => self
                .digest
                .clone()
                .map(|digest| FileState::Remote { digest, expires_at_millis }),
            OutputKind::Symlink => self.symlink_target.clone().map(|t| FileState::Symlink {
                target: PathBuf::from(t),
                proxy: StatProxy { mtime_millis: 0, inode: 0 },
            }),
            OutputKind::Tree => None,
        }
    }
}

/// The record stored per action key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Exec-root-relative output path to its metadata.
    pub outputs: BTreeMap<String, OutputMeta>,
    pub timestamp_millis: u64,
}

pub struct DiskCache {
    root: PathBuf,
    hash: HashFunction,
}

impl DiskCache {
    pub fn open(root: PathBuf, hash: HashFunction) -> io::Result<DiskCache> {
        fs::create_dir_all(root.join("ac"))?;
        fs::create_dir_all(root.join("cas"))?;
        Ok(DiskCache { root, hash })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &Fingerprint) -> PathBuf {
        let hex = key.hex();
        self.root.join("ac").join(&hex[..2]).join(format!("{}.json", &hex[2..]))
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("cas").join(&digest.hex[..2]).join(&digest.hex[2..])
    }

    pub fn get(&self, key: &Fingerprint) -> io::Result<Option<ActionRecord>> {
        let path = self.record_path(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // A corrupt record is a miss, not a failure.
                warn!("dropping corrupt action cache record {}: {}", path.display(), e);
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    pub fn put(&self, key: &Fingerprint, record: &ActionRecord) -> io::Result<()> {
        let path = self.record_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _lock = IndexLock::acquire(&path)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        debug!("stored action record {}", key);
        Ok(())
    }

    pub fn put_blob(&self, bytes: &[u8]) -> io::Result<Digest> {
        let digest = Digest::of_bytes(self.hash, bytes);
        let path = self.blob_path(&digest);
        if path.exists() {
            return Ok(digest);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Blob writes take no lock; a random suffix keeps concurrent writers
        // of the same blob off each other's temp files.
        let tmp = path.with_extension(format!("tmp{:08x}", rand::random::<u32>()));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(digest)
    }

    pub fn get_blob(&self, digest: &Digest) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(digest)) {
            Ok(b) => Ok(Some(b)),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Number of stored action records.
    pub fn record_count(&self) -> usize {
        WalkDir::new(self.root.join("ac"))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.path().extension().map_or(false, |x| x == "json"))
            .count()
    }

    /// Drops every record and blob.
    pub fn clear(&self) -> io::Result<()> {
        for sub in ["ac", "cas"].iter() {
            let dir = self.root.join(sub);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Exclusive lock on one index record, held for the guard's lifetime.
///
/// Creation-exclusive lock files rather than flock keep the cache usable on
/// filesystems without advisory locking (network mounts included).
struct IndexLock {
    path: PathBuf,
}

impl IndexLock {
    fn acquire(record: &Path) -> io::Result<IndexLock> {
        let path = record.with_extension("lock");
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(IndexLock { path }),
                Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!("breaking stale cache lock {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => match SystemTime::now().duration_since(modified) {
            Ok(age) => age > LOCK_STALE_AFTER,
            Err(_) => false,
        },
        Err(_) => false,
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
