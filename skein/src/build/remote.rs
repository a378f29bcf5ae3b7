//! The remote caching contract.
//!
//! A remote backend is two pluggable stores: an action-result store mapping
//! action keys to output metadata, and a content-addressed blob store. The
//! transport is out of scope here; `InMemoryRemote` implements both traits
//! for tests and single-process setups, including entry expiry against an
//! injected clock.
//!
//! Remote execution is the same seam one level up: a `SpawnRunner`
//! implementation that ships the spawn spec to a worker instead of forking
//! locally, streaming status until the final result.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::warn;

use skein_data::{Digest, Fingerprint, HashFunction};

use crate::build::cache::OutputMeta;

/// Injected time source. Nothing in the build reads the system clock
/// directly; tests substitute `ManualClock`.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }
}

/// Settable clock for tests.
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> ManualClock {
        ManualClock { millis: AtomicU64::new(start_millis) }
    }

    pub fn advance(&self, delta_millis: u64) {
        self.millis.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// A cached action result as the remote side reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteActionResult {
    pub outputs: BTreeMap<String, OutputMeta>,
    /// Past this instant the entry (and its blobs) may be gone.
    pub expires_at_millis: Option<u64>,
}

/// `GetActionResult` / `UpdateActionResult` of the wire protocol.
pub trait RemoteActionStore: Send + Sync {
    fn get_action_result(&self, key: &Fingerprint) -> io::Result<Option<RemoteActionResult>>;
    fn put_action_result(&self, key: &Fingerprint, result: &RemoteActionResult) -> io::Result<()>;
}

/// `ReadBlob` / `WriteBlob` of the wire protocol. Digests are
/// `{hash_function, hex, size}` triples.
pub trait BlobStore: Send + Sync {
    fn read_blob(&self, digest: &Digest) -> io::Result<Option<Vec<u8>>>;
    fn write_blob(&self, bytes: &[u8]) -> io::Result<Digest>;
}

/// `Execute` of the wire protocol: run one action on a remote worker,
/// streaming intermediate status lines until the final result. Transports
/// implement this alongside `SpawnRunner`; none ships in this binary.
pub trait RemoteExecutor: Send + Sync {
    fn execute(
        &self,
        action_key: &Fingerprint,
        spawn: &crate::build::exec::SpawnRequest<'_>,
        on_status: &mut dyn FnMut(&str),
    ) -> io::Result<RemoteActionResult>;
}

/// A configured remote cache endpoint pair.
#[derive(Clone)]
pub struct RemoteCache {
    pub actions: Arc<dyn RemoteActionStore>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Process-local remote cache double with TTL semantics.
pub struct InMemoryRemote {
    clock: Arc<dyn Clock>,
    hash: HashFunction,
    /// TTL stamped onto stored entries; `None` stores without expiry.
    ttl_millis: Option<u64>,
    entries: Mutex<HashMap<String, RemoteActionResult>>,
    blobs: Mutex<HashMap<String, (Vec<u8>, Option<u64>)>>,
}

impl InMemoryRemote {
    pub fn new(clock: Arc<dyn Clock>, hash: HashFunction, ttl_millis: Option<u64>) -> InMemoryRemote {
        InMemoryRemote {
            clock,
            hash,
            ttl_millis,
            entries: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn into_cache(self) -> RemoteCache {
        let shared: Arc<InMemoryRemote> = Arc::new(self);
        let actions: Arc<dyn RemoteActionStore> = shared.clone();
        let blobs: Arc<dyn BlobStore> = shared;
        RemoteCache { actions, blobs }
    }

    /// Seeds an entry directly, as another builder would have uploaded it.
    pub fn seed(&self, key: &Fingerprint, outputs: BTreeMap<String, OutputMeta>, blobs: Vec<Vec<u8>>) {
        let expires_at_millis = self.ttl_millis.map(|ttl| self.clock.now_millis() + ttl);
        for bytes in blobs {
            let digest = Digest::of_bytes(self.hash, &bytes);
            self.blobs.lock().unwrap().insert(digest.hex.clone(), (bytes, expires_at_millis));
        }
        self.entries
            .lock()
            .unwrap()
            .insert(key.hex().to_owned(), RemoteActionResult { outputs, expires_at_millis });
    }

    /// Drops every blob while keeping action entries, simulating a remote
    /// that evicted content ahead of its index.
    pub fn drop_blobs(&self) {
        self.blobs.lock().unwrap().clear();
    }

    fn expired(&self, expires_at: Option<u64>) -> bool {
        match expires_at {
            Some(at) => self.clock.now_millis() >= at,
            None => false,
        }
    }
}

impl RemoteActionStore for InMemoryRemote {
    fn get_action_result(&self, key: &Fingerprint) -> io::Result<Option<RemoteActionResult>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key.hex())
            .filter(|e| !self.expired(e.expires_at_millis))
            .cloned())
    }

    fn put_action_result(&self, key: &Fingerprint, result: &RemoteActionResult) -> io::Result<()> {
        let mut stored = result.clone();
        if stored.expires_at_millis.is_none() {
            stored.expires_at_millis = self.ttl_millis.map(|ttl| self.clock.now_millis() + ttl);
        }
        self.entries.lock().unwrap().insert(key.hex().to_owned(), stored);
        Ok(())
    }
}

impl BlobStore for InMemoryRemote {
    fn read_blob(&self, digest: &Digest) -> io::Result<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs
            .get(&digest.hex)
            .filter(|(_, expires)| !self.expired(*expires))
            .map(|(bytes, _)| bytes.clone()))
    }

    fn write_blob(&self, bytes: &[u8]) -> io::Result<Digest> {
        let digest = Digest::of_bytes(self.hash, bytes);
        let expires = self.ttl_millis.map(|ttl| self.clock.now_millis() + ttl);
        self.blobs.lock().unwrap().insert(digest.hex.clone(), (bytes.to_vec(), expires));
        Ok(digest)
    }
}

/// Runs `f` with bounded exponential backoff on I/O errors.
pub fn with_retries<T>(
    what: &str,
    attempts: u32,
    base_delay: Duration,
    mut f: impl FnMut() -> io::Result<T>,
) -> io::Result<T> {
    let mut delay = base_delay;
    let mut tried = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                tried += 1;
                if tried >= attempts.max(1) {
                    return Err(e);
                }
                warn!("{} failed (attempt {}/{}): {}; retrying in {:?}", what, tried, attempts, e, delay);
                thread::sleep(delay);
                delay *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(ttl: Option<u64>) -> (Arc<ManualClock>, InMemoryRemote) {
        let clock = Arc::new(ManualClock::new(1_000));
        let remote = InMemoryRemote::new(clock.clone(), HashFunction::Sha256, ttl);
        (clock, remote)
    }

    #[test]
    fn entries_expire_with_the_clock() {
        let (clock, remote) = remote(Some(500));
        let key = Fingerprint("ab".repeat(32));
        remote.seed(&key, BTreeMap::new(), vec![b"blob".to_vec()]);
        assert!(remote.get_action_result(&key).unwrap().is_some());
        let digest = Digest::of_bytes(HashFunction::Sha256, b"blob");
        assert!(remote.read_blob(&digest).unwrap().is_some());

        clock.advance(500);
        assert!(remote.get_action_result(&key).unwrap().is_none());
        assert!(remote.read_blob(&digest).unwrap().is_none());
    }

    #[test]
    fn entries_without_ttl_never_expire() {
        let (clock, remote) = remote(None);
        let key = Fingerprint("cd".repeat(32));
        remote.seed(&key, BTreeMap::new(), vec![]);
        clock.advance(u64::from(u32::MAX));
        assert!(remote.get_action_result(&key).unwrap().is_some());
    }

    #[test]
    fn retries_back_off_then_surface() {
        let mut calls = 0;
        let result: io::Result<()> = with_retries("op", 3, Duration::from_millis(1), || {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::Other, "transient"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);

        let mut calls = 0;
        let result = with_retries("op", 3, Duration::from_millis(1), || {
            calls += 1;
            if calls < 2 {
                Err(io::Error::new(io::ErrorKind::Other, "transient"))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
    }
}
