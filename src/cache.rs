//! Single-flight fetch cache
//!
//! [`SingleFlightFetchCache`] wraps a [`Fetcher`] so that at most one fetch per key
//! runs at any time. Concurrent callers asking for a key that is being fetched block
//! until that fetch settles and all of them observe its outcome. Outcomes are kept in
//! an [`EntryStore`]: successes as positive entries, failures as negative entries,
//! each kind with its own [`MaxAge`].
//!
//! Two stores are provided:
//! - [`MemoryStore`]: a [`BoundedLru`] in memory
//! - [`DiskStore`]: one file per key in a cache directory, with a sibling marker file
//!   recording a failed fetch

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tracing::{debug, trace, warn};

use crate::error::{CacheError, FetchError, InitializationError};
use crate::lru::BoundedLru;

/// Freshness limit for one kind of cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxAge {
    /// Never serve a stored entry; every request re-attempts the fetch
    Disabled,
    /// Entries never expire
    Unlimited,
    /// Entries expire once they are at least this old
    Limited(Duration),
}

impl MaxAge {
    pub fn is_expired(&self, age: Duration) -> bool {
        match self {
            MaxAge::Disabled => true,
            MaxAge::Unlimited => false,
            MaxAge::Limited(max) => age >= *max,
        }
    }

    /// `None` means unlimited, zero means disabled
    pub fn from_secs(secs: Option<u64>) -> Self {
        match secs {
            None => MaxAge::Unlimited,
            Some(0) => MaxAge::Disabled,
            Some(secs) => MaxAge::Limited(Duration::from_secs(secs)),
        }
    }
}

/// Independent max-ages for positive and negative entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub max_age: MaxAge,
    pub negative_max_age: MaxAge,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_age: MaxAge::Unlimited,
            negative_max_age: MaxAge::Limited(Duration::from_secs(3600)),
        }
    }
}

/// A stored fetch outcome and the time it was recorded
#[derive(Debug, Clone)]
pub struct Entry<V> {
    pub outcome: Result<V, FetchError>,
    pub created: SystemTime,
}

impl<V> Entry<V> {
    pub fn new(outcome: Result<V, FetchError>) -> Self {
        Self {
            outcome,
            created: SystemTime::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed().unwrap_or(Duration::ZERO)
    }
}

/// Source of values for a [`SingleFlightFetchCache`]
pub trait Fetcher: Send + Sync {
    type Output: Clone + Send + Sync;

    fn fetch(&self, key: &str) -> Result<Self::Output, FetchError>;
}

impl<F, V> Fetcher for F
where
    F: Fn(&str) -> Result<V, FetchError> + Send + Sync,
    V: Clone + Send + Sync,
{
    type Output = V;

    fn fetch(&self, key: &str) -> Result<V, FetchError> {
        self(key)
    }
}

/// Storage backend for fetch outcomes
///
/// Stores are internally synchronized; the cache never holds its own locks while
/// calling `store`.
pub trait EntryStore<V>: Send + Sync {
    fn load(&self, key: &str) -> Option<Entry<V>>;

    fn store(&self, key: &str, outcome: &Result<V, FetchError>) -> Result<(), CacheError>;

    fn evict(&self, key: &str);

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests answered from a stored entry
    pub hits: u64,
    /// Requests that found no live entry
    pub misses: u64,
    /// Fetcher invocations
    pub fetches: u64,
    /// Fetches that ended in a failure
    pub failures: u64,
    /// Entries currently stored
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.fetches.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }
}

/// Keys being fetched, and settled outcomes not yet picked up by their waiters
struct PendingSet<V> {
    in_flight: HashMap<String, Flight>,
    settled: HashMap<u64, Settled<V>>,
    next_id: u64,
}

struct Flight {
    id: u64,
    waiters: usize,
}

struct Settled<V> {
    outcome: Result<V, FetchError>,
    waiters: usize,
}

impl<V: Clone> PendingSet<V> {
    fn new() -> Self {
        Self {
            in_flight: HashMap::new(),
            settled: HashMap::new(),
            next_id: 0,
        }
    }

    fn take_settled(&mut self, id: u64) -> Option<Result<V, FetchError>> {
        let settled = self.settled.get_mut(&id)?;
        settled.waiters -= 1;
        if settled.waiters == 0 {
            return self.settled.remove(&id).map(|s| s.outcome);
        }
        Some(settled.outcome.clone())
    }
}

/// Deduplicating, caching wrapper around a [`Fetcher`]
pub struct SingleFlightFetchCache<F, S>
where
    F: Fetcher,
{
    fetcher: F,
    store: S,
    policy: CachePolicy,
    pending: Mutex<PendingSet<F::Output>>,
    settled: Condvar,
    counters: Counters,
}

impl<F, S> SingleFlightFetchCache<F, S>
where
    F: Fetcher,
    S: EntryStore<F::Output>,
{
    pub fn new(fetcher: F, store: S, policy: CachePolicy) -> Self {
        Self {
            fetcher,
            store,
            policy,
            pending: Mutex::new(PendingSet::new()),
            settled: Condvar::new(),
            counters: Counters::default(),
        }
    }

    /// Return the value for `key`, fetching it if no live entry exists.
    ///
    /// Blocks while another thread fetches the same key, then returns that fetch's
    /// outcome.
    pub fn resolve(&self, key: &str) -> Result<F::Output, FetchError> {
        if let Some(outcome) = self.lookup(key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return outcome;
        }

        let mut pending = self.lock_pending();
        let flight_id = pending.in_flight.get_mut(key).map(|flight| {
            flight.waiters += 1;
            flight.id
        });

        if let Some(id) = flight_id {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            trace!("waiting for pending fetch of '{}'", key);
            loop {
                if let Some(outcome) = pending.take_settled(id) {
                    return outcome;
                }
                pending = self
                    .settled
                    .wait(pending)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        // Nobody is fetching `key`, so nobody can be writing its entry either
        if let Some(outcome) = self.lookup_evicting(key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return outcome;
        }

        let id = pending.next_id;
        pending.next_id += 1;
        pending
            .in_flight
            .insert(key.to_string(), Flight { id, waiters: 0 });
        trace!("pending + '{}'", key);
        drop(pending);

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        let mut claim = Claim {
            cache: self,
            key,
            settled: false,
        };
        let outcome = self.fetch_and_store(key);
        claim.settle(outcome.clone());
        outcome
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            entries: self.store.len(),
        }
    }

    /// Drop every stored entry and reset the counters
    pub fn clear(&self) {
        let _pending = self.lock_pending();
        self.store.clear();
        self.counters.reset();
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    fn fetch_and_store(&self, key: &str) -> Result<F::Output, FetchError> {
        let outcome = match self.fetcher.fetch(key) {
            Ok(value) => match self.store.store(key, &Ok(value.clone())) {
                Ok(()) => Ok(value),
                Err(err) => {
                    warn!("storing fetched value for '{}' failed: {}", key, err);
                    Err(FetchError::from(err))
                }
            },
            Err(err) => Err(err),
        };

        if let Err(err) = &outcome {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            debug!("fetching '{}' failed: {}", key, err);
            if let Err(store_err) = self.store.store(key, &outcome) {
                warn!("recording failure for '{}' failed: {}", key, store_err);
            }
        }
        outcome
    }

    fn lookup(&self, key: &str) -> Option<Result<F::Output, FetchError>> {
        let entry = self.store.load(key)?;
        if self.is_expired(&entry) {
            return None;
        }
        trace!("'{}' from cache", key);
        Some(entry.outcome)
    }

    fn lookup_evicting(&self, key: &str) -> Option<Result<F::Output, FetchError>> {
        let entry = self.store.load(key)?;
        if self.is_expired(&entry) {
            debug!("cached entry for '{}' has expired", key);
            self.store.evict(key);
            return None;
        }
        Some(entry.outcome)
    }

    fn is_expired(&self, entry: &Entry<F::Output>) -> bool {
        let max_age = if entry.outcome.is_ok() {
            self.policy.max_age
        } else {
            self.policy.negative_max_age
        };
        max_age.is_expired(entry.age())
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingSet<F::Output>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ownership of a pending key; settles the flight even if the fetcher panics
struct Claim<'a, F, S>
where
    F: Fetcher,
    S: EntryStore<F::Output>,
{
    cache: &'a SingleFlightFetchCache<F, S>,
    key: &'a str,
    settled: bool,
}

impl<F, S> Claim<'_, F, S>
where
    F: Fetcher,
    S: EntryStore<F::Output>,
{
    fn settle(&mut self, outcome: Result<F::Output, FetchError>) {
        self.settled = true;
        let mut pending = self.cache.lock_pending();
        if let Some(flight) = pending.in_flight.remove(self.key)
            && flight.waiters > 0
        {
            pending.settled.insert(
                flight.id,
                Settled {
                    outcome,
                    waiters: flight.waiters,
                },
            );
        }
        trace!("pending - '{}'", self.key);
        drop(pending);
        self.cache.settled.notify_all();
    }
}

impl<F, S> Drop for Claim<'_, F, S>
where
    F: Fetcher,
    S: EntryStore<F::Output>,
{
    fn drop(&mut self) {
        if !self.settled {
            let key = self.key.to_string();
            self.settle(Err(FetchError::Transport {
                uri: key,
                details: "fetch aborted".to_string(),
            }));
        }
    }
}

/// In-memory store bounded by an LRU
pub struct MemoryStore<V> {
    entries: Mutex<BoundedLru<String, Entry<V>>>,
}

impl<V> MemoryStore<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BoundedLru::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoundedLru<String, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> EntryStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync,
{
    fn load(&self, key: &str) -> Option<Entry<V>> {
        self.lock().get(key).cloned()
    }

    fn store(&self, key: &str, outcome: &Result<V, FetchError>) -> Result<(), CacheError> {
        if let Some((evicted, _)) = self.lock().put(key.to_string(), Entry::new(outcome.clone())) {
            trace!("evicted '{}' from memory cache", evicted);
        }
        Ok(())
    }

    fn evict(&self, key: &str) {
        self.lock().remove(key);
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Cached file contents
pub type Bytes = Arc<Vec<u8>>;

const DATA_SUFFIX: &str = "xsd";
const ERROR_SUFFIX: &str = "error";

/// Persistent store: one data file per key plus a marker file for failures
///
/// Entry age is the file modification time, so entries survive restarts.
#[derive(Debug, Clone)]
pub struct DiskStore {
    directory: PathBuf,
}

impl DiskStore {
    /// Open `directory`, creating it if needed, and check that it is writable
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, InitializationError> {
        let directory = directory.into();
        if !directory.exists() {
            fs::create_dir_all(&directory).map_err(|e| {
                InitializationError::CacheDirectoryNotCreatable {
                    path: directory.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if !directory.is_dir() {
            return Err(InitializationError::CacheDirectoryNotUsable {
                path: directory,
                reason: "not a directory".to_string(),
            });
        }

        let probe = directory.join(format!(".write-test-{}", std::process::id()));
        fs::write(&probe, b"")
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|e| InitializationError::CacheDirectoryNotUsable {
                path: directory.clone(),
                reason: format!("not writable: {}", e),
            })?;

        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the data file for `key`
    pub fn data_path(&self, key: &str) -> PathBuf {
        self.directory.join(cache_file_name(key, DATA_SUFFIX))
    }

    /// Path of the failure marker for `key`
    pub fn marker_path(&self, key: &str) -> PathBuf {
        self.directory.join(cache_file_name(key, ERROR_SUFFIX))
    }

    fn load_marker(&self, key: &str, path: &Path) -> Option<Entry<Bytes>> {
        let created = fs::metadata(path).ok()?.modified().ok()?;
        let content = fs::read_to_string(path).unwrap_or_default();
        Some(Entry {
            outcome: Err(decode_marker(key, &content)),
            created,
        })
    }

    fn load_data(&self, key: &str, path: &Path) -> Option<Entry<Bytes>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("cannot open cached file for '{}': {}", key, e);
                return None;
            }
        };

        let read = || -> io::Result<(Vec<u8>, SystemTime)> {
            let _lock = FileLock::shared(&file)?;
            let created = file.metadata()?.modified()?;
            let mut data = Vec::new();
            (&file).read_to_end(&mut data)?;
            Ok((data, created))
        };
        match read() {
            Ok((data, created)) => Some(Entry {
                outcome: Ok(Arc::new(data)),
                created,
            }),
            Err(e) => {
                warn!("cannot read cached file for '{}': {}", key, e);
                None
            }
        }
    }

    fn write_data(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let path = self.data_path(key);
        let write = || -> io::Result<()> {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            let _lock = FileLock::exclusive(&file)?;
            file.set_len(0)?;
            (&file).write_all(data)?;
            (&file).flush()?;
            file.sync_all()
        };

        if let Err(e) = write() {
            // never leave a truncated file behind
            let _ = fs::remove_file(&path);
            return Err(CacheError::WriteError {
                key: key.to_string(),
                details: e.to_string(),
            });
        }
        remove_if_exists(&self.marker_path(key));
        Ok(())
    }

    fn write_marker(&self, key: &str, error: &FetchError) -> Result<(), CacheError> {
        remove_if_exists(&self.data_path(key));
        fs::write(self.marker_path(key), encode_marker(error)).map_err(|e| {
            CacheError::WriteError {
                key: key.to_string(),
                details: e.to_string(),
            }
        })
    }

    fn cache_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.directory) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some(DATA_SUFFIX) | Some(ERROR_SUFFIX)
                )
            })
            .collect()
    }
}

impl EntryStore<Bytes> for DiskStore {
    fn load(&self, key: &str) -> Option<Entry<Bytes>> {
        let marker = self.marker_path(key);
        if marker.exists() {
            return self.load_marker(key, &marker);
        }
        self.load_data(key, &self.data_path(key))
    }

    fn store(&self, key: &str, outcome: &Result<Bytes, FetchError>) -> Result<(), CacheError> {
        match outcome {
            Ok(data) => self.write_data(key, data),
            Err(error) => self.write_marker(key, error),
        }
    }

    fn evict(&self, key: &str) {
        remove_if_exists(&self.marker_path(key));
        remove_if_exists(&self.data_path(key));
    }

    fn clear(&self) {
        for path in self.cache_files() {
            remove_if_exists(&path);
        }
    }

    fn len(&self) -> usize {
        self.cache_files()
            .iter()
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some(DATA_SUFFIX))
            .count()
    }
}

/// File name for `key`: URI punctuation mapped to `_`, plus `.suffix`
pub fn cache_file_name(key: &str, suffix: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| match c {
            '.' | ':' | ';' | '?' | '&' | '=' | '"' | '\'' | '/' | '\\' => '_',
            c => c,
        })
        .collect();
    name.push('.');
    name.push_str(suffix);
    name
}

fn encode_marker(error: &FetchError) -> String {
    let detail = match error {
        FetchError::Timeout { .. } | FetchError::NotFound { .. } => "",
        FetchError::UnknownHost { host, .. } => host,
        FetchError::Transport { details, .. } => details,
    };
    format!("{}\n{}\n", error.kind(), detail)
}

fn decode_marker(key: &str, content: &str) -> FetchError {
    let mut lines = content.lines();
    let kind = lines.next().unwrap_or_default().trim();
    let detail = lines.next().unwrap_or_default().trim().to_string();
    let uri = key.to_string();
    match kind {
        "timeout" => FetchError::Timeout { uri },
        "unknown-host" => FetchError::UnknownHost { uri, host: detail },
        "not-found" => FetchError::NotFound { uri },
        "transport" => FetchError::Transport {
            uri,
            details: detail,
        },
        _ => FetchError::Transport {
            uri,
            details: "cached error condition detected".to_string(),
        },
    }
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!("cannot remove cache file {}: {}", path.display(), e);
    }
}

/// Advisory `flock` held for the guard's lifetime
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> io::Result<Self> {
        Self::acquire(file, true)
    }

    fn shared(file: &'a File) -> io::Result<Self> {
        Self::acquire(file, false)
    }

    #[cfg(unix)]
    fn acquire(file: &'a File, exclusive: bool) -> io::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let operation = if exclusive {
            libc::LOCK_EX
        } else {
            libc::LOCK_SH
        };
        // Safety: the descriptor is owned by `file`, which outlives the guard
        if unsafe { libc::flock(file.as_raw_fd(), operation) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { file })
    }

    #[cfg(not(unix))]
    fn acquire(file: &'a File, _exclusive: bool) -> io::Result<Self> {
        Ok(Self { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // Safety: see `acquire`
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// Keys currently held by a memory store, oldest first
pub fn stored_keys<V>(store: &MemoryStore<V>) -> Vec<String> {
    store
        .lock()
        .iter()
        .map(|(key, _)| key.clone())
        .collect()
}
