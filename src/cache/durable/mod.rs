//! Durable Store Module
//!
//! Disk-backed cache with the same contract as the memory store. Payloads,
//! TTLs and groups live in sibling files under the storage directory; the
//! running size is persisted to `metadata.json` after every mutation.
//!
//! All filesystem work for one store runs on a single named worker thread,
//! in submission order. Operations return a [`Ticket`] immediately, except
//! [`DurableStore::exists`] which waits for the worker's answer.
//!
//! A key lives in at most one group: the payload file is named after the key
//! alone, so storing a key under a new group supersedes the old one, and
//! lookups under any other group report it absent.

mod layout;
mod worker;

use std::path::{Path, PathBuf};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::cache::ticket::Resolver;
use crate::cache::{Cache, CacheKey, CacheStats, EvictionReport, Ticket};
use crate::clock::{Clock, SystemClock};
use crate::config::DurableStoreConfig;
use crate::error::{CacheError, Result};

use layout::{hash_key, Layout};
use worker::{Command, Shared, Worker};

// == Durable Store ==
pub struct DurableStore {
    config: DurableStoreConfig,
    layout: Layout,
    shared: Arc<Shared>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    worker: Option<JoinHandle<()>>,
    open_error: Option<String>,
}

impl DurableStore {
    // == Constructor ==
    /// Opens (creating if needed) the store described by `config`.
    ///
    /// Never fails: if the storage directory is unusable the store is opened
    /// in an invalid state where every operation is a harmless no-op. Check
    /// [`DurableStore::is_valid`] to find out.
    pub fn open(config: DurableStoreConfig) -> Self {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`DurableStore::open`], reading time from `clock`.
    pub fn open_with_clock(config: DurableStoreConfig, clock: Arc<dyn Clock>) -> Self {
        let layout = Layout::new(&config.storage_path);
        let shared = Arc::new(Shared::default());
        let mut store = Self {
            config,
            layout,
            shared,
            commands: None,
            worker: None,
            open_error: None,
        };

        if let Err(e) = store.start(clock) {
            error!(
                path = %store.config.storage_path.display(),
                error = %e,
                "Durable cache unavailable"
            );
            store.open_error = Some(e.to_string());
        }
        store
    }

    fn start(&mut self, clock: Arc<dyn Clock>) -> Result<()> {
        self.layout.prepare()?;

        let mut worker = Worker::new(
            self.layout.clone(),
            Arc::clone(&self.shared),
            self.config.max_size_bytes,
            clock,
        );
        worker
            .recover()
            .map_err(|e| CacheError::InvalidStore(format!("Cannot recover cache state: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = std::thread::Builder::new()
            .name(self.config.worker_name())
            .spawn(move || worker.run(rx))
            .map_err(|e| CacheError::InvalidStore(format!("Cannot start cache worker: {}", e)))?;

        debug!(worker = %self.config.worker_name(), "Durable cache worker started");
        self.commands = Some(tx);
        self.worker = Some(handle);
        Ok(())
    }

    /// Whether the storage directory was usable at open time.
    pub fn is_valid(&self) -> bool {
        self.open_error.is_none()
    }

    /// Why the store is invalid, if it is.
    pub fn open_error(&self) -> Option<&str> {
        self.open_error.as_deref()
    }

    /// Directory holding the payload and sidecar files.
    pub fn storage_path(&self) -> &Path {
        &self.config.storage_path
    }

    /// Namespace the worker thread is named after.
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Where the payload for `key` is (or would be) stored.
    pub fn payload_path(&self, key: &str) -> PathBuf {
        self.layout.payload_path(&hash_key(key.trim()))
    }

    /// Queues a command, or resolves to `fallback` when there is no worker.
    ///
    /// If the worker has already gone the command is dropped with its
    /// resolver, which resolves the ticket with `WorkerStopped`.
    fn dispatch<T>(
        &self,
        fallback: impl FnOnce() -> Result<T>,
        build: impl FnOnce(Resolver<T>) -> Command,
    ) -> Ticket<T> {
        let Some(commands) = &self.commands else {
            return Ticket::ready(fallback());
        };

        let (resolver, ticket) = Ticket::pending();
        let _ = commands.send(build(resolver));
        ticket
    }

    fn unavailable(&self) -> CacheError {
        CacheError::InvalidStore(
            self.open_error
                .clone()
                .unwrap_or_else(|| "Cache worker is not running".to_string()),
        )
    }

    // == Store ==
    /// Writes `payload` under `key` in `group` for `ttl` (zero = forever).
    ///
    /// Returns at once; the ticket resolves once the payload, sidecars and
    /// size metadata are written. A prune, if needed, runs after that.
    pub fn store(&self, payload: Vec<u8>, key: &str, group: &str, ttl: Duration) -> Ticket<()> {
        let key = match CacheKey::parse(key, group) {
            Ok(key) => key,
            Err(e) => return Ticket::ready(Err(e)),
        };

        self.dispatch(
            || Err(self.unavailable()),
            |reply| Command::Store {
                key,
                payload,
                ttl,
                reply,
            },
        )
    }

    // == Exists ==
    /// Whether a non-expired entry exists. Blocks until the worker answers.
    pub fn exists(&self, key: &str, group: &str) -> bool {
        let (Some(commands), Ok(key)) = (&self.commands, CacheKey::parse(key, group)) else {
            return false;
        };

        let (reply, answer) = std_mpsc::sync_channel(1);
        if commands.send(Command::Exists { key, reply }).is_err() {
            return false;
        }
        answer.recv().unwrap_or(false)
    }

    // == Fetch ==
    /// Reads the payload of a non-expired entry.
    pub fn fetch(&self, key: &str, group: &str) -> Ticket<Option<Vec<u8>>> {
        let Ok(key) = CacheKey::parse(key, group) else {
            return Ticket::ready(Ok(None));
        };
        self.dispatch(|| Ok(None), |reply| Command::Fetch { key, reply })
    }

    // == Remove ==
    /// Deletes the entry's payload and sidecars if it is stored under `group`.
    ///
    /// Resolves to whether anything was removed. Removing an absent entry is
    /// not an error.
    pub fn remove(&self, key: &str, group: &str) -> Ticket<bool> {
        let Ok(key) = CacheKey::parse(key, group) else {
            return Ticket::ready(Ok(false));
        };
        self.dispatch(|| Ok(false), |reply| Command::Remove { key, reply })
    }

    /// Removes every entry whose group sidecar names `group`; an empty group
    /// targets ungrouped entries.
    pub fn remove_all_in_group(&self, group: &str) -> Ticket<usize> {
        let group = group.trim().to_string();
        self.dispatch(|| Ok(0), |reply| Command::RemoveGroup { group, reply })
    }

    /// Deletes every entry whose file time plus TTL has passed. Resolves to
    /// the number removed.
    pub fn remove_all_expired(&self) -> Ticket<usize> {
        self.dispatch(|| Ok(0), |reply| Command::RemoveExpired { reply })
    }

    // == Prune ==
    /// Drops expired entries and, if still over capacity, the least recently
    /// modified ones until at or under half capacity.
    pub fn prune(&self) -> Ticket<EvictionReport> {
        self.dispatch(|| Ok(EvictionReport::default()), |reply| Command::Prune { reply })
    }

    /// Deletes everything in the storage directory.
    pub fn clear(&self) -> Ticket<()> {
        self.dispatch(|| Ok(()), |reply| Command::Clear { reply })
    }

    /// Resolves once everything queued before it, including any prune it
    /// triggered, has finished.
    pub fn flush(&self) -> Ticket<()> {
        self.dispatch(|| Ok(()), |reply| Command::Flush { reply })
    }

    /// Tracked payload bytes, as of the last command the worker finished.
    pub fn size_in_bytes(&self) -> u64 {
        self.shared.size()
    }

    /// Capacity above which a store schedules a prune.
    pub fn max_size_in_bytes(&self) -> u64 {
        self.config.max_size_bytes
    }

    /// Counters plus current occupancy.
    pub fn stats(&self) -> CacheStats {
        self.shared.stats()
    }
}

impl Drop for DurableStore {
    /// Lets the worker drain its queue, then waits for it.
    fn drop(&mut self) {
        drop(self.commands.take());
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!(
                    path = %self.config.storage_path.display(),
                    "Durable cache worker panicked"
                );
            }
        }
    }
}

impl Cache for DurableStore {
    fn store(&self, payload: Vec<u8>, key: &str, group: &str, ttl: Duration) -> Ticket<()> {
        DurableStore::store(self, payload, key, group, ttl)
    }

    fn exists(&self, key: &str, group: &str) -> bool {
        DurableStore::exists(self, key, group)
    }

    fn fetch(&self, key: &str, group: &str) -> Ticket<Option<Vec<u8>>> {
        DurableStore::fetch(self, key, group)
    }

    fn remove(&self, key: &str, group: &str) -> Ticket<bool> {
        DurableStore::remove(self, key, group)
    }

    fn remove_all_in_group(&self, group: &str) -> Ticket<usize> {
        DurableStore::remove_all_in_group(self, group)
    }

    fn remove_all_expired(&self) -> Ticket<usize> {
        DurableStore::remove_all_expired(self)
    }

    fn clear(&self) -> Ticket<()> {
        DurableStore::clear(self)
    }

    fn flush(&self) -> Ticket<()> {
        DurableStore::flush(self)
    }

    fn size_in_bytes(&self) -> u64 {
        DurableStore::size_in_bytes(self)
    }

    fn max_size_in_bytes(&self) -> u64 {
        self.config.max_size_bytes
    }

    fn stats(&self) -> CacheStats {
        DurableStore::stats(self)
    }
}
