//! Serial worker owning all filesystem work of one durable store.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::layout::{hash_key, DiskEntry, Layout, Metadata};
use crate::cache::ticket::Resolver;
use crate::cache::{prune_target, CacheKey, CacheStats, EvictionReport};
use crate::clock::Clock;
use crate::error::Result;

/// Work queued for the worker. Each carries the channel its answer goes to.
pub(super) enum Command {
    Store {
        key: CacheKey,
        payload: Vec<u8>,
        ttl: Duration,
        reply: Resolver<()>,
    },
    Exists {
        key: CacheKey,
        reply: std_mpsc::SyncSender<bool>,
    },
    Fetch {
        key: CacheKey,
        reply: Resolver<Option<Vec<u8>>>,
    },
    Remove {
        key: CacheKey,
        reply: Resolver<bool>,
    },
    RemoveGroup {
        group: String,
        reply: Resolver<usize>,
    },
    RemoveExpired {
        reply: Resolver<usize>,
    },
    Prune {
        reply: Resolver<EvictionReport>,
    },
    Clear {
        reply: Resolver<()>,
    },
    Flush {
        reply: Resolver<()>,
    },
}

/// State readable from the store handle without going through the queue.
/// Only the worker writes it.
#[derive(Debug, Default)]
pub(super) struct Shared {
    pub size_bytes: AtomicU64,
    pub entry_count: AtomicUsize,
    pub stats: Mutex<CacheStats>,
}

impl Shared {
    pub fn size(&self) -> u64 {
        self.size_bytes.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.set_occupancy(self.entry_count.load(Ordering::Acquire), self.size());
        stats
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

pub(super) struct Worker {
    layout: Layout,
    shared: Arc<Shared>,
    max_size_bytes: u64,
    clock: Arc<dyn Clock>,
    prune_pending: bool,
}

impl Worker {
    pub fn new(
        layout: Layout,
        shared: Arc<Shared>,
        max_size_bytes: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            layout,
            shared,
            max_size_bytes,
            clock,
            prune_pending: false,
        }
    }

    // == Recovery ==
    /// Restores the running size at startup.
    ///
    /// The directory scan is authoritative; `metadata.json` is rewritten if it
    /// disagrees or is missing.
    pub fn recover(&mut self) -> Result<()> {
        let stray = self.layout.remove_stray_temp_files()?;
        if stray > 0 {
            warn!(count = stray, "Removed partially written cache files");
        }

        let recorded = self.layout.read_metadata().map(|m| m.size);
        let entries = self.layout.scan()?;
        let scanned: u64 = entries.iter().map(|e| e.size_bytes).sum();

        self.shared.entry_count.store(entries.len(), Ordering::Release);
        self.set_size(scanned);

        if recorded != Some(scanned) {
            if let Some(recorded) = recorded {
                warn!(
                    recorded_bytes = recorded,
                    scanned_bytes = scanned,
                    "Cache metadata out of date, using directory scan"
                );
            }
            self.persist_metadata()?;
        }

        info!(
            path = %self.layout.root().display(),
            entries = entries.len(),
            size_bytes = scanned,
            "Opened durable cache"
        );

        if self.size() > self.max_size_bytes {
            self.prune_pending = true;
        }
        Ok(())
    }

    // == Run Loop ==
    /// Processes commands until every sender is gone.
    pub fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            if self.prune_pending {
                self.prune_pending = false;
                if let Err(e) = self.prune() {
                    warn!(error = %e, "Scheduled prune failed");
                }
            }

            let Some(command) = commands.blocking_recv() else {
                break;
            };
            self.handle(command);
        }
        debug!(path = %self.layout.root().display(), "Durable cache worker stopped");
    }

    // Receivers may have gone away; their answers are simply dropped.
    fn handle(&mut self, command: Command) {
        match command {
            Command::Store {
                key,
                payload,
                ttl,
                reply,
            } => {
                let _ = reply.send(self.store(&key, &payload, ttl));
            }
            Command::Exists { key, reply } => {
                let exists = self.lookup(&key).unwrap_or_else(|e| {
                    warn!(key = %key, error = %e, "Existence check failed");
                    None
                });
                let _ = reply.send(exists.is_some());
            }
            Command::Fetch { key, reply } => {
                let _ = reply.send(self.fetch(&key));
            }
            Command::Remove { key, reply } => {
                let _ = reply.send(self.remove(&key));
            }
            Command::RemoveGroup { group, reply } => {
                let _ = reply.send(self.remove_matching(|entry| entry.in_group(&group)));
            }
            Command::RemoveExpired { reply } => {
                let _ = reply.send(self.remove_expired());
            }
            Command::Prune { reply } => {
                let _ = reply.send(self.prune());
            }
            Command::Clear { reply } => {
                let _ = reply.send(self.clear());
            }
            Command::Flush { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    // == Operations ==
    fn store(&mut self, key: &CacheKey, payload: &[u8], ttl: Duration) -> Result<()> {
        let name = hash_key(key.key());
        let previous = self.layout.inspect(&name)?;

        self.layout.write_sidecars(&name, ttl, key.group())?;
        self.layout.write_payload(&name, payload)?;

        let replaced = previous.as_ref().map_or(0, |e| e.size_bytes);
        self.set_size(self.size().saturating_sub(replaced) + payload.len() as u64);
        if previous.is_none() {
            self.shared.entry_count.fetch_add(1, Ordering::AcqRel);
        }
        if self.size() > self.max_size_bytes {
            self.prune_pending = true;
        }
        self.persist_metadata()?;

        debug!(key = %key, size_bytes = payload.len(), cache_bytes = self.size(), "Stored item");
        Ok(())
    }

    /// The live entry for `key`: present, in the requested group, not expired.
    fn lookup(&self, key: &CacheKey) -> Result<Option<DiskEntry>> {
        let now = self.clock.now();
        Ok(self
            .layout
            .inspect(&hash_key(key.key()))?
            .filter(|entry| entry.in_group(key.group()) && !entry.is_expired_at(now)))
    }

    fn fetch(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let payload = match self.lookup(key)? {
            Some(entry) => self.layout.read_payload(&entry.name)?,
            None => None,
        };

        self.shared.record(|stats| match payload {
            Some(_) => stats.record_hit(),
            None => stats.record_miss(),
        });
        Ok(payload)
    }

    fn remove(&mut self, key: &CacheKey) -> Result<bool> {
        let Some(entry) = self
            .layout
            .inspect(&hash_key(key.key()))?
            .filter(|entry| entry.in_group(key.group()))
        else {
            return Ok(false);
        };

        self.delete(&entry)?;
        self.persist_metadata()?;
        Ok(true)
    }

    fn remove_matching(&mut self, matches: impl Fn(&DiskEntry) -> bool) -> Result<usize> {
        let doomed: Vec<DiskEntry> = self.layout.scan()?.into_iter().filter(|e| matches(e)).collect();

        let result = doomed.iter().try_for_each(|entry| self.delete(entry));
        if !doomed.is_empty() {
            self.persist_metadata()?;
        }
        result.map(|_| doomed.len())
    }

    fn remove_expired(&mut self) -> Result<usize> {
        let now = self.clock.now();
        let removed = self.remove_matching(|entry| entry.is_expired_at(now))?;
        self.shared.record(|stats| stats.record_expirations(removed));
        if removed > 0 {
            debug!(removed, cache_bytes = self.size(), "Removed expired items");
        }
        Ok(removed)
    }

    // == Prune ==
    /// Drops expired entries, then deletes the least recently modified
    /// payloads until the store is at or under half its capacity.
    fn prune(&mut self) -> Result<EvictionReport> {
        let entries = self.layout.scan()?;
        self.prune_entries(entries)
    }

    fn prune_entries(&mut self, entries: Vec<DiskEntry>) -> Result<EvictionReport> {
        let size_before = self.size();
        let now = self.clock.now();

        let (expired, mut remaining): (Vec<DiskEntry>, Vec<DiskEntry>) = entries
            .into_iter()
            .partition(|entry| entry.is_expired_at(now));

        let mut report = EvictionReport {
            size_before,
            ..Default::default()
        };
        remaining.sort_by(|a, b| a.modified_at.cmp(&b.modified_at).then_with(|| a.name.cmp(&b.name)));

        let result = self.evict(&expired, &remaining, &mut report);

        // Whatever was deleted before a failure stays deleted; record it.
        report.size_after = self.size();
        self.shared.record(|stats| {
            stats.record_expirations(report.expired);
            stats.record_evictions(report.evicted);
        });
        self.persist_metadata()?;
        result?;

        if report.removed_any() {
            info!(
                expired = report.expired,
                evicted = report.evicted,
                bytes_freed = report.bytes_freed,
                size_after = report.size_after,
                "Pruned durable cache"
            );
        }
        Ok(report)
    }

    /// Deletes every expired entry, then the oldest of `remaining` until the
    /// store is at or under the prune target. Stops at the first failure.
    fn evict(
        &mut self,
        expired: &[DiskEntry],
        remaining: &[DiskEntry],
        report: &mut EvictionReport,
    ) -> Result<()> {
        for entry in expired {
            self.delete(entry)?;
            report.expired += 1;
            report.bytes_freed += entry.size_bytes;
        }

        if self.size() > self.max_size_bytes {
            let target = prune_target(self.max_size_bytes);
            for entry in remaining {
                if self.size() <= target {
                    break;
                }
                self.delete(entry)?;
                report.evicted += 1;
                report.bytes_freed += entry.size_bytes;
            }
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.layout.wipe()?;
        self.shared.entry_count.store(0, Ordering::Release);
        self.set_size(0);
        self.persist_metadata()?;
        info!(path = %self.layout.root().display(), "Cleared durable cache");
        Ok(())
    }

    // == Accounting ==
    /// Deletes an entry's files and only then releases its bytes.
    fn delete(&mut self, entry: &DiskEntry) -> Result<()> {
        self.layout.remove_entry(&entry.name)?;
        self.set_size(self.size().saturating_sub(entry.size_bytes));
        // Never wraps below zero if files vanished behind the store's back.
        let _ = self
            .shared
            .entry_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        Ok(())
    }

    fn size(&self) -> u64 {
        self.shared.size()
    }

    fn set_size(&self, size: u64) {
        self.shared.size_bytes.store(size, Ordering::Release);
    }

    fn persist_metadata(&self) -> Result<()> {
        self.layout.write_metadata(&Metadata {
            size: self.size(),
            updated_at: Some(self.clock.now()),
        })
    }
}
