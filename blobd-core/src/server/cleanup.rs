use super::lock;
use crate::key::{BlobKey, JobId};
use crate::utils::{remove_file_if_exists, storage_location_path};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};

pub type ExpiryKey = (Option<JobId>, BlobKey);

/// Absolute expiry time of every locally cached transient blob.
pub type ExpiryTimes = Mutex<HashMap<ExpiryKey, Instant>>;

/// Periodically deletes transient blobs whose TTL has passed.
///
/// Deletions happen under the server's storage write lock, so a sweep never
/// races a GET that is streaming the same file.
pub struct TransientBlobCleanupTask {
    expiry_times: Arc<ExpiryTimes>,
    storage_lock: Arc<RwLock<()>>,
    storage_dir: PathBuf,
}

impl TransientBlobCleanupTask {
    pub fn new(
        expiry_times: Arc<ExpiryTimes>,
        storage_lock: Arc<RwLock<()>>,
        storage_dir: PathBuf,
    ) -> Self {
        Self {
            expiry_times,
            storage_lock,
            storage_dir,
        }
    }

    /// Runs the sweep every `period`, first one `period` from now.
    pub fn start(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(first_tick) = tokio::time::Instant::now().checked_add(period) else {
                tracing::error!("transient BLOB cleanup period {:?} is out of range", period);
                return;
            };
            let mut ticker = interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = self.run_once(Instant::now()).await;
                if removed > 0 {
                    tracing::debug!("transient BLOB cleanup removed {} expired entries", removed);
                }
            }
        })
    }

    /// Deletes every entry that expired at or before `now` and returns how
    /// many were removed. Entries whose file cannot be deleted stay in the
    /// map for the next sweep.
    pub async fn run_once(&self, now: Instant) -> usize {
        let candidates: Vec<ExpiryKey> = {
            let expiry_times = lock(&self.expiry_times);
            expiry_times
                .iter()
                .filter(|(_, expires_at)| **expires_at <= now)
                .map(|(entry, _)| *entry)
                .collect()
        };
        if candidates.is_empty() {
            return 0;
        }

        let _write = self.storage_lock.write().await;

        let mut removed = 0;
        for entry in candidates {
            // a GET may have refreshed the TTL before we got the lock
            let still_expired = lock(&self.expiry_times)
                .get(&entry)
                .is_some_and(|expires_at| *expires_at <= now);
            if !still_expired {
                continue;
            }

            let (job_id, key) = &entry;
            let local_file = storage_location_path(&self.storage_dir, job_id.as_ref(), key);
            match remove_file_if_exists(&local_file).await {
                Ok(()) => {
                    lock(&self.expiry_times).remove(&entry);
                    removed += 1;
                    tracing::debug!("removed expired transient BLOB {}", local_file.display());
                }
                Err(error) => {
                    tracing::warn!(
                        "failed to locally delete transient BLOB {}: {}",
                        local_file.display(),
                        error
                    );
                }
            }
        }

        removed
    }
}
