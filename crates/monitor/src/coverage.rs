use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::backend::CoverageBackend;
use crate::error::{MonitorError, Result};

/// Per-category count of files with a produced artifact
///
/// Fields are private so `processed + missing == total` and
/// `processed <= total` hold by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageEntry {
    category: String,
    processed: u64,
    missing: u64,
    total: u64,
}

impl CoverageEntry {
    /// `processed` is clamped to `total`
    pub fn new(category: impl Into<String>, processed: u64, total: u64) -> Self {
        let processed = processed.min(total);
        Self {
            category: category.into(),
            processed,
            missing: total - processed,
            total,
        }
    }

    /// Build from a backend record; None when the record lacks enough counts
    pub fn from_record(record: &CoverageRecord) -> Option<Self> {
        let (processed, total) = match (record.processed, record.missing, record.total) {
            (Some(processed), _, Some(total)) => (processed, total),
            (None, Some(missing), Some(total)) => (total.saturating_sub(missing), total),
            (Some(processed), Some(missing), None) => (processed, processed.saturating_add(missing)),
            _ => return None,
        };
        Some(Self::new(record.category.clone(), processed, total))
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn missing(&self) -> u64 {
        self.missing
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Share of processed files in percent; None for an empty population
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.processed as f64 / self.total as f64 * 100.0)
        }
    }
}

/// Coverage counts as reported by the backend; absent counts are unknown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub category: String,
    #[serde(default)]
    pub processed: Option<u64>,
    #[serde(default)]
    pub missing: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// Artifact categories present for one file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatusRecord {
    pub path: String,
    #[serde(default)]
    pub present: Vec<String>,
}

/// Locally cached per-file artifact status
#[derive(Debug, Clone, Default)]
pub struct FileStatusCache {
    files: HashMap<String, HashSet<String>>,
}

impl FileStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace what is known about `path`
    pub fn record<I, S>(&mut self, path: impl Into<String>, present: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files
            .insert(path.into(), present.into_iter().map(Into::into).collect());
    }

    /// Unknown files never count as present
    pub fn has(&self, path: &str, category: &str) -> bool {
        self.files
            .get(path)
            .map(|present| present.contains(category))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Coverage over an explicit file subset, computed from the local cache
pub fn scoped_coverage(
    scope: &BTreeSet<String>,
    cache: &FileStatusCache,
    categories: &[String],
) -> Vec<CoverageEntry> {
    let total = scope.len() as u64;
    categories
        .iter()
        .map(|category| {
            let processed = scope.iter().filter(|path| cache.has(path, category)).count() as u64;
            CoverageEntry::new(category.clone(), processed, total)
        })
        .collect()
}

struct LastCoverage {
    computed_at: Instant,
    scope: Option<BTreeSet<String>>,
    entries: Arc<Vec<CoverageEntry>>,
}

/// Computes coverage for the whole library or a file subset
///
/// The entry list is replaced wholesale on each computation. Within the
/// cooldown window a request for the same scope returns the last result
/// unless the caller forces recomputation.
pub struct CoverageAggregator {
    backend: Arc<dyn CoverageBackend>,
    categories: Vec<String>,
    cooldown: Duration,
    file_status: Mutex<FileStatusCache>,
    last: Mutex<Option<LastCoverage>>,
}

impl CoverageAggregator {
    pub fn new(backend: Arc<dyn CoverageBackend>, categories: Vec<String>, cooldown: Duration) -> Self {
        Self {
            backend,
            categories,
            cooldown,
            file_status: Mutex::new(FileStatusCache::new()),
            last: Mutex::new(None),
        }
    }

    pub async fn compute(&self, scope: Option<&BTreeSet<String>>, force: bool) -> Result<Arc<Vec<CoverageEntry>>> {
        if !force {
            if let Some(cached) = self.cached(scope) {
                debug!("Coverage within cooldown, reusing last result");
                return Ok(cached);
            }
        }

        let entries = match scope {
            None => {
                let records = self.backend.fetch_coverage().await?;
                let entries: Vec<CoverageEntry> = records.iter().filter_map(CoverageEntry::from_record).collect();
                if entries.len() < records.len() {
                    warn!(
                        "Dropped {} coverage record(s) without usable counts",
                        records.len() - entries.len()
                    );
                }
                entries
            }
            Some(scope) => {
                match self.refresh_file_status(scope).await {
                    Ok(_) => {}
                    Err(MonitorError::Capability(reason)) => debug!("Using cached artifact status: {}", reason),
                    Err(e) => warn!("Artifact status refresh failed, using cached status: {}", e),
                }
                self.compute_scoped(scope)
            }
        };

        let entries = Arc::new(entries);
        *lock(&self.last) = Some(LastCoverage {
            computed_at: Instant::now(),
            scope: scope.cloned(),
            entries: Arc::clone(&entries),
        });
        Ok(entries)
    }

    fn compute_scoped(&self, scope: &BTreeSet<String>) -> Vec<CoverageEntry> {
        let cache = lock(&self.file_status);
        scoped_coverage(scope, &cache, &self.categories)
    }

    /// Re-fetch artifact status for every file in `scope`
    ///
    /// Files the backend does not report keep whatever the cache knew.
    pub async fn refresh_file_status(&self, scope: &BTreeSet<String>) -> Result<usize> {
        if scope.is_empty() {
            return Ok(0);
        }
        let paths: Vec<String> = scope.iter().cloned().collect();
        let records = self.backend.fetch_file_status(&paths).await?;
        let mut cache = lock(&self.file_status);
        for record in &records {
            cache.record(record.path.clone(), record.present.iter().cloned());
        }
        debug!("Refreshed artifact status for {} of {} file(s)", records.len(), paths.len());
        Ok(records.len())
    }

    pub fn record_file_status<I, S>(&self, path: impl Into<String>, present: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.file_status).record(path, present);
    }

    /// Last computed result regardless of age
    pub fn last(&self) -> Option<Arc<Vec<CoverageEntry>>> {
        lock(&self.last).as_ref().map(|l| Arc::clone(&l.entries))
    }

    fn cached(&self, scope: Option<&BTreeSet<String>>) -> Option<Arc<Vec<CoverageEntry>>> {
        let last = lock(&self.last);
        let last = last.as_ref()?;
        if last.scope.as_ref() == scope && last.computed_at.elapsed() < self.cooldown {
            Some(Arc::clone(&last.entries))
        } else {
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
