use std::collections::HashSet;
use log::debug;
use serde::Serialize;

use crate::cache::JobCache;
use crate::error::{MonitorError, Result};
use crate::job::{Job, JobId, JobListResponse, JobRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Upserted,
    Removed,
}

/// One change between the cached job population and a fresh snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDelta {
    pub kind: DeltaKind,
    pub job: Job,
}

impl JobDelta {
    fn upserted(job: Job) -> Self {
        JobDelta { kind: DeltaKind::Upserted, job }
    }

    fn removed(job: Job) -> Self {
        JobDelta { kind: DeltaKind::Removed, job }
    }
}

/// Bring `cache` in line with `records` and return the minimal set of changes
///
/// Upserts come first in snapshot order, removals follow in display order.
/// The whole snapshot is validated before the cache is touched, so an error
/// leaves `cache` exactly as it was.
pub fn reconcile(cache: &mut JobCache, records: &[JobRecord]) -> Result<Vec<JobDelta>> {
    let mut fresh = Vec::with_capacity(records.len());
    let mut seen: HashSet<JobId> = HashSet::with_capacity(records.len());

    for record in records {
        let job = Job::from_record(record.clone())?;
        if !seen.insert(job.id.clone()) {
            return Err(MonitorError::Data(format!("duplicate job id {} in snapshot", job.id)));
        }
        fresh.push(job);
    }

    let mut deltas = Vec::new();
    for job in fresh {
        // Unchanged entries stay as they are
        if cache.get(&job.id) == Some(&job) {
            continue;
        }
        cache.upsert(job.clone());
        deltas.push(JobDelta::upserted(job));
    }

    deltas.extend(cache.prune(&seen).into_iter().map(JobDelta::removed));
    Ok(deltas)
}

/// Sole owner and mutator of the job cache
///
/// Snapshots are tagged with the generation at which their fetch was issued;
/// a snapshot that is not newer than the last applied one is discarded so a
/// late response can never overwrite a fresher view.
#[derive(Debug, Default)]
pub struct Reconciler {
    cache: JobCache,
    last_generation: Option<u64>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &JobCache {
        &self.cache
    }

    pub fn last_generation(&self) -> Option<u64> {
        self.last_generation
    }

    /// Apply a fetched snapshot; `Ok(None)` means it was stale and ignored
    pub fn apply(&mut self, generation: u64, response: &JobListResponse) -> Result<Option<Vec<JobDelta>>> {
        if let Some(last) = self.last_generation {
            if generation <= last {
                debug!(
                    "Discarding stale job snapshot (generation {} <= applied {})",
                    generation, last
                );
                return Ok(None);
            }
        }

        let deltas = reconcile(&mut self.cache, &response.jobs)?;
        self.last_generation = Some(generation);
        Ok(Some(deltas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::CanonicalStatus;
    use proptest::prelude::*;
    use serde_json::json;

    fn records(value: serde_json::Value) -> Vec<JobRecord> {
        serde_json::from_value(value).unwrap()
    }

    fn response(value: serde_json::Value) -> JobListResponse {
        JobListResponse { jobs: records(value), stats: None }
    }

    fn status_name() -> impl Strategy<Value = &'static str> {
        prop_oneof![
            Just("running"),
            Just("queued"),
            Just("pending"),
            Just("done"),
            Just("failed"),
            Just("canceled"),
            Just("mystery"),
        ]
    }

    fn snapshot() -> impl Strategy<Value = Vec<JobRecord>> {
        proptest::collection::btree_map(0u32..40, (status_name(), proptest::option::of(0u32..100)), 0..20)
            .prop_map(|jobs| {
                jobs.into_iter()
                    .map(|(id, (status, progress))| {
                        serde_json::from_value(json!({
                            "id": id,
                            "status": status,
                            "progress": progress,
                        }))
                        .unwrap()
                    })
                    .collect()
            })
    }

    #[test]
    fn test_scenario_completion_and_removal() {
        let mut cache = JobCache::new();
        reconcile(
            &mut cache,
            &records(json!([{"id": 1, "status": "running"}, {"id": 2, "status": "queued"}])),
        )
        .unwrap();

        let deltas = reconcile(&mut cache, &records(json!([{"id": 1, "status": "completed"}]))).unwrap();

        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].kind, DeltaKind::Upserted);
        assert_eq!(deltas[0].job.id.as_str(), "1");
        assert_eq!(deltas[0].job.canonical_status, CanonicalStatus::Completed);
        assert_eq!(deltas[1].kind, DeltaKind::Removed);
        assert_eq!(deltas[1].job.id.as_str(), "2");
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&JobId::from("1")));
    }

    #[test]
    fn test_malformed_snapshot_leaves_cache_untouched() {
        let mut cache = JobCache::new();
        reconcile(&mut cache, &records(json!([{"id": 1, "status": "running"}]))).unwrap();
        let before = cache.clone();

        let err = reconcile(
            &mut cache,
            &records(json!([{"id": 2, "status": "queued"}, {"status": "running"}])),
        )
        .unwrap_err();

        assert!(matches!(err, MonitorError::Data(_)));
        assert_eq!(cache, before);
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let mut cache = JobCache::new();
        let err = reconcile(
            &mut cache,
            &records(json!([{"id": 1, "status": "running"}, {"id": "1", "status": "done"}])),
        )
        .unwrap_err();
        assert!(matches!(err, MonitorError::Data(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stale_generation_is_discarded() {
        let mut reconciler = Reconciler::new();
        let newer = response(json!([{"id": 1, "status": "completed"}]));
        let older = response(json!([{"id": 1, "status": "running"}, {"id": 2, "status": "queued"}]));

        assert!(reconciler.apply(2, &newer).unwrap().is_some());
        assert!(reconciler.apply(1, &older).unwrap().is_none());

        let cache = reconciler.cache();
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get(&JobId::from("1")).map(|j| j.canonical_status),
            Some(CanonicalStatus::Completed)
        );
    }

    #[test]
    fn test_failed_apply_keeps_generation() {
        let mut reconciler = Reconciler::new();
        reconciler.apply(1, &response(json!([{"id": 1, "status": "running"}]))).unwrap();
        assert!(reconciler.apply(2, &response(json!([{"status": "running"}]))).is_err());
        assert_eq!(reconciler.last_generation(), Some(1));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Reconciling the same snapshot twice yields no changes the second time
        #[test]
        fn test_unchanged_snapshot_produces_no_deltas(snap in snapshot()) {
            let mut cache = JobCache::new();
            reconcile(&mut cache, &snap).unwrap();
            let deltas = reconcile(&mut cache, &snap).unwrap();
            prop_assert!(deltas.is_empty());
        }

        /// Dropping one id produces exactly one removal for that id
        #[test]
        fn test_missing_id_produces_single_removal(snap in snapshot(), pick in any::<prop::sample::Index>()) {
            prop_assume!(!snap.is_empty());
            let mut cache = JobCache::new();
            reconcile(&mut cache, &snap).unwrap();

            let victim = pick.index(snap.len());
            let victim_id = snap[victim].id.clone().unwrap();
            let mut smaller = snap.clone();
            smaller.remove(victim);

            let deltas = reconcile(&mut cache, &smaller).unwrap();
            prop_assert_eq!(deltas.len(), 1);
            prop_assert_eq!(deltas[0].kind, DeltaKind::Removed);
            prop_assert_eq!(&deltas[0].job.id, &victim_id);
            prop_assert!(!cache.contains(&victim_id));
        }

        /// After reconciliation the cache holds exactly the snapshot's ids
        #[test]
        fn test_cache_mirrors_snapshot(first in snapshot(), second in snapshot()) {
            let mut cache = JobCache::new();
            reconcile(&mut cache, &first).unwrap();
            reconcile(&mut cache, &second).unwrap();
            let expected: HashSet<JobId> = second.iter().filter_map(|r| r.id.clone()).collect();
            let actual: HashSet<JobId> = cache.iter().map(|j| j.id.clone()).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
