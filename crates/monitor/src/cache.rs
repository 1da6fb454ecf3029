use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::job::{Job, JobId};
use crate::status::CanonicalStatus;

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    job: Job,
    /// Order in which the id was first seen, for stable tie-breaking
    seq: u64,
}

/// In-memory working set of the current job population, keyed by id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobCache {
    entries: HashMap<JobId, Entry>,
    next_seq: u64,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.entries.get(id).map(|e| &e.job)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.entries.contains_key(id)
    }

    /// Insert or replace a job; returns false when the stored job was already identical
    pub fn upsert(&mut self, job: Job) -> bool {
        match self.entries.get_mut(&job.id) {
            Some(entry) if entry.job == job => false,
            Some(entry) => {
                entry.job = job;
                true
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.entries.insert(job.id.clone(), Entry { job, seq });
                true
            }
        }
    }

    /// Drop every job whose id is not in `keep`, returning the dropped jobs in display order
    pub fn prune(&mut self, keep: &HashSet<JobId>) -> Vec<Job> {
        let doomed: Vec<JobId> = self
            .ordered_ids()
            .into_iter()
            .filter(|id| !keep.contains(id))
            .collect();

        doomed
            .iter()
            .filter_map(|id| self.entries.remove(id).map(|e| e.job))
            .collect()
    }

    /// Iterate in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.entries.values().map(|e| &e.job)
    }

    /// Jobs in presentation order: running, then queued, then the rest;
    /// within a class the most recently touched first
    pub fn ordered(&self) -> Vec<&Job> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by(|a, b| presentation_order(a, b));
        entries.into_iter().map(|e| &e.job).collect()
    }

    pub fn ordered_ids(&self) -> Vec<JobId> {
        self.ordered().into_iter().map(|j| j.id.clone()).collect()
    }

    pub fn has_active(&self) -> bool {
        self.iter().any(Job::is_active)
    }

    pub fn count_by_status(&self, status: CanonicalStatus) -> usize {
        self.iter().filter(|j| j.canonical_status == status).count()
    }
}

fn presentation_order(a: &Entry, b: &Entry) -> Ordering {
    b.job
        .canonical_status
        .priority()
        .cmp(&a.job.canonical_status.priority())
        // None sorts below any timestamp, so reversing puts unknown times last
        .then_with(|| b.job.freshest_time().cmp(&a.job.freshest_time()))
        .then_with(|| a.seq.cmp(&b.seq))
}
