//! In-memory run records, keyed by run id.
//!
//! Records live for the lifetime of the process. Every merge happens under a
//! single lock, so concurrent updates to one run never interleave.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use tracing::debug;
use uuid::Uuid;

use crate::core::errors::RunNotFoundError;
use crate::core::run::{RunPatch, RunRecord, RunStatus, validate_transition};

pub trait RunStore: Send + Sync {
    fn get(&self, run_id: &str) -> Result<RunRecord>;

    /// Insert a new record. An id that is already stored is an error.
    fn put(&self, record: RunRecord) -> Result<()>;

    /// Merge `patch` into an existing record and return the result.
    fn update(&self, run_id: &str, patch: RunPatch) -> Result<RunRecord>;

    /// Move a run to `to` if its current status allows it, merging `patch` in
    /// the same step.
    fn transition(&self, run_id: &str, to: RunStatus, patch: RunPatch) -> Result<RunRecord>;

    /// All records, oldest first.
    fn list(&self) -> Result<Vec<RunRecord>>;
}

#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<String, RunRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, RunRecord>>> {
        self.runs
            .lock()
            .map_err(|_| anyhow!("run store lock poisoned"))
    }
}

fn not_found(run_id: &str) -> anyhow::Error {
    RunNotFoundError {
        run_id: run_id.to_string(),
    }
    .into()
}

impl RunStore for InMemoryRunStore {
    fn get(&self, run_id: &str) -> Result<RunRecord> {
        self.lock()?
            .get(run_id)
            .cloned()
            .ok_or_else(|| not_found(run_id))
    }

    fn put(&self, record: RunRecord) -> Result<()> {
        debug!(run_id = %record.run_id, status = record.status.as_str(), "storing run");
        let mut runs = self.lock()?;
        if runs.contains_key(&record.run_id) {
            return Err(anyhow!("run {} already exists", record.run_id));
        }
        runs.insert(record.run_id.clone(), record);
        Ok(())
    }

    fn update(&self, run_id: &str, patch: RunPatch) -> Result<RunRecord> {
        let mut runs = self.lock()?;
        let record = runs.get_mut(run_id).ok_or_else(|| not_found(run_id))?;
        record.apply(patch);
        Ok(record.clone())
    }

    fn transition(&self, run_id: &str, to: RunStatus, patch: RunPatch) -> Result<RunRecord> {
        let mut runs = self.lock()?;
        let record = runs.get_mut(run_id).ok_or_else(|| not_found(run_id))?;
        validate_transition(run_id, record.status, to)?;
        debug!(run_id, from = record.status.as_str(), to = to.as_str(), "run transition");
        record.apply(RunPatch {
            status: Some(to),
            ..patch
        });
        Ok(record.clone())
    }

    fn list(&self) -> Result<Vec<RunRecord>> {
        let mut records: Vec<RunRecord> = self.lock()?.values().cloned().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(records)
    }
}

/// Fresh run id from a random v4 UUID.
pub fn new_run_id() -> String {
    format!("run-{}", Uuid::new_v4().simple())
}
