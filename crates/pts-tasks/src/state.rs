//! # Job State
//!
//! The logical state of one job run: which task started it, the events
//! raised so far, and the tasks already processed. Persisted into a
//! [`RunningJob`] storage record after every task boundary so a crashed job
//! can be reconstructed and continued.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use pts_shared::models::RunningJob;
use pts_shared::storage::Storage;
use pts_shared::{PtsError, PtsResult};

use crate::events::Event;

/// Serialized shape of the `state` column of a running-job record.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    events: Vec<Event>,
    processed_tasks: Vec<String>,
}

/// The current state of a running job.
#[derive(Debug, Clone)]
pub struct JobState {
    pub job_id: Uuid,
    pub initial_task_name: String,
    pub additional_parameters: Option<Value>,
    pub events: Vec<Event>,
    pub processed_tasks: Vec<String>,
    pub is_complete: bool,
}

impl JobState {
    pub fn new(initial_task_name: &str) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            initial_task_name: initial_task_name.to_string(),
            additional_parameters: None,
            events: Vec::new(),
            processed_tasks: Vec::new(),
            is_complete: false,
        }
    }

    /// Reconstruct the logical state from its storage record.
    pub fn from_running_job(record: &RunningJob) -> PtsResult<Self> {
        let state: PersistedState = serde_json::from_value(record.state.clone())
            .map_err(|e| PtsError::Storage(format!("corrupt job state: {e}")))?;
        Ok(Self {
            job_id: record.id,
            initial_task_name: record.initial_task_name.clone(),
            additional_parameters: record.additional_parameters.clone(),
            events: state.events,
            processed_tasks: state.processed_tasks,
            is_complete: record.is_complete,
        })
    }

    fn to_running_job(&self) -> PtsResult<RunningJob> {
        let state = serde_json::to_value(PersistedState {
            events: self.events.clone(),
            processed_tasks: self.processed_tasks.clone(),
        })
        .map_err(|e| PtsError::Storage(format!("cannot serialize job state: {e}")))?;
        Ok(RunningJob {
            id: self.job_id,
            initial_task_name: self.initial_task_name.clone(),
            additional_parameters: self.additional_parameters.clone(),
            state,
            is_complete: self.is_complete,
        })
    }

    /// Record a task as processed, folding its raised events into the log.
    pub fn add_processed_task(&mut self, task_name: &str, raised_events: Vec<Event>) {
        self.events.extend(raised_events);
        self.processed_tasks.push(task_name.to_string());
    }

    pub fn is_processed(&self, task_name: &str) -> bool {
        self.processed_tasks.iter().any(|name| name == task_name)
    }

    /// Events whose names appear in the given dependency list.
    pub fn events_for(&self, depends_on: &[String]) -> Vec<Event> {
        self.events
            .iter()
            .filter(|event| depends_on.iter().any(|dep| *dep == event.name))
            .cloned()
            .collect()
    }

    /// Checkpoint to persistent storage.
    pub async fn save(&self, storage: &dyn Storage) -> PtsResult<()> {
        storage.save_running_job(self.to_running_job()?).await
    }

    /// Seal the job and persist the final state.
    pub async fn finish(&mut self, storage: &dyn Storage) -> PtsResult<()> {
        self.is_complete = true;
        self.save(storage).await
    }
}
