//! # Job Engine
//!
//! A job runs the subset of registered tasks reachable from an initial
//! task, in stable topological order. Events raised by a task are
//! propagated to its direct successors; a task only executes when at least
//! one event it depends on has been raised (the initial task always runs).
//! The state is checkpointed after every task so a crashed job resumes at
//! the task following the last durable checkpoint.
//!
//! A single task failure never aborts the job: downstream tasks may still
//! have useful inputs from other predecessors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, instrument, warn};

use pts_shared::models::RunningJob;
use pts_shared::storage::Storage;
use pts_shared::{PtsError, PtsResult};

use crate::dag::Dag;
use crate::events::Event;
use crate::registry::{Task, TaskContext, TaskDefinition, TaskRegistry};
use crate::state::JobState;

/// Outcome of one task execution, used instead of unwinding for control
/// flow in the run loop.
#[derive(Debug)]
enum TaskOutcome {
    Ok,
    Failed(String),
}

struct TaskSlot {
    definition: TaskDefinition,
    task: Box<dyn Task>,
    event_received: bool,
}

impl std::fmt::Debug for TaskSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSlot")
            .field("definition", &self.definition)
            .field("event_received", &self.event_received)
            .finish_non_exhaustive()
    }
}

/// One run of interdependent tasks selected by an initial task.
#[derive(Debug)]
pub struct Job {
    dag: Dag<String>,
    slots: HashMap<String, TaskSlot>,
    state: JobState,
    storage: Arc<dyn Storage>,
    /// Per-task deadline; expiry counts as a task failure.
    task_deadline: Duration,
}

impl Job {
    /// Build a job from the full task DAG, pruned to the initial task and
    /// everything reachable from it. The initial task is flagged as having
    /// received an event so it always executes.
    pub fn new(
        registry: &TaskRegistry,
        storage: Arc<dyn Storage>,
        initial_task_name: &str,
        task_deadline: Duration,
    ) -> PtsResult<Self> {
        let initial = registry.get(initial_task_name).ok_or_else(|| {
            PtsError::Configuration(format!("unknown initial task {initial_task_name}"))
        })?;

        let mut dag = registry.build_dag()?;
        let initial_name = initial.name().to_string();
        let reachable = dag
            .nodes_reachable_from(&initial_name)
            .map_err(|e| PtsError::Configuration(format!("task graph: {e}")))?;

        for name in dag.nodes() {
            if name != initial_name && !reachable.contains(&name) {
                dag.remove_node(&name)
                    .map_err(|e| PtsError::Configuration(format!("task graph: {e}")))?;
            }
        }

        let mut slots = HashMap::new();
        for name in dag.nodes() {
            let definition = registry
                .get(&name)
                .ok_or_else(|| PtsError::Configuration(format!("unknown task {name}")))?
                .clone();
            let task = definition.instantiate();
            slots.insert(
                name.clone(),
                TaskSlot {
                    definition,
                    task,
                    event_received: name == initial_name,
                },
            );
        }

        Ok(Self {
            dag,
            slots,
            state: JobState::new(&initial_name),
            storage,
            task_deadline,
        })
    }

    /// Reconstruct a job from a persisted record. Processed tasks will be
    /// skipped but their events stay visible to successors; unprocessed
    /// tasks are re-armed from the restored event log.
    pub fn reconstruct(
        registry: &TaskRegistry,
        storage: Arc<dyn Storage>,
        record: &RunningJob,
        task_deadline: Duration,
    ) -> PtsResult<Self> {
        let state = JobState::from_running_job(record)?;
        let mut job = Self::new(registry, storage, &state.initial_task_name, task_deadline)?;

        let raised_names: Vec<&str> = state.events.iter().map(|e| e.name.as_str()).collect();
        for slot in job.slots.values_mut() {
            if !slot.event_received && slot.definition.consumes_any(raised_names.iter().copied()) {
                slot.event_received = true;
            }
        }
        job.state = state;
        Ok(job)
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Execute all runnable tasks in topological order, checkpointing
    /// after each one, and seal the job.
    #[instrument(skip(self, parameters), fields(job_id = %self.state.job_id, initial = %self.state.initial_task_name))]
    pub async fn run(&mut self, parameters: Option<Value>) -> PtsResult<()> {
        if parameters.is_some() {
            self.state.additional_parameters = parameters;
        }

        for task_name in self.dag.topological_sort() {
            // Present on resume: the task finished in a previous run and
            // its events are already in the log.
            if self.state.is_processed(&task_name) {
                continue;
            }

            let raised = self.process_task(&task_name).await;
            if !raised.is_empty() {
                self.propagate_events(&task_name, &raised);
            }

            self.state.add_processed_task(&task_name, raised);
            self.state.save(self.storage.as_ref()).await?;
        }

        self.state.finish(self.storage.as_ref()).await?;
        info!("Finished all tasks");
        Ok(())
    }

    /// Run a single task if it is armed, returning the events to fold into
    /// the job log (empty when skipped, or cleared on an opted-in failure).
    async fn process_task(&mut self, task_name: &str) -> Vec<Event> {
        let parameters = self.state.additional_parameters.clone();
        let slot = match self.slots.get_mut(task_name) {
            Some(slot) => slot,
            None => return Vec::new(),
        };

        // No event this task depends on has been raised, and by
        // topological order none ever will be.
        if !slot.event_received {
            return Vec::new();
        }

        let received = self.state.events_for(slot.definition.depends_on());
        let mut ctx = TaskContext::new(parameters.clone(), received);
        if let Some(parameters) = &parameters {
            slot.task.set_parameters(parameters);
        }

        info!(task = %task_name, "Starting task");
        let outcome = match tokio::time::timeout(self.task_deadline, slot.task.execute(&mut ctx))
            .await
        {
            Ok(Ok(())) => TaskOutcome::Ok,
            Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
            Err(_) => TaskOutcome::Failed(format!(
                "deadline of {:?} exceeded",
                self.task_deadline
            )),
        };

        match outcome {
            TaskOutcome::Ok => {
                info!(task = %task_name, "Successfully executed task");
                ctx.take_raised()
            }
            TaskOutcome::Failed(reason) => {
                error!(task = %task_name, reason = %reason, "Problem processing a task");
                if slot.definition.clears_events_on_failure() {
                    // Roll the event log back to the position at entry.
                    Vec::new()
                } else {
                    // Keep partially raised events so successors with other
                    // predecessors are not starved.
                    ctx.take_raised()
                }
            }
        }
    }

    /// Arm direct successors that depend on any of the raised events.
    fn propagate_events(&mut self, task_name: &str, raised: &[Event]) {
        let raised_names: Vec<&str> = raised.iter().map(|e| e.name.as_str()).collect();
        let successors = match self.dag.direct_successors(&task_name.to_string()) {
            Ok(successors) => successors,
            Err(e) => {
                warn!(task = %task_name, error = %e, "Task vanished from the job graph");
                return;
            }
        };
        for successor in successors {
            if let Some(slot) = self.slots.get_mut(&successor) {
                if !slot.event_received
                    && slot.definition.consumes_any(raised_names.iter().copied())
                {
                    slot.event_received = true;
                }
            }
        }
    }
}

/// Run a job starting from the given task.
pub async fn run_task(
    registry: &TaskRegistry,
    storage: Arc<dyn Storage>,
    initial_task_name: &str,
    parameters: Option<Value>,
    task_deadline: Duration,
) -> PtsResult<JobState> {
    let mut job = Job::new(registry, storage, initial_task_name, task_deadline)?;
    job.run(parameters).await?;
    Ok(job.state().clone())
}

/// Reconstruct and continue every incomplete job found in storage.
/// Returns the number of jobs continued.
pub async fn continue_incomplete_jobs(
    registry: &TaskRegistry,
    storage: Arc<dyn Storage>,
    task_deadline: Duration,
) -> PtsResult<usize> {
    let records = storage.incomplete_jobs().await?;
    let mut continued = 0;
    for record in records {
        let mut job = Job::reconstruct(registry, storage.clone(), &record, task_deadline)?;
        let parameters = job.state().additional_parameters.clone();
        job.run(parameters).await?;
        continued += 1;
    }
    Ok(continued)
}
