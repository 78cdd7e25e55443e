//! # Task Registry
//!
//! Task definitions are registered explicitly at startup and collected into
//! an immutable table; lookup is by deduplicated name and enumeration
//! follows registration order. Event-dependency cycles are rejected at
//! registration time, so a built registry always yields a valid DAG.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use pts_shared::{PtsError, PtsResult};

use crate::dag::Dag;
use crate::events::Event;

/// Execution context handed to a task. Collects the events the task raises
/// and exposes the upstream events relevant to it.
#[derive(Debug)]
pub struct TaskContext {
    parameters: Option<Value>,
    received_events: Vec<Event>,
    raised: Vec<Event>,
}

impl TaskContext {
    pub(crate) fn new(parameters: Option<Value>, received_events: Vec<Event>) -> Self {
        Self {
            parameters,
            received_events,
            raised: Vec::new(),
        }
    }

    /// Job-level parameters, if any were supplied.
    pub fn parameters(&self) -> Option<&Value> {
        self.parameters.as_ref()
    }

    /// Upstream events whose names this task depends on.
    pub fn events(&self) -> &[Event] {
        &self.received_events
    }

    /// Signal an event for downstream tasks.
    pub fn raise_event(&mut self, name: &str) {
        self.raised.push(Event::new(name));
    }

    /// Signal an event carrying arguments.
    pub fn raise_event_with(&mut self, name: &str, arguments: Value) {
        self.raised.push(Event::with_arguments(name, arguments));
    }

    pub(crate) fn take_raised(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.raised)
    }
}

/// One unit of data-processing work.
#[async_trait]
pub trait Task: Send {
    /// Inject job parameters before execution. Default: ignore them.
    fn set_parameters(&mut self, _parameters: &Value) {}

    /// Perform the work, raising events through the context.
    async fn execute(&mut self, ctx: &mut TaskContext) -> PtsResult<()>;
}

type TaskFactory = Arc<dyn Fn() -> Box<dyn Task> + Send + Sync>;

/// Static description of a registered task.
#[derive(Clone)]
pub struct TaskDefinition {
    name: String,
    depends_on_events: Vec<String>,
    produces_events: Vec<String>,
    clear_events_on_failure: bool,
    factory: TaskFactory,
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("depends_on_events", &self.depends_on_events)
            .field("produces_events", &self.produces_events)
            .field("clear_events_on_failure", &self.clear_events_on_failure)
            .finish_non_exhaustive()
    }
}

impl TaskDefinition {
    pub fn new<F>(name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Task> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            depends_on_events: Vec::new(),
            produces_events: Vec::new(),
            clear_events_on_failure: false,
            factory: Arc::new(factory),
        }
    }

    pub fn depends_on_events<I: IntoIterator<Item = &'static str>>(mut self, events: I) -> Self {
        self.depends_on_events = events.into_iter().map(str::to_string).collect();
        self
    }

    pub fn produces_events<I: IntoIterator<Item = &'static str>>(mut self, events: I) -> Self {
        self.produces_events = events.into_iter().map(str::to_string).collect();
        self
    }

    /// Opt into discarding partially raised events when `execute` fails.
    pub fn clear_events_on_failure(mut self) -> Self {
        self.clear_events_on_failure = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depends_on(&self) -> &[String] {
        &self.depends_on_events
    }

    pub fn produces(&self) -> &[String] {
        &self.produces_events
    }

    pub fn clears_events_on_failure(&self) -> bool {
        self.clear_events_on_failure
    }

    pub fn instantiate(&self) -> Box<dyn Task> {
        (self.factory)()
    }

    /// Whether any of the given event names is one this task consumes.
    pub fn consumes_any<'a, I: IntoIterator<Item = &'a str>>(&self, names: I) -> bool {
        names
            .into_iter()
            .any(|name| self.depends_on_events.iter().any(|dep| dep == name))
    }
}

/// Immutable-after-startup table of task definitions.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<TaskDefinition>,
    by_name: HashMap<String, usize>,
}

static GLOBAL_REGISTRY: std::sync::OnceLock<TaskRegistry> = std::sync::OnceLock::new();

/// Install the process-wide registry. Callable once, at startup.
pub fn init_global_registry(registry: TaskRegistry) -> PtsResult<&'static TaskRegistry> {
    if GLOBAL_REGISTRY.set(registry).is_err() {
        return Err(PtsError::Configuration(
            "task registry is already initialized".into(),
        ));
    }
    GLOBAL_REGISTRY
        .get()
        .ok_or_else(|| PtsError::Configuration("task registry initialization failed".into()))
}

/// The process-wide registry, if one was installed.
pub fn global_registry() -> Option<&'static TaskRegistry> {
    GLOBAL_REGISTRY.get()
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Duplicate names and event-dependency cycles
    /// are configuration errors.
    pub fn register(&mut self, definition: TaskDefinition) -> PtsResult<()> {
        if self.by_name.contains_key(definition.name()) {
            return Err(PtsError::Configuration(format!(
                "task {} is already registered",
                definition.name()
            )));
        }
        self.by_name
            .insert(definition.name().to_string(), self.tasks.len());
        self.tasks.push(definition);

        // Validate eagerly so a bad registration is caught at startup,
        // then roll it back to keep the registry usable.
        if let Err(error) = self.build_dag() {
            if let Some(definition) = self.tasks.pop() {
                self.by_name.remove(definition.name());
                return Err(PtsError::Configuration(format!(
                    "task {} introduces an event cycle: {error}",
                    definition.name()
                )));
            }
            return Err(error);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.by_name.get(name).map(|&slot| &self.tasks[slot])
    }

    /// Definitions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Build the task-name DAG: an edge p -> c for every (producer,
    /// consumer) pair of every event name.
    pub fn build_dag(&self) -> PtsResult<Dag<String>> {
        let mut dag = Dag::new();
        for definition in &self.tasks {
            dag.add_node(definition.name().to_string())
                .map_err(|e| PtsError::Configuration(format!("task graph: {e}")))?;
        }
        for producer in &self.tasks {
            for event in producer.produces() {
                for consumer in &self.tasks {
                    if consumer.depends_on().iter().any(|dep| dep == event) {
                        dag.add_edge(
                            &producer.name().to_string(),
                            &consumer.name().to_string(),
                        )
                        .map_err(|e| {
                            PtsError::Configuration(format!(
                                "event {event} between {} and {}: {e}",
                                producer.name(),
                                consumer.name()
                            ))
                        })?;
                    }
                }
            }
        }
        Ok(dag)
    }
}
