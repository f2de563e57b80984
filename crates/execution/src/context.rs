//! Task lifetime: the scope that owns cursor resources.

use std::fmt;
use std::sync::{Arc, Mutex};

use nbx_common::{BridgeConfig, MemoryPool, MetricsRegistry, PartitionId, TaskId};
use tracing::debug;

/// How a task ended, passed to every completion listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed(String),
}

type CompletionListener = Box<dyn FnOnce(&TaskOutcome) + Send>;

enum ListenerState {
    Running(Vec<CompletionListener>),
    Completed(TaskOutcome),
}

pub struct TaskContext {
    pub task_id: TaskId,
    pub partition: PartitionId,
    pub config: BridgeConfig,
    /// Pool that cursor reservations are charged against.
    pub memory: Arc<MemoryPool>,
    pub metrics: MetricsRegistry,
    listeners: Mutex<ListenerState>,
}

pub type SharedTaskContext = Arc<TaskContext>;

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        partition: PartitionId,
        config: BridgeConfig,
        memory: Arc<MemoryPool>,
        metrics: MetricsRegistry,
    ) -> SharedTaskContext {
        Arc::new(Self {
            task_id,
            partition,
            config,
            memory,
            metrics,
            listeners: Mutex::new(ListenerState::Running(Vec::new())),
        })
    }

    /// Context with its own unbounded pool and metrics registry.
    pub fn standalone(task_id: TaskId, config: BridgeConfig) -> SharedTaskContext {
        let memory = MemoryPool::new(config.mem_budget_bytes);
        Self::new(
            task_id,
            PartitionId(0),
            config,
            memory,
            MetricsRegistry::new(),
        )
    }

    /// Run `listener` once when the task completes.
    ///
    /// Listeners added after completion run immediately on the calling thread.
    pub fn add_completion_listener<F>(&self, listener: F)
    where
        F: FnOnce(&TaskOutcome) + Send + 'static,
    {
        let mut state = self.listeners.lock().expect("task listeners lock poisoned");
        match &mut *state {
            ListenerState::Running(listeners) => listeners.push(Box::new(listener)),
            ListenerState::Completed(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                listener(&outcome);
            }
        }
    }

    /// Mark the task complete and run listeners in reverse registration order.
    ///
    /// Returns `false` if the task had already completed; listeners never run twice.
    pub fn complete(&self, outcome: TaskOutcome) -> bool {
        let listeners = {
            let mut state = self.listeners.lock().expect("task listeners lock poisoned");
            match std::mem::replace(&mut *state, ListenerState::Completed(outcome.clone())) {
                ListenerState::Running(listeners) => listeners,
                ListenerState::Completed(previous) => {
                    *state = ListenerState::Completed(previous);
                    return false;
                }
            }
        };
        debug!(
            task_id = %self.task_id,
            listeners = listeners.len(),
            ?outcome,
            "task completed"
        );
        for listener in listeners.into_iter().rev() {
            listener(&outcome);
        }
        true
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            *self.listeners.lock().expect("task listeners lock poisoned"),
            ListenerState::Completed(_)
        )
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("partition", &self.partition)
            .field("completed", &self.is_completed())
            .finish()
    }
}
