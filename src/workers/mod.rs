//! Worker data store seam
//!
//! The worker/task store is an external collaborator; the supervisor
//! only reads worker state and performs status-terminal transitions
//! while tearing down workers on dead hosts. [`WorkerStore`] is the
//! trait boundary, [`MemoryWorkerStore`] the in-process implementation
//! that backs the daemon and the tests.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Status of a logical worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Initializing,
    Spawning,
    Starting,
    Working,
    Blocked,
    Error,
    Terminated,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Spawning => "spawning",
            Self::Starting => "starting",
            Self::Working => "working",
            Self::Blocked => "blocked",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }
}

/// Status of a task owned by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Dispatched,
    Done,
    Error,
}

/// A worker record as seen by the supervisor.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: String,
    pub status: WorkerStatus,
    pub project_id: Option<String>,
}

/// A task record as seen by the supervisor.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub worker_id: String,
    pub status: TaskStatus,
}

/// A claim held by a worker, optionally scoped to a single task.
#[derive(Debug, Clone)]
pub struct Claim {
    pub key: String,
    pub worker_id: String,
    pub task_id: Option<String>,
}

/// The supervisor's view of the worker data store.
///
/// Every method is infallible from the caller's perspective: lookups
/// return `Option`/empty, mutations on missing records are no-ops.
pub trait WorkerStore: Send + Sync {
    fn get(&self, worker_id: &str) -> Option<WorkerRecord>;
    fn tasks_for(&self, worker_id: &str, status: TaskStatus) -> Vec<TaskRecord>;
    /// Mark a task errored and drop claims scoped to it.
    fn fail_task(&self, task_id: &str);
    /// Drop every remaining claim held by the worker.
    fn release_claims(&self, worker_id: &str);
    fn set_status(&self, worker_id: &str, status: WorkerStatus);
}

#[derive(Default)]
struct StoreInner {
    workers: HashMap<String, WorkerRecord>,
    tasks: HashMap<String, TaskRecord>,
    claims: Vec<Claim>,
}

/// In-memory worker store.
#[derive(Default)]
pub struct MemoryWorkerStore {
    inner: RwLock<StoreInner>,
}

impl MemoryWorkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_worker(&self, id: &str, status: WorkerStatus, project_id: Option<&str>) {
        let mut inner = self.inner.write();
        inner.workers.insert(
            id.to_string(),
            WorkerRecord {
                id: id.to_string(),
                status,
                project_id: project_id.map(str::to_string),
            },
        );
    }

    pub fn insert_task(&self, id: &str, worker_id: &str, status: TaskStatus) {
        let mut inner = self.inner.write();
        inner.tasks.insert(
            id.to_string(),
            TaskRecord {
                id: id.to_string(),
                worker_id: worker_id.to_string(),
                status,
            },
        );
    }

    pub fn insert_claim(&self, key: &str, worker_id: &str, task_id: Option<&str>) {
        let mut inner = self.inner.write();
        inner.claims.push(Claim {
            key: key.to_string(),
            worker_id: worker_id.to_string(),
            task_id: task_id.map(str::to_string),
        });
    }

    pub fn get_task(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner.read().tasks.get(task_id).cloned()
    }

    pub fn claims_for(&self, worker_id: &str) -> Vec<Claim> {
        self.inner
            .read()
            .claims
            .iter()
            .filter(|c| c.worker_id == worker_id)
            .cloned()
            .collect()
    }
}

impl WorkerStore for MemoryWorkerStore {
    fn get(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.inner.read().workers.get(worker_id).cloned()
    }

    fn tasks_for(&self, worker_id: &str, status: TaskStatus) -> Vec<TaskRecord> {
        let inner = self.inner.read();
        let mut tasks: Vec<TaskRecord> = inner
            .tasks
            .values()
            .filter(|t| t.worker_id == worker_id && t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    fn fail_task(&self, task_id: &str) {
        let mut inner = self.inner.write();
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.status = TaskStatus::Error;
        }
        inner
            .claims
            .retain(|c| c.task_id.as_deref() != Some(task_id));
    }

    fn release_claims(&self, worker_id: &str) {
        let mut inner = self.inner.write();
        inner.claims.retain(|c| c.worker_id != worker_id);
    }

    fn set_status(&self, worker_id: &str, status: WorkerStatus) {
        let mut inner = self.inner.write();
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.status = status;
        }
    }
}
