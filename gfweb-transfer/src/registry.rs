//! The list of visible tasks.
//!
//! Every mutation goes through [`TaskRegistry::apply`], which replaces the
//! record matching one task id and nothing else. Terminal records are
//! frozen: once `done` is set, later events for that id are dropped.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use gfweb_core::ArchiveCommand;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub use crate::transfer::progress::ProgressValue;
use crate::transfer::progress::ProgressSink;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Upload { dest_path: String, size: u64 },
    Download { sources: Vec<String>, target: PathBuf },
    Copy { source: String, destination: String },
    Archive { command: ArchiveCommand, outdir: String },
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Upload { .. } => "upload",
            TaskKind::Download { .. } => "download",
            TaskKind::Copy { .. } => "copy",
            TaskKind::Archive { .. } => "archive",
        }
    }

    /// Where the task writes, for log lines.
    pub fn destination(&self) -> String {
        match self {
            TaskKind::Upload { dest_path, .. } => dest_path.clone(),
            TaskKind::Download { target, .. } => target.display().to_string(),
            TaskKind::Copy { destination, .. } => destination.clone(),
            TaskKind::Archive { outdir, .. } => outdir.clone(),
        }
    }

    fn initial_value(&self) -> ProgressValue {
        match self {
            TaskKind::Upload { .. } | TaskKind::Download { .. } | TaskKind::Copy { .. } => {
                ProgressValue::Percent(0)
            }
            TaskKind::Archive { .. } => ProgressValue::Indeterminate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    InProgress,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::InProgress => 1,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub value: ProgressValue,
    pub message: String,
    pub done: bool,
    cancel: Option<CancellationToken>,
}

impl Task {
    pub fn can_cancel(&self) -> bool {
        self.cancel.is_some()
    }
}

/// A state change reported by a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started,
    Progress { value: ProgressValue, message: String },
    Message(String),
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Updated(Task),
    Removed(TaskId),
    /// The listing of `dir` changed.
    Refresh { dir: String },
}

fn apply_event(task: &mut Task, event: ProgressEvent) -> bool {
    if task.done {
        return false;
    }
    match event {
        ProgressEvent::Started => {
            if task.status != TaskStatus::Queued {
                return false;
            }
            task.status = TaskStatus::InProgress;
        }
        ProgressEvent::Progress { value, message } => {
            task.status = TaskStatus::InProgress;
            task.value = value;
            task.message = message;
        }
        ProgressEvent::Message(message) => {
            task.status = TaskStatus::InProgress;
            task.message = message;
        }
        ProgressEvent::Completed => {
            task.status = TaskStatus::Completed;
            task.value = ProgressValue::Percent(100);
            task.message.clear();
            task.done = true;
        }
        ProgressEvent::Failed(reason) => {
            task.status = TaskStatus::Error;
            task.message = reason;
            task.done = true;
        }
        ProgressEvent::Cancelled => {
            task.status = TaskStatus::Cancelled;
            task.message = "cancelled".to_string();
            task.done = true;
        }
    }
    if task.done {
        task.cancel = None;
    }
    true
}

#[derive(Clone)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<Vec<Task>>>,
    events: broadcast::Sender<RegistryEvent>,
    completed_grace: Option<Duration>,
}

impl TaskRegistry {
    pub fn new(completed_grace: Option<Duration>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tasks: Arc::new(Mutex::new(Vec::new())),
            events,
            completed_grace,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Registers a queued task and returns its cancellation token.
    pub fn create(&self, kind: TaskKind, name: impl Into<String>) -> (TaskId, CancellationToken) {
        let token = CancellationToken::new();
        let task = Task {
            id: TaskId::new(),
            name: name.into(),
            value: kind.initial_value(),
            kind,
            status: TaskStatus::Queued,
            message: String::new(),
            done: false,
            cancel: Some(token.clone()),
        };
        let id = task.id;
        self.lock().push(task.clone());
        let _ = self.events.send(RegistryEvent::Updated(task));
        (id, token)
    }

    /// Applies `event` to task `id`. Returns false when the task is unknown,
    /// already done, or the event would move it backwards.
    pub fn apply(&self, id: TaskId, event: ProgressEvent) -> bool {
        let updated = {
            let mut tasks = self.lock();
            let Some(task) = tasks.iter_mut().find(|task| task.id == id) else {
                return false;
            };
            if !apply_event(task, event) {
                return false;
            }
            task.clone()
        };
        let completed = updated.status == TaskStatus::Completed;
        let _ = self.events.send(RegistryEvent::Updated(updated));
        if completed {
            self.schedule_removal(id);
        }
        true
    }

    /// Requests abort of a live task and marks it cancelled.
    pub fn cancel(&self, id: TaskId) -> bool {
        let token = {
            let tasks = self.lock();
            match tasks.iter().find(|task| task.id == id) {
                Some(task) if !task.done => task.cancel.clone(),
                _ => None,
            }
        };
        let Some(token) = token else {
            return false;
        };
        token.cancel();
        self.apply(id, ProgressEvent::Cancelled)
    }

    pub fn cancel_all(&self) -> usize {
        let live: Vec<TaskId> = self
            .lock()
            .iter()
            .filter(|task| !task.done)
            .map(|task| task.id)
            .collect();
        live.into_iter().filter(|id| self.cancel(*id)).count()
    }

    /// Removes a finished task.
    pub fn dismiss(&self, id: TaskId) -> bool {
        let removed = {
            let mut tasks = self.lock();
            match tasks.iter().position(|task| task.id == id && task.done) {
                Some(pos) => {
                    tasks.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            let _ = self.events.send(RegistryEvent::Removed(id));
        }
        removed
    }

    pub fn request_refresh(&self, dir: impl Into<String>) {
        let _ = self.events.send(RegistryEvent::Refresh { dir: dir.into() });
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.lock().iter().find(|task| task.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.lock().clone()
    }

    pub fn live_count(&self) -> usize {
        self.lock().iter().filter(|task| !task.done).count()
    }

    /// A sink that feeds one task and drops non-terminal events after the
    /// task's token fires.
    pub fn sink(&self, id: TaskId, cancel: CancellationToken) -> Arc<dyn ProgressSink> {
        Arc::new(TaskSink {
            registry: self.clone(),
            id,
            cancel,
        })
    }

    fn schedule_removal(&self, id: TaskId) {
        let Some(grace) = self.completed_grace else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if registry.dismiss(id) {
                debug!(task = %id, "completed task removed after grace period");
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct TaskSink {
    registry: TaskRegistry,
    id: TaskId,
    cancel: CancellationToken,
}

impl ProgressSink for TaskSink {
    fn emit(&self, event: ProgressEvent) {
        if self.cancel.is_cancelled() && event != ProgressEvent::Cancelled {
            return;
        }
        self.registry.apply(self.id, event);
    }
}
