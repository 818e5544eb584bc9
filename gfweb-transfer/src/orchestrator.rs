use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use gfweb_core::{ArchiveCommand, ArchiveMember, ArchiveRequest, GfwebClient};
use reqwest::StatusCode;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::conflict::{
    ConflictChoice, ConflictEntry, assign_destinations, detect_conflicts, resolve, unique_conflicts,
};
use crate::error::TransferError;
use crate::item::TransferItem;
use crate::paths::{file_name, normalize_path, parent_path, truncate_display_name};
use crate::pool::{Job, WorkerPool};
use crate::registry::{ProgressEvent, TaskId, TaskKind, TaskRegistry};
use crate::transfer::download::Downloader;
use crate::transfer::precondition::DirPreconditionCache;
use crate::transfer::stream_ops::StreamOps;
use crate::transfer::upload::Uploader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub tasks: Vec<TaskId>,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => self.completed += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub outcome: TaskOutcome,
    pub listing: Option<Vec<ArchiveMember>>,
}

/// Items bound for one remote directory, annotated with name collisions.
#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub current_dir: String,
    pub items: Vec<TransferItem>,
    pub has_conflict: bool,
    existing_names: HashSet<String>,
}

impl UploadPlan {
    pub fn conflicts(&self) -> Vec<ConflictEntry> {
        unique_conflicts(&self.items)
    }

    /// Applies `choices` keyed by conflicting top-level name.
    pub fn resolve(self, choices: &HashMap<String, ConflictChoice>) -> Vec<TransferItem> {
        resolve(self.items, choices, &self.existing_names, &self.current_dir)
    }

    /// Resolves every conflict with the same choice.
    pub fn resolve_all(self, choice: ConflictChoice) -> Vec<TransferItem> {
        let choices = self
            .conflicts()
            .into_iter()
            .map(|entry| (entry.name, choice))
            .collect();
        self.resolve(&choices)
    }
}

type DestinationLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Entry point for every transfer: owns the task list, the upload pool and
/// the per-destination locks.
pub struct TransferOrchestrator {
    client: GfwebClient,
    config: TransferConfig,
    registry: TaskRegistry,
    pool: Arc<WorkerPool>,
    destinations: DestinationLocks,
}

impl TransferOrchestrator {
    pub fn new(client: GfwebClient, config: TransferConfig) -> Self {
        Self {
            registry: TaskRegistry::new(config.completed_grace),
            pool: Arc::new(WorkerPool::new(config.parallel_limit)),
            destinations: Mutex::new(HashMap::new()),
            client,
            config,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.registry.cancel(id)
    }

    pub fn dismiss(&self, id: TaskId) -> bool {
        self.registry.dismiss(id)
    }

    /// Lists `current_dir` and flags incoming items whose names collide.
    /// A missing directory has no conflicts.
    pub async fn prepare_upload(
        &self,
        current_dir: &str,
        items: Vec<TransferItem>,
    ) -> Result<UploadPlan, TransferError> {
        let current_dir = normalize_path(current_dir);
        let existing = match self.client.list_dir(&current_dir).await {
            Ok(entries) => entries,
            Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let report = detect_conflicts(items, &existing);
        if report.has_conflict {
            info!(dir = %current_dir, "incoming items collide with existing entries");
        }
        Ok(UploadPlan {
            current_dir,
            items: report.items,
            has_conflict: report.has_conflict,
            existing_names: existing.into_iter().map(|entry| entry.name).collect(),
        })
    }

    /// Uploads one batch into `current_dir` through the bounded pool and
    /// waits for every item of this batch to settle.
    pub async fn upload(&self, current_dir: &str, items: Vec<TransferItem>) -> BatchReport {
        let current_dir = normalize_path(current_dir);
        let cache = Arc::new(DirPreconditionCache::new());
        cache.mark_created(&current_dir);
        let uploader = Uploader::new(self.client.clone());
        let outcomes: Arc<Mutex<Vec<TaskOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let tracker = TaskTracker::new();

        let mut report = BatchReport::default();
        let mut jobs: Vec<Job> = Vec::with_capacity(items.len());
        let mut items = items;
        assign_destinations(&mut items, &current_dir);
        for item in items {
            let (id, cancel) = self.registry.create(
                TaskKind::Upload {
                    dest_path: item.dest_path.clone(),
                    size: item.size,
                },
                truncate_display_name(&item.name, self.config.display_name_max),
            );
            report.tasks.push(id);

            let registry = self.registry.clone();
            let uploader = uploader.clone();
            let cache = Arc::clone(&cache);
            let outcomes = Arc::clone(&outcomes);
            let job = async move {
                if cancel.is_cancelled() {
                    debug!(task = %id, "skipping upload cancelled while queued");
                    lock(&outcomes).push(TaskOutcome::Cancelled);
                    return Ok(());
                }
                registry.apply(id, ProgressEvent::Started);
                let sink = registry.sink(id, cancel.clone());
                let result = uploader.upload(&item, &cache, &cancel, sink).await;
                let outcome = settle(&registry, id, &cancel, result);
                lock(&outcomes).push(outcome.clone());
                match outcome {
                    TaskOutcome::Failed(reason) => Err(TransferError::Remote(format!(
                        "{}: {reason}",
                        item.dest_path
                    ))),
                    _ => Ok(()),
                }
            };
            jobs.push(tracker.track_future(job).boxed());
        }
        tracker.close();

        info!(dir = %current_dir, count = jobs.len(), "upload batch queued");
        self.pool.run_with_limit(jobs).await;
        tracker.wait().await;

        for outcome in lock(&outcomes).iter() {
            report.record(outcome);
        }
        info!(
            dir = %current_dir,
            completed = report.completed,
            failed = report.failed,
            cancelled = report.cancelled,
            "upload batch finished"
        );
        self.registry.request_refresh(current_dir);
        report
    }

    /// Downloads one remote file, or several as one server-built archive,
    /// into `target_dir`.
    pub async fn download(&self, paths: &[String], target_dir: &Path) -> TaskOutcome {
        let name = match paths {
            [single] => file_name(single),
            many => format!("{} items", many.len()),
        };
        let (id, cancel) = self.registry.create(
            TaskKind::Download {
                sources: paths.to_vec(),
                target: target_dir.to_path_buf(),
            },
            truncate_display_name(&name, self.config.display_name_max),
        );
        self.registry.apply(id, ProgressEvent::Started);
        let sink = self.registry.sink(id, cancel.clone());
        let downloader = Downloader::new(self.client.clone(), self.config.zip_streaming);
        let result = match paths {
            [] => Err(TransferError::MissingSource("nothing to download".to_string())),
            [single] => downloader.download_file(single, target_dir, &cancel, sink).await,
            many => downloader.download_zip(many, target_dir, &cancel, sink).await,
        };
        let result = result.map(|saved| {
            info!(path = %saved.path.display(), bytes = saved.bytes, "download saved");
        });
        settle(&self.registry, id, &cancel, result)
    }

    /// Server-side copy of `source` to `destination`.
    pub async fn copy(&self, source: &str, destination: &str) -> TaskOutcome {
        let source = normalize_path(source);
        let destination = normalize_path(destination);
        let (id, cancel) = self.registry.create(
            TaskKind::Copy {
                source: source.clone(),
                destination: destination.clone(),
            },
            truncate_display_name(&file_name(&source), self.config.display_name_max),
        );

        let result: Result<(), TransferError> = async {
            let _guard = self.destination_guard(&destination, &cancel).await?;
            self.registry.apply(id, ProgressEvent::Started);
            let sink = self.registry.sink(id, cancel.clone());
            StreamOps::new(self.client.clone())
                .copy(&source, &destination, &cancel, sink)
                .await
        }
        .await;
        let outcome = settle(&self.registry, id, &cancel, result);
        if outcome.is_completed()
            && let Some(parent) = parent_path(&destination)
        {
            self.registry.request_refresh(parent);
        }
        outcome
    }

    /// Runs a gfptar command. A `list` command also returns the members.
    pub async fn archive(&self, request: ArchiveRequest) -> ArchiveReport {
        let target = match request.command {
            ArchiveCommand::List => request.basedir.clone(),
            ArchiveCommand::Create | ArchiveCommand::Extract => request.outdir.clone(),
        };
        let (id, cancel) = self.registry.create(
            TaskKind::Archive {
                command: request.command,
                outdir: target.clone(),
            },
            truncate_display_name(
                &format!("{} {}", request.command.as_str(), file_name(&target)),
                self.config.display_name_max,
            ),
        );

        let result: Result<_, TransferError> = async {
            let _guard = self.destination_guard(&target, &cancel).await?;
            self.registry.apply(id, ProgressEvent::Started);
            let sink = self.registry.sink(id, cancel.clone());
            StreamOps::new(self.client.clone())
                .archive(&request, &cancel, sink)
                .await
        }
        .await;
        let (result, listing) = match result {
            Ok(outcome) => (Ok(()), outcome.listing),
            Err(err) => (Err(err), None),
        };
        let outcome = settle(&self.registry, id, &cancel, result);
        if outcome.is_completed() && request.command != ArchiveCommand::List {
            let refreshed = parent_path(&target).unwrap_or_else(|| normalize_path(&target));
            self.registry.request_refresh(refreshed);
        }
        ArchiveReport { outcome, listing }
    }

    /// Waits for exclusive use of `destination` when destinations are
    /// serialized.
    async fn destination_guard(
        &self,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<DestinationGuard<'_>>, TransferError> {
        if !self.config.serialize_destinations {
            return Ok(None);
        }
        let key = normalize_path(destination);
        let slot = lock(&self.destinations).entry(key.clone()).or_default().clone();
        let held = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = slot.lock_owned() => Some(guard),
        };
        match held {
            Some(held) => Ok(Some(DestinationGuard {
                locks: &self.destinations,
                key,
                held: Some(held),
            })),
            None => {
                release_slot(&self.destinations, &key);
                Err(TransferError::Cancelled)
            }
        }
    }
}

/// Exclusive use of one destination; drops its map entry once nobody else
/// holds or waits for it.
struct DestinationGuard<'a> {
    locks: &'a DestinationLocks,
    key: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for DestinationGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        release_slot(self.locks, &self.key);
    }
}

fn release_slot(locks: &DestinationLocks, key: &str) {
    let mut locks = lock(locks);
    if locks.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
        locks.remove(key);
    }
}

/// Writes the terminal state of task `id`. A fired token always wins so
/// that a cancelled task is never reported as failed.
fn settle(
    registry: &TaskRegistry,
    id: TaskId,
    cancel: &CancellationToken,
    result: Result<(), TransferError>,
) -> TaskOutcome {
    let outcome = match result {
        _ if cancel.is_cancelled() => TaskOutcome::Cancelled,
        Ok(()) => TaskOutcome::Completed,
        Err(err) if err.is_cancelled() => TaskOutcome::Cancelled,
        Err(err) => {
            warn!(task = %id, error = %err, "transfer failed");
            TaskOutcome::Failed(err.user_message())
        }
    };
    let event = match &outcome {
        TaskOutcome::Completed => ProgressEvent::Completed,
        TaskOutcome::Failed(reason) => ProgressEvent::Failed(reason.clone()),
        TaskOutcome::Cancelled => ProgressEvent::Cancelled,
    };
    registry.apply(id, event);
    outcome
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskStatus;

    fn orchestrator() -> TransferOrchestrator {
        let client = GfwebClient::with_base_url("http://127.0.0.1:9").unwrap();
        TransferOrchestrator::new(client, TransferConfig::default())
    }

    #[test]
    fn settle_prefers_cancellation_over_failure() {
        let registry = TaskRegistry::new(None);
        let (id, cancel) = registry.create(
            TaskKind::Copy {
                source: "/a".into(),
                destination: "/b".into(),
            },
            "a",
        );
        cancel.cancel();
        let outcome = settle(
            &registry,
            id,
            &cancel,
            Err(TransferError::Remote("connection reset".into())),
        );
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert_eq!(registry.get(id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn settle_records_failure_reason() {
        let registry = TaskRegistry::new(None);
        let (id, cancel) = registry.create(
            TaskKind::Copy {
                source: "/a".into(),
                destination: "/b".into(),
            },
            "a",
        );
        let outcome = settle(&registry, id, &cancel, Err(TransferError::Remote("nope".into())));
        assert_eq!(outcome, TaskOutcome::Failed("nope".into()));
        let task = registry.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.message, "nope");
    }

    #[tokio::test]
    async fn empty_download_fails_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = orchestrator().download(&[], dir.path()).await;
        assert!(matches!(outcome, TaskOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn destination_guard_serializes_same_target() {
        let orchestrator = orchestrator();
        let cancel = CancellationToken::new();
        let first = orchestrator.destination_guard("/out", &cancel).await.unwrap();
        assert!(first.is_some());

        let waiting = CancellationToken::new();
        waiting.cancel();
        let second = orchestrator.destination_guard("/out/", &waiting).await;
        assert!(matches!(second, Err(TransferError::Cancelled)));

        let other = orchestrator.destination_guard("/elsewhere", &cancel).await.unwrap();
        assert!(other.is_some());
        assert_eq!(lock(&orchestrator.destinations).len(), 2);

        drop(first);
        drop(other);
        assert!(lock(&orchestrator.destinations).is_empty());
    }

    #[tokio::test]
    async fn waiting_destination_keeps_its_entry() {
        let orchestrator = Arc::new(orchestrator());
        let cancel = CancellationToken::new();
        let first = orchestrator.destination_guard("/out", &cancel).await.unwrap();

        let waiter = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let guard = orchestrator.destination_guard("/out", &cancel).await.unwrap();
                assert!(guard.is_some());
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(first);
        assert!(!lock(&orchestrator.destinations).is_empty());

        waiter.await.unwrap();
        assert!(lock(&orchestrator.destinations).is_empty());
    }
}
