//! Durable async-task handles and the polling loop.
//!
//! One `async-tasks.json` per run directory is the sole durable state for
//! long-running research jobs. The store is rewritten atomically on every
//! change; a handle leaves the store only after a successful retrieval.
//! Single writer per directory is assumed.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::LibrariumError;
use crate::output;
use crate::providers::options_for;
use crate::registry::Registry;
use crate::types::{ProviderReport, ReportStatus, TaskHandle, TaskStatus};

pub const TASK_FILE: &str = "async-tasks.json";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Apply a polled status to a handle. Terminal states are sticky: a
/// completed handle never regresses to pending or running.
pub fn advance_status(handle: &mut TaskHandle, status: TaskStatus) -> bool {
    if handle.status.is_terminal() && status.is_open() {
        return false;
    }
    handle.status = status;
    if status.is_terminal() {
        handle.completed_at = Some(now_ms());
    } else {
        handle.last_polled_at = Some(now_ms());
    }
    true
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(TASK_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Vec<TaskHandle>, LibrariumError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| LibrariumError::Other(
                format!("corrupt task file {}: {e}", self.path.display()),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite the store. An empty handle list removes the file; the
    /// task file exists iff there are handles.
    pub async fn save(&self, handles: &[TaskHandle]) -> Result<(), LibrariumError> {
        if handles.is_empty() {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        let bytes = serde_json::to_vec_pretty(handles)
            .map_err(|e| LibrariumError::Other(format!("failed to encode tasks: {e}")))?;
        output::write_atomic(&self.path, &bytes).await
    }

    /// Find one handle by provider and task id, merge fields, save.
    pub async fn update<F>(
        &self,
        provider: &str,
        task_id: &str,
        apply: F,
    ) -> Result<bool, LibrariumError>
    where
        F: FnOnce(&mut TaskHandle),
    {
        let mut handles = self.load().await?;
        let Some(handle) = handles
            .iter_mut()
            .find(|h| h.provider == provider && h.task_id == task_id)
        else {
            return Ok(false);
        };
        apply(handle);
        self.save(&handles).await?;
        Ok(true)
    }

    pub async fn remove(&self, provider: &str, task_id: &str) -> Result<bool, LibrariumError> {
        let mut handles = self.load().await?;
        let before = handles.len();
        handles.retain(|h| !(h.provider == provider && h.task_id == task_id));
        if handles.len() == before {
            return Ok(false);
        }
        self.save(&handles).await?;
        Ok(true)
    }
}

/// Walk the base output directory's immediate children and collect every
/// handle whose status is in `statuses`.
pub async fn scan_tasks(
    base: &Path,
    statuses: &[TaskStatus],
) -> Result<Vec<(PathBuf, TaskHandle)>, LibrariumError> {
    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(base).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let store = TaskStore::new(&path);
        match store.load().await {
            Ok(handles) => {
                for handle in handles {
                    if statuses.contains(&handle.status) {
                        found.push((path.clone(), handle));
                    }
                }
            }
            Err(e) => tracing::warn!("skipping {}: {e}", path.display()),
        }
    }
    Ok(found)
}

// ---------------------------------------------------------------------------
// Polling loop
// ---------------------------------------------------------------------------

pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl PollSettings {
    pub fn from_config(config: &Config, cancel: CancellationToken) -> Self {
        Self {
            interval: Duration::from_secs(config.defaults.async_poll_interval),
            timeout: Duration::from_secs(config.defaults.async_timeout),
            cancel,
        }
    }
}

/// Poll every open handle in the directory until all settle, the overall
/// timeout expires, or the caller cancels; then retrieve what completed.
/// Handles that did not settle stay in the store for the next invocation.
pub async fn wait_for_tasks(
    registry: &Registry,
    config: &Config,
    dir: &Path,
    settings: &PollSettings,
) -> Result<Vec<ProviderReport>, LibrariumError> {
    let store = TaskStore::new(dir);
    let deadline = Instant::now() + settings.timeout;

    loop {
        if settings.cancel.is_cancelled() {
            break;
        }
        let mut handles = store.load().await?;
        if !handles.iter().any(|h| h.status.is_open()) {
            break;
        }

        let mut changed = false;
        for handle in handles.iter_mut().filter(|h| h.status.is_open()) {
            if settings.cancel.is_cancelled() {
                break;
            }
            let Some(provider) = registry.get(&handle.provider) else {
                tracing::warn!(
                    "task {} references unknown provider {}, marking failed",
                    handle.task_id,
                    handle.provider
                );
                changed |= advance_status(handle, TaskStatus::Failed);
                continue;
            };
            if !provider.descriptor().capabilities.poll {
                changed |= advance_status(handle, TaskStatus::Failed);
                continue;
            }

            let opts = options_for(config, provider.descriptor(), settings.cancel.clone());
            match provider.poll(handle, &opts).await {
                Ok(update) => {
                    tracing::debug!(
                        provider = %handle.provider,
                        task_id = %handle.task_id,
                        status = %update.status,
                        "polled task"
                    );
                    changed |= advance_status(handle, update.status);
                }
                Err(e) => {
                    // Transient poll failure: leave the handle for the
                    // next sweep.
                    tracing::warn!(
                        "poll failed for {} task {}: {e}",
                        handle.provider,
                        handle.task_id
                    );
                }
            }
        }
        if changed {
            store.save(&handles).await?;
        }
        if !handles.iter().any(|h| h.status.is_open()) {
            break;
        }
        if Instant::now() + settings.interval > deadline {
            tracing::warn!("async wait timed out with open tasks remaining");
            break;
        }
        tokio::select! {
            _ = settings.cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.interval) => {}
        }
    }

    retrieve_completed(registry, config, dir, &settings.cancel).await
}

/// Retrieve every completed handle in the directory, write its artifacts,
/// and drop it from the store. Failed retrievals leave the handle behind.
pub async fn retrieve_completed(
    registry: &Registry,
    config: &Config,
    dir: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<ProviderReport>, LibrariumError> {
    let store = TaskStore::new(dir);
    let handles = store.load().await?;
    let mut remaining = Vec::new();
    let mut reports = Vec::new();

    for handle in handles {
        if handle.status != TaskStatus::Completed || cancel.is_cancelled() {
            remaining.push(handle);
            continue;
        }
        let Some(provider) = registry.get(&handle.provider) else {
            remaining.push(handle);
            continue;
        };
        let descriptor = provider.descriptor().clone();
        if !descriptor.capabilities.retrieve {
            reports.push(ProviderReport {
                id: descriptor.id.clone(),
                tier: descriptor.tier,
                status: ReportStatus::Error,
                duration_ms: 0,
                word_count: 0,
                citation_count: 0,
                output_file: None,
                meta_file: None,
                error: Some(format!("{} does not support retrieve", descriptor.id)),
                fallback_for: None,
            });
            remaining.push(handle);
            continue;
        }

        let opts = options_for(config, &descriptor, cancel.clone());
        match provider.retrieve(&handle, &opts).await {
            Ok(result) => {
                let target = handle
                    .output_dir
                    .as_deref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| dir.to_path_buf());
                let (output_file, meta_file) =
                    output::write_provider_artifacts(&target, &result).await?;
                let failed = result.failed();
                reports.push(ProviderReport {
                    id: descriptor.id.clone(),
                    tier: descriptor.tier,
                    status: if failed {
                        ReportStatus::Error
                    } else {
                        ReportStatus::Success
                    },
                    duration_ms: result.duration_ms,
                    word_count: result.word_count(),
                    citation_count: result.citations.len(),
                    output_file: Some(output_file),
                    meta_file: Some(meta_file),
                    error: result.error.clone(),
                    fallback_for: None,
                });
                // Handle removed only after successful retrieval.
            }
            Err(e) => {
                let status = if e.is_timeout() {
                    ReportStatus::Timeout
                } else {
                    ReportStatus::Error
                };
                reports.push(ProviderReport {
                    id: descriptor.id.clone(),
                    tier: descriptor.tier,
                    status,
                    duration_ms: 0,
                    word_count: 0,
                    citation_count: 0,
                    output_file: None,
                    meta_file: None,
                    error: Some(e.to_string()),
                    fallback_for: None,
                });
                remaining.push(handle);
            }
        }
    }

    store.save(&remaining).await?;
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(status: TaskStatus) -> TaskHandle {
        TaskHandle {
            provider: "p".into(),
            task_id: "t1".into(),
            query: "q".into(),
            submitted_at: 1,
            status,
            last_polled_at: None,
            completed_at: None,
            output_dir: None,
        }
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut h = handle(TaskStatus::Completed);
        assert!(!advance_status(&mut h, TaskStatus::Running));
        assert_eq!(h.status, TaskStatus::Completed);
        assert!(!advance_status(&mut h, TaskStatus::Pending));
    }

    #[test]
    fn open_statuses_are_interchangeable() {
        let mut h = handle(TaskStatus::Pending);
        assert!(advance_status(&mut h, TaskStatus::Running));
        assert!(advance_status(&mut h, TaskStatus::Pending));
        assert!(advance_status(&mut h, TaskStatus::Completed));
        assert!(h.completed_at.is_some());
    }

    #[tokio::test]
    async fn store_load_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        assert!(store.load().await.unwrap().is_empty());

        store.save(&[handle(TaskStatus::Pending)]).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].task_id, "t1");

        store.save(&[]).await.unwrap();
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn store_update_merges_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        store.save(&[handle(TaskStatus::Pending)]).await.unwrap();

        let updated = store
            .update("p", "t1", |h| {
                h.status = TaskStatus::Running;
                h.last_polled_at = Some(42);
            })
            .await
            .unwrap();
        assert!(updated);
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[0].status, TaskStatus::Running);
        assert_eq!(loaded[0].last_polled_at, Some(42));

        assert!(!store.update("p", "nope", |_| {}).await.unwrap());
    }

    #[tokio::test]
    async fn scan_filters_by_status() {
        let base = tempfile::tempdir().unwrap();
        let run_a = base.path().join("run-a");
        let run_b = base.path().join("run-b");
        tokio::fs::create_dir_all(&run_a).await.unwrap();
        tokio::fs::create_dir_all(&run_b).await.unwrap();

        TaskStore::new(&run_a)
            .save(&[handle(TaskStatus::Pending)])
            .await
            .unwrap();
        let mut done = handle(TaskStatus::Completed);
        done.task_id = "t2".into();
        TaskStore::new(&run_b).save(&[done]).await.unwrap();

        let open = scan_tasks(base.path(), &[TaskStatus::Pending, TaskStatus::Running])
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].1.task_id, "t1");

        let completed = scan_tasks(base.path(), &[TaskStatus::Completed])
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1.task_id, "t2");
    }
}
