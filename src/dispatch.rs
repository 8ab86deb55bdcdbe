//! Bounded-parallel fan-out of one query across a provider selection.
//!
//! Each selected provider id becomes one task in a `JoinSet`; a counting
//! semaphore sized by `defaults.maxParallel` bounds concurrency, and a
//! task holds its permit for its whole lifetime including retries and
//! fallback. The dispatcher never fails the run for a provider outcome:
//! every outcome becomes a report, collected in completion order.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::LibrariumError;
use crate::output;
use crate::providers::{Provider, options_for, resolve_api_key};
use crate::registry::Registry;
use crate::tasks::TaskStore;
use crate::types::{
    Citation, DispatchMode, ProviderReport, ProviderResult, ReportStatus, TaskHandle, Tier,
};

// ---------------------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------------------

/// Display-only events; the sink is unbounded so emission never blocks.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started { id: String },
    Completed { id: String, status: ReportStatus },
    Error { id: String, message: String },
    AsyncSubmitted { id: String, task_id: String },
    FallbackStarted { primary: String, fallback: String },
}

pub type ProgressSink = mpsc::UnboundedSender<ProgressEvent>;

fn emit(progress: &Option<ProgressSink>, event: ProgressEvent) {
    if let Some(sink) = progress {
        let _ = sink.send(event);
    }
}

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub query: String,
    pub provider_ids: Vec<String>,
    pub mode: DispatchMode,
    pub output_dir: PathBuf,
}

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Completion order.
    pub reports: Vec<ProviderReport>,
    /// Citations from every settled sync result.
    pub citations: Vec<Citation>,
    /// Submission order.
    pub handles: Vec<TaskHandle>,
}

/// Output of one provider task.
struct TaskOutput {
    reports: Vec<ProviderReport>,
    citations: Vec<Citation>,
    handle: Option<TaskHandle>,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub async fn dispatch(
    registry: Arc<Registry>,
    config: Arc<Config>,
    request: DispatchRequest,
    progress: Option<ProgressSink>,
    cancel: CancellationToken,
) -> Result<DispatchOutcome, LibrariumError> {
    // At most one concurrent execution per provider id.
    let mut selection: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for id in &request.provider_ids {
        let canonical = Registry::canonical_id(id).to_string();
        if seen.insert(canonical.clone()) {
            selection.push(canonical);
        }
    }
    let selection_set: Arc<HashSet<String>> = Arc::new(seen);

    let semaphore = Arc::new(Semaphore::new(config.defaults.max_parallel));
    let mut set: JoinSet<TaskOutput> = JoinSet::new();
    let mut task_ids: std::collections::HashMap<tokio::task::Id, String> =
        std::collections::HashMap::new();

    for id in selection {
        let registry = registry.clone();
        let config = config.clone();
        let query = request.query.clone();
        let output_dir = request.output_dir.clone();
        let mode = request.mode;
        let progress = progress.clone();
        let cancel = cancel.clone();
        let semaphore = semaphore.clone();
        let selection_set = selection_set.clone();

        let id_for_map = id.clone();
        let handle = set.spawn(async move {
            // Permit held for the entire task, fallback included.
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            run_provider_task(
                registry,
                config,
                id,
                query,
                output_dir,
                mode,
                selection_set,
                progress,
                cancel,
            )
            .await
        });
        task_ids.insert(handle.id(), id_for_map);
    }

    let mut outcome = DispatchOutcome::default();
    while let Some(joined) = set.join_next_with_id().await {
        match joined {
            Ok((_, output)) => {
                outcome.reports.extend(output.reports);
                outcome.citations.extend(output.citations);
                if let Some(handle) = output.handle {
                    outcome.handles.push(handle);
                }
            }
            Err(join_err) => {
                let id = task_ids
                    .get(&join_err.id())
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                tracing::error!("provider task for {id} panicked: {join_err}");
                outcome.reports.push(error_report(
                    &id,
                    Tier::RawSearch,
                    format!("task panicked: {join_err}"),
                ));
            }
        }
    }

    output::submission_order(&mut outcome.handles);
    if !outcome.handles.is_empty() {
        TaskStore::new(&request.output_dir)
            .save(&outcome.handles)
            .await?;
    }

    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn run_provider_task(
    registry: Arc<Registry>,
    config: Arc<Config>,
    id: String,
    query: String,
    output_dir: PathBuf,
    mode: DispatchMode,
    selection: Arc<HashSet<String>>,
    progress: Option<ProgressSink>,
    cancel: CancellationToken,
) -> TaskOutput {
    let mut output = TaskOutput {
        reports: Vec::new(),
        citations: Vec::new(),
        handle: None,
    };

    // 1. Resolve the provider.
    let Some(provider) = registry.get(&id) else {
        output.reports.push(error_report(
            &id,
            Tier::RawSearch,
            LibrariumError::ProviderNotFound(id.clone()).to_string(),
        ));
        return output;
    };
    let descriptor = provider.descriptor().clone();

    // 2. Config gate: unconfigured, disabled, or keyless providers skip.
    let entry = config.provider_entry(&descriptor.id);
    let skip_reason = match entry {
        None => Some("not configured".to_string()),
        Some(e) if !e.is_enabled() => Some("disabled in config".to_string()),
        Some(e) => {
            if descriptor.requires_api_key
                && resolve_api_key(e.api_key.as_deref(), &descriptor.env_var).is_none()
            {
                Some(format!("API key not set ({})", descriptor.env_var))
            } else {
                None
            }
        }
    };
    if let Some(reason) = skip_reason {
        output.reports.push(ProviderReport {
            id: descriptor.id.clone(),
            tier: descriptor.tier,
            status: ReportStatus::Skipped,
            duration_ms: 0,
            word_count: 0,
            citation_count: 0,
            output_file: None,
            meta_file: None,
            error: Some(reason),
            fallback_for: None,
        });
        return output;
    }

    // 3. Running for real now.
    emit(&progress, ProgressEvent::Started {
        id: descriptor.id.clone(),
    });
    let opts = options_for(&config, &descriptor, cancel.clone());

    // 4. Async routing: deep-research providers with submit, outside
    //    sync mode.
    if mode != DispatchMode::Sync
        && descriptor.tier == Tier::DeepResearch
        && descriptor.capabilities.submit
    {
        match provider.submit(&query, &opts).await {
            Ok(mut handle) => {
                handle.output_dir = Some(output_dir.to_string_lossy().into_owned());
                if handle.submitted_at == 0 {
                    handle.submitted_at = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64;
                }

                // Synthetic-async providers come back already settled;
                // retrieve inline and record a sync-style report.
                if handle.status.is_terminal() && descriptor.capabilities.retrieve {
                    match provider.retrieve(&handle, &opts).await {
                        Ok(result) => {
                            record_sync_result(&mut output, &output_dir, result, None, &progress)
                                .await;
                        }
                        Err(e) => {
                            emit(&progress, ProgressEvent::Error {
                                id: descriptor.id.clone(),
                                message: e.to_string(),
                            });
                            output.reports.push(error_report(
                                &descriptor.id,
                                descriptor.tier,
                                e.to_string(),
                            ));
                        }
                    }
                    return output;
                }

                emit(&progress, ProgressEvent::AsyncSubmitted {
                    id: descriptor.id.clone(),
                    task_id: handle.task_id.clone(),
                });
                output.reports.push(ProviderReport {
                    id: descriptor.id.clone(),
                    tier: descriptor.tier,
                    status: ReportStatus::AsyncPending,
                    duration_ms: 0,
                    word_count: 0,
                    citation_count: 0,
                    output_file: None,
                    meta_file: None,
                    error: None,
                    fallback_for: None,
                });
                output.handle = Some(handle);
                return output;
            }
            Err(e) => {
                // Fall through to a plain sync execution.
                tracing::warn!("submit failed for {}, executing sync: {e}", descriptor.id);
            }
        }
    }

    // 5. Sync execution.
    match provider.execute(&query, &opts).await {
        Ok(result) => {
            record_sync_result(&mut output, &output_dir, result, None, &progress).await;
        }
        Err(e) => {
            // Host-side fault; this is the only path that arms fallback.
            let message = e.to_string();
            emit(&progress, ProgressEvent::Error {
                id: descriptor.id.clone(),
                message: message.clone(),
            });
            output
                .reports
                .push(error_report(&descriptor.id, descriptor.tier, message));

            try_fallback(
                &registry,
                &config,
                &descriptor.id,
                &selection,
                &query,
                &output_dir,
                &progress,
                &cancel,
                &mut output,
            )
            .await;
        }
    }

    output
}

/// Write artifacts for a settled result and append its report.
async fn record_sync_result(
    output: &mut TaskOutput,
    output_dir: &std::path::Path,
    result: ProviderResult,
    fallback_for: Option<String>,
    progress: &Option<ProgressSink>,
) {
    let failed = result.failed();
    let status = if !failed {
        ReportStatus::Success
    } else if result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("timed out"))
    {
        ReportStatus::Timeout
    } else {
        ReportStatus::Error
    };

    let (output_file, meta_file) = if !failed {
        match output::write_provider_artifacts(output_dir, &result).await {
            Ok((md, meta)) => (Some(md), Some(meta)),
            Err(e) => {
                tracing::warn!("failed to write artifacts for {}: {e}", result.provider);
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    emit(progress, ProgressEvent::Completed {
        id: result.provider.clone(),
        status,
    });

    output.reports.push(ProviderReport {
        id: result.provider.clone(),
        tier: result.tier,
        status,
        duration_ms: result.duration_ms,
        word_count: result.word_count(),
        citation_count: result.citations.len(),
        output_file,
        meta_file,
        error: result.error.clone(),
        fallback_for,
    });
    if !failed {
        output.citations.extend(result.citations);
    }
}

/// Single-level fallback for a thrown sync execution. The fallback's own
/// fallback is never followed.
#[allow(clippy::too_many_arguments)]
async fn try_fallback(
    registry: &Registry,
    config: &Config,
    primary_id: &str,
    selection: &HashSet<String>,
    query: &str,
    output_dir: &std::path::Path,
    progress: &Option<ProgressSink>,
    cancel: &CancellationToken,
    output: &mut TaskOutput,
) {
    let Some(fallback_id) = config
        .provider_entry(primary_id)
        .and_then(|e| e.fallback.clone())
    else {
        return;
    };
    let Some(fallback) = registry.get(&fallback_id) else {
        tracing::warn!("fallback '{fallback_id}' for '{primary_id}' is not registered");
        return;
    };
    let descriptor = fallback.descriptor().clone();
    let Some(entry) = config.provider_entry(&descriptor.id) else {
        tracing::debug!("fallback '{fallback_id}' has no config entry, skipping");
        return;
    };
    if descriptor.requires_api_key
        && resolve_api_key(entry.api_key.as_deref(), &descriptor.env_var).is_none()
    {
        tracing::debug!("fallback '{fallback_id}' has no API key, skipping");
        return;
    }
    // Already part of the dispatch: its own top-level report covers it.
    if selection.contains(&descriptor.id) {
        return;
    }

    emit(progress, ProgressEvent::FallbackStarted {
        primary: primary_id.to_string(),
        fallback: descriptor.id.clone(),
    });

    let opts = options_for(config, &descriptor, cancel.clone());
    match fallback.execute(query, &opts).await {
        Ok(result) => {
            record_sync_result(
                output,
                output_dir,
                result,
                Some(primary_id.to_string()),
                progress,
            )
            .await;
        }
        Err(e) => {
            let mut report = error_report(&descriptor.id, descriptor.tier, e.to_string());
            report.fallback_for = Some(primary_id.to_string());
            output.reports.push(report);
        }
    }
}

fn error_report(id: &str, tier: Tier, message: String) -> ProviderReport {
    ProviderReport {
        id: id.to_string(),
        tier,
        status: ReportStatus::Error,
        duration_ms: 0,
        word_count: 0,
        citation_count: 0,
        output_file: None,
        meta_file: None,
        error: Some(message),
        fallback_for: None,
    }
}

// ---------------------------------------------------------------------------
// Exit-code computation
// ---------------------------------------------------------------------------

/// Drop the primary error report of every provider whose fallback
/// succeeded.
pub fn effective_reports(reports: &[ProviderReport]) -> Vec<&ProviderReport> {
    let recovered: HashSet<&str> = reports
        .iter()
        .filter(|r| r.status == ReportStatus::Success)
        .filter_map(|r| r.fallback_for.as_deref())
        .collect();

    reports
        .iter()
        .filter(|r| {
            !(r.fallback_for.is_none()
                && matches!(r.status, ReportStatus::Error | ReportStatus::Timeout)
                && recovered.contains(r.id.as_str()))
        })
        .collect()
}

/// 0: everything (after fallback accounting) succeeded or is pending.
/// 1: partial success. 2: nothing succeeded. Skipped providers are
/// neutral; a run where everything was skipped counts as no success.
pub fn compute_exit_code(reports: &[ProviderReport]) -> i32 {
    let effective = effective_reports(reports);
    let counted: Vec<&&ProviderReport> = effective
        .iter()
        .filter(|r| r.status != ReportStatus::Skipped)
        .collect();
    if counted.is_empty() {
        return 2;
    }
    let succeeded = counted.iter().filter(|r| r.status.succeeded()).count();
    if succeeded == 0 {
        2
    } else if succeeded == counted.len() {
        0
    } else {
        1
    }
}
