//! Per-run output directory and artifact files.
//!
//! Layout: `<base>/<timestamp>-<slug>/` holding `prompt.md`, per-provider
//! `.md` and `.meta.json` pairs, `sources.json`, `summary.md`, `run.json`,
//! and `async-tasks.json` when async handles exist. All writes go through
//! a temp file plus rename.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::error::LibrariumError;
use crate::types::{ProviderResult, ReportStatus, RunManifest, SourceEntry, TaskHandle};

pub const SOURCES_FILE: &str = "sources.json";
pub const MANIFEST_FILE: &str = "run.json";
pub const PROMPT_FILE: &str = "prompt.md";
pub const SUMMARY_FILE: &str = "summary.md";

const SUMMARY_TOP_SOURCES: usize = 20;
const SLUG_MAX_LEN: usize = 40;

/// Derive a filesystem-safe slug from the query. Lowercase, keep
/// `[a-z0-9 -]`, whitespace runs become one dash, capped at 40 chars.
pub fn slugify(query: &str) -> String {
    let lowered: String = query
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace() || *c == '-')
        .collect();

    let mut slug = String::new();
    let mut last_dash = false;
    for c in lowered.chars() {
        let mapped = if c.is_whitespace() { '-' } else { c };
        if mapped == '-' {
            if !last_dash && !slug.is_empty() {
                slug.push('-');
            }
            last_dash = true;
        } else {
            slug.push(mapped);
            last_dash = false;
        }
    }

    let slug = slug.trim_matches('-').to_string();
    slug.chars().take(SLUG_MAX_LEN).collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// Replace anything outside `[A-Za-z0-9._-]` so a provider id is safe as a
/// file name.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RunDir {
    pub path: PathBuf,
    pub slug: String,
    /// Epoch seconds at creation.
    pub timestamp: u64,
}

/// Create `<base>/<yyyymmdd-hhmmss>-<slug>/`.
pub async fn create_run_dir(base: &Path, query: &str) -> Result<RunDir, LibrariumError> {
    let now: DateTime<Utc> = Utc::now();
    let slug = slugify(query);
    let stamp = now.format("%Y%m%d-%H%M%S");
    let name = if slug.is_empty() {
        format!("{stamp}-run")
    } else {
        format!("{stamp}-{slug}")
    };
    let path = base.join(name);
    tokio::fs::create_dir_all(&path).await?;
    Ok(RunDir {
        path,
        slug,
        timestamp: now.timestamp() as u64,
    })
}

/// Atomic write: temp file in the same directory, then rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), LibrariumError> {
    let tmp_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    tokio::fs::write(&tmp_path, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

pub async fn write_prompt(dir: &Path, query: &str) -> Result<(), LibrariumError> {
    let now: DateTime<Utc> = Utc::now();
    let body = format!(
        "# Research Query\n\n{query}\n\n---\nStarted: {}\n",
        now.to_rfc3339()
    );
    write_atomic(&dir.join(PROMPT_FILE), body.as_bytes()).await
}

/// Write `<id>.md` (content verbatim) and `<id>.meta.json` for one
/// provider result. Returns the two file names.
pub async fn write_provider_artifacts(
    dir: &Path,
    result: &ProviderResult,
) -> Result<(String, String), LibrariumError> {
    let safe = sanitize_id(&result.provider);
    let output_file = format!("{safe}.md");
    let meta_file = format!("{safe}.meta.json");

    write_atomic(&dir.join(&output_file), result.content.as_bytes()).await?;

    let meta = json!({
        "provider": result.provider,
        "tier": result.tier,
        "model": result.model,
        "durationMs": result.duration_ms,
        "citationCount": result.citations.len(),
        "tokenUsage": result.token_usage,
        "citations": result.citations,
    });
    let bytes = serde_json::to_vec_pretty(&meta)
        .map_err(|e| LibrariumError::Other(format!("failed to encode meta: {e}")))?;
    write_atomic(&dir.join(&meta_file), &bytes).await?;

    Ok((output_file, meta_file))
}

pub async fn write_sources(dir: &Path, sources: &[SourceEntry]) -> Result<(), LibrariumError> {
    let bytes = serde_json::to_vec_pretty(sources)
        .map_err(|e| LibrariumError::Other(format!("failed to encode sources: {e}")))?;
    write_atomic(&dir.join(SOURCES_FILE), &bytes).await
}

pub async fn write_manifest(dir: &Path, manifest: &RunManifest) -> Result<(), LibrariumError> {
    let bytes = serde_json::to_vec_pretty(manifest)
        .map_err(|e| LibrariumError::Other(format!("failed to encode manifest: {e}")))?;
    write_atomic(&dir.join(MANIFEST_FILE), &bytes).await
}

/// Human-readable digest of the run.
pub async fn write_summary(
    dir: &Path,
    manifest: &RunManifest,
    sources: &[SourceEntry],
) -> Result<(), LibrariumError> {
    let body = render_summary(manifest, sources);
    write_atomic(&dir.join(SUMMARY_FILE), body.as_bytes()).await
}

pub fn render_summary(manifest: &RunManifest, sources: &[SourceEntry]) -> String {
    let succeeded = manifest
        .providers
        .iter()
        .filter(|r| r.status == ReportStatus::Success)
        .count();
    let failed = manifest
        .providers
        .iter()
        .filter(|r| matches!(r.status, ReportStatus::Error | ReportStatus::Timeout))
        .count();
    let pending = manifest
        .providers
        .iter()
        .filter(|r| r.status == ReportStatus::AsyncPending)
        .count();
    let elapsed_ms = manifest
        .providers
        .iter()
        .map(|r| r.duration_ms)
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    out.push_str("# Research Summary\n\n");
    out.push_str(&format!("**Query:** {}\n\n", manifest.query));
    out.push_str(&format!(
        "{succeeded} succeeded, {failed} failed, {pending} async-pending. \
         Elapsed {:.1}s. {} unique sources.\n\n",
        elapsed_ms as f64 / 1000.0,
        manifest.sources.unique
    ));

    out.push_str("## Providers\n\n");
    for report in &manifest.providers {
        out.push_str(&format!(
            "### {} [{}]\n\n",
            report.id,
            report.status
        ));
        match report.status {
            ReportStatus::Success => out.push_str(&format!(
                "{} words, {} citations, {:.1}s\n\n",
                report.word_count,
                report.citation_count,
                report.duration_ms as f64 / 1000.0
            )),
            ReportStatus::AsyncPending => {
                out.push_str("submitted, retrieve with `librarium status --wait`\n\n")
            }
            _ => {
                if let Some(ref error) = report.error {
                    out.push_str(&format!("{error}\n\n"));
                }
            }
        }
        if let Some(ref primary) = report.fallback_for {
            out.push_str(&format!("(fallback for {primary})\n\n"));
        }
    }

    if !sources.is_empty() {
        out.push_str(&format!(
            "## Top sources ({} of {})\n\n",
            sources.len().min(SUMMARY_TOP_SOURCES),
            sources.len()
        ));
        for source in sources.iter().take(SUMMARY_TOP_SOURCES) {
            let title = source.title.as_deref().unwrap_or(&source.url);
            out.push_str(&format!(
                "- [{title}]({}) ({}x via {})\n",
                source.url,
                source.citation_count,
                source.providers.join(", ")
            ));
        }
        out.push('\n');
    }

    if !manifest.async_tasks.is_empty() {
        out.push_str("## Pending async tasks\n\n");
        for handle in &manifest.async_tasks {
            out.push_str(&format!(
                "- {} ({}, task {})\n",
                handle.provider, handle.status, handle.task_id
            ));
        }
        out.push('\n');
    }

    out
}

/// Handles sorted into submission order for `async-tasks.json`.
pub fn submission_order(handles: &mut [TaskHandle]) {
    handles.sort_by_key(|h| h.submitted_at);
}
