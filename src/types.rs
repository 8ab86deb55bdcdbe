//! Shared record types: descriptors, results, task handles, reports, and
//! the run manifest. Everything here serializes as camelCase JSON to match
//! the on-disk layout (`run.json`, `sources.json`, `async-tasks.json`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Provider identity
// ---------------------------------------------------------------------------

/// Categorical latency/depth label. Only `deep-research` providers may take
/// the async dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "deep-research")]
    DeepResearch,
    #[serde(rename = "ai-grounded")]
    AiGrounded,
    #[serde(rename = "raw-search")]
    RawSearch,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::DeepResearch => "deep-research",
            Tier::AiGrounded => "ai-grounded",
            Tier::RawSearch => "raw-search",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSource {
    Builtin,
    Npm,
    Script,
}

impl fmt::Display for ProviderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderSource::Builtin => f.write_str("builtin"),
            ProviderSource::Npm => f.write_str("npm"),
            ProviderSource::Script => f.write_str("script"),
        }
    }
}

/// Which optional operations a provider supports. `execute` is mandatory
/// for every provider; the rest gate async routing and `doctor` checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderCapabilities {
    pub execute: bool,
    pub submit: bool,
    pub poll: bool,
    pub retrieve: bool,
    pub test: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            execute: true,
            submit: false,
            poll: false,
            retrieve: false,
            test: false,
        }
    }
}

impl ProviderCapabilities {
    pub fn sync_only() -> Self {
        Self::default()
    }

    pub fn with_async() -> Self {
        Self {
            submit: true,
            poll: true,
            retrieve: true,
            ..Self::default()
        }
    }
}

/// Identity and contract of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub id: String,
    pub display_name: String,
    pub tier: Tier,
    /// Name of the environment variable holding the API key. Empty only
    /// when `requires_api_key` is false.
    pub env_var: String,
    pub source: ProviderSource,
    pub requires_api_key: bool,
    pub capabilities: ProviderCapabilities,
}

// ---------------------------------------------------------------------------
// Results and citations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default)]
    pub provider: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
}

/// Uniform outcome of one provider execution. `error` present means the
/// execution failed; `content` and `citations` are meaningless then.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResult {
    #[serde(default)]
    pub provider: String,
    #[serde(default = "default_tier")]
    pub tier: Tier,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_tier() -> Tier {
    Tier::RawSearch
}

impl ProviderResult {
    pub fn failed(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    pub fn word_count(&self) -> usize {
        if self.failed() {
            0
        } else {
            self.content.split_whitespace().count()
        }
    }
}

// ---------------------------------------------------------------------------
// Async task handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Pending and running are interchangeable intermediate states; the
    /// terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable reference to a submitted long-running provider task. The task id
/// is opaque to the engine and unique within its provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    pub provider: String,
    pub task_id: String,
    #[serde(default)]
    pub query: String,
    /// Epoch milliseconds.
    #[serde(default)]
    pub submitted_at: u64,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polled_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollUpdate {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Reports and manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportStatus {
    Success,
    Error,
    Timeout,
    Skipped,
    AsyncPending,
}

impl ReportStatus {
    /// Success and async-pending both count as "succeeded" for the
    /// exit-code computation.
    pub fn succeeded(&self) -> bool {
        matches!(self, ReportStatus::Success | ReportStatus::AsyncPending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Success => "success",
            ReportStatus::Error => "error",
            ReportStatus::Timeout => "timeout",
            ReportStatus::Skipped => "skipped",
            ReportStatus::AsyncPending => "async-pending",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-provider line in the run manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderReport {
    pub id: String,
    pub tier: Tier,
    pub status: ReportStatus,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub word_count: usize,
    #[serde(default)]
    pub citation_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_for: Option<String>,
}

/// One citation bucket after cross-provider deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEntry {
    /// Representative original url (first seen).
    pub url: String,
    /// Canonical dedup key.
    pub normalized_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Distinct provider ids in first-seen order.
    pub providers: Vec<String>,
    pub citation_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub total: usize,
    pub unique: usize,
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest {
    pub version: u32,
    /// Epoch seconds.
    pub timestamp: u64,
    pub slug: String,
    pub query: String,
    pub mode: DispatchMode,
    /// Absolute run directory.
    pub output_dir: String,
    /// Completion order.
    pub providers: Vec<ProviderReport>,
    pub sources: SourceSummary,
    /// Submission order.
    pub async_tasks: Vec<TaskHandle>,
    pub exit_code: i32,
}

pub const MANIFEST_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Dispatch mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    Sync,
    Async,
    #[default]
    Mixed,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(DispatchMode::Sync),
            "async" => Ok(DispatchMode::Async),
            "mixed" => Ok(DispatchMode::Mixed),
            other => Err(format!("unknown mode '{other}' (expected sync, async, or mixed)")),
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Sync => f.write_str("sync"),
            DispatchMode::Async => f.write_str("async"),
            DispatchMode::Mixed => f.write_str("mixed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_serializes_kebab() {
        assert_eq!(
            serde_json::to_string(&Tier::DeepResearch).unwrap(),
            r#""deep-research""#
        );
        assert_eq!(
            serde_json::to_string(&Tier::AiGrounded).unwrap(),
            r#""ai-grounded""#
        );
    }

    #[test]
    fn report_status_async_pending_is_kebab() {
        assert_eq!(
            serde_json::to_string(&ReportStatus::AsyncPending).unwrap(),
            r#""async-pending""#
        );
    }

    #[test]
    fn task_status_terminality() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Pending.is_open());
        assert!(TaskStatus::Running.is_open());
    }

    #[test]
    fn handle_round_trips_camel_case() {
        let handle = TaskHandle {
            provider: "openai-deep-research".into(),
            task_id: "resp_123".into(),
            query: "what is rust".into(),
            submitted_at: 1_700_000_000_000,
            status: TaskStatus::Pending,
            last_polled_at: None,
            completed_at: None,
            output_dir: Some("/tmp/run".into()),
        };
        let json = serde_json::to_value(&handle).unwrap();
        assert_eq!(json["taskId"], "resp_123");
        assert_eq!(json["submittedAt"], 1_700_000_000_000u64);
        let back: TaskHandle = serde_json::from_value(json).unwrap();
        assert_eq!(back.task_id, handle.task_id);
        assert_eq!(back.status, TaskStatus::Pending);
    }

    #[test]
    fn mode_parses_case_insensitive() {
        assert_eq!("SYNC".parse::<DispatchMode>().unwrap(), DispatchMode::Sync);
        assert!("turbo".parse::<DispatchMode>().is_err());
    }
}
