//! Provider contract and built-in adapters.
//!
//! A provider is a uniform façade over one remote search or research
//! service. `execute` is mandatory; `submit`/`poll`/`retrieve` exist only
//! on deep-research providers and `test` is a cheap connectivity check.
//! Remote failures never escape as `Err`: adapters fold them into the
//! result's `error` field. `Err` from `execute` is reserved for host-side
//! faults (plugin IPC breakage, protocol violations) and is the only
//! execute outcome the dispatcher answers with a fallback.

pub mod brave;
pub mod exa;
pub mod gemini;
pub mod grok;
pub mod http;
pub mod openai;
pub mod perplexity;
pub mod tavily;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::LibrariumError;
use crate::types::{
    PollUpdate, ProviderDescriptor, ProviderResult, TaskHandle, TestOutcome, Tier,
};

/// Ids reserved by the built-in adapters. A custom-provider entry using one
/// of these is ignored with a warning.
pub const BUILTIN_IDS: &[&str] = &[
    "perplexity-sonar-pro",
    "perplexity-deep-research",
    "openai-deep-research",
    "gemini-deep-research",
    "grok-search",
    "exa",
    "tavily",
    "brave-search",
];

/// Known legacy ids and their canonical replacements. Applied to provider
/// keys, group members, and fallback targets at config load time.
pub const LEGACY_IDS: &[(&str, &str)] = &[
    ("perplexity-sonar", "perplexity-sonar-pro"),
    ("perplexity-deep", "perplexity-deep-research"),
    ("openai-deep", "openai-deep-research"),
    ("gemini-deep", "gemini-deep-research"),
    ("exa-search", "exa"),
    ("brave", "brave-search"),
];

/// Per-call options resolved by the dispatcher: the effective timeout, the
/// API key (already env-ref resolved), an optional model override, and the
/// provider's free-form `options` block from config.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub timeout: Duration,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub extra: Value,
    pub cancel: CancellationToken,
}

impl ProviderOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            api_key: None,
            model: None,
            extra: Value::Null,
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Run the query to completion. Remote errors are folded into the
    /// result; `Err` signals a host-side fault.
    async fn execute(
        &self,
        query: &str,
        opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError>;

    /// Start a long-running research task (deep-research only).
    async fn submit(
        &self,
        _query: &str,
        _opts: &ProviderOptions,
    ) -> Result<TaskHandle, LibrariumError> {
        Err(LibrariumError::Unsupported {
            provider: self.descriptor().id.clone(),
            operation: "submit",
        })
    }

    async fn poll(
        &self,
        _handle: &TaskHandle,
        _opts: &ProviderOptions,
    ) -> Result<PollUpdate, LibrariumError> {
        Err(LibrariumError::Unsupported {
            provider: self.descriptor().id.clone(),
            operation: "poll",
        })
    }

    async fn retrieve(
        &self,
        _handle: &TaskHandle,
        _opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError> {
        Err(LibrariumError::Unsupported {
            provider: self.descriptor().id.clone(),
            operation: "retrieve",
        })
    }

    async fn test(&self, _opts: &ProviderOptions) -> TestOutcome {
        TestOutcome {
            ok: true,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// API-key resolution
// ---------------------------------------------------------------------------

/// Resolve an `apiKey` config value against the environment.
///
/// A value starting with `$` names an environment variable looked up at use
/// time; anything else is a literal key. With no configured value the
/// descriptor's own env var is consulted. An empty resolution counts as
/// missing.
pub fn resolve_api_key(configured: Option<&str>, env_var: &str) -> Option<String> {
    let raw = match configured.filter(|s| !s.is_empty()) {
        Some(s) => s.to_string(),
        None if env_var.is_empty() => return None,
        None => format!("${env_var}"),
    };
    let resolved = match raw.strip_prefix('$') {
        Some(name) => std::env::var(name).ok()?,
        None => raw,
    };
    if resolved.trim().is_empty() {
        None
    } else {
        Some(resolved)
    }
}

// ---------------------------------------------------------------------------
// Shared error formatting
// ---------------------------------------------------------------------------

/// Fold a non-success HTTP response into a provider error message. 401 and
/// 403 carry an actionable hint naming the relevant environment variable.
pub fn http_error_message(
    display_name: &str,
    env_var: &str,
    response: &http::HttpResponse,
) -> String {
    let excerpt = response.body.excerpt();
    match response.status {
        401 | 403 => format!(
            "{display_name} returned HTTP {} ({}): {excerpt} (check that {env_var} is set to a valid key)",
            response.status, response.status_text
        ),
        _ => format!(
            "{display_name} returned HTTP {} ({}): {excerpt}",
            response.status, response.status_text
        ),
    }
}

/// Fold a transport-level failure into a provider error message.
/// Connection-level faults collapse to one generic line; the raw error text
/// from the OS is noise to the user.
pub fn transport_error_message(display_name: &str, err: &LibrariumError) -> String {
    match err {
        LibrariumError::Timeout(ms) => format!("{display_name} timed out after {ms}ms"),
        LibrariumError::Cancelled => format!("{display_name} request was cancelled"),
        LibrariumError::ResponseTooLarge { size, max } => {
            format!("{display_name} response too large: {size} bytes (max {max})")
        }
        LibrariumError::Request(e) if is_connection_error(e) => {
            format!("network error connecting to {display_name}")
        }
        other => format!("{display_name}: {other}"),
    }
}

fn is_connection_error(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }
    // ENOTFOUND / ECONNREFUSED / ECONNRESET / ETIMEDOUT surface in the
    // source chain rather than on the reqwest error itself.
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let text = cause.to_string();
        if text.contains("dns error")
            || text.contains("Connection refused")
            || text.contains("Connection reset")
            || text.contains("timed out")
        {
            return true;
        }
        source = cause.source();
    }
    err.is_request()
}

/// Build an error-shaped result for a failed execution.
pub fn error_result(descriptor: &ProviderDescriptor, duration_ms: u64, message: String) -> ProviderResult {
    ProviderResult {
        provider: descriptor.id.clone(),
        tier: descriptor.tier,
        content: String::new(),
        citations: Vec::new(),
        duration_ms,
        model: None,
        token_usage: None,
        error: Some(message),
    }
}

/// Build the per-call options for one provider from the resolved config:
/// default timeout, env-ref resolved key, model override, and the entry's
/// free-form options block.
pub fn options_for(
    config: &crate::config::Config,
    descriptor: &ProviderDescriptor,
    cancel: CancellationToken,
) -> ProviderOptions {
    let entry = config.provider_entry(&descriptor.id);
    ProviderOptions {
        timeout: Duration::from_secs(config.defaults.timeout),
        api_key: resolve_api_key(
            entry.and_then(|e| e.api_key.as_deref()),
            &descriptor.env_var,
        ),
        model: entry.and_then(|e| e.model.clone()),
        extra: entry
            .and_then(|e| e.options.clone())
            .unwrap_or(Value::Null),
        cancel,
    }
}

/// Message used when a provider that requires a key is executed without one.
pub fn missing_key_message(descriptor: &ProviderDescriptor) -> String {
    format!(
        "{} requires an API key; set {}",
        descriptor.display_name, descriptor.env_var
    )
}

pub(crate) fn builtin_descriptor(
    id: &str,
    display_name: &str,
    tier: Tier,
    env_var: &str,
    capabilities: crate::types::ProviderCapabilities,
) -> ProviderDescriptor {
    ProviderDescriptor {
        id: id.to_string(),
        display_name: display_name.to_string(),
        tier,
        env_var: env_var.to_string(),
        source: crate::types::ProviderSource::Builtin,
        requires_api_key: true,
        capabilities,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_table_targets_are_builtin() {
        for (legacy, canonical) in LEGACY_IDS {
            assert!(
                BUILTIN_IDS.contains(canonical),
                "{legacy} maps to unknown id {canonical}"
            );
            assert!(!BUILTIN_IDS.contains(legacy), "{legacy} is still built in");
        }
    }

    #[test]
    fn resolve_api_key_env_ref() {
        unsafe { std::env::set_var("LIBRARIUM_TEST_KEY_A", "secret") };
        assert_eq!(
            resolve_api_key(Some("$LIBRARIUM_TEST_KEY_A"), "IGNORED"),
            Some("secret".to_string())
        );
        unsafe { std::env::remove_var("LIBRARIUM_TEST_KEY_A") };
    }

    #[test]
    fn resolve_api_key_literal_and_missing() {
        assert_eq!(
            resolve_api_key(Some("literal-key"), "X"),
            Some("literal-key".to_string())
        );
        assert_eq!(resolve_api_key(Some("$LIBRARIUM_TEST_UNSET_VAR"), "X"), None);
        assert_eq!(resolve_api_key(None, ""), None);
    }

    #[test]
    fn resolve_api_key_defaults_to_descriptor_env_var() {
        unsafe { std::env::set_var("LIBRARIUM_TEST_KEY_B", "from-env") };
        assert_eq!(
            resolve_api_key(None, "LIBRARIUM_TEST_KEY_B"),
            Some("from-env".to_string())
        );
        unsafe { std::env::remove_var("LIBRARIUM_TEST_KEY_B") };
    }

    #[test]
    fn resolve_api_key_empty_resolution_is_missing() {
        unsafe { std::env::set_var("LIBRARIUM_TEST_KEY_C", "   ") };
        assert_eq!(resolve_api_key(Some("$LIBRARIUM_TEST_KEY_C"), "X"), None);
        unsafe { std::env::remove_var("LIBRARIUM_TEST_KEY_C") };
    }

    #[test]
    fn auth_error_names_env_var() {
        let response = http::HttpResponse {
            status: 401,
            status_text: "Unauthorized".into(),
            body: http::HttpBody::Text("bad key".into()),
            headers: Default::default(),
            duration_ms: 12,
        };
        let msg = http_error_message("Perplexity", "PERPLEXITY_API_KEY", &response);
        assert!(msg.contains("PERPLEXITY_API_KEY"));
        assert!(msg.contains("401"));
    }

    #[test]
    fn timeout_message_has_duration() {
        let msg = transport_error_message("Exa", &LibrariumError::Timeout(5000));
        assert_eq!(msg, "Exa timed out after 5000ms");
    }
}
