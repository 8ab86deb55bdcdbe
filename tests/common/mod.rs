//! Shared fakes for the dispatcher and async-manager suites: in-memory
//! providers with scripted behavior, no network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use librarium::config::{Config, ProviderEntry};
use librarium::error::LibrariumError;
use librarium::providers::{Provider, ProviderOptions};
use librarium::types::{
    Citation, PollUpdate, ProviderCapabilities, ProviderDescriptor, ProviderResult,
    ProviderSource, TaskHandle, TaskStatus, Tier,
};

pub fn descriptor(id: &str, tier: Tier) -> ProviderDescriptor {
    ProviderDescriptor {
        id: id.to_string(),
        display_name: id.to_string(),
        tier,
        env_var: String::new(),
        source: ProviderSource::Builtin,
        requires_api_key: false,
        capabilities: ProviderCapabilities::sync_only(),
    }
}

pub fn citation(url: &str, provider: &str) -> Citation {
    Citation {
        url: url.to_string(),
        title: None,
        snippet: None,
        provider: provider.to_string(),
    }
}

/// What a fake provider does when driven.
pub enum Behavior {
    /// execute returns a successful result.
    Succeed {
        content: String,
        citations: Vec<Citation>,
    },
    /// execute returns a result with `error` set (remote failure).
    ErrorResult(String),
    /// execute returns `Err` (host fault); the fallback trigger.
    Throw(String),
    /// Natively async: submit yields a pending handle, poll reports
    /// `running` the given number of times before `completed`.
    Async {
        running_polls: u32,
        content: String,
        citations: Vec<Citation>,
    },
    /// Synthetic async: submit yields an already-completed handle.
    SyntheticAsync { content: String },
}

pub struct FakeProvider {
    descriptor: ProviderDescriptor,
    behavior: Behavior,
    polls: AtomicU32,
}

impl FakeProvider {
    pub fn new(id: &str, tier: Tier, behavior: Behavior) -> Self {
        let mut descriptor = descriptor(id, tier);
        if matches!(
            behavior,
            Behavior::Async { .. } | Behavior::SyntheticAsync { .. }
        ) {
            descriptor.capabilities = ProviderCapabilities::with_async();
        }
        Self {
            descriptor,
            behavior,
            polls: AtomicU32::new(0),
        }
    }

    fn result(&self, content: &str, citations: &[Citation]) -> ProviderResult {
        ProviderResult {
            provider: self.descriptor.id.clone(),
            tier: self.descriptor.tier,
            content: content.to_string(),
            citations: citations.to_vec(),
            duration_ms: 7,
            model: None,
            token_usage: None,
            error: None,
        }
    }

    fn handle(&self, query: &str, status: TaskStatus) -> TaskHandle {
        TaskHandle {
            provider: self.descriptor.id.clone(),
            task_id: format!("{}-task-1", self.descriptor.id),
            query: query.to_string(),
            submitted_at: 1_700_000_000_000,
            status,
            last_polled_at: None,
            completed_at: None,
            output_dir: None,
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        _query: &str,
        _opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError> {
        match &self.behavior {
            Behavior::Succeed { content, citations } => Ok(self.result(content, citations)),
            Behavior::ErrorResult(message) => {
                let mut result = self.result("", &[]);
                result.error = Some(message.clone());
                Ok(result)
            }
            Behavior::Throw(message) => Err(LibrariumError::Other(message.clone())),
            Behavior::Async {
                content, citations, ..
            } => Ok(self.result(content, citations)),
            Behavior::SyntheticAsync { content } => Ok(self.result(content, &[])),
        }
    }

    async fn submit(
        &self,
        query: &str,
        _opts: &ProviderOptions,
    ) -> Result<TaskHandle, LibrariumError> {
        match &self.behavior {
            Behavior::Async { .. } => Ok(self.handle(query, TaskStatus::Pending)),
            Behavior::SyntheticAsync { .. } => Ok(self.handle(query, TaskStatus::Completed)),
            _ => Err(LibrariumError::Unsupported {
                provider: self.descriptor.id.clone(),
                operation: "submit",
            }),
        }
    }

    async fn poll(
        &self,
        _handle: &TaskHandle,
        _opts: &ProviderOptions,
    ) -> Result<PollUpdate, LibrariumError> {
        match &self.behavior {
            Behavior::Async { running_polls, .. } => {
                let seen = self.polls.fetch_add(1, Ordering::SeqCst);
                let status = if seen < *running_polls {
                    TaskStatus::Running
                } else {
                    TaskStatus::Completed
                };
                Ok(PollUpdate {
                    status,
                    progress: None,
                    message: None,
                })
            }
            Behavior::SyntheticAsync { .. } => Ok(PollUpdate {
                status: TaskStatus::Completed,
                progress: Some(1.0),
                message: None,
            }),
            _ => Err(LibrariumError::Unsupported {
                provider: self.descriptor.id.clone(),
                operation: "poll",
            }),
        }
    }

    async fn retrieve(
        &self,
        _handle: &TaskHandle,
        _opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError> {
        match &self.behavior {
            Behavior::Async { content, citations, .. } => Ok(self.result(content, citations)),
            Behavior::SyntheticAsync { content } => Ok(self.result(content, &[])),
            _ => Err(LibrariumError::Unsupported {
                provider: self.descriptor.id.clone(),
                operation: "retrieve",
            }),
        }
    }
}

/// Config with one enabled, keyless entry per listed provider id.
pub fn config_for(ids: &[&str]) -> Config {
    let mut config = Config::default();
    for id in ids {
        config
            .providers
            .insert(id.to_string(), ProviderEntry::default());
    }
    config
}
