//! Gemini deep research over the Interactions API. Natively async, same
//! lifecycle as the OpenAI adapter but with the Interactions wire shapes:
//! jobs are keyed by an `interactions/...` id and the final report is the
//! last entry of the `outputs` array.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::error::LibrariumError;
use crate::providers::http::HttpClient;
use crate::providers::{
    Provider, ProviderOptions, builtin_descriptor, error_result, http_error_message,
    missing_key_message, transport_error_message,
};
use crate::types::{
    Citation, PollUpdate, ProviderCapabilities, ProviderDescriptor, ProviderResult, TaskHandle,
    TaskStatus, Tier,
};

const API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/interactions";
const DEFAULT_AGENT: &str = "deep-research-pro-preview-12-2025";

const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(45);

fn submit_body(query: &str, agent: &str) -> Value {
    serde_json::json!({
        "agent": agent,
        "input": query,
        "background": true,
    })
}

fn auth_headers(api_key: &str) -> Vec<(String, String)> {
    vec![("x-goog-api-key".to_string(), api_key.to_string())]
}

pub fn map_status(status: &str) -> TaskStatus {
    match status {
        "queued" => TaskStatus::Pending,
        "in_progress" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "cancelled" => TaskStatus::Cancelled,
        _ => TaskStatus::Failed,
    }
}

/// Final report text plus any `sources` attached to the last output.
pub fn extract_result(json: &Value) -> (String, Vec<Citation>) {
    let last = json["outputs"].as_array().and_then(|arr| arr.last());
    let content = last
        .and_then(|item| item["text"].as_str())
        .unwrap_or("")
        .to_string();

    let mut citations = Vec::new();
    if let Some(sources) = last.and_then(|item| item["sources"].as_array()) {
        for source in sources {
            if let Some(url) = source["url"].as_str().filter(|u| !u.is_empty()) {
                citations.push(Citation {
                    url: url.to_string(),
                    title: source["title"].as_str().map(str::to_string),
                    snippet: None,
                    provider: String::new(),
                });
            }
        }
    }
    (content, citations)
}

pub struct GeminiDeepResearchProvider {
    descriptor: ProviderDescriptor,
    http: HttpClient,
}

impl GeminiDeepResearchProvider {
    pub fn new(http: HttpClient) -> Self {
        Self {
            descriptor: builtin_descriptor(
                "gemini-deep-research",
                "Gemini Deep Research",
                Tier::DeepResearch,
                "GOOGLE_API_KEY",
                ProviderCapabilities::with_async(),
            ),
            http,
        }
    }

    async fn fetch_job(
        &self,
        task_id: &str,
        api_key: &str,
        opts: &ProviderOptions,
    ) -> Result<Value, LibrariumError> {
        // Interaction ids already carry the "interactions/" prefix.
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/{}",
            task_id.trim_start_matches('/')
        );
        let response = self
            .http
            .request(
                Method::GET,
                &url,
                &auth_headers(api_key),
                None,
                Duration::from_secs(30).min(opts.timeout),
                &opts.cancel,
            )
            .await?;
        if !response.is_success() {
            return Err(LibrariumError::Upstream {
                provider: self.descriptor.id.clone(),
                message: http_error_message(
                    &self.descriptor.display_name,
                    &self.descriptor.env_var,
                    &response,
                ),
                status: Some(response.status),
            });
        }
        response
            .body
            .as_json()
            .cloned()
            .ok_or_else(|| LibrariumError::SchemaParse("non-JSON poll body".to_string()))
    }

    fn require_key<'a>(&self, opts: &'a ProviderOptions) -> Result<&'a str, LibrariumError> {
        opts.api_key
            .as_deref()
            .ok_or_else(|| LibrariumError::AuthFailed {
                provider: self.descriptor.id.clone(),
                message: missing_key_message(&self.descriptor),
            })
    }
}

#[async_trait]
impl Provider for GeminiDeepResearchProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        query: &str,
        opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError> {
        let start = Instant::now();
        let handle = match self.submit(query, opts).await {
            Ok(h) => h,
            Err(e) => {
                return Ok(error_result(
                    &self.descriptor,
                    start.elapsed().as_millis() as u64,
                    transport_error_message(&self.descriptor.display_name, &e),
                ));
            }
        };

        let deadline = start + opts.timeout;
        loop {
            match self.poll(&handle, opts).await {
                Ok(update) if update.status == TaskStatus::Completed => break,
                Ok(update) if update.status.is_terminal() => {
                    return Ok(error_result(
                        &self.descriptor,
                        start.elapsed().as_millis() as u64,
                        update
                            .message
                            .unwrap_or_else(|| format!("research job {}", update.status)),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    return Ok(error_result(
                        &self.descriptor,
                        start.elapsed().as_millis() as u64,
                        transport_error_message(&self.descriptor.display_name, &e),
                    ));
                }
            }
            if Instant::now() + SYNC_POLL_INTERVAL > deadline {
                return Ok(error_result(
                    &self.descriptor,
                    start.elapsed().as_millis() as u64,
                    format!(
                        "{} timed out after {}ms",
                        self.descriptor.display_name,
                        start.elapsed().as_millis()
                    ),
                ));
            }
            tokio::select! {
                _ = opts.cancel.cancelled() => {
                    return Ok(error_result(
                        &self.descriptor,
                        start.elapsed().as_millis() as u64,
                        transport_error_message(
                            &self.descriptor.display_name,
                            &LibrariumError::Cancelled,
                        ),
                    ));
                }
                _ = tokio::time::sleep(SYNC_POLL_INTERVAL) => {}
            }
        }

        match self.retrieve(&handle, opts).await {
            Ok(mut result) => {
                result.duration_ms = start.elapsed().as_millis() as u64;
                Ok(result)
            }
            Err(e) => Ok(error_result(
                &self.descriptor,
                start.elapsed().as_millis() as u64,
                transport_error_message(&self.descriptor.display_name, &e),
            )),
        }
    }

    async fn submit(
        &self,
        query: &str,
        opts: &ProviderOptions,
    ) -> Result<TaskHandle, LibrariumError> {
        let api_key = self.require_key(opts)?;
        let agent = opts.model.as_deref().unwrap_or(DEFAULT_AGENT);

        let response = self
            .http
            .request(
                Method::POST,
                API_URL,
                &auth_headers(api_key),
                Some(&submit_body(query, agent)),
                Duration::from_secs(60).min(opts.timeout),
                &opts.cancel,
            )
            .await?;
        if !response.is_success() {
            return Err(LibrariumError::Upstream {
                provider: self.descriptor.id.clone(),
                message: http_error_message(
                    &self.descriptor.display_name,
                    &self.descriptor.env_var,
                    &response,
                ),
                status: Some(response.status),
            });
        }
        let json = response
            .body
            .as_json()
            .ok_or_else(|| LibrariumError::SchemaParse("non-JSON launch body".to_string()))?;
        let task_id = json["id"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LibrariumError::SchemaParse("launch response missing 'id'".into()))?
            .to_string();
        let status = json["status"]
            .as_str()
            .map(map_status)
            .unwrap_or(TaskStatus::Pending);

        tracing::info!(provider = %self.descriptor.id, task_id, "research job launched");

        Ok(TaskHandle {
            provider: self.descriptor.id.clone(),
            task_id,
            query: query.to_string(),
            submitted_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            status,
            last_polled_at: None,
            completed_at: None,
            output_dir: None,
        })
    }

    async fn poll(
        &self,
        handle: &TaskHandle,
        opts: &ProviderOptions,
    ) -> Result<PollUpdate, LibrariumError> {
        let api_key = self.require_key(opts)?;
        let json = self.fetch_job(&handle.task_id, api_key, opts).await?;
        let status = json["status"]
            .as_str()
            .map(map_status)
            .ok_or_else(|| LibrariumError::SchemaParse("poll response missing 'status'".into()))?;
        Ok(PollUpdate {
            status,
            progress: None,
            message: json["error"].as_str().map(str::to_string),
        })
    }

    async fn retrieve(
        &self,
        handle: &TaskHandle,
        opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError> {
        let api_key = self.require_key(opts)?;
        let start = Instant::now();
        let json = self.fetch_job(&handle.task_id, api_key, opts).await?;

        if json["status"].as_str().map(map_status) != Some(TaskStatus::Completed) {
            return Err(LibrariumError::Upstream {
                provider: self.descriptor.id.clone(),
                message: format!(
                    "task {} is not completed (status: {})",
                    handle.task_id,
                    json["status"].as_str().unwrap_or("unknown")
                ),
                status: None,
            });
        }

        let (content, mut citations) = extract_result(&json);
        for citation in &mut citations {
            citation.provider = self.descriptor.id.clone();
        }
        Ok(ProviderResult {
            provider: self.descriptor.id.clone(),
            tier: self.descriptor.tier,
            content,
            citations,
            duration_ms: start.elapsed().as_millis() as u64,
            model: json["agent"].as_str().map(str::to_string),
            token_usage: None,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_body_is_background() {
        let body = submit_body("quantum computing", DEFAULT_AGENT);
        assert_eq!(body["agent"], DEFAULT_AGENT);
        assert_eq!(body["input"], "quantum computing");
        assert_eq!(body["background"], true);
    }

    #[test]
    fn extract_result_takes_last_output() {
        let json = serde_json::json!({
            "status": "completed",
            "outputs": [
                {"text": "intermediate"},
                {"text": "final report", "sources": [
                    {"url": "https://a.com", "title": "A"},
                    {"url": ""}
                ]}
            ]
        });
        let (content, citations) = extract_result(&json);
        assert_eq!(content, "final report");
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].title.as_deref(), Some("A"));
    }

    #[test]
    fn extract_result_empty_outputs() {
        let (content, citations) = extract_result(&serde_json::json!({"outputs": []}));
        assert!(content.is_empty());
        assert!(citations.is_empty());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(map_status("in_progress"), TaskStatus::Running);
        assert_eq!(map_status("completed"), TaskStatus::Completed);
        assert_eq!(map_status("failed"), TaskStatus::Failed);
    }
}
