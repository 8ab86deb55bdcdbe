//! OpenAI deep research over the Responses API. Natively async: `submit`
//! launches a background job, `poll` checks it, `retrieve` fetches the
//! report with url-citation annotations. `execute` drives the same three
//! steps to completion for sync dispatches.

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
    TaskStatus, TokenUsage, Tier,
};

const API_URL: &str = "https://api.openai.com/v1/responses";
const DEFAULT_MODEL: &str = "o4-mini-deep-research";

/// Interval between polls when `execute` drives the job synchronously.
const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(15);

fn submit_body(query: &str, model: &str) -> Value {
    serde_json::json!({
        "model": model,
        "input": [{"role": "user", "content": query}],
        "tools": [{"type": "web_search_preview"}],
        "background": true,
        "store": true,
    })
}

fn auth_headers(api_key: &str) -> Vec<(String, String)> {
    vec![("Authorization".to_string(), format!("Bearer {api_key}"))]
}

/// Extract the job id and initial status from a launch response.
pub fn parse_submit(json: &Value) -> Result<(String, TaskStatus), String> {
    let id = json["id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "launch response missing 'id'".to_string())?;
    let status = json["status"]
        .as_str()
        .map(map_status)
        .unwrap_or(TaskStatus::Pending);
    Ok((id.to_string(), status))
}

pub fn map_status(status: &str) -> TaskStatus {
    match status {
        "queued" => TaskStatus::Pending,
        "in_progress" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "cancelled" => TaskStatus::Cancelled,
        // failed, incomplete, anything unknown
        _ => TaskStatus::Failed,
    }
}

/// Assemble report text and citations from a completed response. Citations
/// come from `url_citation` annotations on the output text parts.
pub fn extract_result(json: &Value) -> (String, Vec<Citation>, Option<TokenUsage>) {
    let mut content = String::new();
    let mut citations = Vec::new();

    if let Some(output) = json["output"].as_array() {
        for item in output {
            let Some(parts) = item["content"].as_array() else {
                continue;
            };
            for part in parts {
                if part["type"] == "output_text" {
                    if let Some(text) = part["text"].as_str() {
                        if !content.is_empty() {
                            content.push_str("\n\n");
                        }
                        content.push_str(text);
                    }
                    if let Some(annotations) = part["annotations"].as_array() {
                        for annotation in annotations {
                            if annotation["type"] == "url_citation"
                                && let Some(url) =
                                    annotation["url"].as_str().filter(|u| !u.is_empty())
                            {
                                citations.push(Citation {
                                    url: url.to_string(),
                                    title: annotation["title"].as_str().map(str::to_string),
                                    snippet: None,
                                    provider: String::new(),
                                });
                            }
                        }
                    }
                }
            }
        }
    }
    if content.is_empty()
        && let Some(text) = json["output_text"].as_str()
    {
        content = text.to_string();
    }

    let usage = json.get("usage").map(|u| TokenUsage {
        input: u["input_tokens"].as_u64(),
        output: u["output_tokens"].as_u64(),
    });

    (content, citations, usage)
}

pub struct OpenAiDeepResearchProvider {
    descriptor: ProviderDescriptor,
    http: HttpClient,
}

impl OpenAiDeepResearchProvider {
    pub fn new(http: HttpClient) -> Self {
        Self {
            descriptor: builtin_descriptor(
                "openai-deep-research",
                "OpenAI Deep Research",
                Tier::DeepResearch,
                "OPENAI_API_KEY",
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
        let url = format!("{API_URL}/{task_id}");
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
}

#[async_trait]
impl Provider for OpenAiDeepResearchProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    /// Sync path: launch the background job and drive it to completion
    /// within the caller's timeout.
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
        let api_key = opts
            .api_key
            .as_deref()
            .ok_or_else(|| LibrariumError::AuthFailed {
                provider: self.descriptor.id.clone(),
                message: missing_key_message(&self.descriptor),
            })?;
        let model = opts.model.as_deref().unwrap_or(DEFAULT_MODEL);

        let response = self
            .http
            .request(
                Method::POST,
                API_URL,
                &auth_headers(api_key),
                Some(&submit_body(query, model)),
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
        let (task_id, status) = parse_submit(json).map_err(LibrariumError::SchemaParse)?;

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
        let api_key = opts
            .api_key
            .as_deref()
            .ok_or_else(|| LibrariumError::AuthFailed {
                provider: self.descriptor.id.clone(),
                message: missing_key_message(&self.descriptor),
            })?;
        let json = self.fetch_job(&handle.task_id, api_key, opts).await?;
        let status = json["status"]
            .as_str()
            .map(map_status)
            .ok_or_else(|| LibrariumError::SchemaParse("poll response missing 'status'".into()))?;
        let message = json["error"]["message"].as_str().map(str::to_string);
        Ok(PollUpdate {
            status,
            progress: None,
            message,
        })
    }

    async fn retrieve(
        &self,
        handle: &TaskHandle,
        opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError> {
        let api_key = opts
            .api_key
            .as_deref()
            .ok_or_else(|| LibrariumError::AuthFailed {
                provider: self.descriptor.id.clone(),
                message: missing_key_message(&self.descriptor),
            })?;
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

        let (content, mut citations, token_usage) = extract_result(&json);
        for citation in &mut citations {
            citation.provider = self.descriptor.id.clone();
        }
        Ok(ProviderResult {
            provider: self.descriptor.id.clone(),
            tier: self.descriptor.tier,
            content,
            citations,
            duration_ms: start.elapsed().as_millis() as u64,
            model: json["model"].as_str().map(str::to_string),
            token_usage,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_body_requests_background_job() {
        let body = submit_body("What is Rust?", DEFAULT_MODEL);
        assert_eq!(body["background"], true);
        assert_eq!(body["store"], true);
        assert_eq!(body["tools"][0]["type"], "web_search_preview");
        assert_eq!(body["input"][0]["content"], "What is Rust?");
    }

    #[test]
    fn parse_submit_extracts_id_and_status() {
        let json = serde_json::json!({"id": "resp_abc", "status": "queued"});
        let (id, status) = parse_submit(&json).unwrap();
        assert_eq!(id, "resp_abc");
        assert_eq!(status, TaskStatus::Pending);
    }

    #[test]
    fn parse_submit_missing_id_fails() {
        assert!(parse_submit(&serde_json::json!({"status": "queued"})).is_err());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(map_status("queued"), TaskStatus::Pending);
        assert_eq!(map_status("in_progress"), TaskStatus::Running);
        assert_eq!(map_status("completed"), TaskStatus::Completed);
        assert_eq!(map_status("cancelled"), TaskStatus::Cancelled);
        assert_eq!(map_status("failed"), TaskStatus::Failed);
        assert_eq!(map_status("incomplete"), TaskStatus::Failed);
    }

    #[test]
    fn extract_result_collects_annotations() {
        let json = serde_json::json!({
            "status": "completed",
            "output": [{
                "type": "message",
                "content": [{
                    "type": "output_text",
                    "text": "Findings here.",
                    "annotations": [
                        {"type": "url_citation", "url": "https://a.com", "title": "A"},
                        {"type": "file_citation", "file_id": "f1"}
                    ]
                }]
            }],
            "usage": {"input_tokens": 100, "output_tokens": 900}
        });
        let (content, citations, usage) = extract_result(&json);
        assert_eq!(content, "Findings here.");
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].url, "https://a.com");
        assert_eq!(usage.unwrap().input, Some(100));
    }

    #[test]
    fn extract_result_falls_back_to_output_text() {
        let json = serde_json::json!({"status": "completed", "output_text": "short"});
        let (content, citations, _) = extract_result(&json);
        assert_eq!(content, "short");
        assert!(citations.is_empty());
    }
}
