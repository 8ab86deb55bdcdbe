//! Perplexity adapters: the grounded `sonar-pro` chat model and the
//! blocking `sonar-deep-research` model wrapped in a synthetic async shape
//! so it can share the deep-research dispatch path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

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

const API_URL: &str = "https://api.perplexity.ai/chat/completions";

/// Counter for synthetic task-id uniqueness within one process.
static TASK_COUNTER: AtomicU64 = AtomicU64::new(0);

fn request_body(query: &str, model: &str) -> Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": query}],
    })
}

fn auth_headers(api_key: &str) -> Vec<(String, String)> {
    vec![("Authorization".to_string(), format!("Bearer {api_key}"))]
}

/// Parse a Perplexity chat completion into content, citations, and usage.
pub fn parse_completion(json: &Value) -> Result<(String, Vec<Citation>, Option<TokenUsage>), String> {
    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "empty choices or null content".to_string())?
        .to_string();

    // Newer responses carry search_results with titles; older ones only a
    // bare citations url array.
    let mut citations = Vec::new();
    if let Some(results) = json["search_results"].as_array() {
        for result in results {
            if let Some(url) = result["url"].as_str().filter(|u| !u.is_empty()) {
                citations.push(Citation {
                    url: url.to_string(),
                    title: result["title"].as_str().map(str::to_string),
                    snippet: result["snippet"].as_str().map(str::to_string),
                    provider: String::new(),
                });
            }
        }
    }
    if citations.is_empty()
        && let Some(urls) = json["citations"].as_array()
    {
        for url in urls {
            if let Some(url) = url.as_str().filter(|u| !u.is_empty()) {
                citations.push(Citation {
                    url: url.to_string(),
                    title: None,
                    snippet: None,
                    provider: String::new(),
                });
            }
        }
    }

    let usage = json.get("usage").map(|u| TokenUsage {
        input: u["prompt_tokens"].as_u64(),
        output: u["completion_tokens"].as_u64(),
    });

    Ok((content, citations, usage))
}

async fn run_completion(
    http: &HttpClient,
    descriptor: &ProviderDescriptor,
    default_model: &str,
    query: &str,
    opts: &ProviderOptions,
) -> ProviderResult {
    let start = Instant::now();
    let Some(api_key) = opts.api_key.as_deref() else {
        return error_result(descriptor, 0, missing_key_message(descriptor));
    };
    let model = opts.model.as_deref().unwrap_or(default_model);

    let response = match http
        .request(
            Method::POST,
            API_URL,
            &auth_headers(api_key),
            Some(&request_body(query, model)),
            opts.timeout,
            &opts.cancel,
        )
        .await
    {
        Ok(r) => r,
        Err(e) => {
            return error_result(
                descriptor,
                start.elapsed().as_millis() as u64,
                transport_error_message(&descriptor.display_name, &e),
            );
        }
    };

    let duration_ms = response.duration_ms;
    if !response.is_success() {
        return error_result(
            descriptor,
            duration_ms,
            http_error_message(&descriptor.display_name, &descriptor.env_var, &response),
        );
    }

    let Some(json) = response.body.as_json() else {
        return error_result(
            descriptor,
            duration_ms,
            format!("{} returned a non-JSON body", descriptor.display_name),
        );
    };

    match parse_completion(json) {
        Ok((content, mut citations, token_usage)) => {
            for citation in &mut citations {
                citation.provider = descriptor.id.clone();
            }
            ProviderResult {
                provider: descriptor.id.clone(),
                tier: descriptor.tier,
                content,
                citations,
                duration_ms,
                model: Some(model.to_string()),
                token_usage,
                error: None,
            }
        }
        Err(message) => error_result(
            descriptor,
            duration_ms,
            format!("{}: {message}", descriptor.display_name),
        ),
    }
}

// ---------------------------------------------------------------------------
// perplexity-sonar-pro (ai-grounded, sync)
// ---------------------------------------------------------------------------

pub struct SonarProvider {
    descriptor: ProviderDescriptor,
    http: HttpClient,
}

impl SonarProvider {
    pub fn new(http: HttpClient) -> Self {
        Self {
            descriptor: builtin_descriptor(
                "perplexity-sonar-pro",
                "Perplexity Sonar Pro",
                Tier::AiGrounded,
                "PERPLEXITY_API_KEY",
                ProviderCapabilities::sync_only(),
            ),
            http,
        }
    }
}

#[async_trait]
impl Provider for SonarProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        query: &str,
        opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError> {
        Ok(run_completion(&self.http, &self.descriptor, "sonar-pro", query, opts).await)
    }
}

// ---------------------------------------------------------------------------
// perplexity-deep-research (deep-research, synthetic async)
// ---------------------------------------------------------------------------

/// Wraps the blocking `sonar-deep-research` completion behind the async
/// handle lifecycle: `submit` runs the whole query, caches the result, and
/// returns an already-terminal handle; `retrieve` drains the cache. The
/// cache is in-memory and best-effort by design; a process restart between
/// submit and retrieve surfaces as an unknown task.
pub struct SonarDeepResearchProvider {
    descriptor: ProviderDescriptor,
    http: HttpClient,
    cache: Mutex<HashMap<String, ProviderResult>>,
}

impl SonarDeepResearchProvider {
    pub fn new(http: HttpClient) -> Self {
        Self {
            descriptor: builtin_descriptor(
                "perplexity-deep-research",
                "Perplexity Deep Research",
                Tier::DeepResearch,
                "PERPLEXITY_API_KEY",
                ProviderCapabilities::with_async(),
            ),
            http,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn next_task_id() -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let seq = TASK_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("pplx-deep-{millis}-{seq}")
    }
}

#[async_trait]
impl Provider for SonarDeepResearchProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        query: &str,
        opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError> {
        Ok(run_completion(
            &self.http,
            &self.descriptor,
            "sonar-deep-research",
            query,
            opts,
        )
        .await)
    }

    async fn submit(
        &self,
        query: &str,
        opts: &ProviderOptions,
    ) -> Result<TaskHandle, LibrariumError> {
        let result = self.execute(query, opts).await?;
        let status = if result.failed() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        let task_id = Self::next_task_id();
        let submitted_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .insert(task_id.clone(), result);
        Ok(TaskHandle {
            provider: self.descriptor.id.clone(),
            task_id,
            query: query.to_string(),
            submitted_at,
            status,
            last_polled_at: None,
            completed_at: Some(submitted_at),
            output_dir: None,
        })
    }

    async fn poll(
        &self,
        handle: &TaskHandle,
        _opts: &ProviderOptions,
    ) -> Result<PollUpdate, LibrariumError> {
        let cache = self.cache.lock().expect("cache lock poisoned");
        match cache.get(&handle.task_id) {
            Some(result) if result.failed() => Ok(PollUpdate {
                status: TaskStatus::Failed,
                progress: None,
                message: result.error.clone(),
            }),
            Some(_) => Ok(PollUpdate {
                status: TaskStatus::Completed,
                progress: Some(1.0),
                message: None,
            }),
            None => Ok(PollUpdate {
                status: TaskStatus::Failed,
                progress: None,
                message: Some("no cached result for task (process restarted?)".to_string()),
            }),
        }
    }

    async fn retrieve(
        &self,
        handle: &TaskHandle,
        _opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError> {
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .remove(&handle.task_id)
            .ok_or_else(|| LibrariumError::UnknownTask {
                provider: self.descriptor.id.clone(),
                task_id: handle.task_id.clone(),
            })
    }
}
