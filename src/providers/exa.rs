//! Exa neural search. Raw result list rendered as a markdown digest.

use std::time::Instant;

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
    Citation, ProviderCapabilities, ProviderDescriptor, ProviderResult, TestOutcome, Tier,
};

const API_URL: &str = "https://api.exa.ai/search";
const DEFAULT_NUM_RESULTS: u64 = 10;

fn request_body(query: &str, num_results: u64) -> Value {
    serde_json::json!({
        "query": query,
        "numResults": num_results,
        "contents": {"text": {"maxCharacters": 1500}},
    })
}

/// Map the result list into citations plus a markdown digest.
pub fn parse_results(json: &Value) -> Result<(String, Vec<Citation>), String> {
    let results = json["results"]
        .as_array()
        .ok_or_else(|| "response missing 'results'".to_string())?;

    let mut content = String::new();
    let mut citations = Vec::new();
    for (i, result) in results.iter().enumerate() {
        let Some(url) = result["url"].as_str().filter(|u| !u.is_empty()) else {
            continue;
        };
        let title = result["title"].as_str().filter(|t| !t.is_empty());
        let snippet = result["text"]
            .as_str()
            .map(|t| t.chars().take(300).collect::<String>());

        content.push_str(&format!(
            "{}. [{}]({url})\n",
            i + 1,
            title.unwrap_or(url)
        ));
        if let Some(ref text) = snippet {
            content.push_str(&format!("   {}\n", text.replace('\n', " ")));
        }

        citations.push(Citation {
            url: url.to_string(),
            title: title.map(str::to_string),
            snippet,
            provider: String::new(),
        });
    }
    Ok((content, citations))
}

pub struct ExaProvider {
    descriptor: ProviderDescriptor,
    http: HttpClient,
}

impl ExaProvider {
    pub fn new(http: HttpClient) -> Self {
        let mut capabilities = ProviderCapabilities::sync_only();
        capabilities.test = true;
        Self {
            descriptor: builtin_descriptor(
                "exa",
                "Exa",
                Tier::RawSearch,
                "EXA_API_KEY",
                capabilities,
            ),
            http,
        }
    }

    fn num_results(&self, opts: &ProviderOptions) -> u64 {
        opts.extra
            .get("numResults")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_NUM_RESULTS)
    }
}

#[async_trait]
impl Provider for ExaProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        query: &str,
        opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError> {
        let start = Instant::now();
        let Some(api_key) = opts.api_key.as_deref() else {
            return Ok(error_result(&self.descriptor, 0, missing_key_message(&self.descriptor)));
        };
        let headers = vec![("x-api-key".to_string(), api_key.to_string())];

        let response = match self
            .http
            .request(
                Method::POST,
                API_URL,
                &headers,
                Some(&request_body(query, self.num_results(opts))),
                opts.timeout,
                &opts.cancel,
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return Ok(error_result(
                    &self.descriptor,
                    start.elapsed().as_millis() as u64,
                    transport_error_message(&self.descriptor.display_name, &e),
                ));
            }
        };

        let duration_ms = response.duration_ms;
        if !response.is_success() {
            return Ok(error_result(
                &self.descriptor,
                duration_ms,
                http_error_message(&self.descriptor.display_name, &self.descriptor.env_var, &response),
            ));
        }
        let Some(json) = response.body.as_json() else {
            return Ok(error_result(
                &self.descriptor,
                duration_ms,
                format!("{} returned a non-JSON body", self.descriptor.display_name),
            ));
        };

        match parse_results(json) {
            Ok((content, mut citations)) => {
                for citation in &mut citations {
                    citation.provider = self.descriptor.id.clone();
                }
                Ok(ProviderResult {
                    provider: self.descriptor.id.clone(),
                    tier: self.descriptor.tier,
                    content,
                    citations,
                    duration_ms,
                    model: None,
                    token_usage: None,
                    error: None,
                })
            }
            Err(message) => Ok(error_result(
                &self.descriptor,
                duration_ms,
                format!("{}: {message}", self.descriptor.display_name),
            )),
        }
    }

    async fn test(&self, opts: &ProviderOptions) -> TestOutcome {
        let mut probe = opts.clone();
        probe.extra = serde_json::json!({"numResults": 1});
        match self.execute("connectivity check", &probe).await {
            Ok(result) if !result.failed() => TestOutcome { ok: true, error: None },
            Ok(result) => TestOutcome {
                ok: false,
                error: result.error,
            },
            Err(e) => TestOutcome {
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }
}
