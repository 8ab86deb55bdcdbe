//! Brave web search. GET with the query in the url, token in a header.

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

const API_URL: &str = "https://api.search.brave.com/res/v1/web/search";

fn search_url(query: &str, count: u64) -> String {
    let encoded: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("q", query)
        .append_pair("count", &count.to_string())
        .finish();
    format!("{API_URL}?{encoded}")
}

pub fn parse_results(json: &Value) -> Result<(String, Vec<Citation>), String> {
    let results = json["web"]["results"]
        .as_array()
        .ok_or_else(|| "response missing 'web.results'".to_string())?;

    let mut content = String::new();
    let mut citations = Vec::new();
    for (i, result) in results.iter().enumerate() {
        let Some(url) = result["url"].as_str().filter(|u| !u.is_empty()) else {
            continue;
        };
        let title = result["title"].as_str().filter(|t| !t.is_empty());
        let snippet = result["description"].as_str().map(str::to_string);

        content.push_str(&format!("{}. [{}]({url})\n", i + 1, title.unwrap_or(url)));
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

pub struct BraveProvider {
    descriptor: ProviderDescriptor,
    http: HttpClient,
}

impl BraveProvider {
    pub fn new(http: HttpClient) -> Self {
        let mut capabilities = ProviderCapabilities::sync_only();
        capabilities.test = true;
        Self {
            descriptor: builtin_descriptor(
                "brave-search",
                "Brave Search",
                Tier::RawSearch,
                "BRAVE_API_KEY",
                capabilities,
            ),
            http,
        }
    }
}

#[async_trait]
impl Provider for BraveProvider {
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
        let count = opts
            .extra
            .get("count")
            .and_then(Value::as_u64)
            .unwrap_or(10);
        let headers = vec![
            ("X-Subscription-Token".to_string(), api_key.to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ];

        let response = match self
            .http
            .request(
                Method::GET,
                &search_url(query, count),
                &headers,
                None,
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
        probe.extra = serde_json::json!({"count": 1});
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_encodes_query() {
        let url = search_url("rust async & await", 5);
        assert!(url.starts_with(API_URL));
        assert!(url.contains("q=rust+async+%26+await"));
        assert!(url.contains("count=5"));
    }

    #[test]
    fn parse_results_reads_web_results() {
        let json = serde_json::json!({
            "web": {"results": [
                {"title": "Tokio", "url": "https://tokio.rs", "description": "async runtime"}
            ]}
        });
        let (content, citations) = parse_results(&json).unwrap();
        assert!(content.contains("[Tokio](https://tokio.rs)"));
        assert_eq!(citations[0].snippet.as_deref(), Some("async runtime"));
    }

    #[test]
    fn parse_results_missing_web_block() {
        assert!(parse_results(&serde_json::json!({})).is_err());
    }
}
