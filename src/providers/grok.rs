//! xAI Grok with live search enabled. Grounded answers with a flat
//! citation url list.

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
    Citation, ProviderCapabilities, ProviderDescriptor, ProviderResult, TokenUsage, Tier,
};

const API_URL: &str = "https://api.x.ai/v1/chat/completions";
const DEFAULT_MODEL: &str = "grok-4-1-fast";

fn request_body(query: &str, model: &str) -> Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": query}],
        "search_parameters": {"mode": "auto", "return_citations": true},
    })
}

pub fn parse_completion(json: &Value) -> Result<(String, Vec<Citation>, Option<TokenUsage>), String> {
    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "empty choices or null content".to_string())?
        .to_string();

    let citations = json["citations"]
        .as_array()
        .map(|urls| {
            urls.iter()
                .filter_map(|u| u.as_str())
                .filter(|u| !u.is_empty())
                .map(|url| Citation {
                    url: url.to_string(),
                    title: None,
                    snippet: None,
                    provider: String::new(),
                })
                .collect()
        })
        .unwrap_or_default();

    let usage = json.get("usage").map(|u| TokenUsage {
        input: u["prompt_tokens"].as_u64(),
        output: u["completion_tokens"].as_u64(),
    });

    Ok((content, citations, usage))
}

pub struct GrokProvider {
    descriptor: ProviderDescriptor,
    http: HttpClient,
}

impl GrokProvider {
    pub fn new(http: HttpClient) -> Self {
        Self {
            descriptor: builtin_descriptor(
                "grok-search",
                "Grok Live Search",
                Tier::AiGrounded,
                "XAI_API_KEY",
                ProviderCapabilities::sync_only(),
            ),
            http,
        }
    }
}

#[async_trait]
impl Provider for GrokProvider {
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
        let model = opts.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let headers = vec![("Authorization".to_string(), format!("Bearer {api_key}"))];

        let response = match self
            .http
            .request(
                Method::POST,
                API_URL,
                &headers,
                Some(&request_body(query, model)),
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

        match parse_completion(json) {
            Ok((content, mut citations, token_usage)) => {
                for citation in &mut citations {
                    citation.provider = self.descriptor.id.clone();
                }
                Ok(ProviderResult {
                    provider: self.descriptor.id.clone(),
                    tier: self.descriptor.tier,
                    content,
                    citations,
                    duration_ms,
                    model: Some(model.to_string()),
                    token_usage,
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_completion_collects_citation_urls() {
        let json = serde_json::json!({
            "choices": [{"message": {"content": "grounded answer"}}],
            "citations": ["https://x.com/post", "https://doc.rs"],
            "usage": {"prompt_tokens": 5, "completion_tokens": 20}
        });
        let (content, citations, usage) = parse_completion(&json).unwrap();
        assert_eq!(content, "grounded answer");
        assert_eq!(citations.len(), 2);
        assert_eq!(usage.unwrap().input, Some(5));
    }

    #[test]
    fn parse_completion_without_citations() {
        let json = serde_json::json!({"choices": [{"message": {"content": "plain"}}]});
        let (_, citations, _) = parse_completion(&json).unwrap();
        assert!(citations.is_empty());
    }

    #[test]
    fn request_body_enables_live_search() {
        let body = request_body("q", DEFAULT_MODEL);
        assert_eq!(body["search_parameters"]["mode"], "auto");
        assert_eq!(body["search_parameters"]["return_citations"], true);
    }
}
