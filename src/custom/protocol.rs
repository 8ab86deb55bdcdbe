//! JSON envelope protocol spoken between the engine and custom-provider
//! subprocesses. One request on the child's stdin, one response on its
//! stdout, one process per operation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LibrariumError;
use crate::types::{ProviderCapabilities, TaskHandle, Tier};

pub const PROTOCOL_VERSION: u32 = 1;

pub const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(30);
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const RETRIEVE_TIMEOUT: Duration = Duration::from_secs(120);
/// execute/submit use the caller's timeout, never below this floor.
pub const MIN_CALLER_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Describe,
    Execute,
    Submit,
    Poll,
    Retrieve,
    Test,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Describe => "describe",
            Operation::Execute => "execute",
            Operation::Submit => "submit",
            Operation::Poll => "poll",
            Operation::Retrieve => "retrieve",
            Operation::Test => "test",
        }
    }

    /// Operation deadline. `describe`/`poll`/`test` are quick control
    /// calls; `retrieve` may pull a large artifact; `execute`/`submit`
    /// inherit the caller's budget.
    pub fn timeout(&self, caller: Duration) -> Duration {
        match self {
            Operation::Describe => DESCRIBE_TIMEOUT,
            Operation::Poll => POLL_TIMEOUT,
            Operation::Test => TEST_TIMEOUT,
            Operation::Retrieve => RETRIEVE_TIMEOUT,
            Operation::Execute | Operation::Submit => caller.max(MIN_CALLER_TIMEOUT),
        }
    }
}

/// Request envelope written to the child.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<'a> {
    pub protocol_version: u32,
    pub operation: Operation,
    pub provider_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<&'a TaskHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_options: Option<&'a Value>,
}

/// Raw response envelope read from the child.
#[derive(Debug, Deserialize)]
struct RawResponse {
    ok: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse and validate a child's stdout into the operation payload.
pub fn parse_response(provider_id: &str, stdout: &[u8]) -> Result<Value, LibrariumError> {
    let raw: RawResponse =
        serde_json::from_slice(stdout).map_err(|e| LibrariumError::Protocol {
            provider: provider_id.to_string(),
            message: format!("non-JSON response envelope: {e}"),
        })?;

    if raw.ok {
        raw.data.ok_or_else(|| LibrariumError::Protocol {
            provider: provider_id.to_string(),
            message: "response has ok=true but no data".to_string(),
        })
    } else {
        let message = raw
            .error
            .filter(|e| !e.is_empty())
            .ok_or_else(|| LibrariumError::Protocol {
                provider: provider_id.to_string(),
                message: "response has ok=false but no error".to_string(),
            })?;
        Err(LibrariumError::Protocol {
            provider: provider_id.to_string(),
            message,
        })
    }
}

/// `describe` payload: identity and capability declaration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeData {
    #[serde(default)]
    pub id: Option<String>,
    pub display_name: String,
    pub tier: Tier,
    #[serde(default)]
    pub env_var: Option<String>,
    #[serde(default)]
    pub requires_api_key: Option<bool>,
    #[serde(default)]
    pub capabilities: ProviderCapabilities,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_timeouts() {
        let caller = Duration::from_secs(90);
        assert_eq!(Operation::Describe.timeout(caller), DESCRIBE_TIMEOUT);
        assert_eq!(Operation::Retrieve.timeout(caller), RETRIEVE_TIMEOUT);
        assert_eq!(Operation::Execute.timeout(caller), caller);
        assert_eq!(
            Operation::Submit.timeout(Duration::from_millis(10)),
            MIN_CALLER_TIMEOUT
        );
    }

    #[test]
    fn parse_response_ok_requires_data() {
        let value = parse_response("p", br#"{"ok": true, "data": {"x": 1}}"#).unwrap();
        assert_eq!(value["x"], 1);
        assert!(parse_response("p", br#"{"ok": true}"#).is_err());
    }

    #[test]
    fn parse_response_error_requires_message() {
        let err = parse_response("p", br#"{"ok": false, "error": "boom"}"#).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(parse_response("p", br#"{"ok": false, "error": ""}"#).is_err());
        assert!(parse_response("p", br#"{"ok": false}"#).is_err());
    }

    #[test]
    fn parse_response_rejects_garbage() {
        assert!(parse_response("p", b"hello world").is_err());
    }

    #[test]
    fn request_serializes_camel_case() {
        let req = Request {
            protocol_version: PROTOCOL_VERSION,
            operation: Operation::Execute,
            provider_id: "my-provider",
            query: Some("q"),
            handle: None,
            options: None,
            provider_config: None,
            source_options: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["protocolVersion"], 1);
        assert_eq!(json["operation"], "execute");
        assert_eq!(json["providerId"], "my-provider");
        assert!(json.get("handle").is_none());
    }

    #[test]
    fn describe_data_defaults() {
        let data: DescribeData = serde_json::from_value(serde_json::json!({
            "displayName": "My Provider",
            "tier": "raw-search"
        }))
        .unwrap();
        assert!(data.id.is_none());
        assert!(data.capabilities.execute);
        assert!(!data.capabilities.submit);
    }
}
