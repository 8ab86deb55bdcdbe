//! Subprocess transport for custom providers. Every operation spawns one
//! child, writes one request envelope to its stdin, and reads one response
//! envelope from its stdout. No shell, piped stdio only, the whole process
//! group is killed on timeout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::custom::protocol::{self, Operation, Request};
use crate::error::LibrariumError;
use crate::providers::{Provider, ProviderOptions};
use crate::types::{PollUpdate, ProviderDescriptor, ProviderResult, TaskHandle, TestOutcome};

/// Cap on a child's stdout/stderr. A response envelope has no business
/// being larger.
pub const MAX_IPC_OUTPUT: usize = 2 * 1024 * 1024;

/// How to start the child process for one provider.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Run one operation against the child and return its raw stdout.
async fn run_child(
    invocation: &Invocation,
    input: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, LibrariumError> {
    let start = Instant::now();

    let mut cmd = Command::new(&invocation.command);
    cmd.args(&invocation.args)
        .envs(&invocation.env)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(ref cwd) = invocation.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|e| {
        LibrariumError::Other(format!("failed to spawn {}: {e}", invocation.command))
    })?;

    // Feed stdin from a task so a child that echoes before draining its
    // input cannot deadlock against us on full pipes.
    {
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let payload = input.to_vec();
        tokio::spawn(async move {
            let _ = stdin.write_all(&payload).await;
            let _ = stdin.write_all(b"\n").await;
            // drop closes the pipe, child sees EOF
        });
    }

    let child_pid = child.id();
    let stdout_pipe = child.stdout.take().expect("stdout was piped");
    let stderr_pipe = child.stderr.take().expect("stderr was piped");

    let read_future = async {
        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::with_capacity(64 * 1024);
            let mut capped = stdout_pipe.take(MAX_IPC_OUTPUT as u64);
            let _ = capped.read_to_end(&mut buf).await;
            buf
        });
        let stderr_handle = tokio::spawn(async move {
            let mut buf = Vec::with_capacity(8 * 1024);
            let mut capped = stderr_pipe.take(MAX_IPC_OUTPUT as u64);
            let _ = capped.read_to_end(&mut buf).await;
            buf
        });

        let stdout = stdout_handle.await.unwrap_or_default();
        // A child blocked on a full (capped) stdout pipe never reaches EOF
        // on stderr; kill the group so the second read can finish.
        if stdout.len() >= MAX_IPC_OUTPUT
            && let Some(pid) = child_pid
        {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
        let stderr = stderr_handle.await.unwrap_or_default();
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((stdout, stderr, status))
    };

    let (stdout, stderr, status) = match tokio::time::timeout(timeout, read_future).await {
        Ok(result) => result.map_err(|e| {
            LibrariumError::Other(format!("failed to read from {}: {e}", invocation.command))
        })?,
        Err(_) => {
            if let Some(pid) = child_pid {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
            return Err(LibrariumError::Timeout(start.elapsed().as_millis() as u64));
        }
    };

    let stderr_text = String::from_utf8_lossy(&stderr).to_string();
    if !status.success() {
        return Err(LibrariumError::ProcessExit {
            code: status.code().unwrap_or(-1),
            stderr: stderr_text,
        });
    }
    if !stderr_text.is_empty() {
        tracing::debug!(command = %invocation.command, stderr = %stderr_text, "provider stderr");
    }

    Ok(stdout)
}

/// Wire form of the per-call options passed to the child.
fn wire_options(opts: &ProviderOptions) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(
        "timeoutMs".to_string(),
        Value::from(opts.timeout.as_millis() as u64),
    );
    if let Some(ref key) = opts.api_key {
        map.insert("apiKey".to_string(), Value::from(key.clone()));
    }
    if let Some(ref model) = opts.model {
        map.insert("model".to_string(), Value::from(model.clone()));
    }
    if !opts.extra.is_null() {
        map.insert("extra".to_string(), opts.extra.clone());
    }
    Value::Object(map)
}

/// A custom provider backed by the envelope protocol, regardless of
/// whether the child is a user script or the Node module host.
pub struct IpcProvider {
    descriptor: ProviderDescriptor,
    invocation: Invocation,
    provider_config: Option<Value>,
    source_options: Option<Value>,
}

impl IpcProvider {
    pub fn new(
        descriptor: ProviderDescriptor,
        invocation: Invocation,
        provider_config: Option<Value>,
        source_options: Option<Value>,
    ) -> Self {
        Self {
            descriptor,
            invocation,
            provider_config,
            source_options,
        }
    }

    async fn call(
        &self,
        operation: Operation,
        query: Option<&str>,
        handle: Option<&TaskHandle>,
        opts: &ProviderOptions,
    ) -> Result<Value, LibrariumError> {
        let request = Request {
            protocol_version: protocol::PROTOCOL_VERSION,
            operation,
            provider_id: &self.descriptor.id,
            query,
            handle,
            options: Some(wire_options(opts)),
            provider_config: self.provider_config.as_ref(),
            source_options: self.source_options.as_ref(),
        };
        let input = serde_json::to_vec(&request)
            .map_err(|e| LibrariumError::Other(format!("failed to encode request: {e}")))?;

        let stdout = run_child(&self.invocation, &input, operation.timeout(opts.timeout)).await?;
        protocol::parse_response(&self.descriptor.id, &stdout)
    }

    fn parse_result(&self, data: Value) -> Result<ProviderResult, LibrariumError> {
        let mut result: ProviderResult =
            serde_json::from_value(data).map_err(|e| LibrariumError::Protocol {
                provider: self.descriptor.id.clone(),
                message: format!("invalid result shape: {e}"),
            })?;
        result.provider = self.descriptor.id.clone();
        result.tier = self.descriptor.tier;
        for citation in &mut result.citations {
            if citation.provider.is_empty() {
                citation.provider = self.descriptor.id.clone();
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl Provider for IpcProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        query: &str,
        opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError> {
        let data = self.call(Operation::Execute, Some(query), None, opts).await?;
        self.parse_result(data)
    }

    async fn submit(
        &self,
        query: &str,
        opts: &ProviderOptions,
    ) -> Result<TaskHandle, LibrariumError> {
        let data = self.call(Operation::Submit, Some(query), None, opts).await?;
        let mut handle: TaskHandle =
            serde_json::from_value(data).map_err(|e| LibrariumError::Protocol {
                provider: self.descriptor.id.clone(),
                message: format!("invalid handle shape: {e}"),
            })?;
        if handle.task_id.is_empty() {
            return Err(LibrariumError::Protocol {
                provider: self.descriptor.id.clone(),
                message: "submit returned an empty taskId".to_string(),
            });
        }
        handle.provider = self.descriptor.id.clone();
        if handle.query.is_empty() {
            handle.query = query.to_string();
        }
        if handle.submitted_at == 0 {
            handle.submitted_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
        }
        Ok(handle)
    }

    async fn poll(
        &self,
        handle: &TaskHandle,
        opts: &ProviderOptions,
    ) -> Result<PollUpdate, LibrariumError> {
        let data = self.call(Operation::Poll, None, Some(handle), opts).await?;
        serde_json::from_value(data).map_err(|e| LibrariumError::Protocol {
            provider: self.descriptor.id.clone(),
            message: format!("invalid poll shape: {e}"),
        })
    }

    async fn retrieve(
        &self,
        handle: &TaskHandle,
        opts: &ProviderOptions,
    ) -> Result<ProviderResult, LibrariumError> {
        let data = self.call(Operation::Retrieve, None, Some(handle), opts).await?;
        self.parse_result(data)
    }

    async fn test(&self, opts: &ProviderOptions) -> TestOutcome {
        match self.call(Operation::Test, None, None, opts).await {
            Ok(data) => serde_json::from_value(data).unwrap_or(TestOutcome {
                ok: false,
                error: Some("invalid test shape".to_string()),
            }),
            Err(e) => TestOutcome {
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Call `describe` once against a prospective provider child.
pub async fn describe(
    invocation: &Invocation,
    provider_id: &str,
    provider_config: Option<&Value>,
    source_options: Option<&Value>,
) -> Result<protocol::DescribeData, LibrariumError> {
    let request = Request {
        protocol_version: protocol::PROTOCOL_VERSION,
        operation: Operation::Describe,
        provider_id,
        query: None,
        handle: None,
        options: None,
        provider_config,
        source_options,
    };
    let input = serde_json::to_vec(&request)
        .map_err(|e| LibrariumError::Other(format!("failed to encode request: {e}")))?;
    let stdout = run_child(invocation, &input, protocol::DESCRIBE_TIMEOUT).await?;
    let data = protocol::parse_response(provider_id, &stdout)?;
    serde_json::from_value(data).map_err(|e| LibrariumError::Protocol {
        provider: provider_id.to_string(),
        message: format!("invalid describe shape: {e}"),
    })
}
