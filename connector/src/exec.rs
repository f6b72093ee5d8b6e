//! HostExec — the single choke-point for running host shell commands.
//!
//! Every other module in this crate treats the host as a black box driven
//! by standard Linux utilities (`multipath`, `nvme`, `blockdev`, `mount`,
//! …). Centralizing the exec path here gives us one place to enforce
//! timeouts and redact sensitive argv fragments before they hit a log
//! line, wrapping every `Command::new(...).output()` with `tracing`
//! fields once, generically, instead of at every call site.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ConnectorError, Result};

/// Output of a host command: stdout and stderr interleaved into one
/// string, plus a success flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub success: bool,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn lines(&self) -> std::str::Lines<'_> {
        self.output.lines()
    }
}

/// Argv positions to mask before logging. Used for CHAP secrets and other
/// flags that must never land in a log line even though the real process
/// needs the unmasked value.
#[derive(Debug, Clone, Default)]
pub struct MaskSpec {
    pub indices: Vec<usize>,
}

impl MaskSpec {
    pub fn none() -> Self {
        Self { indices: Vec::new() }
    }

    pub fn at(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            indices: indices.into_iter().collect(),
        }
    }

    fn render(&self, args: &[String]) -> Vec<String> {
        args.iter()
            .enumerate()
            .map(|(i, a)| {
                if self.indices.contains(&i) {
                    "***".to_string()
                } else {
                    a.clone()
                }
            })
            .collect()
    }
}

/// Abstraction over "run a host command", so production code talks to the
/// real shell and tests talk to a canned registry (grounded in the
/// `MockCommandRegistry` pattern from the retrieval pack's sayonara
/// example).
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
        mask: MaskSpec,
    ) -> Result<CommandOutput>;
}

/// Convenience helpers built on top of `Executor::run`.
#[async_trait::async_trait]
pub trait ExecutorExt: Executor {
    async fn run_unmasked(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.run(program, &args, timeout, MaskSpec::none()).await
    }
}

impl<T: Executor + ?Sized> ExecutorExt for T {}

/// Real executor: spawns the host binary and applies the configured
/// per-invocation timeout.
pub struct ShellExecutor;

#[async_trait::async_trait]
impl Executor for ShellExecutor {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
        mask: MaskSpec,
    ) -> Result<CommandOutput> {
        let rendered = mask.render(args);
        debug!(program = %program, args = ?rendered, timeout_s = timeout.as_secs(), "exec");

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let fut = cmd.output();
        let output = match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ConnectorError::Io(e)),
            Err(_) => {
                warn!(program = %program, args = ?rendered, "exec timed out");
                return Err(ConnectorError::Timeout(timeout));
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        Ok(CommandOutput {
            output: combined,
            success: output.status.success(),
            exit_code: output.status.code(),
        })
    }
}

/// A canned command response for `MockExecutor`.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub output: String,
    pub success: bool,
    pub exit_code: Option<i32>,
}

impl MockResponse {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            exit_code: Some(0),
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
            exit_code: Some(1),
        }
    }

    /// Set an explicit exit code, e.g. `nvme connect`'s "already connected"
    /// code 70, which is a non-zero but still successful outcome.
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

/// Test double for `Executor`. Commands are keyed on `"<program> <args...>"`
/// joined with single spaces; callers register expected invocations up
/// front. Unregistered invocations return a `HostCommandFailed` so tests
/// fail loudly instead of hanging on a real subprocess call.
#[derive(Clone, Default)]
pub struct MockExecutor {
    responses: Arc<Mutex<HashMap<String, MockResponse>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(program: &str, args: &[impl AsRef<str>]) -> String {
        let mut key = program.to_string();
        for a in args {
            key.push(' ');
            key.push_str(a.as_ref());
        }
        key
    }

    pub fn register(&self, program: &str, args: &[&str], response: MockResponse) {
        let key = Self::key(program, args);
        self.responses.lock().unwrap().insert(key, response);
    }

    /// Register a response for a command whose exact argv doesn't matter,
    /// only the program name — useful for discovery/listing commands that
    /// attachers call with slightly different flags per code path.
    pub fn register_program(&self, program: &str, response: MockResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert(program.to_string(), response);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, program: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(program))
            .count()
    }
}

#[async_trait::async_trait]
impl Executor for MockExecutor {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
        _mask: MaskSpec,
    ) -> Result<CommandOutput> {
        let key = Self::key(program, args);
        self.calls.lock().unwrap().push(key.clone());

        let responses = self.responses.lock().unwrap();
        if let Some(resp) = responses.get(&key) {
            return Ok(CommandOutput {
                output: resp.output.clone(),
                success: resp.success,
                exit_code: resp.exit_code,
            });
        }
        if let Some(resp) = responses.get(program) {
            return Ok(CommandOutput {
                output: resp.output.clone(),
                success: resp.success,
                exit_code: resp.exit_code,
            });
        }
        Err(ConnectorError::HostCommandFailed(format!(
            "no mock registered for '{}'",
            key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_executor_returns_registered_response() {
        let exec = MockExecutor::new();
        exec.register("blockdev", &["--getsize64", "/dev/sdx"], MockResponse::ok("1073741824\n"));

        let out = exec
            .run_unmasked("blockdev", &["--getsize64", "/dev/sdx"], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.output.trim(), "1073741824");
        assert!(out.success);
    }

    #[tokio::test]
    async fn mock_executor_fails_closed_on_unregistered_command() {
        let exec = MockExecutor::new();
        let result = exec
            .run_unmasked("scsi_id", &["--page", "0x83", "/dev/sdz"], Duration::from_secs(1))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn mock_executor_records_calls() {
        let exec = MockExecutor::new();
        exec.register_program("iscsiadm", MockResponse::ok(""));
        exec.run_unmasked("iscsiadm", &["-m", "discovery"], Duration::from_secs(1))
            .await
            .unwrap();
        exec.run_unmasked("iscsiadm", &["-m", "node", "--login"], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(exec.call_count("iscsiadm"), 2);
    }

    #[test]
    fn mask_spec_redacts_selected_indices() {
        let args = vec!["login".to_string(), "secret-chap-pw".to_string()];
        let mask = MaskSpec::at([1]);
        let rendered = mask.render(&args);
        assert_eq!(rendered[0], "login");
        assert_eq!(rendered[1], "***");
    }

    #[tokio::test]
    async fn shell_executor_runs_real_command_and_times_out() {
        let exec = ShellExecutor;
        let out = exec
            .run_unmasked("echo", &["hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.output.trim(), "hello");
        assert!(out.success);

        let result = exec
            .run_unmasked("sleep", &["2"], Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ConnectorError::Timeout(_))));
    }
}
