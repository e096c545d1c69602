//! Process executor: runs one bound nodetool command under a deadline.
//!
//! The command is launched directly from its argv, never through a shell.
//! stdout and stderr are drained concurrently into bounded buffers. On
//! timeout the child gets SIGTERM, then SIGKILL once the grace period runs
//! out. A guard owns the child for the whole run, so a dropped future
//! (caller cancellation) still kills and reaps the process.

use crate::dispatcher::{CallContext, InvocationResult};
use crate::error::DispatchError;
use crate::registry::BoundCommand;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

const READ_CHUNK: usize = 8 * 1024;
const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Launch primitive used by the dispatcher and the health monitor.
#[async_trait]
pub trait CommandLauncher: Send + Sync {
    /// Run `command` to completion or until `timeout` elapses.
    async fn run(
        &self,
        command: &BoundCommand,
        timeout: Duration,
        ctx: &CallContext,
    ) -> InvocationResult;
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace_period: Duration,
    pub max_output_bytes: usize,
    pub max_error_bytes: usize,
    /// Exported as `JAVA_HOME` with its `bin` prepended to `PATH`.
    pub java_home: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kill_grace_period: Duration::from_secs(2),
            max_output_bytes: 8 * 1024 * 1024,
            max_error_bytes: 4 * 1024,
            java_home: None,
        }
    }
}

pub struct ProcessExecutor {
    config: ExecutorConfig,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn command(&self, bound: &BoundCommand) -> Command {
        let mut cmd = Command::new(&bound.program);
        cmd.args(&bound.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref java_home) = self.config.java_home {
            cmd.env("JAVA_HOME", java_home);
            let mut paths = vec![java_home.join("bin")];
            if let Some(existing) = std::env::var_os("PATH") {
                paths.extend(std::env::split_paths(&existing));
            }
            match std::env::join_paths(paths) {
                Ok(path) => {
                    cmd.env("PATH", path);
                }
                Err(e) => tracing::warn!(error = %e, "could not extend PATH with JAVA_HOME/bin"),
            }
        }
        cmd
    }

    async fn execute(&self, bound: &BoundCommand, timeout: Duration) -> Result<String, DispatchError> {
        let child = self
            .command(bound)
            .spawn()
            .map_err(|e| DispatchError::LaunchFailed {
                program: bound.program.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut guard = ProcessGuard::new(child);
        let stdout = guard.child.stdout.take();
        let stderr = guard.child.stderr.take();
        let max_output = self.config.max_output_bytes;
        let max_error = self.config.max_error_bytes;

        let completion = async {
            tokio::join!(
                read_capped(stdout, max_output),
                read_capped(stderr, max_error),
                guard.child.wait(),
            )
        };
        let finished = tokio::time::timeout(timeout, completion).await;

        match finished {
            Ok((stdout, stderr, Ok(status))) => {
                guard.reaped = true;
                if status.success() {
                    Ok(stdout.into_text())
                } else {
                    Err(DispatchError::ExecutionFailed {
                        exit_code: status.code(),
                        stderr: stderr.into_text().trim_end().to_string(),
                    })
                }
            }
            Ok((_, _, Err(e))) => Err(DispatchError::ExecutionFailed {
                exit_code: None,
                stderr: format!("failed to wait for process: {e}"),
            }),
            Err(_) => {
                guard.terminate(self.config.kill_grace_period).await;
                Err(DispatchError::Timeout(timeout))
            }
        }
    }
}

#[async_trait]
impl CommandLauncher for ProcessExecutor {
    async fn run(
        &self,
        command: &BoundCommand,
        timeout: Duration,
        ctx: &CallContext,
    ) -> InvocationResult {
        let mut record = RunRecord::new(ctx, command);
        let outcome = self.execute(command, timeout).await;
        let elapsed = record.finish(&outcome);
        InvocationResult {
            request_id: ctx.request_id,
            operation: command.operation.name().to_string(),
            outcome,
            elapsed,
        }
    }
}

/// Owns a running child and kills it unless it was reaped.
struct ProcessGuard {
    child: Child,
    reaped: bool,
}

impl ProcessGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        let pid = self.child.id();

        #[cfg(unix)]
        if let Some(pid) = pid {
            // SAFETY: plain signal delivery to our own unreaped child.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc == 0 {
                if let Ok(Ok(_)) = tokio::time::timeout(grace, self.child.wait()).await {
                    self.reaped = true;
                    return;
                }
            }
        }

        tracing::warn!(pid, "process ignored SIGTERM, sending SIGKILL");
        if let Err(e) = self.child.kill().await {
            tracing::warn!(pid, error = %e, "failed to kill process");
        }
        self.reaped = true;
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        let pid = self.child.id();
        match self.child.start_kill() {
            Ok(()) => tracing::warn!(pid, "run abandoned before completion, process killed"),
            Err(e) => tracing::warn!(pid, error = %e, "run abandoned, kill failed"),
        }
    }
}

/// Emits the per-run audit record exactly once, including on cancellation.
struct RunRecord<'a> {
    ctx: &'a CallContext,
    command: &'a BoundCommand,
    started: Instant,
    done: bool,
}

impl<'a> RunRecord<'a> {
    fn new(ctx: &'a CallContext, command: &'a BoundCommand) -> Self {
        Self {
            ctx,
            command,
            started: Instant::now(),
            done: false,
        }
    }

    fn finish(&mut self, outcome: &Result<String, DispatchError>) -> Duration {
        self.done = true;
        let elapsed = self.started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        match outcome {
            Ok(output) => tracing::info!(
                target: "cassadmin::audit",
                request_id = %self.ctx.request_id,
                client = %self.ctx.client,
                operation = %self.command.operation,
                argv = ?self.command.argv(),
                elapsed_ms,
                output_bytes = output.len(),
                outcome = "ok",
                "operation completed"
            ),
            Err(err) => {
                let exit_code = match err {
                    DispatchError::ExecutionFailed { exit_code, .. } => *exit_code,
                    _ => None,
                };
                tracing::warn!(
                    target: "cassadmin::audit",
                    request_id = %self.ctx.request_id,
                    client = %self.ctx.client,
                    operation = %self.command.operation,
                    argv = ?self.command.argv(),
                    elapsed_ms,
                    outcome = %err.kind(),
                    exit_code = ?exit_code,
                    error = %err,
                    "operation failed"
                )
            }
        }
        elapsed
    }
}

impl Drop for RunRecord<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(
                target: "cassadmin::audit",
                request_id = %self.ctx.request_id,
                client = %self.ctx.client,
                operation = %self.command.operation,
                argv = ?self.command.argv(),
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                outcome = "cancelled",
                "operation cancelled by caller"
            );
        }
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Drain a pipe to EOF, keeping at most `limit` bytes.
///
/// Reading continues past the limit so the child never blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, limit: usize) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let Some(mut reader) = reader else {
        return captured;
    };

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.bytes.len());
                let keep = n.min(room);
                captured.bytes.extend_from_slice(&buf[..keep]);
                if keep < n {
                    captured.truncated = true;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "pipe read failed");
                break;
            }
        }
    }
    captured
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::registry::Operation;
    use crate::testing::EventCapture;

    fn command(program: &str, args: &[&str]) -> BoundCommand {
        BoundCommand {
            operation: Operation::Status,
            program: PathBuf::from(program),
            args: args.iter().map(|a| a.to_string()).collect(),
            target_host: None,
        }
    }

    fn executor() -> ProcessExecutor {
        ProcessExecutor::new(ExecutorConfig {
            kill_grace_period: Duration::from_millis(200),
            ..ExecutorConfig::default()
        })
    }

    #[tokio::test]
    async fn test_success_returns_stdout() {
        let ctx = CallContext::new("test");
        let result = executor()
            .run(&command("echo", &["Datacenter: dc1"]), Duration::from_secs(5), &ctx)
            .await;
        assert_eq!(result.outcome, Ok("Datacenter: dc1\n".to_string()));
        assert_eq!(result.operation, "status");
        assert_eq!(result.request_id, ctx.request_id);
    }

    #[tokio::test]
    async fn test_metacharacters_reach_the_process_verbatim() {
        let ctx = CallContext::new("test");
        let result = executor()
            .run(
                &command("echo", &["$(whoami)", "; rm -rf /", "`id`"]),
                Duration::from_secs(5),
                &ctx,
            )
            .await;
        assert_eq!(result.outcome, Ok("$(whoami) ; rm -rf / `id`\n".to_string()));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_execution_error() {
        let ctx = CallContext::new("test");
        let result = executor()
            .run(
                &command("sh", &["-c", "echo partial; echo 'connection refused' >&2; exit 3"]),
                Duration::from_secs(5),
                &ctx,
            )
            .await;
        assert_eq!(
            result.outcome,
            Err(DispatchError::ExecutionFailed {
                exit_code: Some(3),
                stderr: "connection refused".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_stderr_is_truncated() {
        let ctx = CallContext::new("test");
        let executor = ProcessExecutor::new(ExecutorConfig {
            max_error_bytes: 64,
            ..ExecutorConfig::default()
        });
        let result = executor
            .run(
                &command("sh", &["-c", "yes error | head -c 20000 >&2; exit 1"]),
                Duration::from_secs(5),
                &ctx,
            )
            .await;
        match result.outcome {
            Err(DispatchError::ExecutionFailed { stderr, .. }) => {
                assert!(stderr.len() <= 64 + TRUNCATION_MARKER.len());
                assert!(stderr.ends_with("[output truncated]"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stdout_is_capped_and_drained() {
        let ctx = CallContext::new("test");
        let executor = ProcessExecutor::new(ExecutorConfig {
            max_output_bytes: 1024,
            ..ExecutorConfig::default()
        });
        let result = executor
            .run(
                &command("sh", &["-c", "yes ring | head -c 500000"]),
                Duration::from_secs(5),
                &ctx,
            )
            .await;
        let output = result.outcome.unwrap();
        assert!(output.starts_with("ring\nring\n"));
        assert_eq!(output.len(), 1024 + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn test_timeout_terminates_process() {
        let ctx = CallContext::new("test");
        let started = Instant::now();
        let result = executor()
            .run(&command("sleep", &["10"]), Duration::from_millis(200), &ctx)
            .await;
        assert_eq!(result.outcome.unwrap_err().kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_timeout_escalates_when_sigterm_ignored() {
        let ctx = CallContext::new("test");
        let started = Instant::now();
        let result = executor()
            .run(
                &command("sh", &["-c", "trap '' TERM; exec sleep 10"]),
                Duration::from_millis(300),
                &ctx,
            )
            .await;
        assert_eq!(
            result.outcome,
            Err(DispatchError::Timeout(Duration::from_millis(300)))
        );
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_failure() {
        let ctx = CallContext::new("test");
        let result = executor()
            .run(
                &command("/nonexistent/cassandra/bin/nodetool", &["status"]),
                Duration::from_secs(5),
                &ctx,
            )
            .await;
        match result.outcome {
            Err(DispatchError::LaunchFailed { program, .. }) => {
                assert_eq!(program, "/nonexistent/cassandra/bin/nodetool");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_java_home_is_exported() {
        let ctx = CallContext::new("test");
        let executor = ProcessExecutor::new(ExecutorConfig {
            java_home: Some(PathBuf::from("/opt/jdk")),
            ..ExecutorConfig::default()
        });
        let result = executor
            .run(
                &command("sh", &["-c", "echo \"$JAVA_HOME\"; echo \"$PATH\""]),
                Duration::from_secs(5),
                &ctx,
            )
            .await;
        let output = result.outcome.unwrap();
        let mut lines = output.lines();
        assert_eq!(lines.next(), Some("/opt/jdk"));
        assert!(lines.next().unwrap().starts_with("/opt/jdk/bin"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());
        let ctx = CallContext::new("test");
        let executor = executor();
        let cmd = command("sh", &["-c", &script]);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(500),
            executor.run(&cmd, Duration::from_secs(60), &ctx),
        )
        .await;
        assert!(abandoned.is_err());

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let stat = format!("/proc/{pid}/stat");
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let gone = match std::fs::read_to_string(&stat) {
                Err(_) => true,
                Ok(contents) => contents
                    .rsplit(')')
                    .next()
                    .map(|rest| rest.trim_start().starts_with('Z'))
                    .unwrap_or(false),
            };
            if gone {
                break;
            }
            assert!(Instant::now() < deadline, "process {pid} still running");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_one_audit_record_per_run_on_every_path() {
        let capture = EventCapture::default();
        let _guard = capture.install();
        let ctx = CallContext::new("test");
        let executor = executor();

        executor
            .run(&command("echo", &["ok"]), Duration::from_secs(5), &ctx)
            .await;
        executor
            .run(&command("sh", &["-c", "exit 3"]), Duration::from_secs(5), &ctx)
            .await;
        executor
            .run(&command("sleep", &["10"]), Duration::from_millis(200), &ctx)
            .await;
        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            executor.run(&command("sleep", &["30"]), Duration::from_secs(60), &ctx),
        )
        .await;
        assert!(abandoned.is_err());

        assert_eq!(
            capture.outcomes("cassadmin::audit"),
            vec!["ok", "ExecutionError", "Timeout", "cancelled"]
        );
    }
}
