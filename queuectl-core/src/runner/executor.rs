//! Runs one job command in a child process, bounded by a timeout, capturing
//! the trailing 64 KiB of each output stream.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::core::outcome::{Outcome, OutputTail};

/// Executes a single command and reports its [`Outcome`].
///
/// A trait so the worker loop can be driven by scripted executors in tests.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, command: &str, timeout: Option<Duration>) -> Outcome;
}

/// Executor that hands the command string to a shell, unparsed.
///
/// Timeout escalation: SIGTERM on expiry, then SIGKILL after the grace
/// period. The shell path is configurable; pointing it at a missing binary
/// is also how tests exercise the spawn-failure path.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
    grace: Duration,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            grace: Duration::from_secs(5),
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// How long to wait between SIGTERM and SIGKILL on timeout.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    #[instrument(skip_all, fields(command = %command, timeout = ?timeout))]
    async fn execute(&self, command: &str, timeout: Option<Duration>) -> Outcome {
        let mut child = match Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return Outcome::SpawnFailed {
                    message: format!("failed to spawn {}: {e}", self.shell.display()),
                }
            }
        };

        let stdout = drain_tail(child.stdout.take());
        let stderr = drain_tail(child.stderr.take());

        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(?limit, "command exceeded timeout, escalating");
                    self.terminate(&mut child).await;
                    return Outcome::TimedOut {
                        stdout_tail: finish_tail(stdout).await,
                        stderr_tail: finish_tail(stderr).await,
                    };
                }
            },
            None => child.wait().await,
        };

        let stdout_tail = finish_tail(stdout).await;
        let stderr_tail = finish_tail(stderr).await;

        match status {
            Ok(status) => {
                let exit_code = exit_code_of(status);
                debug!(exit_code, "command finished");
                if exit_code == 0 {
                    Outcome::Succeeded {
                        exit_code,
                        stdout_tail,
                        stderr_tail,
                    }
                } else {
                    Outcome::FailedNonZero {
                        exit_code,
                        stdout_tail,
                        stderr_tail,
                    }
                }
            }
            Err(e) => Outcome::SpawnFailed {
                message: format!("failed waiting on child: {e}"),
            },
        }
    }
}

impl ShellExecutor {
    /// SIGTERM, wait out the grace period, then SIGKILL whatever is left.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        if tokio::time::timeout(self.grace, child.wait()).await.is_err() {
            warn!("child ignored SIGTERM, killing");
            let _ = child.kill().await;
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Spawn a reader task collecting the trailing bytes of a stream. A `None`
/// stream (never the case for piped children, but the types allow it)
/// yields an empty tail.
fn drain_tail<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = OutputTail::default();
        if let Some(mut stream) = stream {
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => tail.push(&chunk[..n]),
                }
            }
        }
        tail.into_string()
    })
}

async fn finish_tail(handle: JoinHandle<String>) -> String {
    handle.await.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn true_succeeds_with_exit_zero() {
        let outcome = ShellExecutor::new().execute("true", None).await;
        match outcome {
            Outcome::Succeeded { exit_code, .. } => assert_eq!(exit_code, 0),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let outcome = ShellExecutor::new().execute("exit 3", None).await;
        match outcome {
            Outcome::FailedNonZero { exit_code, .. } => assert_eq!(exit_code, 3),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn captures_both_streams() {
        let outcome = ShellExecutor::new()
            .execute("echo out; echo err >&2", None)
            .await;
        assert_eq!(outcome.stdout_tail(), Some("out\n"));
        assert_eq!(outcome.stderr_tail(), Some("err\n"));
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn output_is_bounded_to_the_tail() {
        // 200 KiB of 'x' followed by a marker; only the tail survives.
        let outcome = ShellExecutor::new()
            .execute(
                "head -c 204800 /dev/zero | tr '\\0' 'x'; echo END",
                None,
            )
            .await;
        let stdout = outcome.stdout_tail().unwrap();
        assert!(stdout.len() <= crate::core::outcome::TAIL_LIMIT);
        assert!(stdout.ends_with("END\n"));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let executor = ShellExecutor::new().with_grace(Duration::from_millis(500));
        let started = std::time::Instant::now();
        let outcome = executor
            .execute("sleep 30", Some(Duration::from_millis(200)))
            .await;
        assert!(matches!(outcome, Outcome::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_failure() {
        let outcome = ShellExecutor::new()
            .with_shell("/nonexistent/shell")
            .execute("true", None)
            .await;
        match outcome {
            Outcome::SpawnFailed { message } => {
                assert!(message.contains("/nonexistent/shell"))
            }
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_command_fails_through_the_shell() {
        // The shell itself spawns fine and reports 127.
        let outcome = ShellExecutor::new()
            .execute("definitely-not-a-command-9f3a", None)
            .await;
        match outcome {
            Outcome::FailedNonZero { exit_code, .. } => assert_eq!(exit_code, 127),
            other => panic!("expected 127, got {other:?}"),
        }
    }
}
