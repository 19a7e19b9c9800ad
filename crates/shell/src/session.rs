use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::error::{Result, ShellError};
use crate::stream::{truncate_tail, RetainedStream};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[cfg(unix)]
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

#[cfg(windows)]
fn default_shell() -> String {
    std::env::var("ComSpec").unwrap_or_else(|_| "cmd.exe".to_string())
}

fn random_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn sentinel_regex(token: &str) -> Regex {
    Regex::new(&format!(r"(?m)^__SHRIMP_DONE_{token}:(-?\d+):(.*)$")).expect("valid sentinel regex")
}

/// Result of resolving a sentinel match against a stdout buffer: the absolute
/// byte range `[match_start, match_end)` it occupies plus the parsed payload.
struct SentinelMatch {
    match_start: usize,
    match_end: usize,
    exit_code: i32,
    cwd: String,
}

fn scan_for_sentinel(buf: &[u8], base_offset: usize, token: &str) -> Option<SentinelMatch> {
    let text = String::from_utf8_lossy(buf);
    let re = sentinel_regex(token);
    let m = re.captures(&text)?;
    let whole = m.get(0)?;
    Some(SentinelMatch {
        match_start: base_offset + whole.start(),
        match_end: base_offset + whole.end(),
        exit_code: m.get(1)?.as_str().parse().ok()?,
        cwd: m.get(2)?.as_str().to_string(),
    })
}

pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub busy: bool,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletedBlock {
    pub exit_code: i32,
    pub cwd: Option<String>,
}

pub struct WriteStdinOutput {
    pub stdout: String,
    pub stderr: String,
    pub completed: Option<CompletedBlock>,
}

struct PendingCommand {
    token: String,
    stdout_start: usize,
    stderr_start: usize,
    report_cursor_out: usize,
    report_cursor_err: usize,
}

struct ActiveInteractive {
    child: Child,
    stdout: Arc<Mutex<RetainedStream>>,
    stderr: Arc<Mutex<RetainedStream>>,
    cursor_out: usize,
    cursor_err: usize,
}

/// A persistent shell backing one `run_command`/`write_stdin` session.
/// Background tasks continuously drain the child's stdout and stderr into
/// retained tails; callers never read the child's pipes directly, only the
/// tails.
pub struct ShellSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    last_used_at: Mutex<Instant>,
    cwd: Mutex<String>,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Arc<Mutex<RetainedStream>>,
    stderr: Arc<Mutex<RetainedStream>>,
    pending: Mutex<Option<PendingCommand>>,
    active_interactive: Mutex<Option<ActiveInteractive>>,
    tail_cap: usize,
    max_output_chars: usize,
}

fn spawn_reader(mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static, tail: Arc<Mutex<RetainedStream>>) {
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.lock().await.append(&buf[..n]);
                }
            }
        }
    });
}

impl ShellSession {
    pub async fn spawn(id: String, cwd: &str, tail_cap: usize, max_output_chars: usize) -> Result<Self> {
        let mut command = Command::new(default_shell());
        command
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(ShellError::SpawnFailed)?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout_pipe = child.stdout.take().expect("piped stdout");
        let stderr_pipe = child.stderr.take().expect("piped stderr");

        let stdout = Arc::new(Mutex::new(RetainedStream::new(tail_cap)));
        let stderr = Arc::new(Mutex::new(RetainedStream::new(tail_cap)));
        spawn_reader(stdout_pipe, stdout.clone());
        spawn_reader(stderr_pipe, stderr.clone());

        Ok(Self {
            id,
            created_at: Utc::now(),
            last_used_at: Mutex::new(Instant::now()),
            cwd: Mutex::new(cwd.to_string()),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout,
            stderr,
            pending: Mutex::new(None),
            active_interactive: Mutex::new(None),
            tail_cap,
            max_output_chars,
        })
    }

    pub async fn touch(&self) {
        *self.last_used_at.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_used_at.lock().await.elapsed()
    }

    pub async fn cwd(&self) -> String {
        self.cwd.lock().await.clone()
    }

    pub async fn kill(&self) {
        let _ = self.child.lock().await.kill().await;
        if let Some(mut interactive) = self.active_interactive.lock().await.take() {
            let _ = interactive.child.kill().await;
        }
    }

    pub async fn is_busy(&self) -> bool {
        self.pending.lock().await.is_some() || self.active_interactive.lock().await.is_some()
    }

    /// Non-interactive command protocol: writes `command` followed by a
    /// sentinel line, then polls stdout for that sentinel to learn the exit
    /// code and post-command cwd.
    pub async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.touch().await;
        if self.is_busy().await {
            return Ok(CommandOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("session {} already has a command in flight", self.id),
                timed_out: false,
                busy: true,
                cwd: None,
            });
        }

        let token = random_token();
        let stdout_start = self.stdout.lock().await.total_len();
        let stderr_start = self.stderr.lock().await.total_len();

        #[cfg(unix)]
        let script = format!("{command}\nprintf '__SHRIMP_DONE_{token}:%s:%s\\n' \"$?\" \"$PWD\"\n");
        #[cfg(windows)]
        let script = format!("{command}\r\necho __SHRIMP_DONE_{token}:%errorlevel%:%cd%\r\n");

        {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(script.as_bytes()).await?;
            stdin.flush().await?;
        }

        *self.pending.lock().await = Some(PendingCommand {
            token: token.clone(),
            stdout_start,
            stderr_start,
            report_cursor_out: stdout_start,
            report_cursor_err: stderr_start,
        });

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.try_consume_sentinel(&token, stdout_start, stderr_start).await? {
                return Ok(result);
            }
            if Instant::now() >= deadline {
                let stdout = self.stdout.lock().await.slice_from(stdout_start).to_vec();
                let stderr = self.stderr.lock().await.slice_from(stderr_start).to_vec();
                return Ok(CommandOutput {
                    exit_code: None,
                    stdout: truncate_tail(&String::from_utf8_lossy(&stdout), self.max_output_chars),
                    stderr: truncate_tail(&String::from_utf8_lossy(&stderr), self.max_output_chars),
                    timed_out: true,
                    busy: false,
                    cwd: None,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Checks once whether `token`'s sentinel is present; if so, finalizes
    /// the pending command (clears it, updates cwd, excises the sentinel
    /// line) and returns the completed `CommandOutput`.
    async fn try_consume_sentinel(
        &self,
        token: &str,
        stdout_start: usize,
        stderr_start: usize,
    ) -> Result<Option<CommandOutput>> {
        let stdout_buf = self.stdout.lock().await.slice_from(stdout_start).to_vec();
        let Some(sentinel) = scan_for_sentinel(&stdout_buf, stdout_start, token) else {
            return Ok(None);
        };

        let stdout_for_command = {
            let stdout = self.stdout.lock().await;
            String::from_utf8_lossy(stdout.slice(stdout_start, sentinel.match_start)).into_owned()
        };
        let stderr_for_command = {
            let stderr = self.stderr.lock().await;
            let end = stderr.total_len();
            String::from_utf8_lossy(stderr.slice(stderr_start, end)).into_owned()
        };

        {
            let mut stdout = self.stdout.lock().await;
            let mut excise_end = sentinel.match_end;
            if stdout.slice(sentinel.match_end, sentinel.match_end + 1) == b"\n" {
                excise_end += 1;
            }
            stdout.truncate_before(excise_end);
        }

        *self.cwd.lock().await = sentinel.cwd.clone();
        *self.pending.lock().await = None;

        Ok(Some(CommandOutput {
            exit_code: Some(sentinel.exit_code),
            stdout: truncate_tail(&stdout_for_command, self.max_output_chars),
            stderr: truncate_tail(&stderr_for_command, self.max_output_chars),
            timed_out: false,
            busy: false,
            cwd: Some(sentinel.cwd),
        }))
    }

    /// Interactive command protocol: spawns a dedicated child for just this
    /// command and polls for its exit.
    pub async fn run_interactive(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.touch().await;
        if self.is_busy().await {
            return Ok(CommandOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("session {} already has a command in flight", self.id),
                timed_out: false,
                busy: true,
                cwd: None,
            });
        }

        #[cfg(unix)]
        let mut cmd = {
            let mut c = Command::new(default_shell());
            c.arg("-lc").arg(command);
            c
        };
        #[cfg(windows)]
        let mut cmd = {
            let mut c = Command::new(default_shell());
            c.arg("/d").arg("/s").arg("/c").arg(command);
            c
        };

        cmd.current_dir(self.cwd().await)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(ShellError::SpawnFailed)?;
        let stdout_pipe = child.stdout.take().expect("piped stdout");
        let stderr_pipe = child.stderr.take().expect("piped stderr");
        let stdout = Arc::new(Mutex::new(RetainedStream::new(self.tail_cap)));
        let stderr = Arc::new(Mutex::new(RetainedStream::new(self.tail_cap)));
        spawn_reader(stdout_pipe, stdout.clone());
        spawn_reader(stderr_pipe, stderr.clone());

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait()? {
                Some(status) => {
                    let out = stdout.lock().await.slice_from(0).to_vec();
                    let err = stderr.lock().await.slice_from(0).to_vec();
                    return Ok(CommandOutput {
                        exit_code: status.code(),
                        stdout: truncate_tail(&String::from_utf8_lossy(&out), self.max_output_chars),
                        stderr: truncate_tail(&String::from_utf8_lossy(&err), self.max_output_chars),
                        timed_out: false,
                        busy: false,
                        cwd: None,
                    });
                }
                None => {
                    if Instant::now() >= deadline {
                        let out = stdout.lock().await.slice_from(0).to_vec();
                        let err = stderr.lock().await.slice_from(0).to_vec();
                        let cursor_out = stdout.lock().await.total_len();
                        let cursor_err = stderr.lock().await.total_len();
                        *self.active_interactive.lock().await = Some(ActiveInteractive {
                            child,
                            stdout,
                            stderr,
                            cursor_out,
                            cursor_err,
                        });
                        return Ok(CommandOutput {
                            exit_code: None,
                            stdout: truncate_tail(&String::from_utf8_lossy(&out), self.max_output_chars),
                            stderr: truncate_tail(&String::from_utf8_lossy(&err), self.max_output_chars),
                            timed_out: true,
                            busy: false,
                            cwd: None,
                        });
                    }
                    sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Feeds `chars` into whichever of `active_interactive`/`pending` is in
    /// flight, then reports whatever output has accumulated since the last
    /// call.
    pub async fn write_stdin(&self, chars: &str, yield_ms: u64) -> Result<WriteStdinOutput> {
        self.touch().await;
        let yield_ms = yield_ms.min(5 * 60 * 1000);

        if let Some(mut interactive) = self.active_interactive.lock().await.take() {
            interactive.child.stdin.as_mut().expect("piped stdin").write_all(chars.as_bytes()).await?;
            interactive.child.stdin.as_mut().expect("piped stdin").flush().await?;
            sleep(Duration::from_millis(yield_ms)).await;

            let exited = interactive.child.try_wait()?;
            let stdout_new = {
                let s = interactive.stdout.lock().await;
                String::from_utf8_lossy(s.slice_from(interactive.cursor_out)).into_owned()
            };
            let stderr_new = {
                let s = interactive.stderr.lock().await;
                String::from_utf8_lossy(s.slice_from(interactive.cursor_err)).into_owned()
            };
            interactive.cursor_out = interactive.stdout.lock().await.total_len();
            interactive.cursor_err = interactive.stderr.lock().await.total_len();

            return match exited {
                Some(status) => Ok(WriteStdinOutput {
                    stdout: stdout_new,
                    stderr: stderr_new,
                    completed: Some(CompletedBlock {
                        exit_code: status.code().unwrap_or(-1),
                        cwd: None,
                    }),
                }),
                None => {
                    *self.active_interactive.lock().await = Some(interactive);
                    Ok(WriteStdinOutput {
                        stdout: stdout_new,
                        stderr: stderr_new,
                        completed: None,
                    })
                }
            };
        }

        let Some(mut pending) = self.pending.lock().await.take() else {
            return Err(ShellError::UnknownSession(format!(
                "session {} has no command in flight",
                self.id
            )));
        };

        {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(chars.as_bytes()).await?;
            stdin.flush().await?;
        }
        sleep(Duration::from_millis(yield_ms)).await;

        if let Some(sentinel) = {
            let stdout_buf = self.stdout.lock().await.slice_from(pending.stdout_start).to_vec();
            scan_for_sentinel(&stdout_buf, pending.stdout_start, &pending.token)
        } {
            let stdout_new = {
                let stdout = self.stdout.lock().await;
                String::from_utf8_lossy(stdout.slice(pending.report_cursor_out, sentinel.match_start)).into_owned()
            };
            let stderr_new = {
                let stderr = self.stderr.lock().await;
                let end = stderr.total_len();
                String::from_utf8_lossy(stderr.slice(pending.report_cursor_err, end)).into_owned()
            };
            {
                let mut stdout = self.stdout.lock().await;
                let mut excise_end = sentinel.match_end;
                if stdout.slice(sentinel.match_end, sentinel.match_end + 1) == b"\n" {
                    excise_end += 1;
                }
                stdout.truncate_before(excise_end);
            }
            *self.cwd.lock().await = sentinel.cwd.clone();
            return Ok(WriteStdinOutput {
                stdout: stdout_new,
                stderr: stderr_new,
                completed: Some(CompletedBlock {
                    exit_code: sentinel.exit_code,
                    cwd: Some(sentinel.cwd),
                }),
            });
        }

        let stdout_new = {
            let stdout = self.stdout.lock().await;
            let end = stdout.total_len();
            String::from_utf8_lossy(stdout.slice(pending.report_cursor_out, end)).into_owned()
        };
        let stderr_new = {
            let stderr = self.stderr.lock().await;
            let end = stderr.total_len();
            String::from_utf8_lossy(stderr.slice(pending.report_cursor_err, end)).into_owned()
        };
        pending.report_cursor_out = self.stdout.lock().await.total_len();
        pending.report_cursor_err = self.stderr.lock().await.total_len();
        *self.pending.lock().await = Some(pending);

        Ok(WriteStdinOutput {
            stdout: stdout_new,
            stderr: stderr_new,
            completed: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn non_interactive_command_reports_exit_code_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let session = ShellSession::spawn("s1".to_string(), dir.path().to_str().unwrap(), 4096, 20_000).await.unwrap();
        let out = session.run_command("echo shrimp", Duration::from_secs(5)).await.unwrap();
        assert!(!out.timed_out);
        assert!(!out.busy);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.trim(), "shrimp");
        assert_eq!(session.cwd().await, out.cwd.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_command_on_busy_session_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(ShellSession::spawn("s2".to_string(), dir.path().to_str().unwrap(), 4096, 20_000).await.unwrap());
        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.run_command("sleep 0.2", Duration::from_secs(5)).await.unwrap() })
        };
        // Give the first command a moment to register as pending.
        sleep(Duration::from_millis(30)).await;
        let second = session.run_command("echo too-fast", Duration::from_secs(5)).await.unwrap();
        assert!(second.busy);
        assert!(second.exit_code.is_none());
        first.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_command_that_times_out_then_completes_via_write_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let session = ShellSession::spawn("s3".to_string(), dir.path().to_str().unwrap(), 4096, 20_000).await.unwrap();

        let timed_out = session
            .run_command("read line; echo got:$line", Duration::from_millis(80))
            .await
            .unwrap();
        assert!(timed_out.timed_out);
        assert!(timed_out.exit_code.is_none());

        let completed = session.write_stdin("shrimp\n", 300).await.unwrap();
        assert!(completed.stdout.contains("got:shrimp"));
        let block = completed.completed.expect("command should have completed");
        assert_eq!(block.exit_code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interactive_command_timeout_then_drained_via_write_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let session = ShellSession::spawn("s4".to_string(), dir.path().to_str().unwrap(), 4096, 20_000).await.unwrap();

        let timed_out = session
            .run_interactive("read line; echo got:$line", Duration::from_millis(80))
            .await
            .unwrap();
        assert!(timed_out.timed_out);

        let completed = session.write_stdin("shrimp\n", 300).await.unwrap();
        assert!(completed.stdout.contains("got:shrimp"));
        assert_eq!(completed.completed.unwrap().exit_code, 0);
    }

    #[tokio::test]
    async fn write_stdin_on_unknown_pending_fails() {
        let dir = tempfile::tempdir().unwrap();
        let session = ShellSession::spawn("s5".to_string(), dir.path().to_str().unwrap(), 4096, 20_000).await.unwrap();
        let err = session.write_stdin("x", 10).await.unwrap_err();
        assert!(matches!(err, ShellError::UnknownSession(_)));
    }
}
