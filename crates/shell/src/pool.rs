use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use regex::Regex;
use shrimp_config::ShellConfig;
use tokio::sync::Mutex;

use crate::error::{Result, ShellError};
use crate::session::{CommandOutput, ShellSession, WriteStdinOutput};
use crate::stream::truncate_tail;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Process-global map of live shell sessions. Enforces the capacity/TTL
/// eviction policy; per-session concurrency is enforced by [`ShellSession`]
/// itself.
pub struct ShellPool {
    config: ShellConfig,
    sessions: Mutex<HashMap<String, Arc<ShellSession>>>,
}

pub struct SessionInfo {
    pub session_id: String,
    pub shell: String,
    pub os: &'static str,
    pub cwd: String,
}

impl ShellPool {
    pub fn new(config: ShellConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Spawns the sweep task; caller retains the returned `JoinHandle` only
    /// if it wants to abort it explicitly (dropping the pool also lets the
    /// `Weak` upgrade fail and the task exit on its own).
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                pool.sweep().await;
            }
        })
    }

    async fn sweep(&self) {
        let mut sessions = self.sessions.lock().await;
        let mut expired = Vec::new();
        for (id, session) in sessions.iter() {
            if session.idle_for().await >= SESSION_TTL {
                expired.push(id.clone());
            }
        }
        for id in expired {
            if let Some(session) = sessions.remove(&id) {
                tracing::info!(session_id = %id, "evicting idle shell session");
                session.kill().await;
            }
        }
    }

    /// Evicts the oldest session by `last_used_at` if at capacity, then
    /// spawns a new one.
    pub async fn create_session(&self, cwd: Option<&str>) -> Result<SessionInfo> {
        let cwd = match cwd {
            Some(c) => c.to_string(),
            None => std::env::current_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| ".".to_string()),
        };

        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.config.max_sessions {
            let mut oldest: Option<(String, Duration)> = None;
            for (id, session) in sessions.iter() {
                let idle = session.idle_for().await;
                if oldest.as_ref().map(|(_, best)| idle > *best).unwrap_or(true) {
                    oldest = Some((id.clone(), idle));
                }
            }
            if let Some((id, _)) = oldest {
                if let Some(session) = sessions.remove(&id) {
                    tracing::info!(session_id = %id, "evicting oldest shell session at capacity");
                    session.kill().await;
                }
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(
            ShellSession::spawn(id.clone(), &cwd, self.config.retained_tail_cap(), self.config.max_output_chars)
                .await?,
        );
        sessions.insert(id.clone(), session.clone());

        Ok(SessionInfo {
            session_id: id,
            shell: shell_program_name(),
            os: std::env::consts::OS,
            cwd: session.cwd().await,
        })
    }

    pub async fn close_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(session_id);
        match removed {
            Some(session) => {
                session.kill().await;
                true
            }
            None => false,
        }
    }

    async fn get(&self, session_id: &str) -> Result<Arc<ShellSession>> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ShellError::UnknownSession(session_id.to_string()))
    }

    pub async fn run_command(
        &self,
        session_id: &str,
        command: &str,
        interactive: bool,
        timeout_ms: u64,
    ) -> Result<CommandOutput> {
        let timeout = Duration::from_millis(timeout_ms.min(5 * 60 * 1000));
        let session = self.get(session_id).await?;
        if interactive {
            session.run_interactive(command, timeout).await
        } else {
            session.run_command(command, timeout).await
        }
    }

    pub async fn write_stdin(&self, session_id: &str, chars: &str, yield_ms: u64) -> Result<WriteStdinOutput> {
        let session = self.get(session_id).await?;
        session.write_stdin(chars, yield_ms).await
    }

    /// Legacy fire-and-forget path used when no session id is supplied: a
    /// fresh one-shot shell per call, with a `cd` intercept so callers get
    /// the illusion of a persisted working directory across calls even
    /// though the process itself never survives one command.
    pub async fn run_ephemeral(&self, cwd: &str, command: &str, timeout_ms: u64) -> CommandOutput {
        if let Some(result) = intercept_cd(cwd, command) {
            return result;
        }

        let timeout = Duration::from_millis(timeout_ms.min(5 * 60 * 1000));
        let output = tokio::time::timeout(
            timeout,
            tokio::process::Command::new(shell_program_name())
                .arg(shell_dash_c())
                .arg(command)
                .current_dir(cwd)
                .output(),
        )
        .await;

        match output {
            Err(_) => CommandOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
                busy: false,
                cwd: None,
            },
            Ok(Err(e)) => CommandOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
                timed_out: false,
                busy: false,
                cwd: None,
            },
            Ok(Ok(out)) => {
                let max = self.config.max_output_chars;
                CommandOutput {
                    exit_code: out.status.code(),
                    stdout: truncate_tail(&String::from_utf8_lossy(&out.stdout), max),
                    stderr: truncate_tail(&String::from_utf8_lossy(&out.stderr), max),
                    timed_out: false,
                    busy: false,
                    cwd: None,
                }
            }
        }
    }
}

#[cfg(unix)]
fn shell_program_name() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}
#[cfg(windows)]
fn shell_program_name() -> String {
    std::env::var("ComSpec").unwrap_or_else(|_| "cmd.exe".to_string())
}

#[cfg(unix)]
fn shell_dash_c() -> &'static str {
    "-c"
}
#[cfg(windows)]
fn shell_dash_c() -> &'static str {
    "/c"
}

fn intercept_cd(cwd: &str, command: &str) -> Option<CommandOutput> {
    let re = Regex::new(r"^\s*cd(?:\s+(.+))?\s*$").unwrap();
    let caps = re.captures(command.trim_end())?;
    let target = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");

    let resolved = if target.is_empty() || target == "~" {
        std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| cwd.to_string())
    } else if let Some(rest) = target.strip_prefix("~/") {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| cwd.to_string());
        format!("{home}/{rest}")
    } else if std::path::Path::new(target).is_absolute() {
        target.to_string()
    } else {
        std::path::Path::new(cwd).join(target).to_string_lossy().into_owned()
    };

    if std::path::Path::new(&resolved).is_dir() {
        Some(CommandOutput {
            exit_code: Some(0),
            stdout: resolved.clone(),
            stderr: String::new(),
            timed_out: false,
            busy: false,
            cwd: Some(resolved),
        })
    } else {
        Some(CommandOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: format!("cd: no such directory: {target}"),
            timed_out: false,
            busy: false,
            cwd: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cd_intercept_resolves_relative_existing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        let result = intercept_cd(tmp.path().to_str().unwrap(), "cd sub").unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(result.cwd.unwrap().ends_with("sub"));
    }

    #[test]
    fn cd_intercept_fails_on_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let result = intercept_cd(tmp.path().to_str().unwrap(), "cd nope").unwrap();
        assert_eq!(result.exit_code, Some(1));
        assert!(result.stderr.contains("no such directory"));
    }

    #[tokio::test]
    async fn create_session_evicts_oldest_at_capacity() {
        let mut config = ShellConfig::default();
        config.max_sessions = 1;
        let pool = ShellPool::new(config);
        let first = pool.create_session(None).await.unwrap();
        let second = pool.create_session(None).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert!(pool.sessions.lock().await.get(&first.session_id).is_none());
        assert!(pool.sessions.lock().await.get(&second.session_id).is_some());
    }

    #[tokio::test]
    async fn close_unknown_session_returns_false() {
        let pool = ShellPool::new(ShellConfig::default());
        assert!(!pool.close_session("nope").await);
    }
}
