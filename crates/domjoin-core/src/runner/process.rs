// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process runner.
//!
//! Executes join scripts as child processes in their own process group, so a
//! timeout kills the script together with anything it spawned. Every
//! execution also carries an environment token; descendants that left the
//! group (`setsid`, daemonizing service starts) are found by that token in
//! `/proc` and killed as well.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::config::Config;
use crate::script::{JoinScript, RecordStatus};

/// How long to wait for output pipes to drain after the script is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Environment variable tagging every process of one script execution.
pub const EXEC_TOKEN_VAR: &str = "DOMJOIN_EXEC_TOKEN";

/// Sweeps over `/proc` before giving up on descendants that keep forking.
const MAX_SWEEPS: usize = 5;

/// Longest tail of output quoted in a failure message.
const MESSAGE_TAIL_CHARS: usize = 200;

/// Combined stdout/stderr capture with a hard size bound.
///
/// Bytes past the bound are read and discarded so the child never blocks on
/// a full pipe.
#[derive(Debug)]
pub struct BoundedOutput {
    buf: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl BoundedOutput {
    /// Create an empty capture holding at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    /// Append a chunk, discarding whatever exceeds the bound.
    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        let kept = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..kept]);
        self.dropped += chunk.len() - kept;
    }

    /// Whether anything was discarded.
    pub fn truncated(&self) -> bool {
        self.dropped > 0
    }

    /// The captured text, with a truncation marker appended if needed.
    pub fn finish(self) -> (String, bool) {
        let truncated = self.truncated();
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if truncated {
            if !text.ends_with('\n') && !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!(
                "[output truncated: exceeded {} bytes]\n",
                self.limit
            ));
        }
        (text, truncated)
    }
}

/// Runs join scripts as local processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    output_limit: usize,
    skip_exit_code: i32,
}

impl ProcessRunner {
    /// Create a runner with an output bound and the "already satisfied" exit code.
    pub fn new(output_limit: usize, skip_exit_code: i32) -> Self {
        Self {
            output_limit,
            skip_exit_code,
        }
    }

    /// Create a runner from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.output_limit_bytes, config.skip_exit_code)
    }

    fn classify(&self, status: ExitStatus, output: &str) -> (RecordStatus, String) {
        match status.code() {
            Some(0) => (RecordStatus::Configured, "configured".to_string()),
            Some(code) if code == self.skip_exit_code => {
                (RecordStatus::Skipped, "already satisfied".to_string())
            }
            Some(code) => (
                RecordStatus::Failed,
                with_tail(format!("exited with code {}", code), output),
            ),
            None => (
                RecordStatus::Failed,
                with_tail(
                    format!("terminated by signal {}", status.signal().unwrap_or(0)),
                    output,
                ),
            ),
        }
    }
}

/// Append the last non-empty output line to a failure message.
fn with_tail(message: String, output: &str) -> String {
    let Some(line) = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("[output truncated"))
    else {
        return message;
    };
    let tail: String = line.chars().take(MESSAGE_TAIL_CHARS).collect();
    format!("{}: {}", message, tail)
}

/// SIGKILL every process in the group led by `pid`.
fn kill_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match signal::killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(pgid = raw, "Sent SIGKILL to process group"),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid = raw, error = %e, "Failed to kill process group"),
    }
}

/// SIGKILL every process whose environment carries `token`. Returns how
/// many processes were signalled.
fn kill_tagged(token: &str) -> usize {
    let needle = format!("{}={}", EXEC_TOKEN_VAR, token);
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };

    let mut killed = 0;
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        // Unreadable entries belong to other users or already exited.
        let Ok(environ) = std::fs::read(entry.path().join("environ")) else {
            continue;
        };
        if !environ
            .split(|b| *b == 0)
            .any(|var| var == needle.as_bytes())
        {
            continue;
        }
        match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => {
                debug!(pid, "Killed escaped script descendant");
                killed += 1;
            }
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!(pid, error = %e, "Failed to kill escaped script descendant"),
        }
    }
    killed
}

/// Kill tagged processes until a sweep finds none left.
async fn reap_tagged(token: String) {
    let result = tokio::task::spawn_blocking(move || {
        let mut total = 0;
        for _ in 0..MAX_SWEEPS {
            let killed = kill_tagged(&token);
            if killed == 0 {
                break;
            }
            total += killed;
            std::thread::sleep(Duration::from_millis(10));
        }
        total
    })
    .await;

    match result {
        Ok(0) => {}
        Ok(n) => warn!(killed = n, "Killed script descendants that left the process group"),
        Err(e) => warn!(error = %e, "Descendant sweep task failed"),
    }
}

/// Spawn, retrying briefly while the executable is still open for writing
/// elsewhere (ETXTBSY right after a package drops the file in place).
async fn spawn_with_retry(
    cmd: &mut tokio::process::Command,
) -> std::io::Result<tokio::process::Child> {
    let mut attempt = 0;
    loop {
        match cmd.spawn() {
            Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32) && attempt < 5 => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20 * attempt)).await;
            }
            other => return other,
        }
    }
}

fn drain<R>(reader: Option<R>, sink: Arc<Mutex<BoundedOutput>>) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = reader?;
    Some(tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().await.push(&chunk[..n]),
            }
        }
    }))
}

#[async_trait]
impl ScriptRunner for ProcessRunner {
    fn runner_type(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, script: &JoinScript, options: &LaunchOptions) -> Result<ScriptResult> {
        let start = Instant::now();

        let token = uuid::Uuid::new_v4().to_string();
        let mut cmd = tokio::process::Command::new(&script.path);
        cmd.envs(&options.env)
            .env(EXEC_TOKEN_VAR, &token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = spawn_with_retry(&mut cmd).await.map_err(|source| RunnerError::Spawn {
            script: script.name.clone(),
            source,
        })?;
        let pid = child.id();

        debug!(
            run_id = %options.run_id,
            script = %script.name,
            pid = ?pid,
            "Script started"
        );

        let output = Arc::new(Mutex::new(BoundedOutput::new(self.output_limit)));
        let readers: Vec<JoinHandle<()>> = [
            drain(child.stdout.take(), output.clone()),
            drain(child.stderr.take(), output.clone()),
        ]
        .into_iter()
        .flatten()
        .collect();

        let waited = tokio::time::timeout(options.timeout, child.wait()).await;

        // Kill whatever the script left behind in its group; lingering
        // children would otherwise hold the output pipes open.
        if let Some(pid) = pid {
            kill_group(pid);
        }
        reap_tagged(token).await;

        let exit = match waited {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(RunnerError::Io(e));
            }
            Err(_) => {
                warn!(
                    run_id = %options.run_id,
                    script = %script.name,
                    timeout_secs = options.timeout.as_secs(),
                    "Script timed out, killing process group"
                );
                if let Err(e) = child.kill().await {
                    warn!(script = %script.name, error = %e, "Failed to kill timed out script");
                }
                None
            }
        };

        let deadline = tokio::time::Instant::now() + READER_GRACE;
        for mut reader in readers {
            if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                warn!(script = %script.name, "Output reader did not finish, aborting it");
                reader.abort();
            }
        }

        let captured = std::mem::replace(&mut *output.lock().await, BoundedOutput::new(0));
        let (text, truncated) = captured.finish();
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match exit {
            None => ScriptResult::timed_out(options.timeout, duration_ms, text, truncated),
            Some(status) => {
                let (record_status, message) = self.classify(status, &text);
                ScriptResult {
                    status: record_status,
                    message,
                    duration_ms,
                    exit_code: status.code(),
                    timed_out: false,
                    output: text,
                    truncated,
                }
            }
        };

        info!(
            run_id = %options.run_id,
            script = %script.name,
            status = %result.status,
            duration_ms,
            "Script finished"
        );

        Ok(result)
    }
}
