use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How long a timed-out child gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Configuration for spawning a collaborator process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub log_prefix: String,
    pub env: Vec<(String, String)>,
    pub stdin_data: Option<String>,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        let command = command.into();
        Self {
            log_prefix: command.clone(),
            command,
            args: Vec::new(),
            working_dir: working_dir.into(),
            timeout: None,
            env: Vec::new(),
            stdin_data: None,
        }
    }
}

/// Output from a completed child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    pub fn stdout(&self) -> String {
        self.stdout_lines.join("\n")
    }

    pub fn stderr(&self) -> String {
        self.stderr_lines.join("\n")
    }
}

/// Spawn a child process and collect its output line by line.
///
/// The child runs in its own process group on Unix. SIGINT/SIGTERM received
/// while it runs are forwarded to that group and the call then returns
/// [`Error::Interrupted`]. A non-zero exit is not an error here; callers
/// decide what an exit code means for their tool.
pub async fn spawn_and_stream(config: ProcessConfig) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .stdin(if config.stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    debug!(command = config.command, args = ?config.args, "spawning process");
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", config.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Process("child has no pid".into()))?;

    if let Some(data) = config.stdin_data {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("child stdin not piped".into()))?;
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(data.as_bytes()).await {
                warn!(error = %e, "failed to write child stdin");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Process("child stdout not piped".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Process("child stderr not piped".into()))?;

    let prefix_out = config.log_prefix.clone();
    let prefix_err = config.log_prefix;

    let stdout_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("[{prefix_out}] {line}");
            lines.push(line);
        }
        lines
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("[{prefix_err}] {line}");
            lines.push(line);
        }
        lines
    });

    let interrupted = Arc::new(AtomicBool::new(false));

    #[cfg(unix)]
    let signal_task = {
        let pgid = pid as i32;
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let (Ok(mut sigint), Ok(mut sigterm)) = (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) else {
                warn!("failed to install signal handlers");
                return;
            };
            loop {
                let sig = tokio::select! {
                    _ = sigint.recv() => libc::SIGINT,
                    _ = sigterm.recv() => libc::SIGTERM,
                };
                // A second signal means the child ignored the first one.
                let sig = if interrupted.swap(true, Ordering::SeqCst) {
                    warn!("second interrupt, killing collaborator");
                    libc::SIGKILL
                } else {
                    sig
                };
                // SAFETY: killpg only signals the child's own process group.
                unsafe {
                    libc::killpg(pgid, sig);
                }
            }
        })
    };

    let status = if let Some(dur) = config.timeout {
        match tokio::time::timeout(dur, child.wait()).await {
            Ok(r) => r.map_err(|e| Error::Process(format!("wait error: {e}")))?,
            Err(_) => {
                #[cfg(unix)]
                {
                    signal_task.abort();
                    // SAFETY: see above.
                    unsafe {
                        libc::killpg(pid as i32, libc::SIGTERM);
                    }
                    tokio::time::sleep(KILL_GRACE).await;
                    // SAFETY: see above.
                    unsafe {
                        libc::killpg(pid as i32, libc::SIGKILL);
                    }
                }
                stdout_task.abort();
                stderr_task.abort();
                return Err(Error::Process(format!(
                    "'{}' timed out after {dur:?}",
                    config.command
                )));
            }
        }
    } else {
        child
            .wait()
            .await
            .map_err(|e| Error::Process(format!("wait error: {e}")))?
    };

    #[cfg(unix)]
    signal_task.abort();

    if interrupted.load(Ordering::SeqCst) {
        stdout_task.abort();
        stderr_task.abort();
        return Err(Error::Interrupted);
    }

    let stdout_lines = stdout_task
        .await
        .map_err(|e| Error::Process(format!("stdout reader failed: {e}")))?;
    let stderr_lines = stderr_task
        .await
        .map_err(|e| Error::Process(format!("stderr reader failed: {e}")))?;

    let (exit_code, signal) = extract_exit_info(&status);

    Ok(ProcessOutput {
        exit_code,
        signal,
        stdout_lines,
        stderr_lines,
    })
}

fn extract_exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}
