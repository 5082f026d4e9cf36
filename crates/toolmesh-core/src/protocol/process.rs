//! ProviderProcess: spawns one provider subprocess and watches it exit.
//!
//! The child is owned by a background exit watcher. `kill()` routes through the
//! watcher, so the exit it reports is classified as [`ExitReason::Requested`]
//! rather than inferred from the status code.

use std::process::Stdio;
use std::sync::Mutex;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::models::ProviderConfig;

/// Signal a well-behaved provider exits on when asked to stop.
const GRACEFUL_SIGNAL: i32 = 15;

/// Why a provider process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitReason {
    /// The client asked for it (remove, disconnect, shutdown).
    Requested,
    /// Exit code 0 or the graceful-termination signal.
    Clean,
    /// Anything else.
    Crashed {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl ExitReason {
    pub fn should_restart(&self) -> bool {
        matches!(self, Self::Crashed { .. })
    }

    pub fn is_unexpected(&self) -> bool {
        !matches!(self, Self::Requested)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "stopped on request"),
            Self::Clean => write!(f, "exited cleanly"),
            Self::Crashed {
                code: Some(code), ..
            } => write!(f, "crashed with exit code {}", code),
            Self::Crashed {
                signal: Some(signal),
                ..
            } => write!(f, "killed by signal {}", signal),
            Self::Crashed { .. } => write!(f, "crashed"),
        }
    }
}

pub fn classify_exit(requested: bool, code: Option<i32>, signal: Option<i32>) -> ExitReason {
    if requested {
        return ExitReason::Requested;
    }
    match (code, signal) {
        (Some(0), _) => ExitReason::Clean,
        (None, Some(GRACEFUL_SIGNAL)) => ExitReason::Clean,
        (code, signal) => ExitReason::Crashed { code, signal },
    }
}

fn classify_status(status: std::process::ExitStatus) -> ExitReason {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    classify_exit(false, status.code(), signal)
}

/// Handle to a running provider process.
pub struct ProviderProcess {
    provider: String,
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// Everything `spawn` hands back: the handle, both protocol pipes and the
/// receiver that resolves once with the exit reason.
pub struct SpawnedProcess {
    pub process: ProviderProcess,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub exited: oneshot::Receiver<ExitReason>,
}

impl ProviderProcess {
    /// Spawn the provider with its env merged over the host environment.
    pub fn spawn(config: &ProviderConfig) -> Result<SpawnedProcess, ClientError> {
        tracing::info!(
            "[ProviderProcess:{}] Spawning: {} {}",
            config.name,
            config.command,
            config.args.join(" "),
        );

        let mut command = tokio::process::Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| ClientError::Spawn {
            provider: config.name.clone(),
            message: format!("'{}': {}", config.command, e),
        })?;

        let missing = |pipe: &str| ClientError::Spawn {
            provider: config.name.clone(),
            message: format!("No {} on child process", pipe),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::debug!("[ProviderProcess:{} stderr] {}", name, line);
                    }
                }
            });
        }

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exited) = oneshot::channel();
        tokio::spawn(watch_exit(config.name.clone(), child, kill_rx, exit_tx));

        Ok(SpawnedProcess {
            process: ProviderProcess {
                provider: config.name.clone(),
                pid,
                kill_tx: Mutex::new(Some(kill_tx)),
            },
            stdin,
            stdout,
            exited,
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the watcher to kill the child. Returns `false` if already asked.
    pub fn kill(&self) -> bool {
        let tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match tx {
            Some(tx) => {
                tracing::info!("[ProviderProcess:{}] Killing process", self.provider);
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

async fn watch_exit(
    provider: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<ExitReason>,
) {
    // A dropped handle counts as a kill request.
    let reason = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => classify_status(status),
            Err(e) => {
                tracing::warn!("[ProviderProcess:{}] wait failed: {}", provider, e);
                ExitReason::Crashed { code: None, signal: None }
            }
        },
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!("[ProviderProcess:{}] start_kill: {}", provider, e);
            }
            let _ = child.wait().await;
            ExitReason::Requested
        }
    };
    tracing::info!("[ProviderProcess:{}] Process {}", provider, reason);
    let _ = exit_tx.send(reason);
}
