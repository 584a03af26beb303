use std::{
    future::Future,
    io,
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use rmcp::{
    RoleClient,
    service::{RxJsonRpcMessage, TxJsonRpcMessage},
    transport::{Transport, TokioChildProcess},
};
use tokio::io::AsyncBufReadExt;

use crate::config::{RestartPolicy, StderrMode};

/// Everything needed to (re)spawn one stdio server process.
#[derive(Debug, Clone)]
pub struct StdioLaunchSpec {
    pub server_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub clear_env: bool,
    pub stderr_mode: StderrMode,
}

impl StdioLaunchSpec {
    pub fn spawn(&self) -> io::Result<TokioChildProcess> {
        let mut command = tokio::process::Command::new(&self.command);
        command.args(&self.args);
        if self.clear_env {
            command.env_clear();
        }
        for (k, v) in &self.env {
            command.env(k, v);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        let stderr = match self.stderr_mode {
            StderrMode::Inherit => Stdio::inherit(),
            StderrMode::Pipe => Stdio::piped(),
            StderrMode::Ignore => Stdio::null(),
        };
        let (transport, stderr) = TokioChildProcess::builder(command).stderr(stderr).spawn()?;
        if let Some(stderr) = stderr {
            let server = self.server_name.clone();
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target = "transport", server = %server, "stderr: {line}");
                }
            });
        }
        Ok(transport)
    }
}

/// Shared diagnostics between a restartable transport and the connection
/// that owns it. The transport itself is consumed by the client service.
#[derive(Debug, Default)]
pub struct RestartState {
    restart_count: AtomicU32,
    restarting: AtomicBool,
    closing: AtomicBool,
    exhausted: AtomicBool,
}

impl RestartState {
    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::Relaxed)
    }

    /// True once the restart budget was spent without a surviving child.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Relaxed)
    }
}

/// A child-process transport with bounded-restart supervision.
///
/// An unexpected child exit schedules exactly one respawn after
/// `policy.delay_ms`, bounded by `policy.max`. An intentional `close()`
/// suppresses the pending restart.
pub struct RestartableChildProcess {
    spec: StdioLaunchSpec,
    policy: RestartPolicy,
    inner: TokioChildProcess,
    state: Arc<RestartState>,
}

impl RestartableChildProcess {
    pub fn start(spec: StdioLaunchSpec, policy: RestartPolicy) -> io::Result<Self> {
        let inner = spec.spawn()?;
        Ok(Self {
            spec,
            policy,
            inner,
            state: Arc::new(RestartState::default()),
        })
    }

    pub fn state(&self) -> Arc<RestartState> {
        self.state.clone()
    }

    /// One restart per observed close. Returns false when the transport
    /// should stay down.
    async fn try_restart(&mut self) -> bool {
        if self.state.closing.load(Ordering::Relaxed) || !self.policy.on_exit {
            return false;
        }
        let done = self.state.restart_count.load(Ordering::Relaxed);
        if let Some(max) = self.policy.max {
            if done >= max {
                self.state.exhausted.store(true, Ordering::Relaxed);
                tracing::warn!(
                    target = "transport",
                    server = %self.spec.server_name,
                    restarts = done,
                    "restart budget exhausted"
                );
                return false;
            }
        }
        self.state.restarting.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(self.policy.delay_ms)).await;
        if self.state.closing.load(Ordering::Relaxed) {
            self.state.restarting.store(false, Ordering::Relaxed);
            return false;
        }
        match self.spec.spawn() {
            Ok(transport) => {
                self.inner = transport;
                self.state.restart_count.fetch_add(1, Ordering::Relaxed);
                self.state.restarting.store(false, Ordering::Relaxed);
                tracing::info!(
                    target = "transport",
                    server = %self.spec.server_name,
                    restarts = done + 1,
                    "child restarted"
                );
                true
            }
            Err(e) => {
                self.state.restarting.store(false, Ordering::Relaxed);
                tracing::warn!(
                    target = "transport",
                    server = %self.spec.server_name,
                    "respawn failed: {e}"
                );
                false
            }
        }
    }
}

impl Transport<RoleClient> for RestartableChildProcess {
    type Error = io::Error;

    fn send(
        &mut self,
        item: TxJsonRpcMessage<RoleClient>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        self.inner.send(item)
    }

    fn receive(&mut self) -> impl Future<Output = Option<RxJsonRpcMessage<RoleClient>>> + Send {
        async move {
            loop {
                if let Some(message) = self.inner.receive().await {
                    return Some(message);
                }
                if !self.try_restart().await {
                    return None;
                }
            }
        }
    }

    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.state.closing.store(true, Ordering::Relaxed);
        self.inner.close()
    }
}
