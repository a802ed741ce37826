//! Supervises tunnel-client processes.

use std::process::Stdio;
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::Dispatcher;
use crate::protocol::{LogLevel, Response, TunnelState, TunnelStatus};

/// How long we wait for a dead tunnel's last output before announcing its exit.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(super) enum TunnelRecord {
    Running {
        pid: Option<u32>,
        /// Taken when the stop has been requested.
        kill: Option<oneshot::Sender<()>>,
    },
    Stopped {
        exit_code: Option<i32>,
    },
}

impl TunnelRecord {
    pub(super) fn status(&self, id: u32) -> TunnelStatus {
        let state = match self {
            Self::Running { pid, .. } => TunnelState::Running { pid: *pid },
            Self::Stopped { exit_code } => TunnelState::Stopped {
                exit_code: *exit_code,
            },
        };

        TunnelStatus { id, state }
    }

    pub(super) fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Asks the supervisor to kill the child. `false` if there is nothing left to kill.
    pub(super) fn kill(&mut self) -> bool {
        let Self::Running { kill, .. } = self else {
            return false;
        };

        kill.take().is_some_and(|tx| tx.send(()).is_ok())
    }
}

pub(super) fn start(dispatcher: &Dispatcher, id: u32) -> Response {
    let program = dispatcher
        .settings()
        .tunnel_client_path(dispatcher.install_dir());
    let args = dispatcher.settings().tunnel_args_for(id);

    // Checking and spawning under one lock, so two sessions can't both start `id`.
    let spawned = dispatcher.with_state(|state| -> std::io::Result<_> {
        if state.tunnels.get(&id).is_some_and(TunnelRecord::is_running) {
            return Ok(None);
        }

        let child = Command::new(&program)
            .args(&args)
            .current_dir(dispatcher.install_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let (kill_tx, kill_rx) = oneshot::channel();
        state.set_tunnel(
            id,
            TunnelRecord::Running {
                pid: child.id(),
                kill: Some(kill_tx),
            },
        );

        Ok(Some((child, kill_rx)))
    });

    match spawned {
        Ok(Some((child, kill_rx))) => {
            tracing::info!(%id, pid = ?child.id(), program = %program.display(), "Started tunnel");
            dispatcher.append_log("service", LogLevel::Info, format!("Tunnel {id} started"));
            tokio::spawn(supervise(dispatcher.clone(), id, child, kill_rx));

            Response::done(format!("Tunnel {id} started"))
        }
        Ok(None) => Response::error(format!("Tunnel {id} is already running")),
        Err(error) => {
            tracing::warn!(%id, program = %program.display(), "Failed to start tunnel: {error}");
            dispatcher.append_log(
                "service",
                LogLevel::Error,
                format!("Failed to start tunnel {id}: {error}"),
            );

            Response::error(format!("Couldn't start `{}`: {error}", program.display()))
        }
    }
}

pub(super) fn stop(dispatcher: &Dispatcher, id: u32) -> Response {
    let requested = dispatcher.with_state(|state| {
        state
            .tunnels
            .get_mut(&id)
            .is_some_and(TunnelRecord::kill)
    });

    if requested {
        Response::done(format!("Stopping tunnel {id}"))
    } else {
        Response::error(format!("Tunnel {id} is not running"))
    }
}

async fn supervise(
    dispatcher: Dispatcher,
    id: u32,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
) {
    let source = format!("tunnel:{id}");
    let mut output = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        output.push(forward_lines(dispatcher.clone(), source.clone(), stdout, LogLevel::Info));
    }
    if let Some(stderr) = child.stderr.take() {
        output.push(forward_lines(dispatcher.clone(), source, stderr, LogLevel::Warn));
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            tracing::debug!(%id, "Killing tunnel client");
            if let Err(error) = child.start_kill() {
                tracing::warn!(%id, "Failed to kill tunnel client: {error}");
            }
            child.wait().await
        }
    };

    // Its last lines should reach the log before the exit does.
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, join_all(output))
        .await
        .is_err()
    {
        tracing::debug!(%id, "Tunnel output is still open, not waiting for it");
    }

    let exit_code = match status {
        Ok(status) => status.code(),
        Err(error) => {
            tracing::warn!(%id, "Couldn't wait for tunnel client: {error}");
            None
        }
    };
    tracing::info!(%id, ?exit_code, "Tunnel exited");
    dispatcher.append_log(
        "service",
        LogLevel::Info,
        match exit_code {
            Some(code) => format!("Tunnel {id} exited with code {code}"),
            None => format!("Tunnel {id} was terminated"),
        },
    );
    dispatcher.with_state(|state| state.set_tunnel(id, TunnelRecord::Stopped { exit_code }));
}

fn forward_lines<R>(dispatcher: Dispatcher, source: String, reader: R, level: LogLevel) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => dispatcher.append_log(source.as_str(), level, line),
                Ok(None) => break,
                Err(error) => {
                    tracing::debug!(%source, "Stopped reading tunnel output: {error}");
                    break;
                }
            }
        }
    })
}
