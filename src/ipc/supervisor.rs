//! Worker process supervision.
//!
//! A worker is started lazily, lives in a private runtime directory (socket,
//! bundled script), and is stopped in a fixed order: close the connection,
//! ask the process to terminate, force-kill after a grace period, then
//! remove the runtime directory. A worker whose channel failed mid-request
//! is killed outright instead ([`WorkerHandle::abort`]).
//!
//! # Process Cleanup Safety
//!
//! `WorkerHandle` owns the child and the runtime directory. If it is dropped
//! without an explicit [`WorkerHandle::stop`] (early return, panic, normal
//! process exit), the child is killed (`kill_on_drop`) and the directory is
//! removed by `TempDir`. A forced kill of the host process skips all of this.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::IpcError;
use crate::ipc::framing::FramedChannel;
use crate::ipc::transport::{choose_transport, Transport, TransportAddress, TransportKind};
use crate::models::{RenderRequest, RenderResponse};

/// Bundled KaTeX render server.
pub const WORKER_SCRIPT: &str = include_str!("../../worker/katex-server.js");

const WORKER_SCRIPT_NAME: &str = "katex-server.js";

/// Interval between readiness checks during startup.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long a worker gets to exit after SIGTERM before it is killed.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// How to launch the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Interpreter binary (`node` by default).
    pub interpreter: String,
    /// Worker script; `None` uses the bundled [`WORKER_SCRIPT`].
    pub script: Option<PathBuf>,
    /// Alternate KaTeX installation passed as `--katex-path`.
    pub katex_path: Option<PathBuf>,
    pub transport: TransportKind,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            interpreter: crate::config::DEFAULT_NODEJS_BINARY.to_string(),
            script: None,
            katex_path: None,
            transport: TransportKind::Auto,
        }
    }
}

impl WorkerCommand {
    fn build(&self, script: &Path, address: &TransportAddress) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(script).args(address.worker_args());
        if let Some(katex_path) = &self.katex_path {
            cmd.arg("--katex-path").arg(katex_path);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

/// A running, connected worker.
#[derive(Debug)]
pub struct WorkerHandle {
    channel: Option<FramedChannel<Transport>>,
    child: Child,
    address: TransportAddress,
    runtime_dir: Option<TempDir>,
    runtime_path: PathBuf,
}

impl WorkerHandle {
    /// Spawn a worker and wait until its transport accepts a connection.
    ///
    /// # Errors
    ///
    /// - `TempDir` if the runtime directory or script cannot be written
    /// - `Spawn` if the interpreter cannot be executed
    /// - `WorkerExited` if the worker dies before it is reachable
    /// - `StartupTimeout` if it is not reachable within `startup_timeout`
    ///
    /// On any error the process is killed and the runtime directory removed.
    pub async fn start(command: &WorkerCommand, startup_timeout: Duration) -> Result<Self, IpcError> {
        let started = Instant::now();
        let deadline = started + startup_timeout;
        let runtime_dir = tempfile::Builder::new()
            .prefix("katex-")
            .tempdir()
            .map_err(IpcError::TempDir)?;

        let address = choose_transport(command.transport, runtime_dir.path())?;

        let script = match &command.script {
            Some(script) => script.clone(),
            None => {
                let path = runtime_dir.path().join(WORKER_SCRIPT_NAME);
                tokio::fs::write(&path, WORKER_SCRIPT)
                    .await
                    .map_err(IpcError::TempDir)?;
                path
            }
        };

        let mut child = command
            .build(&script, &address)
            .spawn()
            .map_err(|source| IpcError::Spawn {
                binary: command.interpreter.clone(),
                source,
            })?;
        info!(
            "Started KaTeX worker (pid {:?}): {} {} on {}",
            child.id(),
            command.interpreter,
            script.display(),
            address
        );

        match wait_until_ready(&address, &mut child, deadline, startup_timeout).await {
            Ok(transport) => {
                info!("KaTeX worker ready after {:?}", started.elapsed());
                let runtime_path = runtime_dir.path().to_path_buf();
                Ok(Self {
                    channel: Some(FramedChannel::new(transport)),
                    child,
                    address,
                    runtime_dir: Some(runtime_dir),
                    runtime_path,
                })
            }
            Err(err) => {
                warn!("KaTeX worker failed to start: {}", err);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill KaTeX worker: {}", e);
                }
                if let Err(e) = runtime_dir.close() {
                    warn!("Failed to remove worker runtime directory: {}", e);
                }
                Err(err)
            }
        }
    }

    pub fn address(&self) -> &TransportAddress {
        &self.address
    }

    /// Runtime directory; it no longer exists once the worker is stopped.
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_path
    }

    /// OS process id, `None` once the process has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn is_stopped(&self) -> bool {
        self.channel.is_none()
    }

    /// Whether the process is still running and the channel still open.
    pub fn is_alive(&mut self) -> bool {
        !self.is_stopped() && matches!(self.child.try_wait(), Ok(None))
    }

    /// Receive buffer size of the channel (0 once stopped).
    pub fn buffer_len(&self) -> usize {
        self.channel.as_ref().map_or(0, FramedChannel::buffer_len)
    }

    /// One request/response round trip; see [`FramedChannel::render`].
    pub async fn render(
        &mut self,
        request: &RenderRequest,
        timeout: Option<Duration>,
    ) -> Result<RenderResponse, IpcError> {
        let channel = self.channel.as_mut().ok_or(IpcError::ConnectionClosed)?;
        channel.render(request, timeout).await
    }

    /// Stop the worker. Safe to call any number of times.
    pub async fn stop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };

        let mut transport = channel.into_inner();
        if let Err(e) = transport.close().await {
            debug!("Error closing worker connection: {}", e);
        }
        drop(transport);

        terminate(&mut self.child).await;

        if let Some(dir) = self.runtime_dir.take() {
            if let Err(e) = dir.close() {
                warn!("Failed to remove worker runtime directory: {}", e);
            }
        }
    }
}

impl WorkerHandle {
    /// Kill the worker without waiting for it to exit.
    ///
    /// For a worker whose channel can no longer be trusted: the caller gets
    /// its error back immediately instead of after the grace period. The
    /// killed process is reaped by the runtime.
    pub fn abort(mut self) {
        if self.channel.take().is_none() {
            return;
        }
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to kill KaTeX worker: {}", e);
        }
        if let Some(dir) = self.runtime_dir.take() {
            if let Err(e) = dir.close() {
                warn!("Failed to remove worker runtime directory: {}", e);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.channel.take().is_some() {
            debug!("Worker handle dropped without stop; killing process");
            let _ = self.child.start_kill();
        }
        // runtime_dir removes itself when dropped
    }
}

/// Poll until the worker's transport accepts a connection.
///
/// Unix sockets are only dialed once the socket file exists. A refused
/// connection means "not listening yet" and is retried. Each connect is
/// bounded by what is left before `deadline`; `startup_timeout` is only
/// reported back in the error.
async fn wait_until_ready(
    address: &TransportAddress,
    child: &mut Child,
    deadline: Instant,
    startup_timeout: Duration,
) -> Result<Transport, IpcError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(IpcError::WorkerExited(status));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(IpcError::StartupTimeout(startup_timeout));
        }

        if address.may_be_ready().await {
            match timeout(remaining, Transport::connect(address)).await {
                Ok(Ok(transport)) => return Ok(transport),
                Ok(Err(e)) if is_not_listening(&e) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(IpcError::StartupTimeout(startup_timeout)),
            }
        }

        sleep(READY_POLL_INTERVAL.min(remaining)).await;
    }
}

fn is_not_listening(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
    )
}

/// SIGTERM, wait up to [`STOP_GRACE_PERIOD`], then SIGKILL.
async fn terminate(child: &mut Child) {
    if child.id().is_none() {
        return;
    }

    request_exit(child);

    match timeout(STOP_GRACE_PERIOD, child.wait()).await {
        Ok(Ok(status)) => debug!("KaTeX worker exited: {}", status),
        Ok(Err(e)) => warn!("Error waiting for KaTeX worker: {}", e),
        Err(_) => {
            warn!("KaTeX worker didn't exit gracefully, killing");
            if let Err(e) = child.kill().await {
                warn!("Failed to kill KaTeX worker: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!("SIGTERM to KaTeX worker failed: {}", e);
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    let _ = child.start_kill();
}

/// Owner of the single worker slot.
///
/// `get_or_start` reuses the current worker while it is alive and starts a
/// new one otherwise. Callers serialise access (the gateway wraps this in a
/// mutex), so at most one worker exists at a time.
#[derive(Debug)]
pub struct WorkerSupervisor {
    command: WorkerCommand,
    startup_timeout: Duration,
    worker: Option<WorkerHandle>,
}

impl WorkerSupervisor {
    pub fn new(command: WorkerCommand, startup_timeout: Duration) -> Self {
        Self {
            command,
            startup_timeout,
            worker: None,
        }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Start a fresh worker without storing it.
    pub async fn start(&self) -> Result<WorkerHandle, IpcError> {
        WorkerHandle::start(&self.command, self.startup_timeout).await
    }

    /// Return the live worker, starting one if there is none.
    pub async fn get_or_start(&mut self) -> Result<&mut WorkerHandle, IpcError> {
        let worker = match self.worker.take() {
            Some(mut worker) => {
                if worker.is_alive() {
                    worker
                } else {
                    warn!("KaTeX worker is no longer running; restarting");
                    worker.stop().await;
                    self.start().await?
                }
            }
            None => self.start().await?,
        };
        Ok(self.worker.insert(worker))
    }

    /// The current worker, if any, without starting one.
    pub fn current(&mut self) -> Option<&mut WorkerHandle> {
        self.worker.as_mut()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Kill the current worker without waiting; see [`WorkerHandle::abort`].
    pub fn discard(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }

    /// Stop and discard the current worker. No-op when there is none.
    pub async fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop().await;
        }
    }
}
