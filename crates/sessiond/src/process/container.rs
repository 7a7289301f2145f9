//! Commands executed inside running containers.
//!
//! The container engine is reached through [`ContainerRuntime`]; this module
//! only relies on the exec calls every engine API offers. Output of a
//! non-tty exec arrives as one framed stream and is split back into stdout
//! and stderr with [`demux_copy`](crate::asyncio::demux_copy).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{
    exit_status, initial_size, shell_command, Process, ProcessError, ProcessFactory, PtyStreams,
    STATUS_UNKNOWN,
};
use crate::asyncio::{self, lock, AsyncIoError, Sink, Source, DEFAULT_GRACE};
use crate::auth::{parse_authorized_keys, AuthError, ConnectionLookup, KeyFinder};
use crate::config::ContainerConfig;
use crate::leak::Tracker;
use crate::term::{Pipes, TerminalPair, WindowSize};
use crate::transport::{Peer, PeerInfo};

/// How often `wait` re-inspects an exec whose output ended before the
/// runtime recorded its exit.
const INSPECT_ATTEMPTS: usize = 10;
const INSPECT_INTERVAL: Duration = Duration::from_millis(50);

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("No running container with {label}={value}")]
    NotFound { label: String, value: String },

    #[error("No unique container found for {label}={value} ({count} matches)")]
    NotUnique {
        label: String,
        value: String,
        count: usize,
    },

    /// The runtime API rejected a call.
    #[error("container runtime: {0}")]
    Api(String),

    /// The attached stream failed.
    #[error("exec stream: {0}")]
    Stream(#[from] AsyncIoError),
}

/// Parameters for a new exec instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecConfig {
    pub container_id: String,
    pub cmd: Vec<String>,
    pub tty: bool,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
}

/// A hijacked exec connection.
#[derive(Debug, Clone)]
pub struct ExecStream {
    /// Raw output in tty mode, framed output otherwise.
    pub output: Source,
    pub input: Sink,
}

/// Result of inspecting an exec instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecInspect {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// A container as listed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    /// Lifecycle state, `running` for containers that accept execs.
    pub state: String,
    pub labels: HashMap<String, String>,
}

/// The calls a container engine must provide.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates an exec instance and returns its id.
    async fn exec_create(&self, config: &ExecConfig) -> Result<String, RuntimeError>;

    /// Starts the exec and attaches to its streams.
    async fn exec_attach(&self, exec_id: &str, tty: bool) -> Result<ExecStream, RuntimeError>;

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecInspect, RuntimeError>;

    async fn exec_resize(&self, exec_id: &str, size: WindowSize) -> Result<(), RuntimeError>;

    /// Lists containers whose `label` equals `value`.
    async fn find_containers(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;
}

/// Finds the one running container labelled `label=value`.
pub async fn find_unique_container(
    runtime: &dyn ContainerRuntime,
    label: &str,
    value: &str,
) -> Result<ContainerSummary, RuntimeError> {
    let mut running: Vec<_> = runtime
        .find_containers(label, value)
        .await?
        .into_iter()
        .filter(|c| c.state == "running")
        .collect();

    match running.len() {
        1 => Ok(running.remove(0)),
        0 => Err(RuntimeError::NotFound {
            label: label.to_string(),
            value: value.to_string(),
        }),
        count => Err(RuntimeError::NotUnique {
            label: label.to_string(),
            value: value.to_string(),
            count,
        }),
    }
}

#[derive(Default)]
struct ContainerState {
    cancel: Option<CancellationToken>,
    pipes: Option<Pipes>,
    exec_id: Option<String>,
    stream: Option<ExecStream>,
    /// Child-side handles the pumps use; closed on cleanup.
    sources: Vec<Source>,
    sinks: Vec<Sink>,
    output_done: Option<oneshot::Receiver<()>>,
}

/// A command run with the runtime's exec API.
pub struct ContainerProcess {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    cmd: Vec<String>,
    grace: Duration,
    terminal: Arc<TerminalPair>,
    state: Mutex<ContainerState>,
    exited: AtomicBool,
}

impl ContainerProcess {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        container_id: impl Into<String>,
        cmd: Vec<String>,
    ) -> Self {
        Self {
            runtime,
            container_id: container_id.into(),
            cmd,
            grace: DEFAULT_GRACE,
            terminal: Arc::new(TerminalPair::new()),
            state: Mutex::new(ContainerState::default()),
            exited: AtomicBool::new(false),
        }
    }

    /// Sets how long stream pumps may run on after cancellation.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn cancel_token(&self) -> Result<CancellationToken, ProcessError> {
        lock(&self.state)
            .cancel
            .clone()
            .ok_or(ProcessError::NotInitialized)
    }

    /// Copies the exec output to the slave side of the local terminal and
    /// keyboard input back to the exec.
    fn pump_tty(
        &self,
        tracker: &Arc<Tracker>,
        cancel: &CancellationToken,
        stream: &ExecStream,
        done: oneshot::Sender<()>,
    ) -> Result<(), ProcessError> {
        let slave_out = Sink::new(self.terminal.slave()?);
        let slave_in = Source::new(self.terminal.slave()?);
        {
            let mut state = lock(&self.state);
            state.sinks.push(slave_out.clone());
            state.sources.push(slave_in.clone());
        }

        let (cancel_out, grace, output) = (cancel.clone(), self.grace, stream.output.clone());
        let terminal = Arc::clone(&self.terminal);
        let guard = tracker.guard("container: output");
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = asyncio::copy(&cancel_out, grace, &slave_out, &output).await {
                tracing::debug!(error = %e, "container output pump stopped");
            }
            terminal.restore();
            let _ = done.send(());
        });

        self.pump_input(tracker, cancel, stream, slave_in);
        Ok(())
    }

    /// Splits the framed exec output onto the stdout and stderr pipes and
    /// feeds the stdin pipe to the exec.
    fn pump_pipes(
        &self,
        tracker: &Arc<Tracker>,
        cancel: &CancellationToken,
        stream: &ExecStream,
        done: oneshot::Sender<()>,
    ) -> Result<(), ProcessError> {
        let ends = lock(&self.state)
            .pipes
            .as_ref()
            .and_then(Pipes::take_ends)
            .ok_or(ProcessError::NotInitialized)?;
        let stdout = Sink::from_unix(ends.stdout)?;
        let stderr = Sink::from_unix(ends.stderr)?;
        let stdin = Source::from_unix(ends.stdin)?;
        {
            let mut state = lock(&self.state);
            state.sinks.extend([stdout.clone(), stderr.clone()]);
            state.sources.push(stdin.clone());
        }

        let (cancel_out, grace, output) = (cancel.clone(), self.grace, stream.output.clone());
        let guard = tracker.guard("container: output");
        tokio::spawn(async move {
            let _guard = guard;
            match asyncio::demux_copy(&cancel_out, grace, &output, &stdout, &stderr).await {
                Ok(_) => {}
                Err(AsyncIoError::Remote(message)) => {
                    tracing::warn!(error = %message, "container runtime reported a stream error");
                }
                Err(e) => tracing::debug!(error = %e, "container output pump stopped"),
            }
            stdout.close();
            stderr.close();
            let _ = done.send(());
        });

        self.pump_input(tracker, cancel, stream, stdin);
        Ok(())
    }

    fn pump_input(
        &self,
        tracker: &Arc<Tracker>,
        cancel: &CancellationToken,
        stream: &ExecStream,
        from: Source,
    ) {
        let (cancel, grace, input) = (cancel.clone(), self.grace, stream.input.clone());
        let guard = tracker.guard("container: input");
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = asyncio::copy(&cancel, grace, &input, &from).await {
                tracing::debug!(error = %e, "container input pump stopped");
            }
            input.close();
        });
    }

    async fn inspect_exit(&self, exec_id: &str) -> Result<u8, ProcessError> {
        for attempt in 0..INSPECT_ATTEMPTS {
            let inspect = self.runtime.exec_inspect(exec_id).await?;
            if !inspect.running {
                self.exited.store(true, Ordering::Release);
                return Ok(inspect.exit_code.map_or(STATUS_UNKNOWN, exit_status));
            }
            if attempt + 1 < INSPECT_ATTEMPTS {
                tokio::time::sleep(INSPECT_INTERVAL).await;
            }
        }
        Ok(STATUS_UNKNOWN)
    }
}

impl fmt::Display for ContainerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.container_id, self.cmd.join(" "))
    }
}

#[async_trait]
impl Process for ContainerProcess {
    async fn init(
        &self,
        cancel: &CancellationToken,
        _tracker: &Arc<Tracker>,
        wants_pty: bool,
    ) -> Result<(), ProcessError> {
        let pipes = if wants_pty {
            self.terminal.open(true)?;
            None
        } else {
            Some(Pipes::open()?)
        };

        let mut state = lock(&self.state);
        state.cancel = Some(cancel.child_token());
        state.pipes = pipes;
        Ok(())
    }

    async fn start(
        &self,
        tracker: &Arc<Tracker>,
        term: &str,
        mut resize: mpsc::Receiver<WindowSize>,
        wants_pty: bool,
    ) -> Result<Option<PtyStreams>, ProcessError> {
        let cancel = self.cancel_token()?;

        let mut env = Vec::new();
        if wants_pty && !term.is_empty() {
            env.push(format!("TERM={term}"));
        }
        let exec_id = self
            .runtime
            .exec_create(&ExecConfig {
                container_id: self.container_id.clone(),
                cmd: self.cmd.clone(),
                tty: wants_pty,
                env,
            })
            .await?;
        let stream = self.runtime.exec_attach(&exec_id, wants_pty).await?;

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            state.exec_id = Some(exec_id.clone());
            state.stream = Some(stream.clone());
            state.output_done = Some(done_rx);
        }

        if !wants_pty {
            self.pump_pipes(tracker, &cancel, &stream, done_tx)?;
            return Ok(None);
        }

        if let Some(size) = initial_size(&mut resize) {
            if let Err(e) = self.terminal.resize(size) {
                tracing::debug!(error = %e, "initial pty resize failed");
            }
            if let Err(e) = self.runtime.exec_resize(&exec_id, size).await {
                tracing::debug!(error = %e, "initial exec resize failed");
            }
        }

        self.pump_tty(tracker, &cancel, &stream, done_tx)?;

        let terminal = Arc::clone(&self.terminal);
        let runtime = Arc::clone(&self.runtime);
        let guard = tracker.guard("container: resize");
        tokio::spawn(async move {
            let _guard = guard;
            terminal
                .handle_with(resize, |size| {
                    let runtime = Arc::clone(&runtime);
                    let exec_id = exec_id.clone();
                    async move {
                        if let Err(e) = runtime.exec_resize(&exec_id, size).await {
                            tracing::debug!(error = %e, "exec resize failed");
                        }
                    }
                })
                .await;
        });

        Ok(Some(PtyStreams {
            reader: Source::new(self.terminal.master()?),
            writer: Sink::new(self.terminal.master()?),
        }))
    }

    fn stdout(&self) -> Result<Source, ProcessError> {
        lock(&self.state)
            .pipes
            .as_ref()
            .map(Pipes::stdout)
            .ok_or(ProcessError::NotInitialized)
    }

    fn stderr(&self) -> Result<Source, ProcessError> {
        lock(&self.state)
            .pipes
            .as_ref()
            .map(Pipes::stderr)
            .ok_or(ProcessError::NotInitialized)
    }

    fn stdin(&self) -> Result<Sink, ProcessError> {
        lock(&self.state)
            .pipes
            .as_ref()
            .map(Pipes::stdin)
            .ok_or(ProcessError::NotInitialized)
    }

    async fn wait(&self, _tracker: &Arc<Tracker>) -> Result<u8, ProcessError> {
        let (done, exec_id, cancel) = {
            let mut state = lock(&self.state);
            (
                state.output_done.take(),
                state.exec_id.clone(),
                state.cancel.clone(),
            )
        };
        let (Some(done), Some(exec_id), Some(cancel)) = (done, exec_id, cancel) else {
            return Err(ProcessError::NotStarted);
        };

        tokio::select! {
            _ = done => {}
            _ = cancel.cancelled() => return Ok(STATUS_UNKNOWN),
        }
        self.inspect_exit(&exec_id).await
    }

    /// Closes the exec connection and every local handle. Returns whether
    /// the exec had already exited; the runtime offers no way to kill one.
    async fn cleanup(&self) -> bool {
        let (cancel, pipes, stream, sources, sinks) = {
            let mut state = lock(&self.state);
            (
                state.cancel.take(),
                state.pipes.take(),
                state.stream.take(),
                std::mem::take(&mut state.sources),
                std::mem::take(&mut state.sinks),
            )
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.terminal.unhang_hack();
        self.terminal.close();

        if let Some(stream) = stream {
            stream.input.close();
            stream.output.close();
        }
        for source in sources {
            source.close();
        }
        for sink in sinks {
            sink.close();
        }
        if let Some(pipes) = pipes {
            pipes.close_all();
        }

        self.exited.load(Ordering::Acquire)
    }
}

/// Runs the peer's command in the container labelled with the user's name.
///
/// One factory serves one connection. The container lookup goes through a
/// [`ConnectionLookup`] that the authorization step may share.
pub struct ContainerFactory {
    runtime: Arc<dyn ContainerRuntime>,
    config: ContainerConfig,
    grace: Duration,
    lookup: Arc<ConnectionLookup<ContainerSummary>>,
}

impl ContainerFactory {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: ContainerConfig,
        lookup: Arc<ConnectionLookup<ContainerSummary>>,
    ) -> Self {
        Self {
            runtime,
            config,
            grace: DEFAULT_GRACE,
            lookup,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl ProcessFactory for ContainerFactory {
    async fn make(&self, peer: &dyn Peer) -> Result<Arc<dyn Process>, ProcessError> {
        let user = &peer.info().user;
        let container = self
            .lookup
            .get_or_try_init(|| {
                find_unique_container(self.runtime.as_ref(), &self.config.user_label, user)
            })
            .await?;

        let cmd = shell_command(&self.config.shell, peer.command());
        Ok(Arc::new(
            ContainerProcess::new(Arc::clone(&self.runtime), container.id.clone(), cmd)
                .with_grace(self.grace),
        ))
    }
}

/// Reads a user's authorized keys from a label on their container.
///
/// Share the lookup with the connection's [`ContainerFactory`] so the
/// container is only resolved once.
pub struct ContainerKeyFinder {
    runtime: Arc<dyn ContainerRuntime>,
    user_label: String,
    key_label: String,
    lookup: Arc<ConnectionLookup<ContainerSummary>>,
}

impl ContainerKeyFinder {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: &ContainerConfig,
        lookup: Arc<ConnectionLookup<ContainerSummary>>,
    ) -> Self {
        Self {
            runtime,
            user_label: config.user_label.clone(),
            key_label: config.key_label.clone(),
            lookup,
        }
    }
}

#[async_trait]
impl KeyFinder for ContainerKeyFinder {
    async fn find_keys(&self, peer: &PeerInfo) -> Result<Vec<hostkey::PublicKey>, AuthError> {
        let container = self
            .lookup
            .get_or_try_init(|| {
                find_unique_container(self.runtime.as_ref(), &self.user_label, &peer.user)
            })
            .await
            .map_err(|e| AuthError::Lookup(e.to_string()))?;

        Ok(container
            .labels
            .get(&self.key_label)
            .map(String::as_str)
            .map(parse_authorized_keys)
            .unwrap_or_default())
    }
}
