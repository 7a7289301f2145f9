//! Binds one peer to one process.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::asyncio::{self, lock, Sink, Source, DEFAULT_GRACE};
use crate::config::SessionConfig;
use crate::leak::{Tracker, DEFAULT_LEAK_TIMEOUT, LEAK_DETECTION_ENABLED};
use crate::process::{Process, ProcessError, STATUS_UNKNOWN};
use crate::sync::OneTime;
use crate::term::WindowSize;
use crate::transport::{Peer, PeerInfo};

/// Capacity of the window change channel handed to the process.
const RESIZE_CHANNEL_CAPACITY: usize = 16;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session.run(): Already started.")]
    AlreadyStarted,

    #[error("Failed to start process: {0}")]
    Start(#[from] ProcessError),
}

/// Timing knobs for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// How long I/O may keep running after cancellation, and how long
    /// output may drain after the process exits.
    pub grace: Duration,
    /// How long the leak detector waits for session tasks.
    pub leak_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            grace: DEFAULT_GRACE,
            leak_timeout: DEFAULT_LEAK_TIMEOUT,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            grace: config.grace_timeout(),
            leak_timeout: config.leak_timeout(),
        }
    }
}

pub(crate) fn session_span(id: Uuid, info: &PeerInfo) -> tracing::Span {
    tracing::info_span!(
        "session",
        session = %id,
        user = %info.user,
        remote = %info.remote,
    )
}

/// A running session.
///
/// `run` may be called once. The session ends exactly once, whether the
/// process exits, the peer disconnects or the process fails to start: the
/// exit status goes to the peer, the leak detector checks the session's
/// tasks and the process is cleaned up in the background.
pub struct Session {
    id: Uuid,
    peer: Arc<dyn Peer>,
    process: Arc<dyn Process>,
    tracker: Arc<Tracker>,
    options: SessionOptions,
    cancel: CancellationToken,
    started: OneTime,
    finished: OneTime,
    status: OnceLock<u8>,
    span: tracing::Span,
    drains: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        peer: Arc<dyn Peer>,
        process: Arc<dyn Process>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let span = session_span(id, peer.info());
        Self::with_span(id, span, peer, process, options)
    }

    pub(crate) fn with_span(
        id: Uuid,
        span: tracing::Span,
        peer: Arc<dyn Peer>,
        process: Arc<dyn Process>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let cancel = peer.cancellation().child_token();
        Arc::new(Self {
            id,
            peer,
            process,
            tracker: Arc::new(Tracker::new(options.leak_timeout)),
            options,
            cancel,
            started: OneTime::new(),
            finished: OneTime::new(),
            status: OnceLock::new(),
            span,
            drains: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The exit status reported to the peer, once the session has ended.
    pub fn status(&self) -> Option<u8> {
        self.status.get().copied()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_fired()
    }

    /// Runs the process to completion and returns the status reported to the peer.
    pub async fn run(self: &Arc<Self>) -> Result<u8, SessionError> {
        if !self.started.fire() {
            return Err(SessionError::AlreadyStarted);
        }
        self.run_started().instrument(self.span.clone()).await
    }

    async fn run_started(self: &Arc<Self>) -> Result<u8, SessionError> {
        if LEAK_DETECTION_ENABLED {
            tracing::info!("memory_leak_detector_enabled");
        }

        if let Err(e) = self.start().await {
            let err = SessionError::Start(e);
            self.finalize(STATUS_UNKNOWN, Some(err.to_string())).await;
            return Err(err);
        }

        // a disconnect ends the session right away
        let session = Arc::clone(self);
        let guard = self.tracker.guard("session: context cancel");
        tokio::spawn(
            async move {
                let _guard = guard;
                session.cancel.cancelled().await;
                session.finalize(STATUS_UNKNOWN, None).await;
            }
            .instrument(self.span.clone()),
        );

        let (status, err) = self.wait().await;
        self.finalize(status, err).await;
        Ok(self.status().unwrap_or(STATUS_UNKNOWN))
    }

    async fn start(&self) -> Result<(), ProcessError> {
        let pty = self.peer.pty_request();
        self.process
            .init(&self.cancel, &self.tracker, pty.is_some())
            .await?;

        match pty {
            Some(request) => self.start_pty(&request.term, request.size).await,
            None => self.start_regular().await,
        }
    }

    async fn start_regular(&self) -> Result<(), ProcessError> {
        let stdout = self.process.stdout()?;
        let handle = self.spawn_output("session: stdout", self.peer.stdout(), stdout);
        lock(&self.drains).push(handle);

        let stderr = self.process.stderr()?;
        let handle = self.spawn_output("session: stderr", self.peer.stderr(), stderr);
        lock(&self.drains).push(handle);

        let stdin = self.process.stdin()?;
        self.spawn_input("session: stdin", stdin, self.peer.stdin(), true);

        let (_resize_tx, resize_rx) = mpsc::channel(1);
        self.process
            .start(&self.tracker, "", resize_rx, false)
            .await?;
        Ok(())
    }

    async fn start_pty(&self, term: &str, size: WindowSize) -> Result<(), ProcessError> {
        let (resize_tx, resize_rx) = mpsc::channel(RESIZE_CHANNEL_CAPACITY);
        // queued ahead of start so the process sees it as the initial size
        let _ = resize_tx.try_send(size);

        if let Some(mut events) = self.peer.take_resize_events() {
            let cancel = self.cancel.clone();
            let guard = self.tracker.guard("session: resize relay");
            tokio::spawn(
                async move {
                    let _guard = guard;
                    loop {
                        let size = tokio::select! {
                            size = events.recv() => size,
                            _ = cancel.cancelled() => None,
                        };
                        let Some(size) = size else { break };
                        if resize_tx.send(size).await.is_err() {
                            break;
                        }
                    }
                }
                .instrument(self.span.clone()),
            );
        }

        let streams = self
            .process
            .start(&self.tracker, term, resize_rx, true)
            .await?
            .ok_or_else(|| ProcessError::Pty("process did not provide a terminal".to_string()))?;
        tracing::info!("pty_start_success");

        self.spawn_input("session: pty input", streams.writer, self.peer.stdin(), false);
        let handle = self.spawn_output("session: pty output", self.peer.stdout(), streams.reader);
        lock(&self.drains).push(handle);
        Ok(())
    }

    /// Copies process output to the peer. Closes the process side when done.
    #[track_caller]
    fn spawn_output(&self, name: &str, dst: Sink, src: Source) -> JoinHandle<()> {
        let (cancel, grace) = (self.cancel.clone(), self.options.grace);
        let guard = self.tracker.guard(name);
        let name = name.to_string();
        tokio::spawn(
            async move {
                let _guard = guard;
                match asyncio::copy(&cancel, grace, &dst, &src).await {
                    Ok(bytes) => tracing::trace!(stream = %name, bytes, "copy finished"),
                    Err(e) => tracing::debug!(stream = %name, error = %e, "copy stopped"),
                }
                src.close();
            }
            .instrument(self.span.clone()),
        )
    }

    /// Copies peer input to the process. With `close_dst`, closes the
    /// process side at end of input.
    #[track_caller]
    fn spawn_input(&self, name: &str, dst: Sink, src: Source, close_dst: bool) {
        let (cancel, grace) = (self.cancel.clone(), self.options.grace);
        let guard = self.tracker.guard(name);
        let name = name.to_string();
        tokio::spawn(
            async move {
                let _guard = guard;
                match asyncio::copy(&cancel, grace, &dst, &src).await {
                    Ok(bytes) => tracing::trace!(stream = %name, bytes, "copy finished"),
                    Err(e) => tracing::debug!(stream = %name, error = %e, "copy stopped"),
                }
                if close_dst {
                    dst.close();
                }
            }
            .instrument(self.span.clone()),
        );
    }

    async fn wait(&self) -> (u8, Option<String>) {
        let (status, err) = match self.process.wait(&self.tracker).await {
            Ok(status) => {
                tracing::info!(status, "command_return");
                (status, None)
            }
            Err(e) => {
                tracing::info!(error = %e, "command_return_fail");
                (STATUS_UNKNOWN, Some(e.to_string()))
            }
        };

        // let output written right before exit reach the peer
        let drains = std::mem::take(&mut *lock(&self.drains));
        let deadline = tokio::time::Instant::now() + self.options.grace;
        for handle in drains {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                tracing::debug!("output did not drain before the deadline");
                break;
            }
        }

        (status, err)
    }

    /// Ends the session. Only the first call does anything.
    async fn finalize(&self, status: u8, err: Option<String>) {
        if !self.finished.fire() {
            return;
        }

        if let Some(err) = &err {
            let message = format!("{err}\n");
            let stderr = self.peer.stderr();
            let written =
                asyncio::write(&self.cancel, self.options.grace, &stderr, message.as_bytes()).await;
            if let Err(e) = written {
                tracing::debug!(error = %e, "failed to report error to peer");
            }
        }

        self.tracker.finish(self.span.clone());

        match &err {
            None => tracing::info!(status, "session_exit"),
            Some(err) => tracing::info!(status, error = %err, "session_exit"),
        }
        let _ = self.status.set(status);
        if let Err(e) = self.peer.exit(status) {
            tracing::debug!(error = %e, "failed to report exit status");
        }
        self.cancel.cancel();

        let process = Arc::clone(&self.process);
        tokio::spawn(
            async move {
                if process.cleanup().await {
                    tracing::info!("command_kill");
                } else {
                    tracing::warn!("command_kill_failure");
                }
            }
            .instrument(self.span.clone()),
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("process", &self.process.to_string())
            .field("started", &self.started.is_fired())
            .field("finished", &self.finished.is_fired())
            .field("status", &self.status())
            .finish()
    }
}
