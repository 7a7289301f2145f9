//! An interactive read-eval-print loop served from inside the daemon.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::line::{CrlfWriter, LineEditor};
use super::{initial_size, Process, ProcessError, ProcessFactory, PtyStreams, STATUS_UNKNOWN};
use crate::asyncio::{lock, spawn_worker, Sink, Source};
use crate::leak::Tracker;
use crate::term::{TerminalPair, WindowSize};
use crate::transport::Peer;

/// Handles one input line. Returning `Some(code)` ends the loop with that
/// exit status. Output written to the writer appears on the user's terminal.
pub type ReplStep =
    Arc<dyn Fn(&CancellationToken, &mut dyn Write, &str) -> Option<u8> + Send + Sync>;

/// The step used when none is configured: leaves on `exit`, ignores
/// everything else.
pub fn default_step() -> ReplStep {
    Arc::new(|_: &CancellationToken, _: &mut dyn Write, line: &str| {
        (line.trim() == "exit").then_some(0)
    })
}

#[derive(Default)]
struct ReplState {
    cancel: Option<CancellationToken>,
    result: Option<oneshot::Receiver<u8>>,
}

/// Runs a line-based loop on the slave side of a raw terminal pair.
///
/// Only works with a terminal. The loop ends when the step returns a
/// status, on end of input (status 0) or on a read error (status 255).
pub struct ReplProcess {
    welcome: Option<String>,
    prompt: String,
    step: ReplStep,
    terminal: Arc<TerminalPair>,
    state: Mutex<ReplState>,
}

impl ReplProcess {
    pub fn new(step: ReplStep) -> Self {
        Self {
            welcome: None,
            prompt: String::new(),
            step,
            terminal: Arc::new(TerminalPair::new()),
            state: Mutex::new(ReplState::default()),
        }
    }

    pub fn with_welcome(mut self, welcome: impl Into<String>) -> Self {
        self.welcome = Some(welcome.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

impl Default for ReplProcess {
    fn default() -> Self {
        Self::new(default_step())
    }
}

impl fmt::Display for ReplProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("REPLProcess")
    }
}

fn run_loop(
    cancel: &CancellationToken,
    terminal: &TerminalPair,
    welcome: Option<&str>,
    prompt: &str,
    step: &ReplStep,
) -> u8 {
    let (reader, writer) = match (terminal.slave(), terminal.slave()) {
        (Ok(reader), Ok(writer)) => (reader, writer),
        (Err(e), _) | (_, Err(e)) => {
            tracing::debug!(error = %e, "repl terminal unavailable");
            return STATUS_UNKNOWN;
        }
    };
    let mut editor = LineEditor::new(reader, CrlfWriter::new(writer), true);

    let greet = |out: &mut CrlfWriter<std::fs::File>| -> io::Result<()> {
        if let Some(welcome) = welcome {
            writeln!(out, "{welcome}")?;
        }
        out.flush()
    };
    if let Err(e) = greet(editor.writer()) {
        tracing::debug!(error = %e, "repl welcome failed");
        return STATUS_UNKNOWN;
    }

    while !cancel.is_cancelled() {
        let prompted = editor
            .writer()
            .write_all(prompt.as_bytes())
            .and_then(|_| editor.writer().flush());
        if prompted.is_err() {
            return STATUS_UNKNOWN;
        }

        let line = match editor.read_line() {
            _ if cancel.is_cancelled() => break,
            Ok(Some(line)) => line,
            Ok(None) => return 0,
            Err(e) => {
                tracing::debug!(error = %e, "repl read failed");
                return STATUS_UNKNOWN;
            }
        };

        let out: &mut dyn Write = editor.writer();
        let status = step(cancel, out, &line);
        let _ = editor.writer().flush();
        if let Some(status) = status {
            return status;
        }
    }
    STATUS_UNKNOWN
}

#[async_trait]
impl Process for ReplProcess {
    async fn init(
        &self,
        cancel: &CancellationToken,
        _tracker: &Arc<Tracker>,
        wants_pty: bool,
    ) -> Result<(), ProcessError> {
        if !wants_pty {
            return Err(ProcessError::NoTty);
        }
        self.terminal.open(true)?;
        lock(&self.state).cancel = Some(cancel.child_token());
        Ok(())
    }

    async fn start(
        &self,
        tracker: &Arc<Tracker>,
        _term: &str,
        mut resize: mpsc::Receiver<WindowSize>,
        wants_pty: bool,
    ) -> Result<Option<PtyStreams>, ProcessError> {
        if !wants_pty {
            return Err(ProcessError::NoTty);
        }
        let cancel = lock(&self.state)
            .cancel
            .clone()
            .ok_or(ProcessError::NotInitialized)?;

        if let Some(size) = initial_size(&mut resize) {
            self.terminal.resize(size)?;
        }
        let terminal = Arc::clone(&self.terminal);
        let guard = tracker.guard("terminal: resize");
        tokio::spawn(async move {
            let _guard = guard;
            terminal.handle(resize).await;
        });

        let streams = PtyStreams {
            reader: Source::new(self.terminal.master()?),
            writer: Sink::new(self.terminal.master()?),
        };

        let terminal = Arc::clone(&self.terminal);
        let welcome = self.welcome.clone();
        let prompt = self.prompt.clone();
        let step = Arc::clone(&self.step);
        let guard = tracker.guard("terminal: pty loop");
        let rx = spawn_worker(
            "repl-loop",
            move || {
                let _guard = guard;
                let status = run_loop(&cancel, &terminal, welcome.as_deref(), &prompt, &step);
                // the slave must go away for the master side to see end of file
                terminal.close();
                status
            },
            |_| {},
        )
        .map_err(|e| ProcessError::Spawn {
            command: self.to_string(),
            reason: e.to_string(),
        })?;
        lock(&self.state).result = Some(rx);

        Ok(Some(streams))
    }

    fn stdout(&self) -> Result<Source, ProcessError> {
        Err(ProcessError::NoTty)
    }

    fn stderr(&self) -> Result<Source, ProcessError> {
        Err(ProcessError::NoTty)
    }

    fn stdin(&self) -> Result<Sink, ProcessError> {
        Err(ProcessError::NoTty)
    }

    async fn wait(&self, _tracker: &Arc<Tracker>) -> Result<u8, ProcessError> {
        let rx = lock(&self.state)
            .result
            .take()
            .ok_or(ProcessError::NotStarted)?;
        Ok(rx.await.unwrap_or(STATUS_UNKNOWN))
    }

    async fn cleanup(&self) -> bool {
        if let Some(cancel) = lock(&self.state).cancel.take() {
            cancel.cancel();
        }
        self.terminal.unhang_hack();
        self.terminal.close();
        true
    }
}

/// Serves every peer the same REPL.
#[derive(Clone)]
pub struct ReplFactory {
    welcome: Option<String>,
    prompt: String,
    step: ReplStep,
}

impl ReplFactory {
    pub fn new(step: ReplStep) -> Self {
        Self {
            welcome: None,
            prompt: "> ".to_string(),
            step,
        }
    }

    pub fn with_welcome(mut self, welcome: impl Into<String>) -> Self {
        self.welcome = Some(welcome.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

impl Default for ReplFactory {
    fn default() -> Self {
        Self::new(default_step())
    }
}

#[async_trait]
impl ProcessFactory for ReplFactory {
    async fn make(&self, _peer: &dyn Peer) -> Result<Arc<dyn Process>, ProcessError> {
        let mut repl = ReplProcess::new(Arc::clone(&self.step)).with_prompt(self.prompt.clone());
        if let Some(welcome) = &self.welcome {
            repl = repl.with_welcome(welcome.clone());
        }
        Ok(Arc::new(repl))
    }
}
