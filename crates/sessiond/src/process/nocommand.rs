//! A session that runs nothing.
//!
//! Used for connections that only exist to forward ports: the user gets a
//! notice and the session stays open until they close it.

use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::line::LineEditor;
use super::{initial_size, Process, ProcessError, ProcessFactory, PtyStreams, STATUS_UNKNOWN};
use crate::asyncio::{lock, spawn_worker, Sink, Source};
use crate::leak::Tracker;
use crate::term::{Pipes, TerminalPair, WindowSize};
use crate::transport::Peer;

/// Printed when the session starts.
pub const NO_SHELL_NOTICE: &str = "No shell access provided. Use CTRL-C / CTRL-D to close.";

#[derive(Default)]
struct NoCommandState {
    cancel: Option<CancellationToken>,
    pipes: Option<Pipes>,
    result: Option<oneshot::Receiver<u8>>,
}

/// Prints [`NO_SHELL_NOTICE`] and discards input until end of input
/// (status 0) or a read error (status 255).
#[derive(Default)]
pub struct NoCommandProcess {
    terminal: Arc<TerminalPair>,
    state: Mutex<NoCommandState>,
}

impl NoCommandProcess {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for NoCommandProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoCommandProcess")
    }
}

fn discard_input(
    cancel: &CancellationToken,
    reader: impl Read,
    mut writer: impl Write,
    echo: bool,
) -> u8 {
    let newline = if echo { "\r\n" } else { "\n" };
    let notice = writer
        .write_all(NO_SHELL_NOTICE.as_bytes())
        .and_then(|_| writer.write_all(newline.as_bytes()))
        .and_then(|_| writer.flush());
    if let Err(e) = notice {
        tracing::debug!(error = %e, "failed to write notice");
        return STATUS_UNKNOWN;
    }

    let mut editor = LineEditor::new(reader, writer, echo);
    loop {
        match editor.read_line() {
            _ if cancel.is_cancelled() => return STATUS_UNKNOWN,
            Ok(Some(_)) => {}
            Ok(None) => return 0,
            Err(e) => {
                tracing::debug!(error = %e, "Error reading from terminal");
                return STATUS_UNKNOWN;
            }
        }
    }
}

impl NoCommandProcess {
    fn spawn_loop<R, W>(
        &self,
        tracker: &Arc<Tracker>,
        reader: R,
        writer: W,
        echo: bool,
        on_exit: impl FnOnce() + Send + 'static,
    ) -> Result<(), ProcessError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let cancel = lock(&self.state)
            .cancel
            .clone()
            .ok_or(ProcessError::NotInitialized)?;

        let guard = tracker.guard("terminal: notice loop");
        let rx = spawn_worker(
            "nocommand-loop",
            move || {
                let _guard = guard;
                let status = discard_input(&cancel, reader, writer, echo);
                on_exit();
                status
            },
            |_| {},
        )
        .map_err(|e| ProcessError::Spawn {
            command: self.to_string(),
            reason: e.to_string(),
        })?;
        lock(&self.state).result = Some(rx);
        Ok(())
    }

    fn start_pty(
        &self,
        tracker: &Arc<Tracker>,
        mut resize: mpsc::Receiver<WindowSize>,
    ) -> Result<PtyStreams, ProcessError> {
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

        let reader: File = self.terminal.slave()?;
        let writer: File = self.terminal.slave()?;
        let terminal = Arc::clone(&self.terminal);
        self.spawn_loop(tracker, reader, writer, true, move || terminal.close())?;
        Ok(streams)
    }

    fn start_pipes(&self, tracker: &Arc<Tracker>) -> Result<(), ProcessError> {
        let ends = lock(&self.state)
            .pipes
            .as_ref()
            .and_then(Pipes::take_ends)
            .ok_or(ProcessError::NotInitialized)?;
        // stderr stays silent; dropping it lets the peer see end of file
        let stdout = ends.stdout;
        drop(ends.stderr);
        self.spawn_loop(tracker, ends.stdin, stdout, false, || {})
    }
}

#[async_trait]
impl Process for NoCommandProcess {
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
        _term: &str,
        resize: mpsc::Receiver<WindowSize>,
        wants_pty: bool,
    ) -> Result<Option<PtyStreams>, ProcessError> {
        if wants_pty {
            self.start_pty(tracker, resize).map(Some)
        } else {
            self.start_pipes(tracker).map(|_| None)
        }
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
        let rx = lock(&self.state)
            .result
            .take()
            .ok_or(ProcessError::NotStarted)?;
        Ok(rx.await.unwrap_or(STATUS_UNKNOWN))
    }

    async fn cleanup(&self) -> bool {
        let (cancel, pipes) = {
            let mut state = lock(&self.state);
            (state.cancel.take(), state.pipes.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.terminal.unhang_hack();
        self.terminal.close();
        if let Some(pipes) = pipes {
            pipes.close_all();
        }
        true
    }
}

/// Gives every peer a [`NoCommandProcess`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCommandFactory;

#[async_trait]
impl ProcessFactory for NoCommandFactory {
    async fn make(&self, _peer: &dyn Peer) -> Result<Arc<dyn Process>, ProcessError> {
        Ok(Arc::new(NoCommandProcess::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::leak::DEFAULT_LEAK_TIMEOUT;

    fn tracker() -> Arc<Tracker> {
        Arc::new(Tracker::new(DEFAULT_LEAK_TIMEOUT))
    }

    #[tokio::test]
    async fn test_pipe_mode_prints_notice_and_exits_on_eof() {
        let tracker = tracker();
        let process = NoCommandProcess::new();
        process
            .init(&CancellationToken::new(), &tracker, false)
            .await
            .unwrap();
        let (mut stdin, stdout, stderr) = (
            process.stdin().unwrap(),
            process.stdout().unwrap(),
            process.stderr().unwrap(),
        );
        let (_tx, rx) = mpsc::channel(1);
        assert!(process.start(&tracker, "", rx, false).await.unwrap().is_none());

        stdin.write_all(b"ls\n").unwrap();
        stdin.close();

        assert_eq!(process.wait(&tracker).await.unwrap(), 0);

        let read = tokio::task::spawn_blocking(move || {
            let (mut stdout, mut stderr) = (stdout, stderr);
            let (mut out, mut err) = (String::new(), String::new());
            stdout.read_to_string(&mut out).unwrap();
            stderr.read_to_string(&mut err).unwrap();
            (out, err)
        });
        let (out, err) = read.await.unwrap();
        assert_eq!(out, format!("{NO_SHELL_NOTICE}\n"));
        assert!(err.is_empty());
        assert!(process.cleanup().await);
    }

    #[tokio::test]
    async fn test_pty_mode_ctrl_c_closes() {
        let tracker = tracker();
        let process = NoCommandProcess::new();
        process
            .init(&CancellationToken::new(), &tracker, true)
            .await
            .unwrap();
        let (_tx, rx) = mpsc::channel(1);
        let streams = process
            .start(&tracker, "xterm", rx, true)
            .await
            .unwrap()
            .unwrap();

        let mut reader = streams.reader.clone();
        let notice = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; NO_SHELL_NOTICE.len() + 2];
            reader.read_exact(&mut buf).map(|_| buf)
        });
        let notice = tokio::time::timeout(Duration::from_secs(5), notice)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(notice, format!("{NO_SHELL_NOTICE}\r\n").into_bytes());

        let mut writer = streams.writer.clone();
        writer.write_all(b"whoami\r\x03").unwrap();
        assert_eq!(process.wait(&tracker).await.unwrap(), 0);
        assert!(process.cleanup().await);
        assert!(tracker.settle().await);
    }

    #[tokio::test]
    async fn test_cleanup_ends_loop() {
        let tracker = tracker();
        let process = Arc::new(NoCommandProcess::new());
        process
            .init(&CancellationToken::new(), &tracker, false)
            .await
            .unwrap();
        let (_tx, rx) = mpsc::channel(1);
        process.start(&tracker, "", rx, false).await.unwrap();

        let waiter = {
            let (process, tracker) = (Arc::clone(&process), Arc::clone(&tracker));
            tokio::spawn(async move { process.wait(&tracker).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(process.cleanup().await);

        let status = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status, STATUS_UNKNOWN);
    }
}
