//! Programs run on this host.

use std::fmt;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{
    exit_status, initial_size, shell_command, Process, ProcessError, ProcessFactory, PtyStreams,
    STATUS_UNKNOWN,
};
use crate::asyncio::{lock, spawn_worker, Sink, Source};
use crate::config::SessionConfig;
use crate::leak::Tracker;
use crate::term::{Pipes, WindowSize};
use crate::transport::Peer;

type SharedMaster = Arc<Mutex<Box<dyn MasterPty + Send>>>;

#[derive(Default)]
struct LocalState {
    program: Option<PathBuf>,
    pipes: Option<Pipes>,
    pid: Option<i32>,
    exit: Option<oneshot::Receiver<io::Result<u8>>>,
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
    master: Option<SharedMaster>,
}

/// A program started from `PATH`, in its own process group.
///
/// In pipe mode the child gets socket pairs created at `init` as its
/// standard streams. In pty mode it runs on a fresh pseudo-terminal with
/// `TERM` set and follows the peer's window size.
pub struct LocalProcess {
    argv: Vec<String>,
    state: Mutex<LocalState>,
    exited: Arc<AtomicBool>,
    killed: AtomicBool,
}

impl LocalProcess {
    /// `argv[0]` is looked up in `PATH` at `init`.
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            state: Mutex::new(LocalState::default()),
            exited: Arc::new(AtomicBool::new(false)),
            killed: AtomicBool::new(false),
        }
    }

    fn program(&self) -> Result<PathBuf, ProcessError> {
        lock(&self.state)
            .program
            .clone()
            .ok_or(ProcessError::NotInitialized)
    }

    fn spawn_failed(&self, reason: impl fmt::Display) -> ProcessError {
        ProcessError::Spawn {
            command: self.to_string(),
            reason: reason.to_string(),
        }
    }

    fn start_pipes(&self, tracker: &Arc<Tracker>) -> Result<(), ProcessError> {
        let program = self.program()?;
        let ends = lock(&self.state)
            .pipes
            .as_ref()
            .and_then(Pipes::take_ends)
            .ok_or(ProcessError::NotInitialized)?;
        let (stdin, stdout, stderr) = ends.into_fds();

        let mut command = Command::new(&program);
        command
            .args(&self.argv[1..])
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0);

        let mut child = command.spawn().map_err(|e| self.spawn_failed(e))?;
        // the child holds its own copies of the pipe ends now
        drop(command);

        let pid = child.id() as i32;
        let exited = Arc::clone(&self.exited);
        let guard = tracker.guard("local: wait");
        let rx = spawn_worker(
            "local-wait",
            move || {
                let _guard = guard;
                let status = child.wait().map(|status| match status.code() {
                    Some(code) => exit_status(code.into()),
                    None => STATUS_UNKNOWN,
                });
                exited.store(true, Ordering::Release);
                status
            },
            |_| {},
        )
        .map_err(|e| self.spawn_failed(e))?;

        let mut state = lock(&self.state);
        state.pid = Some(pid);
        state.exit = Some(rx);
        Ok(())
    }

    fn start_pty(
        &self,
        tracker: &Arc<Tracker>,
        term: &str,
        mut resize: mpsc::Receiver<WindowSize>,
    ) -> Result<PtyStreams, ProcessError> {
        let program = self.program()?;
        let size = initial_size(&mut resize).unwrap_or_default();

        let pair = native_pty_system()
            .openpty(size.into())
            .map_err(|e| ProcessError::Pty(e.to_string()))?;

        let mut command = CommandBuilder::new(&program);
        command.args(&self.argv[1..]);
        if !term.is_empty() {
            command.env("TERM", term);
        }
        if let Ok(dir) = std::env::current_dir() {
            command.cwd(dir);
        }

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| self.spawn_failed(e))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProcessError::Pty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ProcessError::Pty(e.to_string()))?;
        let master: SharedMaster = Arc::new(Mutex::new(pair.master));

        let pid = child.process_id().map(|pid| pid as i32);
        let killer = child.clone_killer();
        let exited = Arc::clone(&self.exited);
        let guard = tracker.guard("local: wait");
        let rx = spawn_worker(
            "local-wait",
            move || {
                let _guard = guard;
                let status = child
                    .wait()
                    .map(|status| exit_status(status.exit_code().into()));
                exited.store(true, Ordering::Release);
                status
            },
            |_| {},
        )
        .map_err(|e| self.spawn_failed(e))?;

        let resize_master = Arc::clone(&master);
        let guard = tracker.guard("local: resize");
        tokio::spawn(async move {
            let _guard = guard;
            while let Some(size) = resize.recv().await {
                if let Err(e) = lock(&resize_master).resize(size.into()) {
                    tracing::debug!(
                        error = %e,
                        rows = size.rows,
                        cols = size.cols,
                        "pty resize failed"
                    );
                }
            }
        });

        let mut state = lock(&self.state);
        state.pid = pid;
        state.exit = Some(rx);
        state.killer = Some(killer);
        state.master = Some(master);

        Ok(PtyStreams {
            reader: Source::new(reader),
            writer: Sink::new(writer),
        })
    }
}

impl fmt::Display for LocalProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv.join(" "))
    }
}

#[async_trait]
impl Process for LocalProcess {
    async fn init(
        &self,
        _cancel: &CancellationToken,
        _tracker: &Arc<Tracker>,
        wants_pty: bool,
    ) -> Result<(), ProcessError> {
        let name = self.argv.first().cloned().unwrap_or_default();
        let program = which::which(&name).map_err(|_| ProcessError::NotFound(name))?;

        let pipes = if wants_pty { None } else { Some(Pipes::open()?) };

        let mut state = lock(&self.state);
        state.program = Some(program);
        state.pipes = pipes;
        Ok(())
    }

    async fn start(
        &self,
        tracker: &Arc<Tracker>,
        term: &str,
        resize: mpsc::Receiver<WindowSize>,
        wants_pty: bool,
    ) -> Result<Option<PtyStreams>, ProcessError> {
        if wants_pty {
            self.start_pty(tracker, term, resize).map(Some)
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
            .exit
            .take()
            .ok_or(ProcessError::NotStarted)?;

        let status = match rx.await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(ProcessError::Wait(e.to_string())),
            Err(_) => return Err(ProcessError::Wait("wait thread exited".to_string())),
        };

        if self.killed.load(Ordering::Acquire) {
            return Ok(STATUS_UNKNOWN);
        }
        Ok(status)
    }

    async fn cleanup(&self) -> bool {
        let (pid, killer, pipes, master) = {
            let mut state = lock(&self.state);
            (
                state.pid,
                state.killer.take(),
                state.pipes.take(),
                state.master.take(),
            )
        };

        if let Some(pipes) = pipes {
            pipes.close_all();
        }
        drop(master);

        let Some(pid) = pid else {
            return true;
        };
        if self.exited.load(Ordering::Acquire) {
            return true;
        }

        self.killed.store(true, Ordering::Release);
        match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => true,
            Err(e) => {
                tracing::debug!(error = %e, pid, "killpg failed, killing child directly");
                match killer {
                    Some(mut killer) => killer.kill().is_ok(),
                    None => false,
                }
            }
        }
    }
}

/// Runs the peer's command through a shell, or the shell itself when no
/// command was given.
#[derive(Debug, Clone)]
pub struct ShellFactory {
    shell: String,
}

impl ShellFactory {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.shell.clone())
    }
}

#[async_trait]
impl ProcessFactory for ShellFactory {
    async fn make(&self, peer: &dyn Peer) -> Result<Arc<dyn Process>, ProcessError> {
        Ok(Arc::new(LocalProcess::new(shell_command(
            &self.shell,
            peer.command(),
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;

    use crate::leak::DEFAULT_LEAK_TIMEOUT;

    fn tracker() -> Arc<Tracker> {
        Arc::new(Tracker::new(DEFAULT_LEAK_TIMEOUT))
    }

    fn sh(script: &str) -> LocalProcess {
        LocalProcess::new(shell_command("/bin/sh", &[script.to_string()]))
    }

    fn no_resize() -> mpsc::Receiver<WindowSize> {
        mpsc::channel(1).1
    }

    fn read_all(mut source: Source) -> String {
        let mut out = String::new();
        source.read_to_string(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_not_found() {
        let process = LocalProcess::new(vec!["definitely-not-a-real-binary-xyz".to_string()]);
        let err = process
            .init(&CancellationToken::new(), &tracker(), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessError::NotFound(ref name) if name == "definitely-not-a-real-binary-xyz"
        ));
    }

    #[tokio::test]
    async fn test_pipes_exit_code_and_streams() {
        let tracker = tracker();
        let process = sh("echo out; echo err >&2; exit 3");
        process
            .init(&CancellationToken::new(), &tracker, false)
            .await
            .unwrap();
        let (stdout, stderr) = (process.stdout().unwrap(), process.stderr().unwrap());

        assert!(process
            .start(&tracker, "", no_resize(), false)
            .await
            .unwrap()
            .is_none());

        let out = tokio::task::spawn_blocking(move || read_all(stdout));
        let err = tokio::task::spawn_blocking(move || read_all(stderr));
        assert_eq!(process.wait(&tracker).await.unwrap(), 3);
        assert_eq!(out.await.unwrap(), "out\n");
        assert_eq!(err.await.unwrap(), "err\n");
        assert!(process.cleanup().await);
        assert!(tracker.settle().await);
    }

    #[tokio::test]
    async fn test_stdin_reaches_child() {
        let tracker = tracker();
        let process = LocalProcess::new(vec!["cat".to_string()]);
        process
            .init(&CancellationToken::new(), &tracker, false)
            .await
            .unwrap();
        let (mut stdin, stdout) = (process.stdin().unwrap(), process.stdout().unwrap());
        process.start(&tracker, "", no_resize(), false).await.unwrap();

        stdin.write_all(b"ping\n").unwrap();
        stdin.close();

        let out = tokio::task::spawn_blocking(move || read_all(stdout));
        assert_eq!(process.wait(&tracker).await.unwrap(), 0);
        assert_eq!(out.await.unwrap(), "ping\n");
        process.cleanup().await;
    }

    #[tokio::test]
    async fn test_cleanup_kills_running_child() {
        let tracker = tracker();
        let process = Arc::new(sh("sleep 30"));
        process
            .init(&CancellationToken::new(), &tracker, false)
            .await
            .unwrap();
        process.start(&tracker, "", no_resize(), false).await.unwrap();

        let waiter = {
            let process = Arc::clone(&process);
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { process.wait(&tracker).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(process.cleanup().await);

        let status = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status, STATUS_UNKNOWN);
    }

    #[tokio::test]
    async fn test_cleanup_before_start() {
        let process = sh("true");
        assert!(process.cleanup().await);
    }

    #[tokio::test]
    async fn test_pty_mode_sets_term_and_size() {
        let tracker = tracker();
        let process = sh("echo $TERM; stty size");
        process
            .init(&CancellationToken::new(), &tracker, true)
            .await
            .unwrap();
        assert!(matches!(process.stdout(), Err(ProcessError::NotInitialized)));

        let (tx, rx) = mpsc::channel(4);
        tx.try_send(WindowSize::new(33, 101)).unwrap();
        let streams = process
            .start(&tracker, "xterm-256color", rx, true)
            .await
            .unwrap()
            .unwrap();
        drop(tx);

        let output = tokio::task::spawn_blocking(move || {
            let mut reader = streams.reader;
            let mut out = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => out.extend_from_slice(&buf[..n]),
                }
            }
            String::from_utf8_lossy(&out).into_owned()
        });

        assert_eq!(process.wait(&tracker).await.unwrap(), 0);
        process.cleanup().await;
        let output = tokio::time::timeout(Duration::from_secs(5), output)
            .await
            .unwrap()
            .unwrap();
        assert!(output.contains("xterm-256color"), "output: {output:?}");
        assert!(output.contains("33 101"), "output: {output:?}");
    }

    #[test]
    fn test_display_is_command_line() {
        assert_eq!(sh("ls -l").to_string(), "/bin/sh -c ls -l");
    }
}
