//! Things a session can run.
//!
//! A [`Process`] goes through `init`, `start`, `wait` and `cleanup`, each
//! called at most once and in that order, except that `cleanup` may run
//! while `wait` is still blocked in order to force termination. Every
//! method therefore takes `&self` and implementations keep their state
//! behind a mutex.
//!
//! | variant | runs | terminal |
//! |---|---|---|
//! | [`LocalProcess`] | a program on this host | pty or pipes |
//! | [`ContainerProcess`] | an exec inside a running container | pty or pipes |
//! | [`ReplProcess`] | an in-process read-eval loop | pty only |
//! | [`NoCommandProcess`] | nothing, prints a notice | pty or pipes |

pub mod container;
pub mod line;
pub mod local;
pub mod nocommand;
pub mod repl;

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::asyncio::{Sink, Source};
use crate::leak::Tracker;
use crate::term::{TermError, WindowSize};
use crate::transport::Peer;

pub use container::{
    find_unique_container, ContainerFactory, ContainerKeyFinder, ContainerProcess,
    ContainerRuntime, ContainerSummary, ExecConfig, ExecInspect, ExecStream, RuntimeError,
};
pub use line::{CrlfWriter, LineEditor};
pub use local::{LocalProcess, ShellFactory};
pub use nocommand::{NoCommandFactory, NoCommandProcess, NO_SHELL_NOTICE};
pub use repl::{ReplFactory, ReplProcess, ReplStep};

/// Exit status reported when a process was killed or its status is unknown.
pub const STATUS_UNKNOWN: u8 = 255;

/// Process errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be resolved against `PATH`.
    #[error("Can't find {0} in path")]
    NotFound(String),

    /// The process only runs on a terminal and none was requested.
    #[error("tty was not allocated")]
    NoTty,

    /// Pseudo-terminal setup failed.
    #[error("pty setup failed: {0}")]
    Pty(String),

    #[error(transparent)]
    Term(#[from] TermError),

    /// The process could not be started.
    #[error("failed to start {command}: {reason}")]
    Spawn { command: String, reason: String },

    /// Waiting for the process failed for a reason other than its exit.
    #[error("wait failed: {0}")]
    Wait(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A method was called before `init`.
    #[error("process was not initialized")]
    NotInitialized,

    /// A method was called before `start`, or `start` ran twice.
    #[error("process was not started")]
    NotStarted,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The master side of a process terminal, streamed to the peer.
#[derive(Debug, Clone)]
pub struct PtyStreams {
    /// What the process writes to its terminal.
    pub reader: Source,
    /// Keyboard input for the process.
    pub writer: Sink,
}

/// Something a session runs on behalf of a peer.
#[async_trait]
pub trait Process: Send + Sync + fmt::Display {
    /// Prepares the process. Allocates pipes or a terminal but starts nothing.
    async fn init(
        &self,
        cancel: &CancellationToken,
        tracker: &Arc<Tracker>,
        wants_pty: bool,
    ) -> Result<(), ProcessError>;

    /// Starts execution.
    ///
    /// The first value on `resize` (if already queued) is the initial window
    /// size. In pty mode the returned streams are the master side of the
    /// process terminal.
    async fn start(
        &self,
        tracker: &Arc<Tracker>,
        term: &str,
        resize: mpsc::Receiver<WindowSize>,
        wants_pty: bool,
    ) -> Result<Option<PtyStreams>, ProcessError>;

    /// Process standard output. Pipe mode only; valid after `init`.
    fn stdout(&self) -> Result<Source, ProcessError>;

    /// Process standard error. Pipe mode only; valid after `init`.
    fn stderr(&self) -> Result<Source, ProcessError>;

    /// Process standard input. Pipe mode only; valid after `init`.
    fn stdin(&self) -> Result<Sink, ProcessError>;

    /// Waits for the process to end and returns its exit status.
    async fn wait(&self, tracker: &Arc<Tracker>) -> Result<u8, ProcessError>;

    /// Terminates the process if it is still running and releases its
    /// resources. Returns `false` if termination could not be confirmed.
    async fn cleanup(&self) -> bool;
}

/// Chooses what a peer runs.
#[async_trait]
pub trait ProcessFactory: Send + Sync {
    async fn make(&self, peer: &dyn Peer) -> Result<Arc<dyn Process>, ProcessError>;
}

/// Builds the argument vector for running `args` through `shell`.
///
/// No arguments means an interactive shell.
pub fn shell_command(shell: &str, args: &[String]) -> Vec<String> {
    if args.is_empty() {
        vec![shell.to_string()]
    } else {
        vec![shell.to_string(), "-c".to_string(), args.join(" ")]
    }
}

/// Maps a raw exit code onto the 0-255 status range.
pub(crate) fn exit_status(code: i64) -> u8 {
    u8::try_from(code).unwrap_or(STATUS_UNKNOWN)
}

/// Takes the initial window size queued ahead of `start`, if any.
pub(crate) fn initial_size(resize: &mut mpsc::Receiver<WindowSize>) -> Option<WindowSize> {
    resize.try_recv().ok()
}
