//! Pseudo-terminal pairs and pipe sets.
//!
//! A [`TerminalPair`] owns both ends of a pty, optionally switched to raw
//! mode. Processes that run without a real command attached to a pty (the
//! REPL, the no-command terminal, container execs in tty mode) talk on the
//! slave side while the session streams the master side to the peer.
//! [`Pipes`] is the non-interactive counterpart: three anonymous
//! close-on-exec socket pairs standing in for stdin, stdout and stderr.

use std::fs::File;
use std::future::Future;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use nix::pty::{openpty, Winsize};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use portable_pty::PtySize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::asyncio::{lock, Sink, Source};
use crate::sync::OneTime;

nix::ioctl_write_ptr_bad!(set_window_size, nix::libc::TIOCSWINSZ, Winsize);
nix::ioctl_read_bad!(get_window_size, nix::libc::TIOCGWINSZ, Winsize);

/// Bytes written by [`TerminalPair::unhang_hack`]: ETX, EOT, newline.
pub const UNHANG_SEQUENCE: [u8; 3] = [3, 4, b'\n'];

/// Terminal errors.
#[derive(Debug, Error)]
pub enum TermError {
    #[error("failed to open pty: {0}")]
    Open(#[source] nix::Error),

    #[error("terminal mode change failed: {0}")]
    Mode(#[source] nix::Error),

    #[error("window size ioctl failed: {0}")]
    WindowSize(#[source] nix::Error),

    #[error("terminal pair is already open")]
    AlreadyOpen,

    #[error("terminal pair is not open")]
    NotOpen,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Terminal window dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

impl From<WindowSize> for Winsize {
    fn from(size: WindowSize) -> Self {
        Winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: size.pixel_width,
            ws_ypixel: size.pixel_height,
        }
    }
}

impl From<Winsize> for WindowSize {
    fn from(ws: Winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

impl From<WindowSize> for PtySize {
    fn from(size: WindowSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: size.pixel_width,
            pixel_height: size.pixel_height,
        }
    }
}

struct OpenPair {
    master: File,
    slave: File,
    saved: Option<(Termios, Termios)>,
}

/// A pty master/slave pair.
///
/// Methods take `&self`; the pair is normally shared behind an `Arc`
/// between the owning process and its resize task. Every method on an
/// unopened or closed pair is a no-op or returns [`TermError::NotOpen`].
#[derive(Default)]
pub struct TerminalPair {
    inner: Mutex<Option<OpenPair>>,
    restored: OneTime,
}

impl TerminalPair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the pair. With `raw`, both ends are switched to
    /// non-canonical, non-echo mode and the previous modes are remembered.
    pub fn open(&self, raw: bool) -> Result<(), TermError> {
        let mut inner = lock(&self.inner);
        if inner.is_some() {
            return Err(TermError::AlreadyOpen);
        }

        let pty = openpty(None, None).map_err(TermError::Open)?;
        let master = File::from(pty.master);
        let slave = File::from(pty.slave);

        let saved = if raw {
            let master_mode = tcgetattr(&master).map_err(TermError::Mode)?;
            let slave_mode = tcgetattr(&slave).map_err(TermError::Mode)?;
            make_raw(&master, &master_mode)?;
            make_raw(&slave, &slave_mode)?;
            Some((master_mode, slave_mode))
        } else {
            None
        };

        *inner = Some(OpenPair {
            master,
            slave,
            saved,
        });
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        lock(&self.inner).is_some()
    }

    /// Returns a new handle to the master side.
    pub fn master(&self) -> Result<File, TermError> {
        let inner = lock(&self.inner);
        let pair = inner.as_ref().ok_or(TermError::NotOpen)?;
        Ok(pair.master.try_clone()?)
    }

    /// Returns a new handle to the slave side.
    pub fn slave(&self) -> Result<File, TermError> {
        let inner = lock(&self.inner);
        let pair = inner.as_ref().ok_or(TermError::NotOpen)?;
        Ok(pair.slave.try_clone()?)
    }

    /// Current window size of the pty.
    pub fn size(&self) -> Result<WindowSize, TermError> {
        let inner = lock(&self.inner);
        let pair = inner.as_ref().ok_or(TermError::NotOpen)?;
        window_size(&pair.master)
    }

    /// Applies a window size to the pty.
    pub fn resize(&self, size: WindowSize) -> Result<(), TermError> {
        let inner = lock(&self.inner);
        let pair = inner.as_ref().ok_or(TermError::NotOpen)?;
        let ws = Winsize::from(size);
        // SAFETY: the descriptor is open for the lifetime of the guard and
        // `ws` outlives the call.
        unsafe { set_window_size(pair.master.as_raw_fd(), &ws) }
            .map_err(TermError::WindowSize)?;
        Ok(())
    }

    /// Applies each size from `events` until the channel closes.
    pub async fn handle(&self, events: mpsc::Receiver<WindowSize>) {
        self.handle_with(events, |_| async {}).await
    }

    /// Applies each size from `events`, then runs `effect` with it.
    pub async fn handle_with<F, Fut>(&self, mut events: mpsc::Receiver<WindowSize>, mut effect: F)
    where
        F: FnMut(WindowSize) -> Fut,
        Fut: Future<Output = ()>,
    {
        while let Some(size) = events.recv().await {
            if let Err(e) = self.resize(size) {
                tracing::debug!(error = %e, rows = size.rows, cols = size.cols, "resize failed");
            }
            effect(size).await;
        }
    }

    /// Restores the original terminal modes. Only the first call has any effect.
    pub fn restore(&self) {
        let inner = lock(&self.inner);
        let Some(pair) = inner.as_ref() else {
            return;
        };
        let Some((master_mode, slave_mode)) = &pair.saved else {
            return;
        };
        if !self.restored.fire() {
            return;
        }
        if let Err(e) = tcsetattr(&pair.master, SetArg::TCSANOW, master_mode) {
            tracing::debug!(error = %e, "failed to restore master mode");
        }
        if let Err(e) = tcsetattr(&pair.slave, SetArg::TCSANOW, slave_mode) {
            tracing::debug!(error = %e, "failed to restore slave mode");
        }
    }

    /// Restores modes and releases both ends.
    pub fn close(&self) {
        self.restore();
        lock(&self.inner).take();
    }

    /// Writes ETX, EOT and a newline to the master so a blocked read on
    /// the slave side returns. Errors are ignored.
    pub fn unhang_hack(&self) {
        let inner = lock(&self.inner);
        if let Some(pair) = inner.as_ref() {
            let _ = (&pair.master).write_all(&UNHANG_SEQUENCE);
        }
    }
}

impl std::fmt::Debug for TerminalPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalPair")
            .field("open", &self.is_open())
            .field("restored", &self.restored.is_fired())
            .finish()
    }
}

fn make_raw(file: &File, current: &Termios) -> Result<(), TermError> {
    let mut raw = current.clone();
    cfmakeraw(&mut raw);
    tcsetattr(file, SetArg::TCSANOW, &raw).map_err(TermError::Mode)
}

/// Window size of any terminal descriptor.
pub fn window_size(fd: &impl AsRawFd) -> Result<WindowSize, TermError> {
    let mut ws = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: the caller keeps the descriptor open for the call and `ws` is a
    // valid, writable winsize.
    unsafe { get_window_size(fd.as_raw_fd(), &mut ws) }.map_err(TermError::WindowSize)?;
    Ok(ws.into())
}

/// Raw mode on a terminal this process did not allocate, such as its own
/// stdin. The previous mode comes back on drop.
pub struct RawTerminal {
    file: File,
    saved: Termios,
}

impl RawTerminal {
    pub fn enable(fd: impl AsFd) -> Result<Self, TermError> {
        let file = File::from(fd.as_fd().try_clone_to_owned()?);
        let saved = tcgetattr(&file).map_err(TermError::Mode)?;
        make_raw(&file, &saved)?;
        Ok(Self { file, saved })
    }

    pub fn size(&self) -> Result<WindowSize, TermError> {
        window_size(&self.file)
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        if let Err(e) = tcsetattr(&self.file, SetArg::TCSANOW, &self.saved) {
            tracing::debug!(error = %e, "failed to restore terminal mode");
        }
    }
}

impl std::fmt::Debug for RawTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawTerminal").finish_non_exhaustive()
    }
}

/// The far ends of a [`Pipes`] set, handed to whatever produces and consumes
/// the data: a child process or an in-process loop.
#[derive(Debug)]
pub struct PipeEnds {
    pub stdin: UnixStream,
    pub stdout: UnixStream,
    pub stderr: UnixStream,
}

impl PipeEnds {
    /// Converts the ends into descriptors suitable for `Stdio::from`.
    pub fn into_fds(self) -> (OwnedFd, OwnedFd, OwnedFd) {
        (self.stdin.into(), self.stdout.into(), self.stderr.into())
    }
}

/// An anonymous pipe set for non-interactive sessions.
#[derive(Debug)]
pub struct Pipes {
    stdin: Sink,
    stdout: Source,
    stderr: Source,
    ends: Mutex<Option<PipeEnds>>,
}

impl Pipes {
    /// Creates three close-on-exec socket pairs.
    pub fn open() -> io::Result<Self> {
        let (stdin_near, stdin_far) = UnixStream::pair()?;
        let (stdout_near, stdout_far) = UnixStream::pair()?;
        let (stderr_near, stderr_far) = UnixStream::pair()?;

        Ok(Self {
            stdin: Sink::from_unix(stdin_near)?,
            stdout: Source::from_unix(stdout_near)?,
            stderr: Source::from_unix(stderr_near)?,
            ends: Mutex::new(Some(PipeEnds {
                stdin: stdin_far,
                stdout: stdout_far,
                stderr: stderr_far,
            })),
        })
    }

    /// Writer feeding the far end's stdin.
    pub fn stdin(&self) -> Sink {
        self.stdin.clone()
    }

    /// Reader for what the far end writes to stdout.
    pub fn stdout(&self) -> Source {
        self.stdout.clone()
    }

    /// Reader for what the far end writes to stderr.
    pub fn stderr(&self) -> Source {
        self.stderr.clone()
    }

    /// Takes the far ends. Returns `None` after the first call.
    pub fn take_ends(&self) -> Option<PipeEnds> {
        lock(&self.ends).take()
    }

    /// Closes every handle still held.
    pub fn close_all(&self) {
        self.stdin.close();
        self.stdout.close();
        self.stderr.close();
        lock(&self.ends).take();
    }
}
