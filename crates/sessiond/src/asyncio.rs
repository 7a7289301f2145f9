//! Cancellation-aware wrappers around blocking I/O.
//!
//! Terminals, pipes and hijacked container streams only offer blocking
//! reads and writes. Each operation here runs on a detached OS thread and
//! reports back over a oneshot channel. When the cancellation token fires
//! first, the caller waits at most `grace` for the operation to finish and
//! otherwise gets [`AsyncIoError::Canceled`] while the thread is left to
//! complete into a buffer nobody reads.
//!
//! [`Source`] and [`Sink`] are cloneable handles to a blocking reader or
//! writer with an explicit `close()`, so several tasks can share one stream
//! and any of them can shut it down.

use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Default time an operation may keep running after cancellation.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(500);

/// Size of pooled I/O buffers.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Maximum number of idle buffers kept in the pool.
const POOL_LIMIT: usize = 64;

/// Longest error frame read from a demultiplexed stream; the rest is dropped.
const MAX_ERROR_FRAME: usize = 64 * 1024;

/// Errors returned by the async I/O wrappers.
#[derive(Debug, Error)]
pub enum AsyncIoError {
    /// Cancellation fired and the operation did not finish within the grace period.
    #[error("operation canceled")]
    Canceled,

    /// The underlying read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The worker thread went away without reporting a result.
    #[error("I/O worker exited without a result")]
    WorkerLost,

    /// A multiplexed stream carried an error frame.
    #[error("remote stream error: {0}")]
    Remote(String),

    /// A multiplexed stream frame could not be parsed.
    #[error("malformed stream frame: {0}")]
    Frame(String),
}

/// Locks a mutex, ignoring poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type ShutdownHook = Box<dyn Fn() + Send + Sync>;

struct SourceInner {
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    closed: AtomicBool,
    shutdown: Option<ShutdownHook>,
}

/// A shared blocking reader. Reads after `close()` return end-of-file.
#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceInner>,
}

impl Source {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self::build(Box::new(reader), None)
    }

    /// Creates a source whose `close()` also runs `shutdown`, which should
    /// unblock a read in progress.
    pub fn with_shutdown(
        reader: impl Read + Send + 'static,
        shutdown: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::build(Box::new(reader), Some(Box::new(shutdown)))
    }

    /// Wraps the read half of a Unix socket. Closing shuts the read side down.
    pub fn from_unix(stream: UnixStream) -> io::Result<Self> {
        let control = stream.try_clone()?;
        Ok(Self::with_shutdown(stream, move || {
            let _ = control.shutdown(Shutdown::Read);
        }))
    }

    fn build(reader: Box<dyn Read + Send>, shutdown: Option<ShutdownHook>) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                reader: Mutex::new(Some(reader)),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Closes the source. A read in progress keeps the reader alive until it
    /// returns; it is dropped right after.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shutdown) = &self.inner.shutdown {
            shutdown();
        }
        match self.inner.reader.try_lock() {
            Ok(mut guard) => drop(guard.take()),
            Err(TryLockError::Poisoned(poisoned)) => drop(poisoned.into_inner().take()),
            Err(TryLockError::WouldBlock) => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Ok(0);
        }
        let mut guard = lock(&self.inner.reader);
        let result = match guard.as_mut() {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        };
        if self.is_closed() {
            guard.take();
        }
        result
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct SinkInner {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    closed: AtomicBool,
    shutdown: Option<ShutdownHook>,
}

/// A shared blocking writer. Writes after `close()` fail with `BrokenPipe`.
#[derive(Clone)]
pub struct Sink {
    inner: Arc<SinkInner>,
}

impl Sink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self::build(Box::new(writer), None)
    }

    /// Creates a sink whose `close()` also runs `shutdown`.
    pub fn with_shutdown(
        writer: impl Write + Send + 'static,
        shutdown: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::build(Box::new(writer), Some(Box::new(shutdown)))
    }

    /// Wraps the write half of a Unix socket. Closing shuts the write side
    /// down so the peer sees end-of-file.
    pub fn from_unix(stream: UnixStream) -> io::Result<Self> {
        let control = stream.try_clone()?;
        Ok(Self::with_shutdown(stream, move || {
            let _ = control.shutdown(Shutdown::Write);
        }))
    }

    fn build(writer: Box<dyn Write + Send>, shutdown: Option<ShutdownHook>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                writer: Mutex::new(Some(writer)),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shutdown) = &self.inner.shutdown {
            shutdown();
        }
        match self.inner.writer.try_lock() {
            Ok(mut guard) => drop(guard.take()),
            Err(TryLockError::Poisoned(poisoned)) => drop(poisoned.into_inner().take()),
            Err(TryLockError::WouldBlock) => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "sink closed"));
        }
        let mut guard = lock(&self.inner.writer);
        let result = match guard.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::new(ErrorKind::BrokenPipe, "sink closed")),
        };
        if self.is_closed() {
            guard.take();
        }
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.inner.writer).as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("closed", &self.is_closed())
            .finish()
    }
}

static POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

fn take_buffer() -> Vec<u8> {
    lock(&POOL).pop().unwrap_or_else(|| vec![0; BUFFER_SIZE])
}

fn give_buffer(buf: Vec<u8>) {
    if buf.len() != BUFFER_SIZE {
        return;
    }
    let mut pool = lock(&POOL);
    if pool.len() < POOL_LIMIT {
        pool.push(buf);
    }
}

/// Runs `work` on a detached thread. If nobody is waiting when it finishes,
/// the result goes to `abandoned`.
pub(crate) fn spawn_worker<T, F, A>(
    name: &str,
    work: F,
    abandoned: A,
) -> Result<oneshot::Receiver<T>, AsyncIoError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
    A: FnOnce(T) + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Err(value) = tx.send(work()) {
                abandoned(value);
            }
        })?;
    Ok(rx)
}

/// Waits for a worker result, giving up `grace` after cancellation.
async fn settle<T>(
    cancel: &CancellationToken,
    grace: Duration,
    mut rx: oneshot::Receiver<T>,
) -> Result<T, AsyncIoError> {
    tokio::select! {
        biased;
        result = &mut rx => return result.map_err(|_| AsyncIoError::WorkerLost),
        _ = cancel.cancelled() => {}
    }

    match tokio::time::timeout(grace, rx).await {
        Ok(result) => result.map_err(|_| AsyncIoError::WorkerLost),
        Err(_) => Err(AsyncIoError::Canceled),
    }
}

/// Reads at most `buf.len()` bytes (capped at [`BUFFER_SIZE`]).
pub async fn read(
    cancel: &CancellationToken,
    grace: Duration,
    source: &Source,
    buf: &mut [u8],
) -> Result<usize, AsyncIoError> {
    let mut src = source.clone();
    let want = buf.len().min(BUFFER_SIZE);

    let rx = spawn_worker(
        "asyncio-read",
        move || {
            let mut chunk = take_buffer();
            let result = src.read(&mut chunk[..want]);
            (chunk, result)
        },
        |(chunk, _)| give_buffer(chunk),
    )?;

    let (chunk, result) = settle(cancel, grace, rx).await?;
    let outcome = result.map(|n| {
        buf[..n].copy_from_slice(&chunk[..n]);
        n
    });
    give_buffer(chunk);
    Ok(outcome?)
}

/// Writes all of `data` and flushes.
pub async fn write(
    cancel: &CancellationToken,
    grace: Duration,
    sink: &Sink,
    data: &[u8],
) -> Result<usize, AsyncIoError> {
    let mut dst = sink.clone();
    let len = data.len();
    let chunk = if len <= BUFFER_SIZE {
        let mut chunk = take_buffer();
        chunk[..len].copy_from_slice(data);
        chunk
    } else {
        data.to_vec()
    };

    let rx = spawn_worker(
        "asyncio-write",
        move || {
            let result = dst.write_all(&chunk[..len]).and_then(|_| dst.flush());
            (chunk, result)
        },
        |(chunk, _)| give_buffer(chunk),
    )?;

    let (chunk, result) = settle(cancel, grace, rx).await?;
    give_buffer(chunk);
    result?;
    Ok(len)
}

/// Copies from `src` to `dst` until end-of-file, an error, or cancellation.
///
/// Returns the number of bytes copied.
pub async fn copy(
    cancel: &CancellationToken,
    grace: Duration,
    dst: &Sink,
    src: &Source,
) -> Result<u64, AsyncIoError> {
    let (mut dst, mut src) = (dst.clone(), src.clone());
    let stop = cancel.clone();
    let rx = spawn_worker(
        "asyncio-copy",
        move || copy_blocking(&stop, &mut dst, &mut src),
        |_| {},
    )?;
    settle(cancel, grace, rx).await?
}

/// Runs a blocking action on a detached thread.
///
/// Returns `true` when the action completed, `false` when cancellation fired
/// and the action did not finish within `grace`.
pub async fn wait<F>(cancel: &CancellationToken, grace: Duration, action: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    match spawn_worker("asyncio-wait", action, |_| {}) {
        Ok(rx) => settle(cancel, grace, rx).await.is_ok(),
        Err(e) => {
            tracing::debug!(error = %e, "failed to start wait worker");
            false
        }
    }
}

/// Splits a multiplexed container stream into stdout and stderr.
///
/// Each frame is an 8-byte header (stream id, three zero bytes, big-endian
/// `u32` payload length) followed by the payload. Stream ids 0 and 1 go to
/// `stdout`, 2 to `stderr`; id 3 carries an error message from the runtime.
pub async fn demux_copy(
    cancel: &CancellationToken,
    grace: Duration,
    src: &Source,
    stdout: &Sink,
    stderr: &Sink,
) -> Result<u64, AsyncIoError> {
    let mut src = src.clone();
    let (mut stdout, mut stderr) = (stdout.clone(), stderr.clone());
    let stop = cancel.clone();
    let rx = spawn_worker(
        "asyncio-demux",
        move || demux_blocking(&stop, &mut src, &mut stdout, &mut stderr),
        |_| {},
    )?;
    settle(cancel, grace, rx).await?
}

/// A pty master reports EIO once the slave side is gone; treat it as end-of-file.
fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EIO as i32)
}

fn copy_blocking(
    cancel: &CancellationToken,
    dst: &mut impl Write,
    src: &mut impl Read,
) -> Result<u64, AsyncIoError> {
    let mut buf = take_buffer();
    let mut total = 0u64;

    let result = loop {
        if cancel.is_cancelled() {
            break Err(AsyncIoError::Canceled);
        }
        let n = match src.read(&mut buf) {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_hangup(&e) => break Ok(total),
            Err(e) => break Err(e.into()),
        };
        if let Err(e) = dst.write_all(&buf[..n]).and_then(|_| dst.flush()) {
            break Err(e.into());
        }
        total += n as u64;
    };

    give_buffer(buf);
    result
}

/// Fills `header`, returning `false` on a clean end-of-file before the first byte.
fn read_header(src: &mut impl Read, header: &mut [u8; 8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < header.len() {
        match src.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream ended inside a frame header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn forward_payload(
    src: &mut impl Read,
    dst: &mut dyn Write,
    buf: &mut [u8],
    mut remaining: usize,
) -> io::Result<()> {
    while remaining > 0 {
        let n = remaining.min(buf.len());
        src.read_exact(&mut buf[..n])?;
        dst.write_all(&buf[..n])?;
        remaining -= n;
    }
    dst.flush()
}

fn demux_blocking(
    cancel: &CancellationToken,
    src: &mut impl Read,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
) -> Result<u64, AsyncIoError> {
    let mut header = [0u8; 8];
    let mut buf = take_buffer();
    let mut total = 0u64;

    let result = loop {
        if cancel.is_cancelled() {
            break Err(AsyncIoError::Canceled);
        }
        match read_header(src, &mut header) {
            Ok(true) => {}
            Ok(false) => break Ok(total),
            Err(e) => break Err(e.into()),
        }

        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let dst: &mut dyn Write = match header[0] {
            0 | 1 => &mut *stdout,
            2 => &mut *stderr,
            3 => {
                // the header is untrusted, so grow with the bytes that arrive
                let want = len.min(MAX_ERROR_FRAME);
                let mut message = Vec::new();
                break match (&mut *src).take(want as u64).read_to_end(&mut message) {
                    Ok(n) if n == want => Err(AsyncIoError::Remote(
                        String::from_utf8_lossy(&message).trim_end().to_string(),
                    )),
                    Ok(_) => Err(io::Error::from(ErrorKind::UnexpectedEof).into()),
                    Err(e) => Err(e.into()),
                };
            }
            other => break Err(AsyncIoError::Frame(format!("unknown stream id {}", other))),
        };

        if let Err(e) = forward_payload(src, dst, &mut buf, len) {
            break Err(e.into());
        }
        total += len as u64;
    };

    give_buffer(buf);
    result
}
