//! The connection side of a session.
//!
//! The wire protocol lives elsewhere; a session only needs what the
//! [`Peer`] trait exposes: who connected, what they asked to run, whether
//! they want a terminal, their data streams, and a way to report the exit
//! status.

use std::io::{Read, Write};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::asyncio::{lock, Sink, Source};
use crate::term::WindowSize;

/// Identity of the connected user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Authenticated user name.
    pub user: String,
    /// Remote address, as reported by the transport.
    pub remote: String,
}

impl PeerInfo {
    pub fn new(user: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            remote: remote.into(),
        }
    }
}

/// A request for an interactive terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Value for `TERM`.
    pub term: String,
    /// Initial window size.
    pub size: WindowSize,
}

/// An authenticated connection as seen by a session.
pub trait Peer: Send + Sync {
    fn info(&self) -> &PeerInfo;

    /// Requested command arguments. Empty means an interactive shell.
    fn command(&self) -> &[String];

    /// The terminal request, if the client asked for one.
    fn pty_request(&self) -> Option<PtyRequest>;

    /// Window change notifications. Returns `Some` only on the first call.
    fn take_resize_events(&self) -> Option<mpsc::Receiver<WindowSize>>;

    /// Fires when the connection goes away.
    fn cancellation(&self) -> CancellationToken;

    fn stdin(&self) -> Source;
    fn stdout(&self) -> Sink;
    fn stderr(&self) -> Sink;

    /// Reports the exit status to the client.
    fn exit(&self, status: u8) -> std::io::Result<()>;
}

/// A [`Peer`] over arbitrary blocking streams.
///
/// Used to attach the local terminal to a session and to drive sessions over
/// socket pairs. `exit` records the status, closes every stream and cancels
/// the connection token.
pub struct StreamPeer {
    info: PeerInfo,
    command: Vec<String>,
    pty: Option<PtyRequest>,
    resize: std::sync::Mutex<Option<mpsc::Receiver<WindowSize>>>,
    cancel: CancellationToken,
    stdin: Source,
    stdout: Sink,
    stderr: Sink,
    status: watch::Sender<Option<u8>>,
}

impl StreamPeer {
    pub fn new(
        info: PeerInfo,
        command: Vec<String>,
        stdin: Source,
        stdout: Sink,
        stderr: Sink,
    ) -> Self {
        Self {
            info,
            command,
            pty: None,
            resize: std::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            stdin,
            stdout,
            stderr,
            status: watch::Sender::new(None),
        }
    }

    /// Convenience constructor over plain reader/writers.
    pub fn from_streams(
        info: PeerInfo,
        command: Vec<String>,
        stdin: impl Read + Send + 'static,
        stdout: impl Write + Send + 'static,
        stderr: impl Write + Send + 'static,
    ) -> Self {
        Self::new(
            info,
            command,
            Source::new(stdin),
            Sink::new(stdout),
            Sink::new(stderr),
        )
    }

    /// Requests a terminal. Returns the sender for window change events.
    pub fn with_pty(mut self, request: PtyRequest) -> (Self, mpsc::Sender<WindowSize>) {
        let (tx, rx) = mpsc::channel(16);
        self.pty = Some(request);
        self.resize = std::sync::Mutex::new(Some(rx));
        (self, tx)
    }

    /// The exit status, once reported.
    pub fn exit_status(&self) -> Option<u8> {
        *self.status.borrow()
    }

    /// Waits until an exit status is reported.
    pub async fn wait_exit(&self) -> u8 {
        let mut status = self.status.subscribe();
        let reported = match status.wait_for(Option::is_some).await {
            Ok(value) => *value,
            Err(_) => None,
        };
        reported.unwrap_or(255)
    }

    /// Simulates the connection dropping.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

impl Peer for StreamPeer {
    fn info(&self) -> &PeerInfo {
        &self.info
    }

    fn command(&self) -> &[String] {
        &self.command
    }

    fn pty_request(&self) -> Option<PtyRequest> {
        self.pty.clone()
    }

    fn take_resize_events(&self) -> Option<mpsc::Receiver<WindowSize>> {
        lock(&self.resize).take()
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn stdin(&self) -> Source {
        self.stdin.clone()
    }

    fn stdout(&self) -> Sink {
        self.stdout.clone()
    }

    fn stderr(&self) -> Sink {
        self.stderr.clone()
    }

    fn exit(&self, status: u8) -> std::io::Result<()> {
        self.status.send_replace(Some(status));
        let mut stdout = self.stdout.clone();
        let mut stderr = self.stderr.clone();
        let flushed = stdout.flush().and_then(|_| stderr.flush());
        self.stdout.close();
        self.stderr.close();
        self.stdin.close();
        self.cancel.cancel();
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn peer() -> StreamPeer {
        StreamPeer::from_streams(
            PeerInfo::new("alice", "127.0.0.1:2222"),
            vec!["echo".to_string(), "hi".to_string()],
            Cursor::new(Vec::new()),
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn test_peer_accessors() {
        let peer = peer();
        assert_eq!(peer.info().user, "alice");
        assert_eq!(peer.command(), &["echo".to_string(), "hi".to_string()]);
        assert!(peer.pty_request().is_none());
        assert!(peer.take_resize_events().is_none());
    }

    #[test]
    fn test_resize_events_taken_once() {
        let (peer, _tx) = peer().with_pty(PtyRequest {
            term: "xterm".to_string(),
            size: WindowSize::new(24, 80),
        });

        assert_eq!(peer.pty_request().unwrap().term, "xterm");
        assert!(peer.take_resize_events().is_some());
        assert!(peer.take_resize_events().is_none());
    }

    #[tokio::test]
    async fn test_exit_records_status_and_cancels() {
        let peer = peer();
        let cancel = peer.cancellation();
        assert!(peer.exit_status().is_none());

        peer.exit(3).unwrap();

        assert_eq!(peer.exit_status(), Some(3));
        assert_eq!(peer.wait_exit().await, 3);
        assert!(cancel.is_cancelled());
        assert!(peer.stdout().is_closed());
        assert!(peer.stderr().is_closed());
    }

    #[test]
    fn test_disconnect_cancels() {
        let peer = peer();
        peer.disconnect();
        assert!(peer.cancellation().is_cancelled());
        assert!(peer.exit_status().is_none());
    }
}
