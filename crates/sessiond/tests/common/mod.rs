//! Peers over Unix socket pairs for driving whole sessions.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use sessiond::asyncio::{Sink, Source};
use sessiond::process::ProcessFactory;
use sessiond::session::{handle, SessionOptions};
use sessiond::term::WindowSize;
use sessiond::transport::{PeerInfo, PtyRequest, StreamPeer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Generous upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The client side of a socket peer.
pub struct Client {
    pub stdin: UnixStream,
    pub stdout: UnixStream,
    pub stderr: UnixStream,
}

impl Client {
    pub fn send(&mut self, data: &[u8]) {
        self.stdin.write_all(data).unwrap();
    }

    /// Signals end of input.
    pub fn close_stdin(&self) {
        let _ = self.stdin.shutdown(Shutdown::Write);
    }

    /// Reads stdout and stderr to end of file on blocking threads.
    pub fn collect(&self) -> JoinHandle<(String, String)> {
        let mut stdout = self.stdout.try_clone().unwrap();
        let mut stderr = self.stderr.try_clone().unwrap();
        tokio::task::spawn_blocking(move || {
            let err = std::thread::spawn(move || {
                let mut text = Vec::new();
                let _ = stderr.read_to_end(&mut text);
                String::from_utf8_lossy(&text).into_owned()
            });
            let mut text = Vec::new();
            let _ = stdout.read_to_end(&mut text);
            let out = String::from_utf8_lossy(&text).into_owned();
            (out, err.join().unwrap_or_default())
        })
    }

    /// Reads stdout until `needle` shows up. Returns everything read so far.
    pub fn read_until(&self, needle: &str) -> JoinHandle<String> {
        let mut stdout = self.stdout.try_clone().unwrap();
        let needle = needle.to_string();
        tokio::task::spawn_blocking(move || {
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => seen.extend_from_slice(&buf[..n]),
                }
                if String::from_utf8_lossy(&seen).contains(&needle) {
                    break;
                }
            }
            String::from_utf8_lossy(&seen).into_owned()
        })
    }
}

/// A peer running `command` plus the client ends of its streams.
pub fn socket_peer(command: &[&str]) -> (StreamPeer, Client) {
    let (stdin_client, stdin_server) = UnixStream::pair().unwrap();
    let (stdout_client, stdout_server) = UnixStream::pair().unwrap();
    let (stderr_client, stderr_server) = UnixStream::pair().unwrap();

    let peer = StreamPeer::new(
        PeerInfo::new("tester", "127.0.0.1:50022"),
        command.iter().map(|s| s.to_string()).collect(),
        Source::from_unix(stdin_server).unwrap(),
        Sink::from_unix(stdout_server).unwrap(),
        Sink::from_unix(stderr_server).unwrap(),
    );
    let client = Client {
        stdin: stdin_client,
        stdout: stdout_client,
        stderr: stderr_client,
    };
    (peer, client)
}

/// Same as [`socket_peer`] with a terminal request.
pub fn pty_peer(
    command: &[&str],
    size: WindowSize,
) -> (StreamPeer, Client, mpsc::Sender<WindowSize>) {
    let (peer, client) = socket_peer(command);
    let (peer, resize) = peer.with_pty(PtyRequest {
        term: "xterm-256color".to_string(),
        size,
    });
    (peer, client, resize)
}

pub fn options() -> SessionOptions {
    SessionOptions {
        grace: Duration::from_millis(200),
        leak_timeout: Duration::from_secs(2),
    }
}

/// Runs a session for `peer` on a task.
pub fn spawn_session<F>(peer: Arc<StreamPeer>, factory: F) -> JoinHandle<u8>
where
    F: ProcessFactory + 'static,
{
    tokio::spawn(async move { handle(peer, &factory, options()).await })
}

/// Awaits `handle` with [`TEST_TIMEOUT`].
pub async fn finish<T>(handle: JoinHandle<T>) -> T {
    tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .expect("timed out")
        .expect("task panicked")
}
