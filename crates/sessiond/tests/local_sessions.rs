//! Whole sessions running local programs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{finish, pty_peer, socket_peer, spawn_session};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use sessiond::process::{ShellFactory, STATUS_UNKNOWN};
use sessiond::term::WindowSize;

fn shell() -> ShellFactory {
    ShellFactory::new("/bin/sh")
}

/// Polls until `pid` no longer exists.
async fn wait_gone(pid: i32) -> bool {
    for _ in 0..100 {
        if kill(Pid::from_raw(pid), None) == Err(Errno::ESRCH) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_echo_output_and_status() {
    let (peer, client) = socket_peer(&["echo", "hi"]);
    let peer = Arc::new(peer);
    let output = client.collect();

    let status = finish(spawn_session(Arc::clone(&peer), shell())).await;
    let (out, err) = finish(output).await;

    assert_eq!(status, 0);
    assert_eq!(peer.exit_status(), Some(0));
    assert_eq!(out, "hi\n");
    assert!(err.is_empty());
}

#[tokio::test]
async fn test_false_exits_one() {
    let (peer, client) = socket_peer(&["false"]);
    let output = client.collect();

    let status = finish(spawn_session(Arc::new(peer), shell())).await;
    let (out, err) = finish(output).await;

    assert_eq!(status, 1);
    assert!(out.is_empty());
    assert!(err.is_empty());
}

#[tokio::test]
async fn test_streams_stay_separate() {
    let (peer, client) = socket_peer(&["echo out; echo err >&2; exit 3"]);
    let output = client.collect();

    let status = finish(spawn_session(Arc::new(peer), shell())).await;
    let (out, err) = finish(output).await;

    assert_eq!(status, 3);
    assert_eq!(out, "out\n");
    assert_eq!(err, "err\n");
}

#[tokio::test]
async fn test_stdin_reaches_process() {
    let (peer, mut client) = socket_peer(&["cat"]);
    let output = client.collect();
    let session = spawn_session(Arc::new(peer), shell());

    client.send(b"hello\nworld\n");
    client.close_stdin();

    assert_eq!(finish(session).await, 0);
    let (out, _) = finish(output).await;
    assert_eq!(out, "hello\nworld\n");
}

#[tokio::test]
async fn test_missing_shell_reports_error() {
    let (peer, client) = socket_peer(&["true"]);
    let output = client.collect();

    let factory = ShellFactory::new("no-such-shell-here");
    let status = finish(spawn_session(Arc::new(peer), factory)).await;
    let (_, err) = finish(output).await;

    assert_eq!(status, STATUS_UNKNOWN);
    assert!(err.contains("Can't find no-such-shell-here in path"), "stderr: {err:?}");
}

#[tokio::test]
async fn test_disconnect_kills_process() {
    let (peer, client) = socket_peer(&["echo $$; exec sleep 30"]);
    let peer = Arc::new(peer);
    let pid_line = client.read_until("\n");
    let session = spawn_session(Arc::clone(&peer), shell());

    let pid: i32 = finish(pid_line).await.trim().parse().unwrap();
    peer.disconnect();

    assert_eq!(finish(session).await, STATUS_UNKNOWN);
    assert_eq!(peer.exit_status(), Some(STATUS_UNKNOWN));
    assert!(wait_gone(pid).await, "process {pid} survived the disconnect");
}

#[tokio::test]
async fn test_pty_session_sees_term_and_size() {
    let (peer, client, _resize) = pty_peer(&["echo $TERM; stty size"], WindowSize::new(33, 101));
    let output = client.collect();

    let status = finish(spawn_session(Arc::new(peer), shell())).await;
    let (out, _) = finish(output).await;

    assert_eq!(status, 0);
    assert!(out.contains("xterm-256color"), "output: {out:?}");
    assert!(out.contains("33 101"), "output: {out:?}");
}

#[tokio::test]
async fn test_pty_resize_is_applied() {
    let (peer, mut client, resize) = pty_peer(&["read line; stty size"], WindowSize::new(24, 80));
    let output = client.collect();
    let session = spawn_session(Arc::new(peer), shell());

    tokio::time::sleep(Duration::from_millis(200)).await;
    resize.send(WindowSize::new(50, 160)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.send(b"go\r");

    assert_eq!(finish(session).await, 0);
    let (out, _) = finish(output).await;
    assert!(out.contains("50 160"), "output: {out:?}");
}

#[tokio::test]
async fn test_pty_disconnect_kills_process() {
    let command = ["echo pid=$$; exec sleep 30"];
    let (peer, client, _resize) = pty_peer(&command, WindowSize::new(24, 80));
    let peer = Arc::new(peer);
    let pid_line = client.read_until("\r\n");
    let session = spawn_session(Arc::clone(&peer), shell());

    let seen = finish(pid_line).await;
    let pid: i32 = seen
        .split("pid=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap()
        .parse()
        .unwrap();
    peer.disconnect();

    assert_eq!(finish(session).await, STATUS_UNKNOWN);
    assert!(wait_gone(pid).await, "process {pid} survived the disconnect");
}
