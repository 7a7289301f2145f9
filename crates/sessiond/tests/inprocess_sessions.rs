//! Whole sessions for the REPL and no-command processes.

mod common;

use std::io::Write;
use std::sync::Arc;

use common::{finish, pty_peer, socket_peer, spawn_session};
use sessiond::process::{NoCommandFactory, ReplFactory, ReplStep, NO_SHELL_NOTICE, STATUS_UNKNOWN};
use sessiond::term::WindowSize;
use tokio_util::sync::CancellationToken;

fn shouting_repl() -> ReplFactory {
    let step: ReplStep = Arc::new(|_: &CancellationToken, out: &mut dyn Write, line: &str| {
        match line.trim() {
            "quit" => Some(9),
            other => {
                let _ = writeln!(out, "{}", other.to_uppercase());
                None
            }
        }
    });
    ReplFactory::new(step).with_welcome("welcome")
}

#[tokio::test]
async fn test_repl_session_runs_steps() {
    let (peer, mut client, _resize) = pty_peer(&[], WindowSize::new(24, 80));
    let output = client.collect();
    let session = spawn_session(Arc::new(peer), shouting_repl());

    client.send(b"hello\r");
    client.send(b"quit\r");

    assert_eq!(finish(session).await, 9);
    let (out, _) = finish(output).await;
    assert!(out.starts_with("welcome"), "output: {out:?}");
    assert!(out.contains("> "), "output: {out:?}");
    assert!(out.contains("HELLO\r\n"), "output: {out:?}");
}

#[tokio::test]
async fn test_repl_typed_ahead_lines() {
    let (peer, mut client, _resize) = pty_peer(&[], WindowSize::new(24, 80));
    let output = client.collect();
    let session = spawn_session(Arc::new(peer), shouting_repl());

    client.send(b"a\rb\r\x04");

    assert_eq!(finish(session).await, 0);
    let (out, _) = finish(output).await;
    let first = out.find("A\r\n").expect("first step output");
    let second = out.find("B\r\n").expect("second step output");
    assert!(first < second, "output: {out:?}");
}

#[tokio::test]
async fn test_repl_end_of_input_exits_zero() {
    let (peer, mut client, _resize) = pty_peer(&[], WindowSize::new(24, 80));
    let output = client.collect();
    let session = spawn_session(Arc::new(peer), ReplFactory::default());

    client.send(b"\x04");

    assert_eq!(finish(session).await, 0);
    finish(output).await;
}

#[tokio::test]
async fn test_repl_without_tty_fails() {
    let (peer, client) = socket_peer(&[]);
    let output = client.collect();

    let status = finish(spawn_session(Arc::new(peer), ReplFactory::default())).await;
    let (_, err) = finish(output).await;

    assert_eq!(status, STATUS_UNKNOWN);
    assert_eq!(err, "Failed to start process: tty was not allocated\n");
}

#[tokio::test]
async fn test_no_command_prints_notice() {
    let (peer, client) = socket_peer(&[]);
    let output = client.collect();
    let session = spawn_session(Arc::new(peer), NoCommandFactory);

    client.close_stdin();

    assert_eq!(finish(session).await, 0);
    let (out, err) = finish(output).await;
    assert_eq!(out, format!("{NO_SHELL_NOTICE}\n"));
    assert!(err.is_empty());
}

#[tokio::test]
async fn test_no_command_pty_closes_on_ctrl_d() {
    let (peer, mut client, _resize) = pty_peer(&[], WindowSize::new(24, 80));
    let notice = client.read_until(NO_SHELL_NOTICE);
    let session = spawn_session(Arc::new(peer), NoCommandFactory);

    assert!(finish(notice).await.contains(NO_SHELL_NOTICE));
    client.send(b"ls\r\x04");

    assert_eq!(finish(session).await, 0);
}
