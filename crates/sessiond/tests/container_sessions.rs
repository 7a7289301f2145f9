//! Whole sessions against a scripted container runtime.

mod common;

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{finish, pty_peer, socket_peer, spawn_session};
use sessiond::asyncio::{AsyncIoError, Sink, Source};
use sessiond::auth::ConnectionLookup;
use sessiond::config::ContainerConfig;
use sessiond::process::{
    ContainerFactory, ContainerRuntime, ContainerSummary, ExecConfig, ExecInspect, ExecStream,
    RuntimeError, STATUS_UNKNOWN,
};
use sessiond::term::WindowSize;

fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![stream, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// An exec that echoes input lines. Framed execs echo to stdout and report
/// the line count on stderr when input ends.
struct EchoRuntime {
    containers: Vec<ContainerSummary>,
    exit_code: i64,
    finished: Arc<AtomicBool>,
    execs: Mutex<Vec<ExecConfig>>,
}

impl EchoRuntime {
    fn new(exit_code: i64) -> Self {
        let container = ContainerSummary {
            id: "c0ffee".to_string(),
            names: vec!["/tester-box".to_string()],
            state: "running".to_string(),
            labels: HashMap::from([("shellproxy.user".to_string(), "tester".to_string())]),
        };
        Self {
            containers: vec![container],
            exit_code,
            finished: Arc::new(AtomicBool::new(false)),
            execs: Mutex::new(Vec::new()),
        }
    }
}

fn serve(theirs: UnixStream, tty: bool, finished: Arc<AtomicBool>) {
    let mut writer = match theirs.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut lines = 0usize;
    for line in BufReader::new(theirs).lines() {
        let Ok(line) = line else { break };
        lines += 1;
        let reply = format!("{line}\n");
        let data = if tty {
            reply.into_bytes()
        } else {
            frame(1, reply.as_bytes())
        };
        if writer.write_all(&data).is_err() {
            break;
        }
    }
    if !tty {
        let _ = writer.write_all(&frame(2, format!("{lines} lines\n").as_bytes()));
    }
    finished.store(true, Ordering::SeqCst);
}

#[async_trait]
impl ContainerRuntime for EchoRuntime {
    async fn exec_create(&self, config: &ExecConfig) -> Result<String, RuntimeError> {
        self.execs.lock().unwrap().push(config.clone());
        Ok("exec-42".to_string())
    }

    async fn exec_attach(&self, _exec_id: &str, tty: bool) -> Result<ExecStream, RuntimeError> {
        let (ours, theirs) = UnixStream::pair().map_err(AsyncIoError::from)?;
        let finished = Arc::clone(&self.finished);
        std::thread::spawn(move || serve(theirs, tty, finished));
        Ok(ExecStream {
            output: Source::from_unix(ours.try_clone().map_err(AsyncIoError::from)?)
                .map_err(AsyncIoError::from)?,
            input: Sink::from_unix(ours).map_err(AsyncIoError::from)?,
        })
    }

    async fn exec_inspect(&self, _exec_id: &str) -> Result<ExecInspect, RuntimeError> {
        let done = self.finished.load(Ordering::SeqCst);
        Ok(ExecInspect {
            running: !done,
            exit_code: done.then_some(self.exit_code),
        })
    }

    async fn exec_resize(&self, _exec_id: &str, _size: WindowSize) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn find_containers(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        Ok(self
            .containers
            .iter()
            .filter(|c| c.labels.get(label).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }
}

fn factory(runtime: Arc<EchoRuntime>) -> ContainerFactory {
    ContainerFactory::new(runtime, ContainerConfig::default(), Arc::new(ConnectionLookup::new()))
}

#[tokio::test]
async fn test_container_pipes_session() {
    let runtime = Arc::new(EchoRuntime::new(4));
    let (peer, mut client) = socket_peer(&["cat"]);
    let output = client.collect();
    let session = spawn_session(Arc::new(peer), factory(Arc::clone(&runtime)));

    client.send(b"one\ntwo\n");
    client.close_stdin();

    assert_eq!(finish(session).await, 4);
    let (out, err) = finish(output).await;
    assert_eq!(out, "one\ntwo\n");
    assert_eq!(err, "2 lines\n");

    let execs = runtime.execs.lock().unwrap().clone();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].container_id, "c0ffee");
    assert_eq!(execs[0].cmd, vec!["/bin/sh".to_string(), "-c".to_string(), "cat".to_string()]);
    assert!(!execs[0].tty);
}

#[tokio::test]
async fn test_container_missing_for_user() {
    let mut runtime = EchoRuntime::new(0);
    runtime.containers.clear();
    let (peer, client) = socket_peer(&["id"]);
    let output = client.collect();

    let status = finish(spawn_session(Arc::new(peer), factory(Arc::new(runtime)))).await;
    let (_, err) = finish(output).await;

    assert_eq!(status, STATUS_UNKNOWN);
    assert_eq!(err, "No running container with shellproxy.user=tester\n");
}

#[tokio::test]
async fn test_container_pty_session_disconnect() {
    let runtime = Arc::new(EchoRuntime::new(0));
    let (peer, mut client, _resize) = pty_peer(&[], WindowSize::new(24, 80));
    let peer = Arc::new(peer);
    let echoed = client.read_until("ping");
    let session = spawn_session(Arc::clone(&peer), factory(Arc::clone(&runtime)));

    client.send(b"ping\n");
    assert!(finish(echoed).await.contains("ping"));

    peer.disconnect();
    assert_eq!(finish(session).await, STATUS_UNKNOWN);

    let execs = runtime.execs.lock().unwrap().clone();
    assert!(execs[0].tty);
    assert!(execs[0].env.iter().any(|e| e == "TERM=xterm-256color"));
}
