//! # Shellproxy Session Daemon Library
//!
//! The session execution core of the shellproxy server: everything that
//! happens after a connection has been authenticated.
//!
//! ## Overview
//!
//! A session binds one [`Peer`](transport::Peer) to one
//! [`Process`](process::Process) and ends exactly once:
//!
//! - **Processes**: local programs (pty or pipes), container execs, an
//!   in-process REPL and a no-command placeholder
//! - **Cancellable I/O**: blocking reads and writes on detached threads that
//!   give up after a grace period once the session is cancelled
//! - **Leak detection**: every task a session spawns is named and checked
//!   when the session ends
//! - **Host keys**: persistent RSA and Ed25519 identities, provided by the
//!   `hostkey` crate
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     session::handle                          │
//! │        ProcessFactory::make(peer) -> Session::run            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌───────────┐  │
//! │  │   Local   │  │ Container  │  │   REPL   │  │ NoCommand │  │
//! │  └───────────┘  └────────────┘  └──────────┘  └───────────┘  │
//! ├──────────────────────────────────────────────────────────────┤
//! │   asyncio (copy / read / write)   term (pty, pipes, resize)  │
//! ├──────────────────────────────────────────────────────────────┤
//! │                 leak (per-session task tracker)              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sessiond::process::ShellFactory;
//! use sessiond::session::{handle, SessionOptions};
//! use sessiond::transport::{PeerInfo, StreamPeer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let peer = Arc::new(StreamPeer::from_streams(
//!         PeerInfo::new("alice", "local"),
//!         vec!["uname".to_string(), "-a".to_string()],
//!         std::io::stdin(),
//!         std::io::stdout(),
//!         std::io::stderr(),
//!     ));
//!     let status = handle(peer, &ShellFactory::new("/bin/sh"), SessionOptions::default()).await;
//!     std::process::exit(i32::from(status));
//! }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: the orchestrator and connection entry point
//! - [`process`]: process variants and factories
//! - [`transport`]: the peer abstraction and a stream-backed peer
//! - [`auth`]: public key authorization and per-connection lookups
//! - [`asyncio`]: cancellation-aware blocking I/O
//! - [`term`]: pseudo-terminal pairs, pipes and window sizes
//! - [`leak`]: the session task leak detector
//! - [`config`]: configuration management
//! - [`sync`]: small synchronization helpers

pub mod asyncio;
pub mod auth;
pub mod config;
pub mod leak;
pub mod process;
pub mod session;
pub mod sync;
pub mod term;
pub mod transport;

pub use config::Config;
pub use process::{Process, ProcessError, ProcessFactory, STATUS_UNKNOWN};
pub use session::{handle, Session, SessionError, SessionOptions};
pub use transport::{Peer, PeerInfo, PtyRequest, StreamPeer};
