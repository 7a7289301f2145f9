//! Session lifecycle.
//!
//! [`handle`] turns an authenticated [`Peer`](crate::transport::Peer) into a
//! [`Session`] by asking a [`ProcessFactory`](crate::process::ProcessFactory)
//! for the process to run. The session wires the peer's streams to the
//! process, relays window changes, waits for the exit status and ends
//! exactly once.

pub mod handler;
pub mod orchestrator;

pub use handler::handle;
pub use orchestrator::{Session, SessionError, SessionOptions};
