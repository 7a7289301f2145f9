//! Entry point for a freshly authenticated connection.

use std::sync::Arc;

use uuid::Uuid;

use super::orchestrator::{session_span, Session, SessionOptions};
use crate::asyncio;
use crate::process::{ProcessFactory, STATUS_UNKNOWN};
use crate::transport::Peer;

/// Builds a process for `peer`, runs it and returns the exit status.
///
/// When the factory fails, the error goes to the peer's stderr and the peer
/// gets status 255.
pub async fn handle(
    peer: Arc<dyn Peer>,
    factory: &dyn ProcessFactory,
    options: SessionOptions,
) -> u8 {
    let id = Uuid::new_v4();
    let span = session_span(id, peer.info());
    span.in_scope(|| tracing::info!("session_start"));

    let process = match factory.make(peer.as_ref()).await {
        Ok(process) => process,
        Err(e) => {
            span.in_scope(|| tracing::info!(error = %e, "session_command"));
            let message = format!("{e}\n");
            let cancel = peer.cancellation();
            let stderr = peer.stderr();
            let written = asyncio::write(&cancel, options.grace, &stderr, message.as_bytes()).await;
            if let Err(e) = written {
                span.in_scope(|| tracing::debug!(error = %e, "failed to report error to peer"));
            }
            if let Err(e) = peer.exit(STATUS_UNKNOWN) {
                span.in_scope(|| tracing::debug!(error = %e, "failed to report exit status"));
            }
            span.in_scope(|| tracing::info!("session_end"));
            return STATUS_UNKNOWN;
        }
    };
    span.in_scope(|| tracing::info!(command = %process, "session_valid"));

    let session = Session::with_span(id, span.clone(), peer, process, options);
    let status = match session.run().await {
        Ok(status) => status,
        Err(_) => session.status().unwrap_or(STATUS_UNKNOWN),
    };

    span.in_scope(|| tracing::info!(status, "session_end"));
    status
}
