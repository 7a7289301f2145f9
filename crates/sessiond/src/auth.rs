//! Public-key authorization and per-connection lookups.
//!
//! Key lookup itself (authorized_keys files, container labels, a directory
//! service) sits behind [`KeyFinder`]. [`authorize`] checks an offered key
//! against every candidate so the time taken does not depend on which one
//! matched.

use async_trait::async_trait;
use hostkey::{HostKeyError, PublicKey};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::transport::PeerInfo;

/// Authorization errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The key source could not be consulted.
    #[error("key lookup failed: {0}")]
    Lookup(String),

    /// A stored key could not be parsed.
    #[error("invalid authorized key on line {line}: {source}")]
    InvalidKey {
        line: usize,
        #[source]
        source: HostKeyError,
    },
}

/// Supplies the keys a connecting user may authenticate with.
#[async_trait]
pub trait KeyFinder: Send + Sync {
    async fn find_keys(&self, peer: &PeerInfo) -> Result<Vec<PublicKey>, AuthError>;
}

/// Returns whether `offered` is one of the keys `finder` returns for `peer`.
///
/// Every candidate is compared, even after a match.
pub async fn authorize(
    finder: &dyn KeyFinder,
    peer: &PeerInfo,
    offered: &PublicKey,
) -> Result<bool, AuthError> {
    let keys = finder.find_keys(peer).await?;
    let matched = keys
        .iter()
        .fold(false, |found, candidate| found | candidate.same_key(offered));

    tracing::debug!(
        user = %peer.user,
        remote = %peer.remote,
        candidates = keys.len(),
        matched,
        "public key check"
    );
    Ok(matched)
}

/// Non-blank, non-comment lines of `authorized_keys` text with their
/// 1-based line numbers.
fn key_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

/// Parses `authorized_keys` text, skipping lines that do not hold a key.
///
/// For key sources the user controls, where one bad line should not lock
/// them out.
pub fn parse_authorized_keys(text: &str) -> Vec<PublicKey> {
    key_lines(text)
        .filter_map(|(line, key)| match PublicKey::from_openssh(key) {
            Ok(key) => Some(key),
            Err(err) => {
                tracing::debug!(line, error = %err, "skipping authorized key");
                None
            }
        })
        .collect()
}

/// A fixed key list shared by every user.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyFinder {
    keys: Vec<PublicKey>,
}

impl StaticKeyFinder {
    pub fn new(keys: Vec<PublicKey>) -> Self {
        Self { keys }
    }

    /// Parses `authorized_keys` text: one OpenSSH public key per line, blank
    /// lines and `#` comments skipped. Option prefixes are not supported.
    pub fn from_authorized_keys(text: &str) -> Result<Self, AuthError> {
        let keys = key_lines(text)
            .map(|(line, key)| {
                PublicKey::from_openssh(key)
                    .map_err(|source| AuthError::InvalidKey { line, source })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl KeyFinder for StaticKeyFinder {
    async fn find_keys(&self, _peer: &PeerInfo) -> Result<Vec<PublicKey>, AuthError> {
        Ok(self.keys.clone())
    }
}

/// Caches one lookup for the lifetime of a connection.
///
/// Authorization and command execution both need the lookup target (the
/// container a user maps to, for example). Both go through the same
/// `ConnectionLookup`, so the target is resolved once and both steps see
/// the same answer.
#[derive(Debug)]
pub struct ConnectionLookup<T> {
    cell: OnceCell<T>,
}

impl<T> Default for ConnectionLookup<T> {
    fn default() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }
}

impl<T> ConnectionLookup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value, running `lookup` if there is none yet.
    /// A failed lookup is not cached.
    pub async fn get_or_try_init<E, F, Fut>(&self, lookup: F) -> Result<&T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.cell.get_or_try_init(lookup).await
    }

    /// The cached value, if a lookup already succeeded.
    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }
}
