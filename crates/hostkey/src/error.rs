//! Error types for the hostkey crate.

use std::path::PathBuf;

use thiserror::Error;

/// Host key error type covering loading, generation and signing failures.
#[derive(Debug, Error)]
pub enum HostKeyError {
    /// Reading or writing a key file failed.
    #[error("key file {path}: {source}")]
    Io {
        /// The key file involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The key file is not a valid PEM document.
    #[error("invalid PEM: {0}")]
    Pem(String),

    /// The PEM block does not hold a key of the expected algorithm.
    #[error("cannot decode {algorithm} key: {reason}")]
    Decode {
        /// Algorithm the caller asked for.
        algorithm: String,
        /// What went wrong.
        reason: String,
    },

    /// Key generation failed.
    #[error("key generation failed: {0}")]
    Generate(String),

    /// Serializing a key failed.
    #[error("key encoding failed: {0}")]
    Encode(String),

    /// Unknown algorithm name.
    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Malformed OpenSSH public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

impl HostKeyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HostKeyError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn decode(algorithm: impl std::fmt::Display, reason: impl ToString) -> Self {
        HostKeyError::Decode {
            algorithm: algorithm.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<pem::PemError> for HostKeyError {
    fn from(err: pem::PemError) -> Self {
        HostKeyError::Pem(err.to_string())
    }
}

/// `ed25519_dalek::SignatureError` and `rsa::signature::Error` are the same
/// type, so this covers both algorithms.
impl From<ed25519_dalek::SignatureError> for HostKeyError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        HostKeyError::InvalidSignature(err.to_string())
    }
}

/// Result type alias for host key operations.
pub type Result<T> = std::result::Result<T, HostKeyError>;
