//! # Shellproxy Host Keys
//!
//! Persistent host identity keys for the shellproxy session server.
//!
//! ## Overview
//!
//! A server presents one signing key per configured algorithm. On first start
//! each key is generated and written to disk as PEM; every later start loads
//! the same file, so the host identity stays stable across restarts.
//!
//! - **Key material**: RSA (PKCS#1 v1.5 / SHA-256 signatures) and Ed25519
//! - **Persistence**: PEM files with owner-only permissions
//! - **Public keys**: OpenSSH wire encoding, `authorized_keys` lines and
//!   `SHA256:` fingerprints
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use hostkey::{use_or_make_keys, Algorithm, HostKeySet};
//!
//! let mut set = HostKeySet::new();
//! use_or_make_keys(&mut set, "/etc/shellproxy/host_key", &[Algorithm::Ed25519]).unwrap();
//!
//! for key in set.iter() {
//!     println!("{}", key.public_key().to_openssh());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`key`]: private key generation, PEM encoding and signing
//! - [`public`]: public keys, OpenSSH encoding and fingerprints
//! - [`store`]: load-or-generate on disk and the host key set
//! - [`error`]: Error types

pub mod error;
pub mod key;
pub mod public;
pub mod store;

pub use error::{HostKeyError, Result};
pub use key::{Algorithm, HostKey, DEFAULT_RSA_BITS};
pub use public::PublicKey;
pub use store::{
    key_path, read_or_make_key, read_or_make_key_with, use_or_make_key, use_or_make_keys,
    use_or_make_keys_with, HostKeySet, DEFAULT_ALGORITHMS,
};
