//! Loading and generating host keys on disk.
//!
//! Each algorithm lives in its own PEM file. A missing file is generated and
//! written with owner-only permissions, then loaded back from disk; an
//! existing file is parsed as-is. A file that fails to parse is reported and
//! left untouched.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{HostKeyError, Result};
use crate::key::{Algorithm, HostKey, DEFAULT_RSA_BITS};

/// Algorithms used when none are configured.
pub const DEFAULT_ALGORITHMS: [Algorithm; 2] = [Algorithm::Rsa, Algorithm::Ed25519];

/// The set of host keys a server presents.
#[derive(Debug, Default, Clone)]
pub struct HostKeySet {
    keys: Vec<Arc<HostKey>>,
}

impl HostKeySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key, replacing any key of the same algorithm.
    pub fn add(&mut self, key: Arc<HostKey>) {
        self.keys.retain(|k| k.algorithm() != key.algorithm());
        self.keys.push(key);
    }

    /// Returns the key for an algorithm, if loaded.
    pub fn get(&self, algorithm: Algorithm) -> Option<&Arc<HostKey>> {
        self.keys.iter().find(|k| k.algorithm() == algorithm)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<HostKey>> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Loads the key at `path`, generating it first if the file does not exist.
///
/// RSA keys are generated with [`DEFAULT_RSA_BITS`].
pub fn read_or_make_key(path: impl AsRef<Path>, algorithm: Algorithm) -> Result<HostKey> {
    read_or_make_key_with(path, algorithm, DEFAULT_RSA_BITS)
}

/// Same as [`read_or_make_key`] with an explicit RSA modulus size.
pub fn read_or_make_key_with(
    path: impl AsRef<Path>,
    algorithm: Algorithm,
    rsa_bits: usize,
) -> Result<HostKey> {
    let path = path.as_ref();

    match fs::read(path) {
        Ok(data) => {
            tracing::info!(path = %path.display(), %algorithm, "load_hostkey");
            HostKey::from_pem(algorithm, &data)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), %algorithm, "generate_hostkey");
            let key = HostKey::generate(algorithm, rsa_bits)?;
            write_key(path, &key)?;

            let data = fs::read(path).map_err(|e| HostKeyError::io(path, e))?;
            HostKey::from_pem(algorithm, &data)
        }
        Err(e) => Err(HostKeyError::io(path, e)),
    }
}

/// Loads or generates a key and registers it in `set`.
pub fn use_or_make_key(
    set: &mut HostKeySet,
    path: impl AsRef<Path>,
    algorithm: Algorithm,
) -> Result<Arc<HostKey>> {
    let key = Arc::new(read_or_make_key(path, algorithm)?);
    set.add(Arc::clone(&key));
    Ok(key)
}

/// Loads or generates one key per algorithm at `<base_path>_<algorithm>`.
///
/// An empty algorithm list means [`DEFAULT_ALGORITHMS`].
pub fn use_or_make_keys(
    set: &mut HostKeySet,
    base_path: impl AsRef<Path>,
    algorithms: &[Algorithm],
) -> Result<()> {
    use_or_make_keys_with(set, base_path, algorithms, DEFAULT_RSA_BITS)
}

/// Same as [`use_or_make_keys`] with an explicit RSA modulus size.
pub fn use_or_make_keys_with(
    set: &mut HostKeySet,
    base_path: impl AsRef<Path>,
    algorithms: &[Algorithm],
    rsa_bits: usize,
) -> Result<()> {
    let algorithms = if algorithms.is_empty() {
        &DEFAULT_ALGORITHMS[..]
    } else {
        algorithms
    };

    for &algorithm in algorithms {
        let path = key_path(base_path.as_ref(), algorithm);
        let key = read_or_make_key_with(&path, algorithm, rsa_bits)?;
        set.add(Arc::new(key));
    }
    Ok(())
}

/// Returns the per-algorithm file path, `<base_path>_<algorithm>`.
pub fn key_path(base_path: &Path, algorithm: Algorithm) -> PathBuf {
    let mut name = base_path.as_os_str().to_owned();
    name.push("_");
    name.push(algorithm.as_str());
    PathBuf::from(name)
}

fn write_key(path: &Path, key: &HostKey) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| HostKeyError::io(parent, e))?;
    }

    let pem = key.to_pem()?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| HostKeyError::io(path, e))?;
    file.write_all(pem.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| HostKeyError::io(path, e))
}
