//! Public keys in OpenSSH form.
//!
//! Host public keys are published as `authorized_keys`-style lines and
//! identified by `SHA256:` fingerprints. Client keys offered during
//! authorization are compared with [`PublicKey::same_key`].

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use ed25519_dalek::{VerifyingKey, PUBLIC_KEY_LENGTH};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::{HostKeyError, Result};
use crate::key::Algorithm;

/// A host or client public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// RSA public key.
    Rsa(RsaPublicKey),
    /// Ed25519 public key.
    Ed25519(VerifyingKey),
}

impl PublicKey {
    /// Returns the key algorithm.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            PublicKey::Rsa(_) => Algorithm::Rsa,
            PublicKey::Ed25519(_) => Algorithm::Ed25519,
        }
    }

    /// Encodes the key in SSH wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_string(&mut out, self.algorithm().ssh_name().as_bytes());
        match self {
            PublicKey::Rsa(key) => {
                put_mpint(&mut out, &key.e().to_bytes_be());
                put_mpint(&mut out, &key.n().to_bytes_be());
            }
            PublicKey::Ed25519(key) => put_string(&mut out, key.as_bytes()),
        }
        out
    }

    /// Decodes a key from SSH wire format.
    pub fn from_wire(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader { data };
        let name = reader.string()?;

        let key = match name {
            b"ssh-rsa" => {
                let e = BigUint::from_bytes_be(reader.string()?);
                let n = BigUint::from_bytes_be(reader.string()?);
                let key = RsaPublicKey::new(n, e)
                    .map_err(|e| HostKeyError::InvalidPublicKey(e.to_string()))?;
                PublicKey::Rsa(key)
            }
            b"ssh-ed25519" => {
                let raw = reader.string()?;
                let bytes: [u8; PUBLIC_KEY_LENGTH] = raw.try_into().map_err(|_| {
                    HostKeyError::InvalidPublicKey(format!(
                        "ed25519 key must be {} bytes, got {}",
                        PUBLIC_KEY_LENGTH,
                        raw.len()
                    ))
                })?;
                let key = VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| HostKeyError::InvalidPublicKey(e.to_string()))?;
                PublicKey::Ed25519(key)
            }
            other => {
                return Err(HostKeyError::UnsupportedAlgorithm(
                    String::from_utf8_lossy(other).into_owned(),
                ))
            }
        };

        if !reader.data.is_empty() {
            return Err(HostKeyError::InvalidPublicKey(
                "trailing bytes after key".to_string(),
            ));
        }
        Ok(key)
    }

    /// Formats the key as an OpenSSH public key line, e.g. `ssh-ed25519 AAAA...`.
    pub fn to_openssh(&self) -> String {
        format!(
            "{} {}",
            self.algorithm().ssh_name(),
            STANDARD.encode(self.to_wire())
        )
    }

    /// Parses an OpenSSH public key line. A trailing comment is ignored.
    pub fn from_openssh(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let (Some(kind), Some(blob)) = (fields.next(), fields.next()) else {
            return Err(HostKeyError::InvalidPublicKey(
                "expected \"<type> <base64>\"".to_string(),
            ));
        };

        let wire = STANDARD
            .decode(blob)
            .map_err(|e| HostKeyError::InvalidPublicKey(e.to_string()))?;
        let key = Self::from_wire(&wire)?;
        if key.algorithm().ssh_name() != kind {
            return Err(HostKeyError::InvalidPublicKey(format!(
                "key type {} does not match encoded {}",
                kind,
                key.algorithm().ssh_name()
            )));
        }
        Ok(key)
    }

    /// Returns the OpenSSH-style `SHA256:` fingerprint.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.to_wire());
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }

    /// Compares two keys by their wire encoding in constant time with
    /// respect to the key contents.
    pub fn same_key(&self, other: &PublicKey) -> bool {
        let a = self.to_wire();
        let b = other.to_wire();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }

    /// Verifies a signature produced by the matching private key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            PublicKey::Rsa(key) => {
                let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
                let signature = rsa::pkcs1v15::Signature::try_from(signature)?;
                rsa::signature::Verifier::verify(&verifier, message, &signature)?;
                Ok(())
            }
            PublicKey::Ed25519(key) => {
                let signature = ed25519_dalek::Signature::from_slice(signature)?;
                ed25519_dalek::Verifier::verify(key, message, &signature)?;
                Ok(())
            }
        }
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_openssh())
    }
}

impl FromStr for PublicKey {
    type Err = HostKeyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_openssh(s)
    }
}

fn put_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

fn put_mpint(out: &mut Vec<u8>, magnitude: &[u8]) {
    let start = magnitude
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];
    if trimmed.first().is_some_and(|b| b & 0x80 != 0) {
        out.extend_from_slice(&((trimmed.len() + 1) as u32).to_be_bytes());
        out.push(0);
        out.extend_from_slice(trimmed);
    } else {
        put_string(out, trimmed);
    }
}

struct WireReader<'a> {
    data: &'a [u8],
}

impl<'a> WireReader<'a> {
    fn string(&mut self) -> Result<&'a [u8]> {
        if self.data.len() < 4 {
            return Err(HostKeyError::InvalidPublicKey("truncated length".to_string()));
        }
        let (len, rest) = self.data.split_at(4);
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if rest.len() < len {
            return Err(HostKeyError::InvalidPublicKey("truncated field".to_string()));
        }
        let (field, rest) = rest.split_at(len);
        self.data = rest;
        Ok(field)
    }
}
