//! Public keys used to verify workload deployment signatures.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::workload::SignatureVerifier;

/// File suffix of public key files
pub const PUBLIC_KEY_SUFFIX: &str = "pub";

/// Errors for loading keys and checking signatures
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Unable to read keys at {}: {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Invalid public key in {}: {1}", .0.display())]
    InvalidKey(PathBuf, String),

    #[error("Invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("No public keys found at {}", .0.display())]
    NoKeys(PathBuf),

    #[error("Key cache lock poisoned")]
    LockPoisoned,
}

/// Owned cache of ed25519 public keys, keyed by the path they were loaded from.
///
/// A key path is either a single key file or a directory of `*.pub` files. Each file holds
/// one 32 byte key, hex or base64 encoded.
#[derive(Debug, Default)]
pub struct KeyManager {
    /// Keys per key path
    keys: RwLock<HashMap<PathBuf, Vec<VerifyingKey>>>,
}

impl KeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys for `key_path`, loading and caching them on first use
    pub fn keys_for(&self, key_path: &Path) -> Result<Vec<VerifyingKey>, KeyError> {
        {
            let cache = self.keys.read().map_err(|_| KeyError::LockPoisoned)?;
            if let Some(keys) = cache.get(key_path) {
                return Ok(keys.clone());
            }
        }

        let keys = load_keys(key_path)?;
        if keys.is_empty() {
            return Err(KeyError::NoKeys(key_path.to_path_buf()));
        }
        debug!("Loaded {} public keys from {}", keys.len(), key_path.display());

        let mut cache = self.keys.write().map_err(|_| KeyError::LockPoisoned)?;
        cache.insert(key_path.to_path_buf(), keys.clone());
        Ok(keys)
    }

    /// Drop cached keys so the next use reloads them from disk
    pub fn invalidate(&self) -> Result<(), KeyError> {
        self.keys.write().map_err(|_| KeyError::LockPoisoned)?.clear();
        Ok(())
    }

    /// Number of key paths currently cached
    pub fn cached_paths(&self) -> usize {
        self.keys.read().map(|cache| cache.len()).unwrap_or(0)
    }
}

impl SignatureVerifier for KeyManager {
    /// The signature is base64 ed25519 over the SHA-256 digest of `payload`
    fn verify(&self, key_path: &Path, payload: &str, signature: &str) -> Result<bool, KeyError> {
        let raw = STANDARD
            .decode(signature.trim())
            .map_err(|e| KeyError::InvalidSignature(e.to_string()))?;
        let bytes: [u8; 64] = raw
            .try_into()
            .map_err(|_| KeyError::InvalidSignature("expected 64 bytes".to_string()))?;
        let signature = Signature::from_bytes(&bytes);
        let digest = Sha256::digest(payload.as_bytes());

        let keys = self.keys_for(key_path)?;
        Ok(keys.iter().any(|key| key.verify(&digest, &signature).is_ok()))
    }
}

fn load_keys(key_path: &Path) -> Result<Vec<VerifyingKey>, KeyError> {
    let io_err = |e| KeyError::Io(key_path.to_path_buf(), e);

    if key_path.is_file() {
        return Ok(vec![parse_key_file(key_path)?]);
    }

    let mut keys = Vec::new();
    let mut entries: Vec<PathBuf> = fs::read_dir(key_path)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == PUBLIC_KEY_SUFFIX))
        .collect();
    entries.sort();

    for path in entries {
        match parse_key_file(&path) {
            Ok(key) => keys.push(key),
            Err(e) => warn!("Skipping public key file: {}", e),
        }
    }
    Ok(keys)
}

fn parse_key_file(path: &Path) -> Result<VerifyingKey, KeyError> {
    let content = fs::read_to_string(path).map_err(|e| KeyError::Io(path.to_path_buf(), e))?;
    let content = content.trim();

    let raw = hex::decode(content)
        .or_else(|_| STANDARD.decode(content))
        .map_err(|_| KeyError::InvalidKey(path.to_path_buf(), "neither hex nor base64".to_string()))?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| KeyError::InvalidKey(path.to_path_buf(), "expected 32 bytes".to_string()))?;

    VerifyingKey::from_bytes(&bytes).map_err(|e| KeyError::InvalidKey(path.to_path_buf(), e.to_string()))
}
