//! KMS client interface and a local in-process key provider
//!
//! The re-encryption core talks to the Key Management Service through the
//! [`KmsClient`] trait. The KMS is a shared external resource with its own
//! client-side retry; the coordinator does not add retries on top - a failed
//! batch call fails the whole batch.
//!
//! [`LocalKeyProvider`] is a deterministic in-process implementation used by
//! the simulate binary and the test suite. It supports key rolling, a small
//! pre-generated EDEK cache (drained on zone submission), and fault injection
//! for exercising batch-failure paths.

use crate::error::{KmsError, KmsResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// An encryption key wrapped by a specific version of a zone key.
///
/// `version_name` identifies the zone key version the material is wrapped
/// under; re-encryption rewraps `material` and moves `version_name` forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeyVersion {
    /// Name of the zone key this EDEK is wrapped by
    pub key_name: String,

    /// Version of the zone key the material is currently wrapped under
    pub version_name: String,

    /// The wrapped key material
    pub material: Vec<u8>,
}

impl EncryptedKeyVersion {
    /// Create a new wrapped key
    pub fn new(key_name: impl Into<String>, version_name: impl Into<String>, material: Vec<u8>) -> Self {
        Self {
            key_name: key_name.into(),
            version_name: version_name.into(),
            material,
        }
    }
}

/// Client-side interface to the Key Management Service.
///
/// Implementations must be safe to call from multiple pool workers at once.
/// None of these methods may be called while a namespace lock is held.
pub trait KmsClient: Send + Sync {
    /// Name of the current (latest) version of a key
    fn current_key_version(&self, key_name: &str) -> KmsResult<String>;

    /// Generate a fresh EDEK wrapped under the current key version
    fn generate_encrypted_key(&self, key_name: &str) -> KmsResult<EncryptedKeyVersion>;

    /// Re-wrap a batch of EDEKs under the current key version, in place.
    ///
    /// This is a single batch operation: either every entry is rewrapped or
    /// the whole call fails.
    fn reencrypt_encrypted_keys(&self, edeks: &mut [EncryptedKeyVersion]) -> KmsResult<()>;

    /// Drop any client-side cache of pre-generated EDEKs for a key, so that
    /// keys handed out after a re-encryption command are wrapped by the new
    /// version.
    fn drain_encrypted_keys(&self, key_name: &str);
}

/// Per-key state held by the local provider
#[derive(Debug, Default)]
struct KeyState {
    /// Monotone key version generation; version names are "<key>@<gen>"
    generation: u64,
}

/// Deterministic in-process key provider.
///
/// Key material is never real cryptography here: rewrapping XORs the material
/// with the generation byte, which is enough to observe that a rewrap
/// happened and that it is version-dependent.
pub struct LocalKeyProvider {
    keys: Mutex<HashMap<String, KeyState>>,

    /// Pre-generated EDEKs handed out by generate_encrypted_key
    cache: Mutex<HashMap<String, Vec<EncryptedKeyVersion>>>,

    /// Monotone counter for deterministic fresh material
    next_material: AtomicU64,

    /// Total reencrypt_encrypted_keys calls (batch calls, not entries)
    reencrypt_calls: AtomicU64,

    /// Fail every Nth reencrypt call (0 = never fail)
    fail_every: AtomicU64,
}

impl LocalKeyProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            next_material: AtomicU64::new(1),
            reencrypt_calls: AtomicU64::new(0),
            fail_every: AtomicU64::new(0),
        }
    }

    /// Create a key at generation 0
    pub fn create_key(&self, key_name: &str) {
        self.keys
            .lock()
            .entry(key_name.to_string())
            .or_insert_with(KeyState::default);
    }

    /// Roll the key to a new version and return the new version name
    pub fn roll_new_version(&self, key_name: &str) -> KmsResult<String> {
        let mut keys = self.keys.lock();
        let state = keys
            .get_mut(key_name)
            .ok_or_else(|| KmsError::KeyNotFound(key_name.to_string()))?;
        state.generation += 1;
        let version = version_name(key_name, state.generation);
        debug!(key = key_name, version = %version, "rolled key");
        Ok(version)
    }

    /// Pre-generate `count` EDEKs wrapped under the current key version, as
    /// a provider-side cache would. Submitting a zone for re-encryption
    /// drains this cache so stale-version keys are never handed out.
    pub fn warm_edek_cache(&self, key_name: &str, count: usize) -> KmsResult<()> {
        let generation = self.generation_of(key_name)?;
        let mut cache = self.cache.lock();
        let edeks = cache.entry(key_name.to_string()).or_default();
        for _ in 0..count {
            let seed = self.next_material.fetch_add(1, Ordering::SeqCst);
            edeks.push(EncryptedKeyVersion::new(
                key_name,
                version_name(key_name, generation),
                rewrap(&seed.to_be_bytes(), generation),
            ));
        }
        Ok(())
    }

    /// Make every Nth batch call fail with an I/O error (0 disables)
    pub fn fail_every_nth_call(&self, n: u64) {
        self.fail_every.store(n, Ordering::SeqCst);
    }

    /// Number of batch re-encrypt calls made so far
    pub fn reencrypt_call_count(&self) -> u64 {
        self.reencrypt_calls.load(Ordering::SeqCst)
    }

    fn generation_of(&self, key_name: &str) -> KmsResult<u64> {
        self.keys
            .lock()
            .get(key_name)
            .map(|s| s.generation)
            .ok_or_else(|| KmsError::KeyNotFound(key_name.to_string()))
    }
}

impl Default for LocalKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl KmsClient for LocalKeyProvider {
    fn current_key_version(&self, key_name: &str) -> KmsResult<String> {
        Ok(version_name(key_name, self.generation_of(key_name)?))
    }

    fn generate_encrypted_key(&self, key_name: &str) -> KmsResult<EncryptedKeyVersion> {
        if let Some(cached) = self
            .cache
            .lock()
            .get_mut(key_name)
            .and_then(|edeks| edeks.pop())
        {
            return Ok(cached);
        }
        let generation = self.generation_of(key_name)?;
        let seed = self.next_material.fetch_add(1, Ordering::SeqCst);
        let material = rewrap(&seed.to_be_bytes(), generation);
        Ok(EncryptedKeyVersion::new(
            key_name,
            version_name(key_name, generation),
            material,
        ))
    }

    fn reencrypt_encrypted_keys(&self, edeks: &mut [EncryptedKeyVersion]) -> KmsResult<()> {
        let call = self.reencrypt_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail_every = self.fail_every.load(Ordering::SeqCst);
        if fail_every > 0 && call % fail_every == 0 {
            return Err(KmsError::Io(format!("injected failure on call {}", call)));
        }

        for edek in edeks.iter_mut() {
            let generation = self.generation_of(&edek.key_name)?;
            // unwrap under the old version, rewrap under the current one
            let old_generation = parse_generation(&edek.version_name);
            let plain = rewrap(&edek.material, old_generation);
            edek.material = rewrap(&plain, generation);
            edek.version_name = version_name(&edek.key_name, generation);
        }
        Ok(())
    }

    fn drain_encrypted_keys(&self, key_name: &str) {
        if let Some(drained) = self.cache.lock().remove(key_name) {
            debug!(key = key_name, count = drained.len(), "drained edek cache");
        }
    }
}

fn version_name(key_name: &str, generation: u64) -> String {
    format!("{}@{}", key_name, generation)
}

fn parse_generation(version_name: &str) -> u64 {
    version_name
        .rsplit('@')
        .next()
        .and_then(|g| g.parse().ok())
        .unwrap_or(0)
}

fn rewrap(material: &[u8], generation: u64) -> Vec<u8> {
    material.iter().map(|b| b ^ (generation as u8)).collect()
}
