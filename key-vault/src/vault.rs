use crate::envelope::{Algorithm, Envelope};
use crate::error::VaultError;
use crate::material::{aead_open, aead_seal, random_data_key, KeyMaterial};
use crate::models::{KeyInfo, KeyKind, KeyStatus};
use crate::store::{KeyStore, MemoryKeyStore, StoredKey};
use crate::usage::UsageReporter;
use arc_swap::ArcSwap;
use audit_pipeline::{AuditCategory, AuditEntry, AuditOutcome, AuditPipeline, SYSTEM_USER};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use custodian_core::config::KeyStorageConfig;
use custodian_core::Details;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

#[derive(Debug, Clone)]
pub struct VaultOptions {
    pub rsa_bits: usize,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self { rsa_bits: 2048 }
    }
}

impl From<&KeyStorageConfig> for VaultOptions {
    fn from(config: &KeyStorageConfig) -> Self {
        Self {
            rsa_bits: config.rsa_bits,
        }
    }
}

struct KeyEntry {
    info: KeyInfo,
    material: Option<Arc<KeyMaterial>>,
    /// Live ciphertexts produced by this process. Shared across snapshots.
    usage: Arc<AtomicUsize>,
}

impl KeyEntry {
    fn material(&self) -> Result<&KeyMaterial, VaultError> {
        self.material
            .as_deref()
            .ok_or_else(|| VaultError::KeyRetired(self.info.id.clone()))
    }

    fn with_info(&self, info: KeyInfo, keep_material: bool) -> Self {
        Self {
            info,
            material: if keep_material {
                self.material.clone()
            } else {
                None
            },
            usage: self.usage.clone(),
        }
    }
}

/// Immutable view of every key. Replaced wholesale on each mutation.
#[derive(Clone, Default)]
struct Registry {
    keys: HashMap<String, Arc<KeyEntry>>,
    /// name -> id of its single active key
    active: HashMap<String, String>,
}

impl Registry {
    fn active_entry(&self, name: &str) -> Option<&Arc<KeyEntry>> {
        self.active.get(name).and_then(|id| self.keys.get(id))
    }

    fn next_version(&self, name: &str) -> u32 {
        self.keys
            .values()
            .filter(|e| e.info.name == name)
            .map(|e| e.info.version)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn with(&self, entries: &[Arc<KeyEntry>]) -> Registry {
        let mut next = self.clone();
        for entry in entries {
            let id = entry.info.id.clone();
            if entry.info.is_active() {
                next.active.insert(entry.info.name.clone(), id.clone());
            } else if next.active.get(&entry.info.name) == Some(&id) {
                next.active.remove(&entry.info.name);
            }
            next.keys.insert(id, entry.clone());
        }
        next
    }
}

struct VaultInner {
    registry: ArcSwap<Registry>,
    name_locks: DashMap<String, Arc<Mutex<()>>>,
    store: Arc<dyn KeyStore>,
    audit: AuditPipeline,
    options: VaultOptions,
    reporters: RwLock<Vec<Arc<dyn UsageReporter>>>,
}

/// Key lifecycle and cryptographic operations by key name.
///
/// Reads (encrypt, decrypt, sign, verify) work from one immutable registry
/// snapshot and never lock. Mutations of a key name are serialized by a
/// per-name lock and published with a single pointer swap.
#[derive(Clone)]
pub struct KeyVault {
    inner: Arc<VaultInner>,
}

impl KeyVault {
    pub fn new(
        store: Arc<dyn KeyStore>,
        audit: AuditPipeline,
        options: VaultOptions,
    ) -> Result<Self, VaultError> {
        let registry = load_registry(store.as_ref())?;
        tracing::info!(
            keys = registry.keys.len(),
            active = registry.active.len(),
            "Key vault loaded"
        );

        Ok(Self {
            inner: Arc::new(VaultInner {
                registry: ArcSwap::from_pointee(registry),
                name_locks: DashMap::new(),
                store,
                audit,
                options,
                reporters: RwLock::new(Vec::new()),
            }),
        })
    }

    pub fn in_memory(audit: AuditPipeline, options: VaultOptions) -> Self {
        Self {
            inner: Arc::new(VaultInner {
                registry: ArcSwap::from_pointee(Registry::default()),
                name_locks: DashMap::new(),
                store: Arc::new(MemoryKeyStore::new()),
                audit,
                options,
                reporters: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn register_usage_reporter(&self, reporter: Arc<dyn UsageReporter>) {
        tracing::debug!(reporter = reporter.name(), "Registered key usage reporter");
        self.inner.reporters.write().push(reporter);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create the first key for `name`. Fails if an active key exists.
    pub fn generate_key(&self, name: &str, kind: KeyKind) -> Result<String, VaultError> {
        validate_name(name)?;
        let lock = self.lock_for(name);
        let _guard = lock.lock();

        if let Some(existing) = self.inner.registry.load().active_entry(name) {
            self.audit(
                "key_generate_rejected",
                AuditOutcome::Failure,
                Details::new()
                    .with("key_name", name)
                    .with("active_key_id", &existing.info.id),
            );
            return Err(VaultError::KeyExists(name.to_string()));
        }

        let id = self.create_locked(name, kind)?;
        self.audit(
            "key_generated",
            AuditOutcome::Success,
            Details::new()
                .with("key_name", name)
                .with("key_id", &id)
                .with("kind", kind.as_str()),
        );
        Ok(id)
    }

    /// Active key id for `name`, creating the key on first use.
    pub fn ensure_key(&self, name: &str, kind: KeyKind) -> Result<String, VaultError> {
        validate_name(name)?;
        if let Some(entry) = self.inner.registry.load().active_entry(name) {
            check_kind(name, entry, kind)?;
            return Ok(entry.info.id.clone());
        }

        let lock = self.lock_for(name);
        let _guard = lock.lock();
        if let Some(entry) = self.inner.registry.load().active_entry(name) {
            check_kind(name, entry, kind)?;
            return Ok(entry.info.id.clone());
        }

        let id = self.create_locked(name, kind)?;
        self.audit(
            "key_provisioned",
            AuditOutcome::Success,
            Details::new()
                .with("key_name", name)
                .with("key_id", &id)
                .with("kind", kind.as_str()),
        );
        Ok(id)
    }

    /// Replace the active key of `name` with a fresh one of the same kind.
    ///
    /// The old key becomes `rotated` and stays usable for decryption and
    /// verification until retired.
    pub fn rotate_key(&self, name: &str) -> Result<String, VaultError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock();

        let registry = self.inner.registry.load();
        let old = registry
            .active_entry(name)
            .cloned()
            .ok_or_else(|| VaultError::KeyNotFound(name.to_string()))?;

        let kind = old.info.kind;
        let material = KeyMaterial::generate(kind, self.inner.options.rsa_bits)?;
        let new_info = KeyInfo::new(name, kind, registry.next_version(name));

        // New record first: a crash before the old record is updated leaves two
        // active records, which loading resolves in favour of the newer one.
        self.persist(&new_info, Some(&material))?;

        let mut old_info = old.info.clone();
        old_info.status = KeyStatus::Rotated;
        old_info.rotated_at = Some(Utc::now());
        old_info.superseded_by = Some(new_info.id.clone());
        if let Err(e) = self.persist(&old_info, old.material.as_deref()) {
            tracing::error!(
                error = %e,
                key_id = %old_info.id,
                "Failed to persist rotated key record; it will be demoted on next load"
            );
        }

        let new_id = new_info.id.clone();
        let old_entry = Arc::new(old.with_info(old_info, true));
        let new_entry = Arc::new(KeyEntry {
            info: new_info,
            material: Some(Arc::new(material)),
            usage: Arc::new(AtomicUsize::new(0)),
        });
        self.inner
            .registry
            .rcu(|current| current.with(&[old_entry.clone(), new_entry.clone()]));

        metrics::counter!("key_operations_total", "op" => "rotate").increment(1);
        tracing::info!(key_name = name, old_key_id = %old.info.id, new_key_id = %new_id, "Key rotated");
        self.audit(
            "key_rotated",
            AuditOutcome::Success,
            Details::new()
                .with("key_name", name)
                .with("old_key_id", &old.info.id)
                .with("new_key_id", &new_id),
        );
        Ok(new_id)
    }

    /// Destroy the material of a rotated key.
    ///
    /// Refused while the key is active or while anything is still sealed
    /// under it. Retiring an already retired key is a no-op.
    pub fn retire_key(&self, name: &str, key_id: &str) -> Result<(), VaultError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock();

        let registry = self.inner.registry.load();
        let entry = registry
            .keys
            .get(key_id)
            .filter(|e| e.info.name == name)
            .cloned()
            .ok_or_else(|| VaultError::KeyNotFound(key_id.to_string()))?;

        match entry.info.status {
            KeyStatus::Retired => {
                tracing::debug!(key_id, "Key already retired");
                return Ok(());
            }
            KeyStatus::Active => {
                self.audit(
                    "key_retire_rejected",
                    AuditOutcome::Failure,
                    Details::new()
                        .with("key_name", name)
                        .with("key_id", key_id)
                        .with("reason", "active"),
                );
                return Err(VaultError::KeyActive(key_id.to_string()));
            }
            KeyStatus::Rotated => {}
        }

        // Pairs with the fence in `seal_with_active`: an encryption that
        // missed the rotation has already reserved its count.
        fence(Ordering::SeqCst);
        let outstanding = self.outstanding_for(&entry);
        if outstanding > 0 {
            self.audit(
                "key_retire_rejected",
                AuditOutcome::Failure,
                Details::new()
                    .with("key_name", name)
                    .with("key_id", key_id)
                    .with("reason", "in_use")
                    .with("outstanding", outstanding),
            );
            return Err(VaultError::KeyInUse {
                key_id: key_id.to_string(),
                outstanding,
            });
        }

        let mut info = entry.info.clone();
        info.status = KeyStatus::Retired;
        info.retired_at = Some(Utc::now());
        self.persist(&info, None)?;

        let retired = Arc::new(entry.with_info(info, false));
        self.inner
            .registry
            .rcu(|current| current.with(std::slice::from_ref(&retired)));

        metrics::counter!("key_operations_total", "op" => "retire").increment(1);
        tracing::info!(key_name = name, key_id, "Key retired, material destroyed");
        self.audit(
            "key_retired",
            AuditOutcome::Success,
            Details::new().with("key_name", name).with("key_id", key_id),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Symmetric
    // ------------------------------------------------------------------

    pub fn encrypt_symmetric(&self, name: &str, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let sealed = self.seal_with_active(name, KeyKind::Symmetric, |entry| {
            let key = symmetric_key(entry)?;
            let aad = Envelope::aad(Algorithm::Aes256Gcm, &entry.info.id);
            let (nonce, ciphertext) = aead_seal(key, plaintext, &aad)?;
            Envelope::new(Algorithm::Aes256Gcm, &entry.info.id, &ciphertext)
                .with_nonce(&nonce)
                .to_bytes()
        })?;

        metrics::counter!("key_operations_total", "op" => "encrypt").increment(1);
        Ok(sealed)
    }

    pub fn decrypt_symmetric(&self, name: &str, ciphertext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let envelope = Envelope::parse(ciphertext)?;
        envelope.expect(Algorithm::Aes256Gcm)?;

        let registry = self.inner.registry.load();
        let entry = self.entry_for(&registry, name, &envelope.key_id)?;

        let opened = symmetric_key(entry).and_then(|key| {
            let aad = Envelope::aad(Algorithm::Aes256Gcm, &entry.info.id);
            aead_open(key, &envelope.nonce_bytes()?, &envelope.data_bytes()?, &aad)
        });
        metrics::counter!("key_operations_total", "op" => "decrypt").increment(1);
        opened.map_err(|e| self.decrypt_failed(name, &envelope.key_id, e))
    }

    // ------------------------------------------------------------------
    // Asymmetric
    // ------------------------------------------------------------------

    pub fn encrypt_asymmetric(&self, name: &str, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let sealed = self.seal_with_active(name, KeyKind::Asymmetric, |entry| {
            let material = entry.material()?;
            let data_key = random_data_key();
            let aad = Envelope::aad(Algorithm::RsaOaepAes256Gcm, &entry.info.id);
            let (nonce, ciphertext) = aead_seal(&data_key[..], plaintext, &aad)?;
            let wrapped = material.wrap_key(&data_key[..])?;

            Envelope::new(Algorithm::RsaOaepAes256Gcm, &entry.info.id, &ciphertext)
                .with_nonce(&nonce)
                .with_wrapped_key(&wrapped)
                .to_bytes()
        })?;

        metrics::counter!("key_operations_total", "op" => "encrypt").increment(1);
        Ok(sealed)
    }

    pub fn decrypt_asymmetric(&self, name: &str, ciphertext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let envelope = Envelope::parse(ciphertext)?;
        envelope.expect(Algorithm::RsaOaepAes256Gcm)?;

        let registry = self.inner.registry.load();
        let entry = self.entry_for(&registry, name, &envelope.key_id)?;

        let opened = entry.material().and_then(|material| {
            let data_key = material.unwrap_key(&envelope.wrapped_key_bytes()?)?;
            let aad = Envelope::aad(Algorithm::RsaOaepAes256Gcm, &entry.info.id);
            aead_open(&data_key, &envelope.nonce_bytes()?, &envelope.data_bytes()?, &aad)
        });
        metrics::counter!("key_operations_total", "op" => "decrypt").increment(1);
        opened.map_err(|e| self.decrypt_failed(name, &envelope.key_id, e))
    }

    /// Signature envelope over `message` with the active key of `name`.
    pub fn sign(&self, name: &str, message: &[u8]) -> Result<Vec<u8>, VaultError> {
        let registry = self.inner.registry.load();
        let entry = active_of_kind(&registry, name, KeyKind::Asymmetric)?;
        let signature = entry.material()?.sign(message)?;

        metrics::counter!("key_operations_total", "op" => "sign").increment(1);
        Envelope::new(Algorithm::RsaPkcs1v15Sha256, &entry.info.id, &signature).to_bytes()
    }

    /// Check a signature envelope. Works for signatures made before a rotation.
    pub fn verify(&self, name: &str, message: &[u8], signature: &[u8]) -> Result<bool, VaultError> {
        let envelope = Envelope::parse(signature)?;
        envelope.expect(Algorithm::RsaPkcs1v15Sha256)?;

        let registry = self.inner.registry.load();
        let entry = self.entry_for(&registry, name, &envelope.key_id)?;

        metrics::counter!("key_operations_total", "op" => "verify").increment(1);
        entry.material()?.verify(message, &envelope.data_bytes()?)
    }

    pub fn public_key_pem(&self, name: &str) -> Result<String, VaultError> {
        let registry = self.inner.registry.load();
        active_of_kind(&registry, name, KeyKind::Asymmetric)?
            .material()?
            .public_pem()
    }

    // ------------------------------------------------------------------
    // Migration and accounting
    // ------------------------------------------------------------------

    /// Re-seal `ciphertext` under the active key of `name`.
    ///
    /// Returns the input unchanged when it already uses the active key.
    pub fn reencrypt(&self, name: &str, ciphertext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let envelope = Envelope::parse(ciphertext)?;
        let active_id = self
            .active_key_id(name)
            .ok_or_else(|| VaultError::KeyNotFound(name.to_string()))?;
        if envelope.key_id == active_id {
            return Ok(ciphertext.to_vec());
        }

        let fresh = match envelope.algorithm {
            Algorithm::Aes256Gcm => {
                let plaintext = Zeroizing::new(self.decrypt_symmetric(name, ciphertext)?);
                self.encrypt_symmetric(name, &plaintext)?
            }
            Algorithm::RsaOaepAes256Gcm => {
                let plaintext = Zeroizing::new(self.decrypt_asymmetric(name, ciphertext)?);
                self.encrypt_asymmetric(name, &plaintext)?
            }
            Algorithm::RsaPkcs1v15Sha256 => {
                return Err(VaultError::MalformedCiphertext(
                    "signatures cannot be re-encrypted".to_string(),
                ))
            }
        };

        self.release_id(&envelope.key_id);
        metrics::counter!("key_operations_total", "op" => "reencrypt").increment(1);
        Ok(fresh)
    }

    /// Forget a ciphertext the caller has deleted.
    pub fn release(&self, ciphertext: &[u8]) -> Result<(), VaultError> {
        let envelope = Envelope::parse(ciphertext)?;
        self.release_id(&envelope.key_id);
        Ok(())
    }

    /// Items still sealed under `key_id`, per this process and every reporter.
    pub fn outstanding(&self, key_id: &str) -> usize {
        match self.inner.registry.load().keys.get(key_id) {
            Some(entry) => self.outstanding_for(entry),
            None => 0,
        }
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    pub fn active_key_id(&self, name: &str) -> Option<String> {
        self.inner.registry.load().active.get(name).cloned()
    }

    pub fn key_info(&self, key_id: &str) -> Option<KeyInfo> {
        self.inner
            .registry
            .load()
            .keys
            .get(key_id)
            .map(|e| e.info.clone())
    }

    pub fn list_keys(&self) -> Vec<KeyInfo> {
        let mut keys: Vec<KeyInfo> = self
            .inner
            .registry
            .load()
            .keys
            .values()
            .map(|e| e.info.clone())
            .collect();
        keys.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        keys
    }

    /// Key id embedded in a ciphertext or signature envelope.
    pub fn key_id_of(&self, ciphertext: &[u8]) -> Result<String, VaultError> {
        Ok(Envelope::parse(ciphertext)?.key_id)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.inner
            .name_locks
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Run `seal` with the active key of `name`, counted as outstanding.
    ///
    /// The usage count is taken before sealing and the key is checked to
    /// still be active afterwards. `retire_key` reads the count only after a
    /// rotation has been published, so either it sees this reservation and
    /// refuses, or this call sees the rotation and retries with the new key.
    fn seal_with_active<F>(&self, name: &str, kind: KeyKind, seal: F) -> Result<Vec<u8>, VaultError>
    where
        F: Fn(&KeyEntry) -> Result<Vec<u8>, VaultError>,
    {
        loop {
            let entry = active_of_kind(&self.inner.registry.load(), name, kind)?.clone();
            entry.usage.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);

            if self.inner.registry.load().active.get(name) != Some(&entry.info.id) {
                unreserve(&entry);
                tracing::debug!(key_name = name, key_id = %entry.info.id, "Key rotated during encryption; retrying");
                continue;
            }

            return seal(&*entry).map_err(|e| {
                unreserve(&entry);
                e
            });
        }
    }

    /// Caller holds the name lock.
    fn create_locked(&self, name: &str, kind: KeyKind) -> Result<String, VaultError> {
        let version = self.inner.registry.load().next_version(name);
        let material = KeyMaterial::generate(kind, self.inner.options.rsa_bits)?;
        let info = KeyInfo::new(name, kind, version);
        self.persist(&info, Some(&material))?;

        let id = info.id.clone();
        let entry = Arc::new(KeyEntry {
            info,
            material: Some(Arc::new(material)),
            usage: Arc::new(AtomicUsize::new(0)),
        });
        self.inner
            .registry
            .rcu(|current| current.with(std::slice::from_ref(&entry)));

        metrics::counter!("key_operations_total", "op" => "generate").increment(1);
        tracing::info!(key_name = name, key_id = %id, kind = kind.as_str(), version, "Key generated");
        Ok(id)
    }

    fn persist(&self, info: &KeyInfo, material: Option<&KeyMaterial>) -> Result<(), VaultError> {
        let material = match material {
            Some(m) => Some(general_purpose::STANDARD.encode(&m.to_bytes()?[..])),
            None => None,
        };
        self.inner.store.save(&StoredKey {
            info: info.clone(),
            material,
        })
    }

    fn entry_for<'a>(
        &self,
        registry: &'a Registry,
        name: &str,
        key_id: &str,
    ) -> Result<&'a Arc<KeyEntry>, VaultError> {
        let entry = registry
            .keys
            .get(key_id)
            .filter(|e| e.info.name == name)
            .ok_or_else(|| VaultError::KeyNotFound(key_id.to_string()))?;

        if entry.info.status == KeyStatus::Retired {
            self.audit(
                "decrypt_with_retired_key",
                AuditOutcome::Failure,
                Details::new().with("key_name", name).with("key_id", key_id),
            );
            return Err(VaultError::KeyRetired(key_id.to_string()));
        }
        Ok(entry)
    }

    fn decrypt_failed(&self, name: &str, key_id: &str, err: VaultError) -> VaultError {
        tracing::warn!(key_name = name, key_id, error = %err, "Decryption failed");
        self.audit(
            "decrypt_failed",
            AuditOutcome::Failure,
            Details::new()
                .with("key_name", name)
                .with("key_id", key_id)
                .with("error", err.to_string()),
        );
        err
    }

    fn release_id(&self, key_id: &str) {
        if let Some(entry) = self.inner.registry.load().keys.get(key_id) {
            unreserve(entry);
        }
    }

    fn outstanding_for(&self, entry: &KeyEntry) -> usize {
        let local = entry.usage.load(Ordering::SeqCst);
        let reported: usize = self
            .inner
            .reporters
            .read()
            .iter()
            .map(|r| r.outstanding(&entry.info.id))
            .sum();
        local + reported
    }

    fn audit(&self, action: &str, outcome: AuditOutcome, details: Details) {
        self.inner.audit.record(
            AuditEntry::new(AuditCategory::KeyManagement, action, SYSTEM_USER, outcome)
                .details(details),
        );
    }
}

fn unreserve(entry: &KeyEntry) {
    let _ = entry
        .usage
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

fn validate_name(name: &str) -> Result<(), VaultError> {
    if name.trim().is_empty() {
        return Err(VaultError::InvalidInput("key name must not be empty".to_string()));
    }
    Ok(())
}

fn check_kind(name: &str, entry: &KeyEntry, kind: KeyKind) -> Result<(), VaultError> {
    if entry.info.kind != kind {
        return Err(VaultError::WrongKeyKind {
            name: name.to_string(),
            expected: kind,
        });
    }
    Ok(())
}

fn active_of_kind<'a>(
    registry: &'a Registry,
    name: &str,
    kind: KeyKind,
) -> Result<&'a Arc<KeyEntry>, VaultError> {
    let entry = registry
        .active_entry(name)
        .ok_or_else(|| VaultError::KeyNotFound(name.to_string()))?;
    check_kind(name, entry, kind)?;
    Ok(entry)
}

fn symmetric_key(entry: &KeyEntry) -> Result<&[u8], VaultError> {
    entry
        .material()?
        .symmetric_key()
        .map(|k| &k[..])
        .ok_or_else(|| VaultError::WrongKeyKind {
            name: entry.info.name.clone(),
            expected: KeyKind::Symmetric,
        })
}

/// Build the registry from stored records, demoting stale active records
/// left behind by an interrupted rotation.
fn load_registry(store: &dyn KeyStore) -> Result<Registry, VaultError> {
    let mut stored = store.load_all()?;
    stored.sort_by(|a, b| {
        a.info
            .name
            .cmp(&b.info.name)
            .then(b.info.version.cmp(&a.info.version))
    });

    let mut registry = Registry::default();
    for record in &stored {
        let mut info = record.info.clone();

        let material = match (&record.material, info.status) {
            (_, KeyStatus::Retired) => None,
            (Some(encoded), _) => {
                let bytes = Zeroizing::new(general_purpose::STANDARD.decode(encoded).map_err(|e| {
                    VaultError::Storage(format!("Invalid material encoding for {}: {}", info.id, e))
                })?);
                Some(Arc::new(KeyMaterial::from_bytes(info.kind, &bytes)?))
            }
            (None, _) => {
                return Err(VaultError::Storage(format!(
                    "Key {} is {} but has no material",
                    info.id,
                    info.status.as_str()
                )))
            }
        };

        // Newest version of each name is visited first.
        if info.is_active() {
            if let Some(winner) = registry.active.get(&info.name).cloned() {
                tracing::warn!(
                    key_id = %info.id,
                    superseded_by = %winner,
                    "Demoting stale active key left by interrupted rotation"
                );
                info.status = KeyStatus::Rotated;
                info.rotated_at = Some(Utc::now());
                info.superseded_by = Some(winner);
                store.save(&StoredKey {
                    info: info.clone(),
                    material: record.material.clone(),
                })?;
            }
        }

        let entry = Arc::new(KeyEntry {
            info,
            material,
            usage: Arc::new(AtomicUsize::new(0)),
        });
        registry = registry.with(std::slice::from_ref(&entry));
    }

    Ok(registry)
}
