//! Plugin code signing and verification
//!
//! Each runtime instance holds one RSA key pair in memory. Signing hashes the
//! plugin file, followed by its sidecar manifest when one exists, with SHA-256
//! and signs the digest with PKCS#1 v1.5; the stored
//! record carries the hash, the hex signature and the signer's PKCS#1 PEM
//! public key. Verification re-hashes the file and checks the record in a
//! fixed order, stopping at the first failure:
//!
//! 1. a signature exists
//! 2. it is not revoked
//! 3. it has not expired
//! 4. the hash of the file and manifest matches the signed hash
//! 5. the certificate belongs to this runtime or a trusted signer
//! 6. the RSA signature is valid for the hash
//!
//! Every step that fails leaves its own entry in the security event log.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey, LineEnding};
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::digest::Output;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SecurityConfig;
use crate::error::{Result, RuntimeError};
use crate::plugins::loader::manifest_path;

/// Why a plugin failed signature verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("no signature found for plugin")]
    Missing,

    #[error("plugin signature has been revoked")]
    Revoked,

    #[error("plugin signature has expired")]
    Expired,

    #[error("failed to read plugin code: {0}")]
    Unreadable(String),

    #[error("plugin code has been modified (hash mismatch)")]
    HashMismatch,

    #[error("invalid signature: {0}")]
    Invalid(String),

    #[error("signer '{0}' is not trusted")]
    UntrustedSigner(String),

    #[error("no private key available for signing")]
    NoKey,
}

/// A signature record for one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSignature {
    pub plugin_id: String,
    /// Hex SHA-256 of the plugin file.
    pub hash: String,
    /// Hex PKCS#1 v1.5 signature over the raw digest.
    pub signature: String,
    /// PKCS#1 PEM public key of the signer.
    pub certificate: String,
    pub signed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub signed_by: String,
    pub revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl PluginSignature {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Signed, not revoked, not expired. Says nothing about the file on disk.
    pub fn is_valid(&self) -> bool {
        !self.revoked && !self.is_expired()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Failed,
    Denied,
}

/// One entry of the security event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_id: String,
    pub plugin_id: String,
    /// `generate_keys`, `sign`, `verify`, `revoke`, `trust`, `untrust`,
    /// `import_signatures` or `clear_signatures`.
    pub event_type: String,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub details: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecurityStats {
    pub total_signatures: usize,
    pub trusted_keys: usize,
    pub audit_events: usize,
    pub revoked: usize,
    pub expired: usize,
    pub verified: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignatureExport {
    timestamp: DateTime<Utc>,
    signatures: HashMap<String, PluginSignature>,
}

struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    public_pem: String,
}

const SYSTEM: &str = "system";

// ---------------------------------------------------------------------------
// SignatureVerifier
// ---------------------------------------------------------------------------

/// Signs plugin files and verifies them against stored signatures.
pub struct SignatureVerifier {
    signer: String,
    key_bits: usize,
    validity: Duration,
    event_capacity: usize,
    keys: RwLock<Option<KeyPair>>,
    signatures: RwLock<HashMap<String, PluginSignature>>,
    /// Signer name to PEM public key.
    trusted_keys: RwLock<HashMap<String, String>>,
    events: Mutex<VecDeque<SecurityEvent>>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("signer", &self.signer)
            .field("key_bits", &self.key_bits)
            .field("has_key", &self.keys.read().is_some())
            .field("signatures", &self.signatures.read().len())
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    /// Create a verifier without key material. Call
    /// [`generate_key_pair`](Self::generate_key_pair) before signing.
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            signer: config.signer.clone(),
            key_bits: config.key_bits,
            validity: Duration::days(config.signature_validity_days),
            event_capacity: config.event_capacity.max(1),
            keys: RwLock::new(None),
            signatures: RwLock::new(HashMap::new()),
            trusted_keys: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Generate the runtime key pair, replacing any previous one.
    pub fn generate_key_pair(&self) -> Result<()> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), self.key_bits)
            .map_err(|e| RuntimeError::Crypto(format!("failed to generate key pair: {}", e)))?;
        let public = RsaPublicKey::from(&private);
        let public_pem = public
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| RuntimeError::Crypto(format!("failed to encode public key: {}", e)))?;

        *self.keys.write() = Some(KeyPair {
            private,
            public,
            public_pem,
        });

        info!(bits = self.key_bits, "Generated signing key pair");
        self.log_event(
            SYSTEM,
            "generate_keys",
            EventStatus::Success,
            None,
            [("key_size", self.key_bits.to_string())],
        );
        Ok(())
    }

    pub fn has_key(&self) -> bool {
        self.keys.read().is_some()
    }

    /// PEM public key of this runtime, if one was generated.
    pub fn public_key_pem(&self) -> Option<String> {
        self.keys.read().as_ref().map(|k| k.public_pem.clone())
    }

    /// Hex SHA-256 of a plugin file and its sidecar manifest.
    pub fn plugin_hash(&self, path: &Path) -> Result<String> {
        Ok(hex::encode(content_digest(path)?))
    }

    /// Sign the file at `path` and store the signature for `plugin_id`.
    ///
    /// An existing record for the same plugin, revoked or not, is replaced.
    pub fn sign_plugin(&self, plugin_id: &str, path: &Path) -> Result<PluginSignature> {
        let fail = |source: SignatureError| {
            self.log_event(plugin_id, "sign", EventStatus::Failed, Some(source.to_string()), []);
            RuntimeError::Signature {
                plugin: plugin_id.to_string(),
                source,
            }
        };

        let digest =
            content_digest(path).map_err(|e| fail(SignatureError::Unreadable(e.to_string())))?;
        let hash = hex::encode(digest);

        let (signature, certificate) = {
            let keys = self.keys.read();
            let keys = keys.as_ref().ok_or_else(|| fail(SignatureError::NoKey))?;
            let signature = keys
                .private
                .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
                .map_err(|e| {
                    self.log_event(plugin_id, "sign", EventStatus::Failed, Some(e.to_string()), []);
                    RuntimeError::Crypto(format!("failed to sign plugin: {}", e))
                })?;
            (hex::encode(signature), keys.public_pem.clone())
        };

        let signed_at = Utc::now();
        let record = PluginSignature {
            plugin_id: plugin_id.to_string(),
            hash: hash.clone(),
            signature,
            certificate,
            signed_at,
            expires_at: signed_at + self.validity,
            signed_by: self.signer.clone(),
            revoked: false,
            revoked_at: None,
        };

        self.signatures
            .write()
            .insert(plugin_id.to_string(), record.clone());

        info!(plugin = %plugin_id, hash = %hash, "Signed plugin");
        self.log_event(
            plugin_id,
            "sign",
            EventStatus::Success,
            None,
            [
                ("hash", hash),
                ("expires", record.expires_at.to_rfc3339()),
            ],
        );
        Ok(record)
    }

    /// Check the file at `path` against the stored signature of `plugin_id`.
    pub fn verify_plugin(
        &self,
        plugin_id: &str,
        path: &Path,
    ) -> std::result::Result<(), SignatureError> {
        let outcome = self.verify_inner(plugin_id, path);
        match &outcome {
            Ok(hash) => self.log_event(
                plugin_id,
                "verify",
                EventStatus::Success,
                None,
                [("hash", hash.clone())],
            ),
            Err(e) => {
                let status = match e {
                    SignatureError::Missing | SignatureError::Unreadable(_) => EventStatus::Failed,
                    _ => EventStatus::Denied,
                };
                warn!(plugin = %plugin_id, reason = %e, "Signature verification failed");
                self.log_event(plugin_id, "verify", status, Some(e.to_string()), []);
            }
        }
        outcome.map(|_| ())
    }

    fn verify_inner(
        &self,
        plugin_id: &str,
        path: &Path,
    ) -> std::result::Result<String, SignatureError> {
        let sig = self
            .signatures
            .read()
            .get(plugin_id)
            .cloned()
            .ok_or(SignatureError::Missing)?;

        if sig.revoked {
            return Err(SignatureError::Revoked);
        }
        if sig.is_expired() {
            return Err(SignatureError::Expired);
        }

        let digest = content_digest(path).map_err(|e| SignatureError::Unreadable(e.to_string()))?;
        let hash = hex::encode(digest);
        if hash != sig.hash {
            return Err(SignatureError::HashMismatch);
        }

        let signature = hex::decode(&sig.signature)
            .map_err(|e| SignatureError::Invalid(format!("malformed signature encoding: {}", e)))?;
        let certificate = parse_public_key_pem(&sig.certificate)
            .ok_or_else(|| SignatureError::Invalid("malformed certificate".to_string()))?;

        if !self.is_trusted_certificate(&certificate) {
            return Err(SignatureError::UntrustedSigner(sig.signed_by));
        }

        certificate
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .map_err(|_| SignatureError::Invalid("signature does not match".to_string()))?;

        Ok(hash)
    }

    fn is_trusted_certificate(&self, certificate: &RsaPublicKey) -> bool {
        if self
            .keys
            .read()
            .as_ref()
            .is_some_and(|k| &k.public == certificate)
        {
            return true;
        }
        self.trusted_keys
            .read()
            .values()
            .filter_map(|pem| parse_public_key_pem(pem))
            .any(|key| &key == certificate)
    }

    /// Signed, not revoked and not expired.
    pub fn is_plugin_trusted(&self, plugin_id: &str) -> bool {
        self.signatures
            .read()
            .get(plugin_id)
            .is_some_and(PluginSignature::is_valid)
    }

    /// Mark a signature revoked. Revocation cannot be undone.
    pub fn revoke_signature(&self, plugin_id: &str) -> Result<()> {
        let revoked_at = {
            let mut signatures = self.signatures.write();
            let sig = signatures
                .get_mut(plugin_id)
                .ok_or_else(|| RuntimeError::Signature {
                    plugin: plugin_id.to_string(),
                    source: SignatureError::Missing,
                })?;
            if !sig.revoked {
                sig.revoked = true;
                sig.revoked_at = Some(Utc::now());
            }
            sig.revoked_at.unwrap_or_else(Utc::now)
        };

        warn!(plugin = %plugin_id, "Revoked plugin signature");
        self.log_event(
            plugin_id,
            "revoke",
            EventStatus::Success,
            None,
            [("revoked_at", revoked_at.to_rfc3339())],
        );
        Ok(())
    }

    /// Trust signatures made by `signer_id`'s key.
    pub fn add_trusted_key(&self, signer_id: &str, public_key_pem: &str) -> Result<()> {
        if parse_public_key_pem(public_key_pem).is_none() {
            self.log_event(
                SYSTEM,
                "trust",
                EventStatus::Failed,
                Some("invalid PEM format".to_string()),
                [("signer", signer_id.to_string())],
            );
            return Err(RuntimeError::Crypto(format!(
                "invalid PEM public key for signer '{}'",
                signer_id
            )));
        }

        self.trusted_keys
            .write()
            .insert(signer_id.to_string(), public_key_pem.to_string());
        info!(signer = %signer_id, "Added trusted key");
        self.log_event(
            SYSTEM,
            "trust",
            EventStatus::Success,
            None,
            [("signer", signer_id.to_string())],
        );
        Ok(())
    }

    pub fn remove_trusted_key(&self, signer_id: &str) -> Result<()> {
        if self.trusted_keys.write().remove(signer_id).is_none() {
            return Err(RuntimeError::Crypto(format!(
                "trusted key not found: {}",
                signer_id
            )));
        }
        self.log_event(
            SYSTEM,
            "untrust",
            EventStatus::Success,
            None,
            [("signer", signer_id.to_string())],
        );
        Ok(())
    }

    pub fn trusted_signers(&self) -> Vec<String> {
        let mut signers: Vec<String> = self.trusted_keys.read().keys().cloned().collect();
        signers.sort();
        signers
    }

    pub fn get_signature(&self, plugin_id: &str) -> Option<PluginSignature> {
        self.signatures.read().get(plugin_id).cloned()
    }

    pub fn signatures(&self) -> HashMap<String, PluginSignature> {
        self.signatures.read().clone()
    }

    /// Store a signature record produced elsewhere, replacing any existing one.
    pub fn import_signature(&self, mut signature: PluginSignature, plugin_id: &str) {
        if signature.plugin_id.is_empty() {
            signature.plugin_id = plugin_id.to_string();
        }
        self.signatures
            .write()
            .insert(plugin_id.to_string(), signature);
    }

    /// Write every signature to `path` as JSON.
    pub fn export_signatures(&self, path: &Path) -> Result<()> {
        let export = SignatureExport {
            timestamp: Utc::now(),
            signatures: self.signatures(),
        };
        fs::write(path, serde_json::to_string_pretty(&export)?)?;
        info!(path = %path.display(), count = export.signatures.len(), "Exported signatures");
        Ok(())
    }

    /// Merge signatures from a JSON file written by [`export_signatures`](Self::export_signatures).
    pub fn import_signatures(&self, path: &Path) -> Result<usize> {
        let content = fs::read_to_string(path)?;
        let export: SignatureExport = serde_json::from_str(&content)?;
        let count = export.signatures.len();
        for (plugin_id, signature) in export.signatures {
            self.import_signature(signature, &plugin_id);
        }

        info!(path = %path.display(), count, "Imported signatures");
        self.log_event(
            SYSTEM,
            "import_signatures",
            EventStatus::Success,
            None,
            [("count", count.to_string())],
        );
        Ok(count)
    }

    pub fn clear_signatures(&self) {
        self.signatures.write().clear();
        self.log_event(SYSTEM, "clear_signatures", EventStatus::Success, None, []);
    }

    // -----------------------------------------------------------------------
    // Event log
    // -----------------------------------------------------------------------

    fn log_event<const N: usize>(
        &self,
        plugin_id: &str,
        event_type: &str,
        status: EventStatus,
        error: Option<String>,
        details: [(&str, String); N],
    ) {
        let event = SecurityEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            plugin_id: plugin_id.to_string(),
            event_type: event_type.to_string(),
            status,
            error,
            timestamp: Utc::now(),
            details: details
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        };

        let mut events = self.events.lock();
        if events.len() >= self.event_capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn events_for(&self, plugin_id: &str) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn security_stats(&self) -> SecurityStats {
        let signatures = self.signatures.read();
        let mut stats = SecurityStats {
            total_signatures: signatures.len(),
            trusted_keys: self.trusted_keys.read().len(),
            audit_events: self.events.lock().len(),
            ..Default::default()
        };
        for sig in signatures.values() {
            if sig.revoked {
                stats.revoked += 1;
            }
            if sig.is_expired() {
                stats.expired += 1;
            }
            if sig.is_valid() {
                stats.verified += 1;
            }
        }
        stats
    }
}

/// Accept PKCS#1 (`RSA PUBLIC KEY`) or SPKI (`PUBLIC KEY`) PEM.
fn parse_public_key_pem(pem: &str) -> Option<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_pem(pem)
        .ok()
        .or_else(|| RsaPublicKey::from_public_key_pem(pem).ok())
}

/// Separates the plugin body from its manifest inside the signed digest.
const MANIFEST_SEPARATOR: &[u8] = b"\0manifest\0";

/// SHA-256 over the plugin file followed by its sidecar manifest, if any.
/// The manifest overrides the header metadata, so it is covered too.
fn content_digest(path: &Path) -> std::io::Result<Output<Sha256>> {
    let mut hasher = Sha256::new();
    hasher.update(fs::read(path)?);
    if let Some(manifest) = manifest_path(path).filter(|m| m.is_file()) {
        hasher.update(MANIFEST_SEPARATOR);
        hasher.update(fs::read(manifest)?);
    }
    Ok(hasher.finalize())
}
