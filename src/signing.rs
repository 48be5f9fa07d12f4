//! Approval signing: Ed25519 attestations over a module's content hash.
//!
//! The signed message is a domain-separated byte string
//! (`APPROVAL_DOMAIN || sha256_digest`), so an approval signature cannot be
//! replayed as a signature over some other kind of payload held by the same key.
//! Signatures travel as lowercase hex of the 64-byte Ed25519 signature.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use std::path::Path;
use tracing::{info, warn};

use crate::identity::ContentHash;

const APPROVAL_DOMAIN: &[u8] = b"evoclaw-gatekeeper/approval/v1:";

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Process-wide approval signer. Key material is fixed after construction.
pub struct ApprovalSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl ApprovalSigner {
    /// Generate a fresh key. Signatures from an ephemeral key stop verifying
    /// once the process restarts.
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Parse a hex-encoded 32-byte secret key.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, SigningError> {
        let s = secret_hex.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidKey("secret key must be 32 bytes".into()))?;
        Ok(Self::from_secret_bytes(&secret))
    }

    /// Load the key at `path`, or create and persist a new one if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, SigningError> {
        let key_file_err = |source: std::io::Error| SigningError::KeyFile {
            path: path.display().to_string(),
            source,
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let signer = Self::from_secret_hex(&contents)?;
                info!(path = %path.display(), public_key = %signer.public_key_hex(), "approval key loaded");
                Ok(signer)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let signer = Self::generate();
                signer.write_secret(path).map_err(key_file_err)?;
                info!(path = %path.display(), public_key = %signer.public_key_hex(), "approval key created");
                Ok(signer)
            }
            Err(e) => Err(key_file_err(e)),
        }
    }

    /// Write the secret key as hex. On unix the file is created with mode 0600.
    pub fn write_secret(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        write_private(path, hex::encode(self.signing_key.to_bytes()).as_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.to_bytes())
    }

    /// Sign an approval of `content_hash`.
    pub fn sign(&self, content_hash: &ContentHash) -> String {
        let sig = self.signing_key.sign(&approval_message(content_hash));
        hex::encode(sig.to_bytes())
    }

    /// True iff `signature` was produced by [`sign`](Self::sign) with this key
    /// for exactly `content_hash`. Malformed input returns false.
    pub fn verify(&self, signature: &str, content_hash: &ContentHash) -> bool {
        let Ok(bytes) = hex::decode(signature) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        let sig = Signature::from_bytes(&sig_bytes);
        self.verifying_key
            .verify_strict(&approval_message(content_hash), &sig)
            .is_ok()
    }
}

/// Log the consequence of running without a persisted key.
pub fn warn_ephemeral(signer: &ApprovalSigner) {
    warn!(
        public_key = %signer.public_key_hex(),
        "using ephemeral approval key; approvals will not verify after restart"
    );
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

fn approval_message(content_hash: &ContentHash) -> Vec<u8> {
    let digest = content_hash.as_bytes();
    let mut msg = Vec::with_capacity(APPROVAL_DOMAIN.len() + digest.len());
    msg.extend_from_slice(APPROVAL_DOMAIN);
    msg.extend_from_slice(digest);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::derive_hash;

    #[test]
    fn test_sign_verify_roundtrip() {
        let signer = ApprovalSigner::generate();
        let h = derive_hash(b"def f(): pass");
        let sig = signer.sign(&h);
        assert_eq!(sig.len(), 128);
        assert!(signer.verify(&sig, &h));
    }

    #[test]
    fn test_signature_bound_to_hash() {
        let signer = ApprovalSigner::generate();
        let h1 = derive_hash(b"def f(): pass");
        let h2 = derive_hash(b"def g(): pass");
        let sig = signer.sign(&h1);
        assert!(!signer.verify(&sig, &h2));
    }

    #[test]
    fn test_distinct_hashes_never_share_a_signature() {
        let signer = ApprovalSigner::generate();
        let h1 = derive_hash(b"def f(): pass");
        let mut text = h1.to_string();
        let last = if text.ends_with('0') { "1" } else { "0" };
        text.replace_range(63..64, last);
        let h2: ContentHash = text.parse().unwrap();

        assert_ne!(h1, h2);
        assert!(!signer.verify(&signer.sign(&h1), &h2));
        assert!(h1.to_string().to_uppercase().parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let a = ApprovalSigner::generate();
        let b = ApprovalSigner::generate();
        let h = derive_hash(b"x");
        assert!(!b.verify(&a.sign(&h), &h));
    }

    #[test]
    fn test_malformed_signatures_rejected() {
        let signer = ApprovalSigner::generate();
        let h = derive_hash(b"x");
        assert!(!signer.verify("", &h));
        assert!(!signer.verify("not hex at all", &h));
        assert!(!signer.verify("abcd", &h));
        assert!(!signer.verify(&"00".repeat(64), &h));

        let mut sig = signer.sign(&h);
        sig.replace_range(0..2, if sig.starts_with("ff") { "00" } else { "ff" });
        assert!(!signer.verify(&sig, &h));
    }

    #[test]
    fn test_deterministic_signatures() {
        let signer = ApprovalSigner::from_secret_bytes(&[7u8; 32]);
        let h = derive_hash(b"x");
        assert_eq!(signer.sign(&h), signer.sign(&h));
    }

    #[test]
    fn test_from_secret_hex() {
        let signer = ApprovalSigner::from_secret_bytes(&[7u8; 32]);
        let same = ApprovalSigner::from_secret_hex(&format!("0x{}\n", "07".repeat(32))).unwrap();
        assert_eq!(signer.public_key_hex(), same.public_key_hex());

        assert!(ApprovalSigner::from_secret_hex("zz").is_err());
        assert!(ApprovalSigner::from_secret_hex("0707").is_err());
    }

    #[test]
    fn test_load_or_create_persists_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("approval.key");

        let first = ApprovalSigner::load_or_create(&path).unwrap();
        assert!(path.exists());
        let second = ApprovalSigner::load_or_create(&path).unwrap();
        assert_eq!(first.public_key_hex(), second.public_key_hex());

        let h = derive_hash(b"x");
        assert!(second.verify(&first.sign(&h), &h));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approval.key");
        ApprovalSigner::load_or_create(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_corrupt_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approval.key");
        std::fs::write(&path, "not a key").unwrap();
        assert!(matches!(
            ApprovalSigner::load_or_create(&path),
            Err(SigningError::InvalidKey(_))
        ));
    }
}
