//! Message authentication and optional payload encryption.
//!
//! Signing is a collaborator: transports never call it themselves, the broker path and
//! the application consult a [`MessageSigner`] before send and after receive.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Signing service consulted around transport send/receive.
pub trait MessageSigner: Send + Sync {
    /// Public key advertised next to each signature.
    fn public_key(&self) -> Vec<u8>;
    fn sign(&self, bytes: &[u8]) -> Vec<u8>;
    fn verify(&self, bytes: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// Ed25519 signer. The key is generated per process unless restored from secret bytes.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl MessageSigner for Ed25519Signer {
    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }

    fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.key.sign(bytes).to_bytes().to_vec()
    }

    fn verify(&self, bytes: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(pk) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(vk) = VerifyingKey::from_bytes(&pk) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        vk.verify(bytes, &sig).is_ok()
    }
}

/// Whether inbound envelopes without a signature are accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignaturePolicy {
    #[default]
    AllowUnsigned,
    RequireSigned,
}

/// Derive a 32-byte payload key from a shared secret (e.g. a team passphrase).
pub fn derive_payload_key(shared_secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"sitrep-payload-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// ChaCha20-Poly1305 payload cipher. Output is `nonce || ciphertext`, base64 text.
#[derive(Clone)]
pub struct PayloadCipher {
    key: [u8; 32],
}

impl PayloadCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn from_shared_secret(secret: &str) -> Self {
        Self::new(derive_payload_key(secret.as_bytes()))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::Key)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
        let sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, text: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = BASE64.decode(text).map_err(|_| CryptoError::Encoding)?;
        if raw.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::Key)?;
        cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadCipher(..)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("invalid base64")]
    Encoding,
}
