//! Credential-at-rest encryption.
//!
//! The specification requires that a session's password never be held in
//! plaintext in memory: it is "encrypted in memory using the process's
//! application certificate's public key" (§3). The certificate-store
//! lifecycle itself is an external collaborator (§1) — this module only
//! consumes a key handle from it. We model that key handle as an
//! AES-256-GCM key (the symmetric key an asymmetric cert-backed envelope
//! would ultimately unwrap to) so the in-memory representation is never the
//! raw password, following the authenticated-encryption idiom the teacher
//! uses for its own credential-at-rest filter.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use rand::RngCore;

use crate::error::{GatewayError, Result};

const NONCE_LEN: usize = 12;

/// A key handle sourced from the application certificate store. In this
/// edge gateway the certificate store's lifecycle (§1 Non-goals) is
/// external; `CredentialKey::ephemeral` stands in for "derive a symmetric
/// key from the loaded application certificate" at process start.
#[derive(Clone)]
pub struct CredentialKey {
    key: Key<Aes256Gcm>,
}

impl CredentialKey {
    pub fn ephemeral() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self {
            key: Key::<Aes256Gcm>::from_slice(&bytes).to_owned(),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: Key::<Aes256Gcm>::from_slice(&bytes).to_owned(),
        }
    }
}

/// A password held only in its encrypted form, decrypted on demand for the
/// single call that builds a session identity.
#[derive(Clone)]
pub struct EncryptedSecret {
    nonce_and_ciphertext: Vec<u8>,
}

impl std::fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSecret").finish_non_exhaustive()
    }
}

impl EncryptedSecret {
    pub fn seal(key: &CredentialKey, plaintext: &str) -> Result<Self> {
        let cipher = Aes256Gcm::new(&key.key);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| GatewayError::Other(anyhow::anyhow!("encrypt credential: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(Self {
            nonce_and_ciphertext: out,
        })
    }

    pub fn unseal(&self, key: &CredentialKey) -> Result<String> {
        if self.nonce_and_ciphertext.len() < NONCE_LEN {
            return Err(GatewayError::Other(anyhow::anyhow!(
                "malformed encrypted credential"
            )));
        }
        let (nonce_bytes, ciphertext) = self.nonce_and_ciphertext.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(&key.key);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| GatewayError::Other(anyhow::anyhow!("decrypt credential: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| GatewayError::Other(anyhow::anyhow!("decrypted credential not utf8: {e}")))
    }

    /// Base64 form, for embedding in diagnostics or logs without ever
    /// exposing the plaintext.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.nonce_and_ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_unseal_round_trip() {
        let key = CredentialKey::ephemeral();
        let secret = EncryptedSecret::seal(&key, "hunter2").unwrap();
        assert_eq!(secret.unseal(&key).unwrap(), "hunter2");
    }

    #[test]
    fn test_wrong_key_fails_to_unseal() {
        let key_a = CredentialKey::ephemeral();
        let key_b = CredentialKey::ephemeral();
        let secret = EncryptedSecret::seal(&key_a, "hunter2").unwrap();
        assert!(secret.unseal(&key_b).is_err());
    }

    #[test]
    fn test_ciphertext_never_contains_plaintext() {
        let key = CredentialKey::ephemeral();
        let secret = EncryptedSecret::seal(&key, "super-secret-password").unwrap();
        assert!(!secret.to_base64().contains("super-secret-password"));
    }
}
