use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, aead::Aead, aead::KeyInit, aead::Payload};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct MasterKey(pub(crate) [u8; 32]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Zeroize for MasterKey {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// AEAD sealing shared by the key-value store and the image files.
#[derive(Clone)]
pub struct SecretCrypto {
    key: MasterKey,
}

impl SecretCrypto {
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key.0))
    }

    /// Output layout is `nonce || ciphertext`.
    pub fn seal(&self, aad_label: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut ciphertext = self
            .cipher()
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: aad_label.as_bytes(),
                },
            )
            .map_err(|e| CryptoError::Seal(format!("{e:?}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.append(&mut ciphertext);
        Ok(out)
    }

    pub fn open(&self, aad_label: &str, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce_bytes, ct) = blob.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ct,
                    aad: aad_label.as_bytes(),
                },
            )
            .map_err(|e| CryptoError::Open(format!("{e:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let crypto = SecretCrypto::new(MasterKey([7u8; 32]));
        let plaintext = b"hello-secret";
        let ct = crypto.seal("credential1", plaintext).expect("seal");
        assert_ne!(&ct[NONCE_LEN..], plaintext);
        let pt = crypto.open("credential1", &ct).expect("open");
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn open_rejects_wrong_label() {
        let crypto = SecretCrypto::new(MasterKey([7u8; 32]));
        let ct = crypto.seal("credential1", b"x").unwrap();
        assert!(matches!(
            crypto.open("credential2", &ct),
            Err(CryptoError::Open(_))
        ));
    }

    #[test]
    fn open_rejects_short_blob() {
        let crypto = SecretCrypto::new(MasterKey([1u8; 32]));
        assert!(matches!(crypto.open("x", &[0u8; 4]), Err(CryptoError::Truncated)));
    }
}
