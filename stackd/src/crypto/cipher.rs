//! Encryption of repository credentials at rest

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::errors::StackError;
use crate::filesys::file::File;

/// Prefix marking an encrypted credential token.
const TOKEN_PREFIX: &str = "enc1:";

const NONCE_LEN: usize = 12;

/// Narrow encrypt/decrypt interface used when persisting credentials
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, StackError>;
    fn decrypt(&self, token: &str) -> Result<String, StackError>;
}

/// AES-256-GCM cipher. Tokens are `enc1:` + base64(nonce || ciphertext).
pub struct AesGcmCipher {
    key: [u8; 32],
}

impl AesGcmCipher {
    /// Derive the key from arbitrary secret material
    pub fn from_secret(secret: &[u8]) -> Self {
        let key: [u8; 32] = Sha256::digest(secret).into();
        Self { key }
    }

    /// Load the key file, generating a random key on first use
    pub async fn load_or_generate(file: &File) -> Result<Self, StackError> {
        if file.exists().await {
            let encoded = file.read_string().await?;
            let secret = BASE64
                .decode(encoded.trim())
                .map_err(|e| StackError::CipherError(format!("invalid key file: {e}")))?;
            return Ok(Self::from_secret(&secret));
        }

        info!("Generating credential key at {}", file.path().display());
        let secret: [u8; 32] = rand::random();
        file.write_atomic(BASE64.encode(secret).as_bytes()).await?;
        file.set_permissions_600().await?;
        Ok(Self::from_secret(&secret))
    }
}

impl CredentialCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, StackError> {
        let cipher = Aes256Gcm::new((&self.key).into());
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| StackError::CipherError("encryption failed".to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(format!("{TOKEN_PREFIX}{}", BASE64.encode(&combined)))
    }

    fn decrypt(&self, token: &str) -> Result<String, StackError> {
        let encoded = token
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| StackError::CipherError("not an encrypted token".to_string()))?;
        let combined = BASE64
            .decode(encoded)
            .map_err(|e| StackError::CipherError(e.to_string()))?;
        if combined.len() <= NONCE_LEN {
            return Err(StackError::CipherError("token too short".to_string()));
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new((&self.key).into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StackError::CipherError("decryption failed (wrong key?)".to_string()))?;
        String::from_utf8(plaintext).map_err(|e| StackError::CipherError(e.to_string()))
    }
}
