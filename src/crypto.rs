// AeroBucket Credential Codecs
// Obfuscation (base64 JSON) and passphrase sealing (Argon2id + AES-256-GCM)
// for the remembered-credentials blob

use aes_gcm::{Aes256Gcm, KeyInit, aead::Aead};
use aes_gcm::aead::generic_array::GenericArray;
use argon2::Argon2;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};

pub const ARGON2_MEM_COST: u32 = 65536; // 64MB
pub const ARGON2_TIME_COST: u32 = 3;
pub const ARGON2_PARALLELISM: u32 = 4;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const SEALED_PREFIX: &str = "v1:";

/// Derive a 256-bit key from password + salt using Argon2id
pub fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32], String> {
    let params = argon2::Params::new(
        ARGON2_MEM_COST,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(32),
    ).map_err(|e| format!("Argon2 params: {}", e))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2.hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| format!("Argon2 derive: {}", e))?;
    Ok(key)
}

/// Encrypt plaintext using AES-256-GCM
pub fn encrypt_aes_gcm(key: &[u8; 32], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, String> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(nonce);
    cipher.encrypt(nonce, plaintext)
        .map_err(|e| format!("AES-GCM encrypt: {}", e))
}

/// Decrypt ciphertext using AES-256-GCM
pub fn decrypt_aes_gcm(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, String> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(nonce);
    cipher.decrypt(nonce, ciphertext)
        .map_err(|e| format!("AES-GCM decrypt: {}", e))
}

/// Generate cryptographically secure random bytes using OS entropy
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::rngs::OsRng;
    use rand::RngCore;
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// How the credentials blob is encoded at rest
#[derive(Clone)]
pub enum CredentialCodec {
    /// base64 of the JSON text. Obfuscation only: anyone who can read the
    /// storage can recover the secret key.
    Obfuscated,
    /// Argon2id-derived key + AES-256-GCM.
    /// Blob: `"v1:" + base64(salt[16] || nonce[12] || ciphertext+tag)`
    Passphrase(SecretString),
}

impl std::fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialCodec::Obfuscated => f.write_str("Obfuscated"),
            CredentialCodec::Passphrase(_) => f.write_str("Passphrase(..)"),
        }
    }
}

impl Default for CredentialCodec {
    fn default() -> Self {
        CredentialCodec::Obfuscated
    }
}

impl CredentialCodec {
    pub fn encode(&self, plaintext: &str) -> Result<String, String> {
        match self {
            CredentialCodec::Obfuscated => Ok(BASE64.encode(plaintext.as_bytes())),
            CredentialCodec::Passphrase(passphrase) => {
                let salt = random_bytes(SALT_LEN);
                let nonce = random_bytes(NONCE_LEN);
                let key = derive_key(passphrase.expose_secret(), &salt)?;
                let ciphertext = encrypt_aes_gcm(&key, &nonce, plaintext.as_bytes())?;

                let mut sealed = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
                sealed.extend_from_slice(&salt);
                sealed.extend_from_slice(&nonce);
                sealed.extend_from_slice(&ciphertext);
                Ok(format!("{}{}", SEALED_PREFIX, BASE64.encode(sealed)))
            }
        }
    }

    pub fn decode(&self, blob: &str) -> Result<String, String> {
        let bytes = match self {
            CredentialCodec::Obfuscated => {
                if blob.starts_with(SEALED_PREFIX) {
                    return Err("blob is passphrase-sealed".to_string());
                }
                BASE64.decode(blob.trim()).map_err(|e| format!("base64: {}", e))?
            }
            CredentialCodec::Passphrase(passphrase) => {
                let body = blob
                    .strip_prefix(SEALED_PREFIX)
                    .ok_or_else(|| "blob is not passphrase-sealed".to_string())?;
                let sealed = BASE64.decode(body.trim()).map_err(|e| format!("base64: {}", e))?;
                if sealed.len() < SALT_LEN + NONCE_LEN + 16 {
                    return Err("sealed blob too short".to_string());
                }
                let (salt, rest) = sealed.split_at(SALT_LEN);
                let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
                let key = derive_key(passphrase.expose_secret(), salt)?;
                decrypt_aes_gcm(&key, nonce, ciphertext)?
            }
        };
        String::from_utf8(bytes).map_err(|e| format!("utf-8: {}", e))
    }
}
