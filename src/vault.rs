//! Secrets at rest — AES-256-GCM encryption and Argon2id hashing.
//!
//! Provider API keys held in tenant configuration may optionally be
//! encrypted on disk with these primitives. Client-key secrets are never
//! encrypted (reversible) — they are hashed with `hash_secret` and checked
//! with `verify_secret`, never decrypted.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::RngCore;
use zeroize::Zeroize;

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Derive a 256-bit key from a passphrase using Argon2id.
pub fn derive_key(passphrase: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase, salt, &mut key)
        .expect("Argon2 key derivation failed");
    key
}

/// Encrypt plaintext with AES-256-GCM. Returns salt(32) || nonce(12) || ciphertext.
pub fn encrypt(plaintext: &[u8], passphrase: &[u8]) -> Vec<u8> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let mut key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).expect("key length");
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-GCM encryption failed");

    key.zeroize();

    let mut result = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&salt);
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    result
}

/// Decrypt ciphertext produced by `encrypt`.
pub fn decrypt(data: &[u8], passphrase: &[u8]) -> anyhow::Result<Vec<u8>> {
    if data.len() < SALT_LEN + NONCE_LEN + 16 {
        anyhow::bail!("ciphertext too short");
    }

    let salt = &data[..SALT_LEN];
    let nonce_bytes = &data[SALT_LEN..SALT_LEN + NONCE_LEN];
    let ciphertext = &data[SALT_LEN + NONCE_LEN..];

    let mut key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).expect("key length");
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("decryption failed — wrong passphrase or corrupted data"))?;

    key.zeroize();
    Ok(plaintext)
}

/// Hash a client-key secret with Argon2id, for storage. Never reversible.
pub fn hash_secret(secret: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("secret hashing failed: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a client-key secret against a stored Argon2id hash.
pub fn verify_secret(secret: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok()
}
