//! Credential sealing for `system_config`.
//!
//! Controller API keys and legacy-login passwords are stored AES-256-GCM
//! encrypted under a key derived from the database password with
//! PBKDF2-HMAC-SHA256. Changing `POSTGRES_PASSWORD` therefore invalidates
//! stored credentials; decryption failure yields the empty string so the
//! operator is prompted to re-enter them rather than crashing the app.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;

use gatewatch_core::{Error, Result};

const KEY_SALT: &[u8] = b"gatewatch-credential-store";
const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;

fn derive_key(db_password: &str) -> Key<Aes256Gcm> {
    let bytes = pbkdf2_hmac_array::<Sha256, 32>(db_password.as_bytes(), KEY_SALT, PBKDF2_ITERATIONS);
    *Key::<Aes256Gcm>::from_slice(&bytes)
}

/// Encrypt a credential for storage. Output is base64(nonce || ciphertext).
pub fn encrypt_credential(plaintext: &str, db_password: &str) -> Result<String> {
    let cipher = Aes256Gcm::new(&derive_key(db_password));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| Error::Config("Credential encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(blob))
}

/// Decrypt a stored credential. Any failure (bad base64, wrong key, tampered
/// data) yields the empty string.
pub fn decrypt_credential(encoded: &str, db_password: &str) -> String {
    let Ok(blob) = BASE64.decode(encoded) else {
        return String::new();
    };
    if blob.len() <= NONCE_LEN {
        return String::new();
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(&derive_key(db_password));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .ok()
        .and_then(|plain| String::from_utf8(plain).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let encrypted = encrypt_credential("super-secret-api-key", "dbpass").unwrap();
        assert_ne!(encrypted, "super-secret-api-key");
        assert_eq!(decrypt_credential(&encrypted, "dbpass"), "super-secret-api-key");
    }

    #[test]
    fn test_wrong_password_yields_empty() {
        let encrypted = encrypt_credential("super-secret", "dbpass").unwrap();
        assert_eq!(decrypt_credential(&encrypted, "other-pass"), "");
    }

    #[test]
    fn test_garbage_input_yields_empty() {
        assert_eq!(decrypt_credential("not base64 at all!!", "dbpass"), "");
        assert_eq!(decrypt_credential("", "dbpass"), "");
        assert_eq!(decrypt_credential("QUJD", "dbpass"), ""); // too short
    }

    #[test]
    fn test_nonce_makes_output_nondeterministic() {
        let a = encrypt_credential("same", "dbpass").unwrap();
        let b = encrypt_credential("same", "dbpass").unwrap();
        assert_ne!(a, b);
        assert_eq!(decrypt_credential(&a, "dbpass"), decrypt_credential(&b, "dbpass"));
    }
}
