//! Encrypted callback envelopes.
//!
//! Once an Encrypt Key is set for the app, every callback arrives as
//! `{"encrypt": base64(iv || aes_256_cbc(json))}` with the AES key being
//! `sha256(encrypt_key)`.

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use sha2::{Digest, Sha256};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

/// Returns the plaintext callback document.
pub fn decrypt_payload(encrypt_key: &str, encrypted: &str) -> Result<Vec<u8>> {
    if encrypt_key.is_empty() {
        bail!("encrypted callback received without a configured encrypt key");
    }
    let raw = STANDARD
        .decode(encrypted.trim())
        .context("decode encrypted payload")?;
    if raw.len() <= IV_LEN {
        bail!("encrypted payload too short ({} bytes)", raw.len());
    }
    let (iv, ciphertext) = raw.split_at(IV_LEN);
    let key = Sha256::digest(encrypt_key.as_bytes());

    Aes256CbcDec::new_from_slices(key.as_slice(), iv)
        .map_err(|e| anyhow!("init cipher: {e}"))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| anyhow!("decrypt payload: {e}"))
}


#[cfg(test)]
mod tests {
    use super::testing::encrypt_payload;
    use super::*;

    #[test]
    fn decrypts_platform_sample() {
        // Sample from the platform's event subscription docs.
        let plain = decrypt_payload("test key", "P37w+VZImNgPEO1RBhJ6RtKl7n6zymIbEG1pReEzghk=")
            .expect("decrypt");
        assert_eq!(plain, b"hello world");
    }

    #[test]
    fn round_trips_a_callback_document() {
        let doc = br#"{"type":"url_verification","challenge":"c","token":"t"}"#;
        let envelope = encrypt_payload("secret", doc);
        assert_eq!(decrypt_payload("secret", &envelope).expect("decrypt"), doc);
    }

    #[test]
    fn wrong_key_or_garbage_is_rejected() {
        let envelope = encrypt_payload("secret", br#"{"challenge":"c"}"#);
        assert!(
            decrypt_payload("other", &envelope)
                .map(|plain| plain != br#"{"challenge":"c"}"#)
                .unwrap_or(true)
        );
        assert!(decrypt_payload("secret", "not base64!").is_err());
        assert!(decrypt_payload("secret", "AAAA").is_err());
        assert!(decrypt_payload("", &envelope).is_err());
    }
}
