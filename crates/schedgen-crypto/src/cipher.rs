use anyhow::{Context, Result};
use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::secret::SharedSecret;

pub const CIPHER_KEY_BYTES: usize = 32;

/// Standard alphabet, padding optional on decode. Peers differ on whether
/// they strip trailing `=` when splitting the envelope across lines.
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Key derived from a [`SharedSecret`]. Recomputed per use, never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey([u8; CIPHER_KEY_BYTES]);

impl CipherKey {
    pub fn as_bytes(&self) -> &[u8; CIPHER_KEY_BYTES] {
        &self.0
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(..)")
    }
}

/// Derive the envelope key as the SHA-256 digest of the secret's UTF-8 bytes.
pub fn derive_key(secret: &SharedSecret) -> CipherKey {
    let digest = Sha256::digest(secret.expose().as_bytes());
    let mut key = [0u8; CIPHER_KEY_BYTES];
    key.copy_from_slice(&digest[..CIPHER_KEY_BYTES]);
    CipherKey(key)
}

/// XOR every byte with the key, cycling the key. Self-inverse.
pub fn xor_with_key(data: &[u8], key: &CipherKey) -> Vec<u8> {
    data.iter()
        .zip(key.as_bytes().iter().cycle())
        .map(|(byte, k)| byte ^ k)
        .collect()
}

/// Produce the text-safe envelope for `plaintext`.
pub fn encrypt(plaintext: &[u8], key: &CipherKey) -> String {
    STANDARD.encode(xor_with_key(plaintext, key))
}

/// Reverse [`encrypt`]: base64-decode, then XOR with the same key.
pub fn decrypt(envelope: &str, key: &CipherKey) -> Result<Vec<u8>> {
    let raw = LENIENT_STANDARD
        .decode(envelope.trim())
        .context("envelope is not valid base64")?;
    Ok(xor_with_key(&raw, key))
}
