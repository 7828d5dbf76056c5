//! Shared-secret envelope used between the schedule service and its worker.
//!
//! The transform is a repeating-key XOR over the SHA-256 digest of the shared
//! secret, wrapped in standard base64. It only exists for compatibility with
//! peers that already speak it and offers no confidentiality against anyone
//! holding a known plaintext.

pub mod cipher;
pub mod secret;

pub use cipher::{CIPHER_KEY_BYTES, CipherKey, decrypt, derive_key, encrypt, xor_with_key};
pub use secret::SharedSecret;
