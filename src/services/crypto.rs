//! Encrypted-string carrier.
//!
//! Credential values and the playback auth segment travel as either
//! plaintext or marker-prefixed AES-256-CBC ciphertext. Every boundary
//! checks the tag before use instead of guessing.

use aes::Aes256;
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};
use rand::RngCore;

/// Marker identifying ciphertext form. Anything else is plaintext.
const CIPHERTEXT_PREFIX: &str = "E2:";

/// A string that is either plaintext or a sealed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncString {
    Plaintext(String),
    Ciphertext(String),
}

impl EncString {
    /// Classify a raw value by its prefix.
    pub fn from_raw(raw: &str) -> Self {
        if let Some(body) = raw.strip_prefix(CIPHERTEXT_PREFIX) {
            EncString::Ciphertext(body.to_string())
        } else {
            EncString::Plaintext(raw.to_string())
        }
    }

    pub fn is_ciphertext(&self) -> bool {
        matches!(self, EncString::Ciphertext(_))
    }

    /// Serialized form with the marker prefix on ciphertext.
    pub fn to_raw(&self) -> String {
        match self {
            EncString::Plaintext(s) => s.clone(),
            EncString::Ciphertext(s) => format!("{}{}", CIPHERTEXT_PREFIX, s),
        }
    }
}

/// AES-256-CBC keyring derived from the operator secret.
#[derive(Clone)]
pub struct Crypto {
    key: [u8; 32],
}

impl Crypto {
    /// Build from a 64-char hex secret.
    pub fn new(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex).context("secret must be hex")?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("secret must decode to 32 bytes"))?;
        Ok(Self { key })
    }

    /// Encrypt, producing the marker-prefixed carrier form. The random IV
    /// is prepended to the ciphertext before encoding.
    pub fn seal(&self, plaintext: &str) -> EncString {
        let mut iv = [0u8; 16];
        rand::rng().fill_bytes(&mut iv);

        let encryptor = Encryptor::<Aes256>::new((&self.key).into(), (&iv).into());
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut payload = Vec::with_capacity(16 + ciphertext.len());
        payload.extend_from_slice(&iv);
        payload.extend_from_slice(&ciphertext);
        EncString::Ciphertext(URL_SAFE_NO_PAD.encode(payload))
    }

    /// Decrypt a carrier value. Plaintext passes through unchanged.
    pub fn open(&self, value: &EncString) -> Result<String> {
        let body = match value {
            EncString::Plaintext(s) => return Ok(s.clone()),
            EncString::Ciphertext(body) => body,
        };
        let payload = URL_SAFE_NO_PAD
            .decode(body)
            .context("ciphertext is not valid base64")?;
        if payload.len() < 16 || (payload.len() - 16) % 16 != 0 {
            bail!("ciphertext payload has invalid length");
        }
        let (iv, ciphertext) = payload.split_at(16);
        let iv: [u8; 16] = iv.try_into().expect("split_at(16) yields 16 bytes");

        let decryptor = Decryptor::<Aes256>::new((&self.key).into(), (&iv).into());
        let plaintext = decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| anyhow!("ciphertext failed to decrypt"))?;
        String::from_utf8(plaintext).context("decrypted payload is not utf-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> Crypto {
        Crypto::new("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")
            .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let c = crypto();
        let sealed = c.seal("realdebrid:abc123");
        assert!(sealed.is_ciphertext());
        assert_eq!(c.open(&sealed).unwrap(), "realdebrid:abc123");
    }

    #[test]
    fn test_prefix_classification() {
        let sealed = crypto().seal("secret");
        let raw = sealed.to_raw();
        assert!(raw.starts_with("E2:"));
        assert_eq!(EncString::from_raw(&raw), sealed);
        assert_eq!(
            EncString::from_raw("plain-key"),
            EncString::Plaintext("plain-key".into())
        );
    }

    #[test]
    fn test_plaintext_passes_through() {
        let c = crypto();
        let value = EncString::Plaintext("as-is".into());
        assert_eq!(c.open(&value).unwrap(), "as-is");
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let c = crypto();
        assert!(c.open(&EncString::Ciphertext("not-base64!!".into())).is_err());
        assert!(c.open(&EncString::Ciphertext(URL_SAFE_NO_PAD.encode(b"short")).clone()).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = crypto().seal("secret");
        let other = Crypto::new(
            "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .unwrap();
        assert!(other.open(&sealed).is_err());
    }
}
