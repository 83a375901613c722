use rand::rngs::OsRng;
use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Computes the SHA-256 digest of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes the SHA-256 digest of `data` as a lowercase hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// An ECDSA key pair on secp256k1.
///
/// The secret half is never exposed: the only thing an owner can do with it
/// is sign a digest.
#[derive(Clone)]
pub struct KeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl KeyPair {
    /// Generates a fresh random key pair
    pub fn generate() -> Self {
        let (secret_key, public_key) = SECP256K1.generate_keypair(&mut OsRng);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Gets the public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Gets the compressed public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Signs a 32-byte digest, returning the DER-encoded signature as hex
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<String, CryptoError> {
        let message = Message::from_digest_slice(digest)
            .map_err(|e| CryptoError::InvalidDigest(e.to_string()))?;
        let signature = SECP256K1.sign_ecdsa(&message, &self.secret_key);
        Ok(hex::encode(&*signature.serialize_der()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Verifies a DER-hex signature over a 32-byte digest.
///
/// Malformed input is an error; a well-formed signature that does not match
/// is `Ok(false)`.
pub fn verify_digest(
    digest: &[u8; 32],
    signature_hex: &str,
    public_key: &PublicKey,
) -> Result<bool, CryptoError> {
    let der = hex::decode(signature_hex).map_err(|e| CryptoError::DecodingError(e.to_string()))?;
    let signature =
        Signature::from_der(&der).map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let message = Message::from_digest_slice(digest)
        .map_err(|e| CryptoError::InvalidDigest(e.to_string()))?;

    match SECP256K1.verify_ecdsa(&message, &signature, public_key) {
        Ok(_) => Ok(true),
        Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hex::encode(sha256(b"abc")), sha256_hex(b"abc"));
    }

    #[test]
    fn test_signing_and_verification() {
        let key_pair = KeyPair::generate();
        let digest = sha256(b"Hello, world!");

        let signature = key_pair.sign_digest(&digest).unwrap();
        assert!(verify_digest(&digest, &signature, key_pair.public_key()).unwrap());

        // Wrong digest
        let other = sha256(b"Wrong message");
        assert!(!verify_digest(&other, &signature, key_pair.public_key()).unwrap());

        // Wrong key
        let stranger = KeyPair::generate();
        assert!(!verify_digest(&digest, &signature, stranger.public_key()).unwrap());
    }

    #[test]
    fn test_malformed_signature_is_an_error() {
        let key_pair = KeyPair::generate();
        let digest = sha256(b"payload");

        assert!(matches!(
            verify_digest(&digest, "not hex", key_pair.public_key()),
            Err(CryptoError::DecodingError(_))
        ));
        assert!(matches!(
            verify_digest(&digest, "deadbeef", key_pair.public_key()),
            Err(CryptoError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let key_pair = KeyPair::generate();
        let rendered = format!("{:?}", key_pair);
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains(&key_pair.public_key_hex()));
    }
}
