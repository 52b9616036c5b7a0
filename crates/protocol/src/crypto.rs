//! Secure channel primitives.
//!
//! Each user owns a static X25519 key pair. Two peers agree on a random
//! 256-bit session key: the initiator seals the key to the responder's
//! public key (ephemeral X25519 agreement, HKDF-SHA256, ChaCha20-Poly1305),
//! and from then on message bodies are encrypted with ChaCha20-Poly1305
//! under that session key.
//!
//! # Sealed key layout
//!
//! ```text
//! [ephemeral public key: 32][nonce: 12][ciphertext of session key + tag: 48]
//! ```

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::{ProtocolError, Result};

/// Length of public keys, private keys and session keys in bytes.
pub const KEY_LENGTH: usize = 32;

/// Length of a ChaCha20-Poly1305 nonce in bytes.
pub const NONCE_LENGTH: usize = 12;

/// Length of the Poly1305 authentication tag in bytes.
pub const TAG_LENGTH: usize = 16;

/// Total length of a sealed session key.
pub const SEALED_KEY_LENGTH: usize = KEY_LENGTH + NONCE_LENGTH + KEY_LENGTH + TAG_LENGTH;

const SEAL_CONTEXT: &[u8] = b"chat-relay secure channel v1 key seal";

/// A user's long-lived X25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS random source.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a key pair from its 32 secret bytes.
    pub fn from_secret_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a key pair from a secret of unchecked length.
    pub fn from_secret_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!(
                "private key must be {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self::from_secret_bytes(bytes))
    }

    /// The secret bytes, for persistence.
    pub fn secret_bytes(&self) -> [u8; KEY_LENGTH] {
        self.secret.to_bytes()
    }

    /// The public key bytes to hand to peers.
    pub fn public_bytes(&self) -> [u8; KEY_LENGTH] {
        self.public.to_bytes()
    }

    /// Recover a session key that a peer sealed to this key pair.
    pub fn open_session_key(&self, sealed: &[u8]) -> Result<SessionKey> {
        if sealed.len() != SEALED_KEY_LENGTH {
            return Err(ProtocolError::Decryption(format!(
                "sealed key must be {} bytes, got {}",
                SEALED_KEY_LENGTH,
                sealed.len()
            )));
        }

        let (ephemeral, rest) = sealed.split_at(KEY_LENGTH);
        let (nonce, ciphertext) = rest.split_at(NONCE_LENGTH);
        let ephemeral = parse_public_key(ephemeral)?;

        let shared = self.secret.diffie_hellman(&ephemeral);
        if !shared.was_contributory() {
            return Err(ProtocolError::InvalidPublicKey(
                "ephemeral key produced a non-contributory agreement".to_string(),
            ));
        }
        let key = derive_seal_key(shared.as_bytes(), &ephemeral, &self.public)?;

        let cipher = ChaCha20Poly1305::new(&key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::Decryption("sealed key authentication failed".to_string()))?;
        SessionKey::from_slice(&plaintext)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// A symmetric key shared by exactly two peers.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LENGTH]);

impl SessionKey {
    /// Generate a random 256-bit key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::Decryption(format!(
                "session key must be {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Encrypt `plaintext` under a random nonce. Returns `(nonce, ciphertext)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| ProtocolError::Encryption("message encryption failed".to_string()))?;
        Ok((nonce.to_vec(), ciphertext))
    }

    /// Decrypt a `(nonce, ciphertext)` pair produced by [`SessionKey::encrypt`].
    pub fn decrypt(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_LENGTH {
            return Err(ProtocolError::Decryption(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LENGTH,
                nonce.len()
            )));
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::Decryption("authentication tag mismatch".to_string()))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Seal `key` so that only the holder of `recipient_public`'s secret can open it.
pub fn seal_session_key(recipient_public: &[u8], key: &SessionKey) -> Result<Vec<u8>> {
    let recipient = parse_public_key(recipient_public)?;
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(&recipient);
    if !shared.was_contributory() {
        return Err(ProtocolError::InvalidPublicKey(
            "peer key produced a non-contributory agreement".to_string(),
        ));
    }
    let seal_key = derive_seal_key(shared.as_bytes(), &ephemeral_public, &recipient)?;

    let cipher = ChaCha20Poly1305::new(&seal_key);
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, key.as_bytes().as_slice())
        .map_err(|_| ProtocolError::Encryption("session key sealing failed".to_string()))?;

    let mut sealed = Vec::with_capacity(SEALED_KEY_LENGTH);
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Parse a peer's public key from raw bytes.
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    let bytes: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| {
        ProtocolError::InvalidPublicKey(format!(
            "expected {} bytes, got {}",
            KEY_LENGTH,
            bytes.len()
        ))
    })?;
    Ok(PublicKey::from(bytes))
}

fn derive_seal_key(shared: &[u8], ephemeral: &PublicKey, recipient: &PublicKey) -> Result<Key> {
    let mut salt = [0u8; KEY_LENGTH * 2];
    salt[..KEY_LENGTH].copy_from_slice(ephemeral.as_bytes());
    salt[KEY_LENGTH..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; KEY_LENGTH];
    hk.expand(SEAL_CONTEXT, &mut okm)
        .map_err(|_| ProtocolError::Encryption("HKDF expand failed".to_string()))?;
    Ok(*Key::from_slice(&okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_restore() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(pair.secret_bytes());
        assert_eq!(pair.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn test_keypair_from_bad_slice() {
        assert!(KeyPair::from_secret_slice(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let bob = KeyPair::generate();
        let key = SessionKey::generate();

        let sealed = seal_session_key(&bob.public_bytes(), &key).unwrap();
        assert_eq!(sealed.len(), SEALED_KEY_LENGTH);

        let opened = bob.open_session_key(&sealed).unwrap();
        assert_eq!(opened, key);
    }

    #[test]
    fn test_sealed_key_opens_only_for_recipient() {
        let bob = KeyPair::generate();
        let eve = KeyPair::generate();
        let sealed = seal_session_key(&bob.public_bytes(), &SessionKey::generate()).unwrap();

        let result = eve.open_session_key(&sealed);
        assert!(matches!(result, Err(ProtocolError::Decryption(_))));
    }

    #[test]
    fn test_tampered_sealed_key_rejected() {
        let bob = KeyPair::generate();
        let mut sealed = seal_session_key(&bob.public_bytes(), &SessionKey::generate()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(bob.open_session_key(&sealed).is_err());
    }

    #[test]
    fn test_seal_to_malformed_key() {
        let result = seal_session_key(&[1, 2, 3], &SessionKey::generate());
        assert!(matches!(result, Err(ProtocolError::InvalidPublicKey(_))));
    }

    #[test]
    fn test_seal_to_low_order_point() {
        let result = seal_session_key(&[0u8; KEY_LENGTH], &SessionKey::generate());
        assert!(matches!(result, Err(ProtocolError::InvalidPublicKey(_))));
    }

    #[test]
    fn test_message_encrypt_decrypt() {
        let key = SessionKey::generate();
        let (nonce, ciphertext) = key.encrypt(b"hi again").unwrap();
        assert_eq!(nonce.len(), NONCE_LENGTH);
        assert_ne!(ciphertext.as_slice(), b"hi again");

        let plaintext = key.decrypt(&nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hi again");
    }

    #[test]
    fn test_nonces_differ() {
        let key = SessionKey::generate();
        let (a, _) = key.encrypt(b"same").unwrap();
        let (b, _) = key.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_with_wrong_key() {
        let (nonce, ciphertext) = SessionKey::generate().encrypt(b"secret").unwrap();
        let result = SessionKey::generate().decrypt(&nonce, &ciphertext);
        assert!(matches!(result, Err(ProtocolError::Decryption(_))));
    }

    #[test]
    fn test_decrypt_bad_nonce_length() {
        let key = SessionKey::generate();
        let (_, ciphertext) = key.encrypt(b"x").unwrap();
        assert!(key.decrypt(&[0u8; 4], &ciphertext).is_err());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let key = SessionKey::from_bytes([7u8; KEY_LENGTH]);
        assert_eq!(format!("{:?}", key), "SessionKey(..)");
    }
}
