//! Event signing and NIP-44 payload encryption.
//!
//! Wraps a long-term `nostr::Keys` pair. Signing fills the event id (the
//! hash of the canonical serialization) and the Schnorr signature; encryption
//! is NIP-44 v2, authenticated with the conversation key derived from the
//! local secret and the peer public key.

use nostr::nips::nip44::{self, Version};
use nostr::{Event, Keys, PublicKey, UnsignedEvent};

use crate::core::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct EventSigner {
    keys: Keys,
}

impl EventSigner {
    /// A signer with a fresh random secret.
    pub fn generate() -> Self {
        Self {
            keys: Keys::generate(),
        }
    }

    /// Parse a secret key (hex or nsec).
    pub fn from_secret(secret: &str) -> Result<Self> {
        Ok(Self {
            keys: Keys::parse(secret)?,
        })
    }

    pub fn from_keys(keys: Keys) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn public_key_hex(&self) -> String {
        self.keys.public_key().to_hex()
    }

    /// Sign an event template, filling id and signature.
    pub fn sign(&self, unsigned: UnsignedEvent) -> Result<Event> {
        unsigned
            .sign_with_keys(&self.keys)
            .map_err(|e| Error::InvalidEvent(e.to_string()))
    }

    /// NIP-44 v2 encryption towards `peer`.
    pub fn encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String> {
        nip44::encrypt(self.keys.secret_key(), peer, plaintext, Version::V2)
            .map_err(|e| Error::EncryptFailed(e.to_string()))
    }

    /// NIP-44 decryption of a payload authored by `peer`.
    pub fn decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String> {
        nip44::decrypt(self.keys.secret_key(), peer, ciphertext)
            .map_err(|e| Error::DecryptFailed(e.to_string()))
    }
}
