//! Peer identity and crypto: keypairs, peer ID, session keys, link encryption.

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::{OsRng, StdRng};
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Length of a peer ID in bytes.
pub const PEER_ID_LEN: usize = 16;

/// Peer public key (32 bytes, X25519). Sent in the link handshake.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Peer ID: truncated SHA-256 of the public key. Ordered by byte value.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_16")] [u8; PEER_ID_LEN]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    /// Derive the peer ID from a public key (same as `Keypair` does).
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let digest = Sha256::digest(public);
        let mut id = [0u8; PEER_ID_LEN];
        id.copy_from_slice(&digest[..PEER_ID_LEN]);
        PeerId(id)
    }

    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// First four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerIdParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 16 bytes, got {0}")]
    Length(usize),
}

impl FromStr for PeerId {
    type Err = PeerIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        let len = bytes.len();
        let arr: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| PeerIdParseError::Length(len))?;
        Ok(PeerId(arr))
    }
}

/// X25519 keypair. Keep secret key private; expose only public key and peer ID.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    peer_id: PeerId,
}

impl Keypair {
    /// Generate a new random keypair from the OS RNG.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Deterministic keypair from a caller-supplied seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let mut rng = StdRng::from_seed(seed);
        Self::from_secret(StaticSecret::random_from_rng(&mut rng))
    }

    /// Restore a keypair from its persisted secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let peer_id = PeerId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            peer_id,
        }
    }

    /// Secret bytes, for persisting the identity. Never send these anywhere.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Shared secret with another peer's public key. Used to derive the session key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Derive a 32-byte session key from the shared secret. Pairwise per link.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"shoal-session-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

fn nonce_bytes(nonce: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[4..12].copy_from_slice(&nonce.to_le_bytes());
    out
}

/// Link encryption: ChaCha20-Poly1305. Nonce is a per-direction counter; never reuse.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce = nonce_bytes(nonce);
    let nonce_arr =
        chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(&nonce);
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Link decryption.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce = nonce_bytes(nonce);
    let nonce_arr =
        chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(&nonce);
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_peer_id_derivation() {
        let kp = Keypair::generate();
        let id = PeerId::from_public_key(kp.public_key().as_bytes());
        assert_eq!(id, kp.peer_id());
    }

    #[test]
    fn seeded_keypair_is_deterministic() {
        let a = Keypair::from_seed([7u8; 32]);
        let b = Keypair::from_seed([7u8; 32]);
        let c = Keypair::from_seed([8u8; 32]);
        assert_eq!(a.peer_id(), b.peer_id());
        assert_ne!(a.peer_id(), c.peer_id());
    }

    #[test]
    fn secret_bytes_restore_same_identity() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_bytes(kp.secret_bytes());
        assert_eq!(kp.peer_id(), restored.peer_id());
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let secret_a = a.shared_secret(b.public_key());
        let secret_b = b.shared_secret(a.public_key());
        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn peer_ids_order_by_bytes() {
        let low = PeerId::from_bytes([0u8; 16]);
        let mut high_bytes = [0u8; 16];
        high_bytes[0] = 1;
        let high = PeerId::from_bytes(high_bytes);
        assert!(low < high);
    }

    #[test]
    fn peer_id_hex_roundtrip() {
        let id = Keypair::generate().peer_id();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("abcd".parse::<PeerId>().is_err());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let plain = b"hello shoal";
        let cipher = encrypt_wire(&key, 3, plain).unwrap();
        let dec = decrypt_wire(&key, 3, &cipher).unwrap();
        assert_eq!(dec.as_slice(), plain);
        assert!(decrypt_wire(&key, 4, &cipher).is_err());
    }
}
