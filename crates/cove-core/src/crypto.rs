//! Cryptographic primitives for Cove.
//!
//! Provides three things:
//!   1. BLAKE3 hashing — chunk content hashes, keyed path/plaintext hashes
//!   2. ChaCha20-Poly1305 chunk encryption under the folder encryption key
//!   3. The node's long-lived Ed25519 identity keypair and its persistence
//!
//! One suite covers both signatures and link identity; the chunk cipher is
//! the only symmetric primitive. All private key material is wiped from
//! memory on drop. There is no unsafe code in this module.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of a chunk encryption IV in bytes (96 bits, ChaCha20-Poly1305).
pub const IV_SIZE: usize = 12;

/// Poly1305 tag length appended to every encrypted chunk.
pub const TAG_SIZE: usize = 16;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
///
/// Used for chunk ct_hashes, folder IDs, and index row checksums.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Keyed BLAKE3 hash. Used for path hashes and plaintext chunk hashes,
/// keyed with the folder encryption key so the digests leak nothing
/// to peers that cannot decrypt.
pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    *blake3::keyed_hash(key, data).as_bytes()
}

/// Domain-separated key derivation (BLAKE3 derive_key).
pub fn derive_key(context: &str, material: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, material)
}

/// Incremental BLAKE3 hasher for payloads that arrive in pieces.
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Chunk cipher ──────────────────────────────────────────────────────────────

/// Generate a cryptographically random 12-byte chunk IV.
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// ChaCha20-Poly1305 under the folder encryption key.
///
/// Every chunk is encrypted with a distinct IV recorded in its FileChunk
/// entry; the ciphertext (tag included) is what the chunk store addresses.
pub struct ChunkCipher {
    key: Zeroizing<[u8; 32]>,
}

impl ChunkCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Encrypt a plaintext chunk. Output is ciphertext with the 16-byte
    /// Poly1305 tag appended.
    pub fn encrypt(&self, iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&*self.key));
        cipher
            .encrypt(Nonce::from_slice(iv), plaintext)
            .map_err(|_| CryptoError::Encrypt)
    }

    /// Decrypt an encrypted chunk, verifying the tag.
    pub fn decrypt(&self, iv: &[u8; IV_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&*self.key));
        cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

// ── Path hashing ──────────────────────────────────────────────────────────────

/// Keyed hash of a relative path. Peers exchange these, never cleartext
/// paths. When `normalize` is set the path is NFC-normalized first so that
/// differently-composed filenames hash identically across platforms.
pub fn path_hash(enc_key: &[u8; 32], rel_path: &str, normalize: bool) -> [u8; 32] {
    if normalize {
        use unicode_normalization::UnicodeNormalization;
        let nfc: String = rel_path.nfc().collect();
        keyed_hash(enc_key, nfc.as_bytes())
    } else {
        keyed_hash(enc_key, rel_path.as_bytes())
    }
}

// ── Node identity ─────────────────────────────────────────────────────────────

/// A node's long-term Ed25519 identity keypair.
///
/// Generated once per node and stored persistently under `system_path` as
/// `node.key` (private) and `node.cert` (public key + self-signature). The
/// public key authenticates every peer link this node participates in.
pub struct NodeIdentity {
    signing: SigningKey,
}

impl NodeIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Reconstruct from stored private key bytes.
    pub fn from_private(private: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&private),
        }
    }

    /// The node's public key, as announced to peers.
    pub fn public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Sign with the node key (link-level proofs, not folder metadata).
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing.sign(data).to_bytes()
    }

    /// Verify a node-key signature against a known public key.
    pub fn verify(public: &[u8; 32], data: &[u8], signature: &[u8; 64]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(public) else {
            return false;
        };
        key.verify(data, &Signature::from_bytes(signature)).is_ok()
    }

    /// Load the identity from `dir/node.key`, generating and persisting a
    /// fresh one (plus `node.cert`) on first run.
    pub fn load_or_generate(dir: &std::path::Path) -> Result<Self, CryptoError> {
        let key_path = dir.join("node.key");
        match std::fs::read(&key_path) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut private = [0u8; 32];
                private.copy_from_slice(&bytes);
                Ok(Self::from_private(private))
            }
            Ok(_) => Err(CryptoError::BadKeyFile(key_path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.persist(dir)?;
                Ok(identity)
            }
            Err(e) => Err(CryptoError::Io(e)),
        }
    }

    /// Write `node.key` (0600 on unix) and `node.cert` under `dir`.
    fn persist(&self, dir: &std::path::Path) -> Result<(), CryptoError> {
        std::fs::create_dir_all(dir).map_err(CryptoError::Io)?;

        let key_path = dir.join("node.key");
        std::fs::write(&key_path, &*self.private_bytes()).map_err(CryptoError::Io)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
                .map_err(CryptoError::Io)?;
        }

        // node.cert: public key followed by a self-signature over it.
        let public = self.public();
        let mut cert = Vec::with_capacity(32 + 64);
        cert.extend_from_slice(&public);
        cert.extend_from_slice(&self.sign(&public));
        std::fs::write(dir.join("node.cert"), cert).map_err(CryptoError::Io)?;

        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("chunk encryption failed")]
    Encrypt,

    #[error("chunk decryption failed (bad key, IV, or tampered ciphertext)")]
    Decrypt,

    #[error("malformed key file: {0}")]
    BadKeyFile(std::path::PathBuf),

    #[error("key storage I/O: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_known_vector() {
        // BLAKE3 official test vector for the empty input
        let expected = [
            0xaf, 0x13, 0x49, 0xb9, 0xf5, 0xf9, 0xa1, 0xa6, 0xa0, 0x40, 0x4d, 0xea, 0x36, 0xdc,
            0xc9, 0x49, 0x9b, 0xcb, 0x25, 0xc9, 0xad, 0xc1, 0x12, 0xb7, 0xcc, 0x9a, 0x93, 0xca,
            0xe4, 0x1f, 0x32, 0x62,
        ];
        assert_eq!(hash(b""), expected);
    }

    #[test]
    fn keyed_hash_differs_from_plain() {
        let key = [7u8; 32];
        assert_ne!(keyed_hash(&key, b"cove"), hash(b"cove"));
        assert_eq!(keyed_hash(&key, b"cove"), keyed_hash(&key, b"cove"));
    }

    #[test]
    fn incremental_hasher_matches_oneshot() {
        let mut h = Hasher::new();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(h.finalize(), hash(b"hello world"));
    }

    #[test]
    fn chunk_cipher_roundtrip() {
        let cipher = ChunkCipher::new([3u8; 32]);
        let iv = generate_iv();
        let ct = cipher.encrypt(&iv, b"chunk payload").unwrap();
        assert_eq!(ct.len(), b"chunk payload".len() + TAG_SIZE);
        assert_ne!(&ct[..13], b"chunk payload".as_slice());
        assert_eq!(cipher.decrypt(&iv, &ct).unwrap(), b"chunk payload");
    }

    #[test]
    fn tampered_chunk_is_rejected() {
        let cipher = ChunkCipher::new([3u8; 32]);
        let iv = generate_iv();
        let mut ct = cipher.encrypt(&iv, b"important data").unwrap();
        ct[4] ^= 0xFF;
        assert!(cipher.decrypt(&iv, &ct).is_err());
    }

    #[test]
    fn wrong_iv_is_rejected() {
        let cipher = ChunkCipher::new([3u8; 32]);
        let iv = [1u8; IV_SIZE];
        let ct = cipher.encrypt(&iv, b"data").unwrap();
        assert!(cipher.decrypt(&[2u8; IV_SIZE], &ct).is_err());
    }

    #[test]
    fn path_hash_normalization() {
        let key = [9u8; 32];
        // "é" precomposed vs decomposed — must collide when normalizing,
        // must differ when not.
        let composed = "caf\u{e9}.txt";
        let decomposed = "cafe\u{301}.txt";
        assert_eq!(
            path_hash(&key, composed, true),
            path_hash(&key, decomposed, true)
        );
        assert_ne!(
            path_hash(&key, composed, false),
            path_hash(&key, decomposed, false)
        );
    }

    #[test]
    fn node_identity_roundtrip() {
        let id = NodeIdentity::generate();
        let restored = NodeIdentity::from_private(*id.private_bytes());
        assert_eq!(id.public(), restored.public());
    }

    #[test]
    fn node_identity_sign_verify() {
        let id = NodeIdentity::generate();
        let sig = id.sign(b"hello");
        assert!(NodeIdentity::verify(&id.public(), b"hello", &sig));
        assert!(!NodeIdentity::verify(&id.public(), b"other", &sig));
    }

    #[test]
    fn node_identity_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let id1 = NodeIdentity::load_or_generate(dir.path()).unwrap();
        assert!(dir.path().join("node.key").exists());
        assert!(dir.path().join("node.cert").exists());

        let id2 = NodeIdentity::load_or_generate(dir.path()).unwrap();
        assert_eq!(id1.public(), id2.public());
    }
}
