//! Folder secrets — the shared credential a folder's peers hold.
//!
//! A secret is a short typed string: a level letter, a format version digit,
//! and a hex payload. Four privilege levels exist, each derivable from the
//! one above it with no network round-trip:
//!
//!   A (Owner)      payload = master seed
//!   B (ReadWrite)  payload = signing seed           = derive("sign", seed)
//!   C (ReadOnly)   payload = enc key ‖ verify key
//!   D (Download)   payload = verify key
//!
//! where enc_key = derive("enc", signing seed) and verify key is the Ed25519
//! public half of the signing keypair. The folder ID is the BLAKE3 hash of
//! the verify key, so every level can compute it. A Download secret can
//! relay and verify ciphertext but cannot decrypt or sign.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto;

const CTX_SIGN: &str = "cove v1 secret sign seed";
const CTX_ENC: &str = "cove v1 secret enc key";
const CTX_AUTH: &str = "cove v1 session auth";

/// Privilege level carried by a secret. Ordered strongest to weakest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Read, write, and produce further secrets.
    Owner,
    /// Read and write (sign new metadata).
    ReadWrite,
    /// Read (decrypt) and verify only.
    ReadOnly,
    /// Relay encrypted data without decrypting; verify signatures.
    Download,
}

impl Level {
    fn code(self) -> char {
        match self {
            Level::Owner => 'A',
            Level::ReadWrite => 'B',
            Level::ReadOnly => 'C',
            Level::Download => 'D',
        }
    }

    fn from_code(c: char) -> Option<Self> {
        match c {
            'A' => Some(Level::Owner),
            'B' => Some(Level::ReadWrite),
            'C' => Some(Level::ReadOnly),
            'D' => Some(Level::Download),
            _ => None,
        }
    }
}

/// Public identifier of a folder on the discovery plane.
/// `blake3(verify_key)` — derivable at every privilege level.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FolderId(pub [u8; 32]);

impl std::fmt::Display for FolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for FolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FolderId({})", &hex::encode(self.0)[..16])
    }
}

enum Payload {
    Owner { seed: Zeroizing<[u8; 32]> },
    ReadWrite { sign_seed: Zeroizing<[u8; 32]> },
    ReadOnly { enc_key: Zeroizing<[u8; 32]>, verify: [u8; 32] },
    Download { verify: [u8; 32] },
}

/// A parsed folder secret.
pub struct Secret {
    version: u8,
    payload: Payload,
}

impl Secret {
    /// Generate a fresh Owner secret from OS randomness.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self {
            version: 1,
            payload: Payload::Owner {
                seed: Zeroizing::new(seed),
            },
        }
    }

    /// Parse the string form (`A1<hex>` … `D1<hex>`).
    pub fn parse(s: &str) -> Result<Self, SecretError> {
        let mut chars = s.chars();
        let level = chars
            .next()
            .and_then(Level::from_code)
            .ok_or(SecretError::BadFormat)?;
        let version = match chars.next() {
            Some('1') => 1u8,
            _ => return Err(SecretError::BadFormat),
        };
        let payload = hex::decode(chars.as_str()).map_err(|_| SecretError::BadFormat)?;

        let key32 = |b: &[u8]| -> Result<[u8; 32], SecretError> {
            b.try_into().map_err(|_| SecretError::BadFormat)
        };

        let payload = match level {
            Level::Owner => Payload::Owner {
                seed: Zeroizing::new(key32(&payload)?),
            },
            Level::ReadWrite => Payload::ReadWrite {
                sign_seed: Zeroizing::new(key32(&payload)?),
            },
            Level::ReadOnly => {
                if payload.len() != 64 {
                    return Err(SecretError::BadFormat);
                }
                Payload::ReadOnly {
                    enc_key: Zeroizing::new(key32(&payload[..32])?),
                    verify: key32(&payload[32..])?,
                }
            }
            Level::Download => Payload::Download {
                verify: key32(&payload)?,
            },
        };

        Ok(Self { version, payload })
    }

    /// The privilege level of this secret.
    pub fn level(&self) -> Level {
        match self.payload {
            Payload::Owner { .. } => Level::Owner,
            Payload::ReadWrite { .. } => Level::ReadWrite,
            Payload::ReadOnly { .. } => Level::ReadOnly,
            Payload::Download { .. } => Level::Download,
        }
    }

    /// Whether this secret can produce signed metadata.
    pub fn can_sign(&self) -> bool {
        matches!(self.level(), Level::Owner | Level::ReadWrite)
    }

    /// Whether this secret can decrypt folder content.
    pub fn can_decrypt(&self) -> bool {
        self.level() <= Level::ReadOnly
    }

    fn sign_seed(&self) -> Result<Zeroizing<[u8; 32]>, SecretError> {
        match &self.payload {
            Payload::Owner { seed } => {
                Ok(Zeroizing::new(crypto::derive_key(CTX_SIGN, &seed[..])))
            }
            Payload::ReadWrite { sign_seed } => Ok(sign_seed.clone()),
            _ => Err(SecretError::InsufficientPrivilege),
        }
    }

    fn signing_key(&self) -> Result<SigningKey, SecretError> {
        Ok(SigningKey::from_bytes(&*self.sign_seed()?))
    }

    /// The folder's public verification key, known at every level.
    pub fn verify_key(&self) -> [u8; 32] {
        let sign_seed = match &self.payload {
            Payload::ReadOnly { verify, .. } | Payload::Download { verify } => return *verify,
            Payload::Owner { seed } => Zeroizing::new(crypto::derive_key(CTX_SIGN, &seed[..])),
            Payload::ReadWrite { sign_seed } => sign_seed.clone(),
        };
        SigningKey::from_bytes(&sign_seed).verifying_key().to_bytes()
    }

    /// The public folder identifier used on the discovery plane.
    pub fn derive_folder_id(&self) -> FolderId {
        FolderId(crypto::hash(&self.verify_key()))
    }

    /// The symmetric key for chunk payloads and path obfuscation.
    /// Fails for Download secrets, which only relay ciphertext.
    pub fn derive_encryption_key(&self) -> Result<Zeroizing<[u8; 32]>, SecretError> {
        match &self.payload {
            Payload::ReadOnly { enc_key, .. } => Ok(enc_key.clone()),
            Payload::Download { .. } => Err(SecretError::InsufficientPrivilege),
            _ => Ok(Zeroizing::new(crypto::derive_key(
                CTX_ENC,
                &self.sign_seed()?[..],
            ))),
        }
    }

    /// Session auth key: provable at every privilege level, so even a
    /// Download peer can authenticate to the folder mesh.
    pub fn auth_key(&self) -> [u8; 32] {
        crypto::derive_key(CTX_AUTH, &self.verify_key())
    }

    /// Sign canonical metadata bytes. Writers only.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; 64], SecretError> {
        Ok(self.signing_key()?.sign(data).to_bytes())
    }

    /// Verify a metadata signature under the folder's verify key.
    pub fn verify(&self, data: &[u8], signature: &[u8; 64]) -> Result<(), SecretError> {
        let key = VerifyingKey::from_bytes(&self.verify_key())
            .map_err(|_| SecretError::SignatureInvalid)?;
        key.verify(data, &Signature::from_bytes(signature))
            .map_err(|_| SecretError::SignatureInvalid)
    }

    /// Produce a lower-privilege secret. Purely local: each level is a
    /// deterministic function of the one above. Requesting a higher level
    /// fails with `InsufficientPrivilege`.
    pub fn derive(&self, level: Level) -> Result<Secret, SecretError> {
        if level < self.level() {
            return Err(SecretError::InsufficientPrivilege);
        }
        let payload = match level {
            Level::Owner => match &self.payload {
                Payload::Owner { seed } => Payload::Owner { seed: seed.clone() },
                _ => unreachable!("guarded by level ordering"),
            },
            Level::ReadWrite => Payload::ReadWrite {
                sign_seed: self.sign_seed()?,
            },
            Level::ReadOnly => Payload::ReadOnly {
                enc_key: self.derive_encryption_key()?,
                verify: self.verify_key(),
            },
            Level::Download => Payload::Download {
                verify: self.verify_key(),
            },
        };
        Ok(Secret {
            version: self.version,
            payload,
        })
    }
}

impl Clone for Secret {
    fn clone(&self) -> Self {
        let payload = match &self.payload {
            Payload::Owner { seed } => Payload::Owner { seed: seed.clone() },
            Payload::ReadWrite { sign_seed } => Payload::ReadWrite {
                sign_seed: sign_seed.clone(),
            },
            Payload::ReadOnly { enc_key, verify } => Payload::ReadOnly {
                enc_key: enc_key.clone(),
                verify: *verify,
            },
            Payload::Download { verify } => Payload::Download { verify: *verify },
        };
        Self {
            version: self.version,
            payload,
        }
    }
}

/// The string form, suitable for config files and out-of-band exchange.
impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex_payload = match &self.payload {
            Payload::Owner { seed } => hex::encode(&seed[..]),
            Payload::ReadWrite { sign_seed } => hex::encode(&sign_seed[..]),
            Payload::ReadOnly { enc_key, verify } => {
                let mut joined = Vec::with_capacity(64);
                joined.extend_from_slice(&enc_key[..]);
                joined.extend_from_slice(verify);
                hex::encode(joined)
            }
            Payload::Download { verify } => hex::encode(verify),
        };
        write!(f, "{}{}{}", self.level().code(), self.version, hex_payload)
    }
}

/// Debug never prints key material.
impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret({}{})", self.level().code(), self.version)
    }
}

impl std::str::FromStr for Secret {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Secret::parse(s)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("malformed secret string")]
    BadFormat,

    #[error("operation requires a higher-privilege secret")]
    InsufficientPrivilege,

    #[error("signature verification failed")]
    SignatureInvalid,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
