//! Meta — the canonical description of one filesystem object at one
//! revision, and its deterministic binary codec.
//!
//! The encoding IS the signed artifact: field order is fixed, integers are
//! little-endian fixed-width, variable-length fields carry a u32 length
//! prefix, optional fields a presence byte. Two encoders given the same
//! Meta must produce bit-identical bytes, because signatures are computed
//! over the canonical bytes and peers compare revisions by them. Trailing
//! bytes after a well-formed record are an error, not an extension point.

use thiserror::Error;

use crate::crypto::{self, ChunkCipher, IV_SIZE};
use crate::secret::{Secret, SecretError};

/// Largest accepted encrypted-name field. Paths are short; anything past
/// this is a malformed or hostile record.
pub const MAX_NAME_CT: usize = 64 * 1024;

/// Largest accepted chunk list. At the default target chunk size this
/// bounds a single file at several terabytes.
pub const MAX_CHUNKS: usize = 1 << 24;

/// What kind of filesystem object a Meta describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    File = 0,
    Directory = 1,
    Symlink = 2,
    Deleted = 3,
}

impl Kind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Kind::File),
            1 => Some(Kind::Directory),
            2 => Some(Kind::Symlink),
            3 => Some(Kind::Deleted),
            _ => None,
        }
    }
}

/// Strong-hash family used for chunk ct_hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum StrongHashType {
    #[default]
    Blake3 = 0,
}

impl StrongHashType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StrongHashType::Blake3),
            _ => None,
        }
    }
}

/// One encrypted chunk of a file's content.
///
/// `ct_hash` addresses the encrypted blob in the chunk store; `pt_hash_hmac`
/// is the keyed hash of the plaintext, used for dedup and post-decrypt
/// verification; `iv` is the per-chunk AEAD nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub ct_hash: [u8; 32],
    pub size: u32,
    pub iv: [u8; IV_SIZE],
    pub pt_hash_hmac: [u8; 32],
}

/// One immutable record per (path, revision).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    /// Keyed hash of the normalized relative path.
    pub path_hash: [u8; 32],
    /// Encrypted cleartext path.
    pub path_ct: Vec<u8>,
    pub kind: Kind,
    /// Wall-clock microseconds chosen by the writer; monotone per path.
    pub revision: u64,
    pub windows_attrib: Option<u32>,
    pub unix_attrib: Option<u32>,
    /// Encrypted symlink target. Symlink metas only.
    pub symlink_target_ct: Option<Vec<u8>>,
    /// Modification time in microseconds since the epoch.
    pub mtime: i64,
    /// File metas only; ignored for other kinds.
    pub strong_hash_type: StrongHashType,
    /// File metas only; empty for other kinds.
    pub chunks: Vec<FileChunk>,
}

impl Meta {
    /// Canonical encoding. Chunk fields are written for File metas only.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.path_ct.len() + self.chunks.len() * 80);

        out.extend_from_slice(&self.path_hash);
        out.extend_from_slice(&(self.path_ct.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.path_ct);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.revision.to_le_bytes());

        encode_opt_u32(&mut out, self.windows_attrib);
        encode_opt_u32(&mut out, self.unix_attrib);
        match &self.symlink_target_ct {
            Some(target) => {
                out.push(1);
                out.extend_from_slice(&(target.len() as u32).to_le_bytes());
                out.extend_from_slice(target);
            }
            None => out.push(0),
        }

        out.extend_from_slice(&self.mtime.to_le_bytes());

        if self.kind == Kind::File {
            out.push(self.strong_hash_type as u8);
            out.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
            for chunk in &self.chunks {
                out.extend_from_slice(&chunk.ct_hash);
                out.extend_from_slice(&chunk.size.to_le_bytes());
                out.extend_from_slice(&chunk.iv);
                out.extend_from_slice(&chunk.pt_hash_hmac);
            }
        }

        out
    }

    /// Decode canonical bytes. Fails on truncation, unknown discriminants,
    /// oversized fields, and trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, MetaError> {
        let mut r = Reader::new(bytes);

        let path_hash = r.array::<32>()?;
        let path_ct_len = r.u32()? as usize;
        if path_ct_len > MAX_NAME_CT {
            return Err(MetaError::Malformed("path_ct too long"));
        }
        let path_ct = r.bytes(path_ct_len)?.to_vec();
        let kind = Kind::from_u8(r.u8()?).ok_or(MetaError::Malformed("unknown kind"))?;
        let revision = r.u64()?;

        let windows_attrib = decode_opt_u32(&mut r)?;
        let unix_attrib = decode_opt_u32(&mut r)?;
        let symlink_target_ct = match r.u8()? {
            0 => None,
            1 => {
                let len = r.u32()? as usize;
                if len > MAX_NAME_CT {
                    return Err(MetaError::Malformed("symlink target too long"));
                }
                Some(r.bytes(len)?.to_vec())
            }
            _ => return Err(MetaError::Malformed("bad presence byte")),
        };

        let mtime = r.u64()? as i64;

        let (strong_hash_type, chunks) = if kind == Kind::File {
            let hash_type = StrongHashType::from_u8(r.u8()?)
                .ok_or(MetaError::Malformed("unknown strong hash type"))?;
            let count = r.u32()? as usize;
            if count > MAX_CHUNKS {
                return Err(MetaError::Malformed("chunk list too long"));
            }
            let mut chunks = Vec::with_capacity(count);
            for _ in 0..count {
                chunks.push(FileChunk {
                    ct_hash: r.array::<32>()?,
                    size: r.u32()?,
                    iv: r.array::<IV_SIZE>()?,
                    pt_hash_hmac: r.array::<32>()?,
                });
            }
            (hash_type, chunks)
        } else {
            (StrongHashType::default(), Vec::new())
        };

        if !r.is_empty() {
            return Err(MetaError::Malformed("trailing bytes"));
        }

        Ok(Meta {
            path_hash,
            path_ct,
            kind,
            revision,
            windows_attrib,
            unix_attrib,
            symlink_target_ct,
            mtime,
            strong_hash_type,
            chunks,
        })
    }

    /// Total plaintext size of a File meta's content.
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size as u64).sum()
    }
}

fn encode_opt_u32(out: &mut Vec<u8>, value: Option<u32>) {
    match value {
        Some(v) => {
            out.push(1);
            out.extend_from_slice(&v.to_le_bytes());
        }
        None => out.push(0),
    }
}

fn decode_opt_u32(r: &mut Reader<'_>) -> Result<Option<u32>, MetaError> {
    match r.u8()? {
        0 => Ok(None),
        1 => Ok(Some(r.u32()?)),
        _ => Err(MetaError::Malformed("bad presence byte")),
    }
}

// ── Name obfuscation ──────────────────────────────────────────────────────────

/// Encrypt a cleartext name (path or symlink target) for carriage inside a
/// Meta. The IV is derived from path_hash + revision + label, so the same
/// writer re-encoding the same revision produces identical bytes — a
/// requirement for canonical-bytes equality across peers.
pub fn seal_name(
    enc_key: &[u8; 32],
    path_hash: &[u8; 32],
    revision: u64,
    label: &str,
    cleartext: &[u8],
) -> Result<Vec<u8>, crypto::CryptoError> {
    let iv = name_iv(enc_key, path_hash, revision, label);
    ChunkCipher::new(*enc_key).encrypt(&iv, cleartext)
}

/// Decrypt a sealed name.
pub fn open_name(
    enc_key: &[u8; 32],
    path_hash: &[u8; 32],
    revision: u64,
    label: &str,
    ciphertext: &[u8],
) -> Result<Vec<u8>, crypto::CryptoError> {
    let iv = name_iv(enc_key, path_hash, revision, label);
    ChunkCipher::new(*enc_key).decrypt(&iv, ciphertext)
}

fn name_iv(enc_key: &[u8; 32], path_hash: &[u8; 32], revision: u64, label: &str) -> [u8; IV_SIZE] {
    let mut material = Vec::with_capacity(32 + 8 + label.len());
    material.extend_from_slice(path_hash);
    material.extend_from_slice(&revision.to_le_bytes());
    material.extend_from_slice(label.as_bytes());
    let digest = crypto::keyed_hash(enc_key, &material);
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&digest[..IV_SIZE]);
    iv
}

// ── SignedMeta ────────────────────────────────────────────────────────────────

/// Canonical meta bytes plus the folder signature over them.
///
/// This is the unit of gossip: peers exchange SignedMetas, verify them
/// under the folder's verify key, and store them without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMeta {
    pub meta_bytes: Vec<u8>,
    pub signature: [u8; 64],
}

impl SignedMeta {
    /// Encode and sign a Meta. Fails `InsufficientPrivilege` for non-writer
    /// secrets.
    pub fn sign(meta: &Meta, secret: &Secret) -> Result<Self, SecretError> {
        let meta_bytes = meta.encode();
        let signature = secret.sign(&meta_bytes)?;
        Ok(Self {
            meta_bytes,
            signature,
        })
    }

    /// Verify the signature under the folder's verify key.
    pub fn verify(&self, secret: &Secret) -> Result<(), MetaError> {
        secret
            .verify(&self.meta_bytes, &self.signature)
            .map_err(|_| MetaError::SignatureInvalid)
    }

    /// Decode the canonical bytes.
    pub fn meta(&self) -> Result<Meta, MetaError> {
        Meta::decode(&self.meta_bytes)
    }
}

// ── Byte reader ───────────────────────────────────────────────────────────────

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], MetaError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(MetaError::Malformed("truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], MetaError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, MetaError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, MetaError> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    fn u64(&mut self) -> Result<u64, MetaError> {
        Ok(u64::from_le_bytes(self.array::<8>()?))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("malformed meta: {0}")]
    Malformed(&'static str),

    #[error("meta signature verification failed")]
    SignatureInvalid,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
