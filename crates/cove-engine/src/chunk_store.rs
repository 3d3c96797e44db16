//! Content-addressable store of encrypted chunk blobs.
//!
//! Blobs are keyed by the BLAKE3 hash of their (encrypted) bytes and laid
//! out two levels deep by hash prefix: `chunks/<hh>/<full hex hash>`.
//! Writes land in a temp file in the target shard and are renamed into
//! place, so concurrent `put`s of the same hash and crash-interrupted
//! writes are both harmless. The store keeps no in-memory index — the
//! directory tree is the truth.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use rand::RngCore;
use thiserror::Error;

use cove_core::crypto;

use crate::index::{GcLease, Index, IndexError};

const TEMP_PREFIX: &str = ".tmp-";

pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Open (or create) the store rooted at `system_path/chunks`, and
    /// reclaim any temp files a previous run left behind.
    pub fn open(system_path: &Path) -> Result<Self, StoreError> {
        let root = system_path.join("chunks");
        std::fs::create_dir_all(&root)?;
        let store = Self { root };
        store.sweep_temp()?;
        Ok(store)
    }

    fn shard_dir(&self, ct_hash: &[u8; 32]) -> PathBuf {
        self.root.join(&hex::encode(ct_hash)[..2])
    }

    fn blob_path(&self, ct_hash: &[u8; 32]) -> PathBuf {
        self.shard_dir(ct_hash).join(hex::encode(ct_hash))
    }

    /// Insert a blob. Idempotent: a second put of the same hash is a no-op.
    /// Fails `HashMismatch` when the bytes do not hash to `ct_hash`.
    pub fn put(&self, ct_hash: &[u8; 32], bytes: &[u8]) -> Result<(), StoreError> {
        if crypto::hash(bytes) != *ct_hash {
            return Err(StoreError::HashMismatch);
        }

        let path = self.blob_path(ct_hash);
        if path.exists() {
            return Ok(());
        }

        let shard = self.shard_dir(ct_hash);
        std::fs::create_dir_all(&shard)?;

        let mut suffix = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut suffix);
        let temp = shard.join(format!("{TEMP_PREFIX}{}", hex::encode(suffix)));

        std::fs::write(&temp, bytes)?;
        match std::fs::rename(&temp, &path) {
            Ok(()) => Ok(()),
            Err(e) => {
                // A concurrent put may have won the rename; that's fine.
                let _ = std::fs::remove_file(&temp);
                if path.exists() {
                    Ok(())
                } else {
                    Err(StoreError::Io(e))
                }
            }
        }
    }

    /// Fetch a blob by hash.
    pub fn get(&self, ct_hash: &[u8; 32]) -> Result<Bytes, StoreError> {
        match std::fs::read(self.blob_path(ct_hash)) {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    pub fn has(&self, ct_hash: &[u8; 32]) -> bool {
        self.blob_path(ct_hash).exists()
    }

    /// Enumerate locally-held hashes. The shard list is snapshotted up
    /// front, so the iteration is restartable and stable under concurrent
    /// inserts into other shards.
    pub fn iter(&self) -> impl Iterator<Item = [u8; 32]> {
        let mut shards: Vec<PathBuf> = std::fs::read_dir(&self.root)
            .into_iter()
            .flatten()
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        shards.sort();

        shards.into_iter().flat_map(|shard| {
            let mut hashes: Vec<[u8; 32]> = std::fs::read_dir(shard)
                .into_iter()
                .flatten()
                .flatten()
                .filter_map(|entry| {
                    let name = entry.file_name();
                    let name = name.to_str()?;
                    if name.starts_with(TEMP_PREFIX) {
                        return None;
                    }
                    let bytes = hex::decode(name).ok()?;
                    bytes.try_into().ok()
                })
                .collect();
            hashes.sort();
            hashes.into_iter()
        })
    }

    /// Remove a blob. Only callable under the Index's GC lease, which
    /// blocks concurrent upserts from re-referencing the hash mid-sweep.
    pub fn remove(&self, ct_hash: &[u8; 32], _lease: &GcLease<'_>) -> Result<(), StoreError> {
        match std::fs::remove_file(self.blob_path(ct_hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Delete chunks no current Index entry references. Returns the number
    /// of blobs removed.
    pub fn collect_garbage(&self, index: &Index) -> Result<usize, StoreError> {
        let lease = index.gc_lease();
        let referenced = index.referenced_chunks().map_err(StoreError::Index)?;

        let mut removed = 0usize;
        for ct_hash in self.iter() {
            if !referenced.contains(&ct_hash) {
                self.remove(&ct_hash, &lease)?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "chunk store garbage collected");
        }
        Ok(removed)
    }

    /// Remove orphaned temp files (interrupted writes from a prior run).
    fn sweep_temp(&self) -> Result<(), StoreError> {
        for shard in std::fs::read_dir(&self.root)?.flatten() {
            if !shard.path().is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(shard.path())?.flatten() {
                if entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(TEMP_PREFIX))
                {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob bytes do not hash to the requested ct_hash")]
    HashMismatch,

    #[error("chunk not present in store")]
    NotFound,

    #[error("index error during store operation: {0}")]
    Index(IndexError),

    #[error("chunk store I/O: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
