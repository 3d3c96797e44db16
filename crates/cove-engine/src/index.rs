//! The folder index — durable mapping from path hash to the latest
//! SignedMeta known for that path, plus a "chunks present" bitmap per
//! entry, a plaintext-hash dedup index, and assembly marks.
//!
//! Backed by SQLite (`system_path/index.db`, WAL). The index is the single
//! source of truth for a folder: every mutation goes through its
//! transactional API and every row carries a BLAKE3 checksum over its
//! logical fields. A checksum mismatch means on-disk corruption; the index
//! refuses to serve rather than silently discarding data.
//!
//! Change events go out on a broadcast channel. Events are a hint, not a
//! log: a subscriber that lags simply re-reads current state, so observers
//! see the present, not every intermediate.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::broadcast;

use cove_core::crypto;
use cove_core::meta::{Meta, MetaError, SignedMeta};
use cove_core::secret::Secret;

const EVENT_CAPACITY: usize = 1024;

/// One coalescable change notification.
#[derive(Debug, Clone, Copy)]
pub struct IndexEvent {
    pub path_hash: [u8; 32],
    /// A new revision was committed for this path.
    pub new_meta: bool,
    /// The "chunks present" bitmap changed.
    pub bitmap_changed: bool,
}

/// Presence bitmap over a meta's chunk list. Empty for non-File entries,
/// which are therefore trivially complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, len: usize) -> Self {
        let mut bitmap = Self { bits: bytes, len };
        bitmap.bits.resize(len.div_ceil(8), 0);
        bitmap
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> bool {
        i < self.len && self.bits[i / 8] & (1 << (i % 8)) != 0
    }

    pub fn set(&mut self, i: usize, present: bool) {
        if present {
            self.bits[i / 8] |= 1 << (i % 8);
        } else {
            self.bits[i / 8] &= !(1 << (i % 8));
        }
    }

    /// True when every chunk is present (vacuously true for empty maps).
    pub fn is_full(&self) -> bool {
        (0..self.len).all(|i| self.get(i))
    }

    pub fn count_set(&self) -> usize {
        (0..self.len).filter(|&i| self.get(i)).count()
    }

    /// Indices still missing.
    pub fn missing(&self) -> Vec<usize> {
        (0..self.len).filter(|&i| !self.get(i)).collect()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

/// Record of the filesystem state the engine itself last produced for a
/// path — by assembling a remote revision or by indexing a local one.
/// Lets the scanner recognize self-caused events and the assembler tell a
/// committed local edit from an unsynced user edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyMark {
    pub mtime: i64,
    pub size: u64,
    /// True when the scanner wrote the mark (content originated here),
    /// false when the assembler did (content came from a peer).
    pub local_origin: bool,
}

impl AssemblyMark {
    pub fn matches(&self, mtime: i64, size: u64) -> bool {
        self.mtime == mtime && self.size == size
    }
}

/// A stored entry: the signed meta plus local-only bookkeeping.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub signed_meta: SignedMeta,
    pub revision: u64,
    pub bitmap: Bitmap,
    /// Survives upserts: it describes the disk, not the meta.
    pub assembly_mark: Option<AssemblyMark>,
}

impl IndexEntry {
    pub fn meta(&self) -> Result<Meta, MetaError> {
        self.signed_meta.meta()
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.is_full()
    }
}

/// Dedup record: plaintext hash → the encrypted chunk already stored.
#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub ct_hash: [u8; 32],
    pub iv: [u8; 12],
    pub size: u32,
}

/// Held for the duration of a garbage-collection sweep; blocks upserts so
/// a sweep can never race a new reference to a chunk it is removing.
pub struct GcLease<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

pub struct Index {
    conn: Mutex<Connection>,
    secret: Secret,
    events: broadcast::Sender<IndexEvent>,
    gc: Mutex<()>,
}

impl Index {
    /// Open (or create) the index at `system_path/index.db` and verify
    /// every stored row's checksum. Any mismatch fails the open with
    /// `Corrupted` — a damaged index must not silently lose entries.
    pub fn open(system_path: &Path, secret: Secret) -> Result<Self, IndexError> {
        std::fs::create_dir_all(system_path).map_err(|_| IndexError::Corrupted)?;
        let conn = Connection::open(system_path.join("index.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                 path_hash        BLOB PRIMARY KEY,
                 meta             BLOB NOT NULL,
                 signature        BLOB NOT NULL,
                 revision         INTEGER NOT NULL,
                 bitmap           BLOB NOT NULL,
                 assembled_mtime  INTEGER,
                 assembled_size   INTEGER,
                 mark_local       INTEGER NOT NULL DEFAULT 0,
                 checksum         BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS dedup (
                 pt_hash  BLOB PRIMARY KEY,
                 ct_hash  BLOB NOT NULL,
                 iv       BLOB NOT NULL,
                 size     INTEGER NOT NULL
             );",
        )?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let index = Self {
            conn: Mutex::new(conn),
            secret,
            events,
            gc: Mutex::new(()),
        };
        index.verify_integrity()?;
        Ok(index)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to change events. On `Lagged`, re-read current state.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: IndexEvent) {
        let _ = self.events.send(event);
    }

    /// Commit a new SignedMeta for its path.
    ///
    /// The signature is verified first; the transaction replaces the stored
    /// entry iff the new revision is strictly greater, or equal with a
    /// lexicographically greater signature (the deterministic tiebreak every
    /// node applies identically). Anything else is `Stale`.
    pub fn upsert(&self, signed: &SignedMeta) -> Result<(), IndexError> {
        let _gc = self.gc.lock().unwrap_or_else(|e| e.into_inner());

        signed.verify(&self.secret)?;
        let meta = signed.meta()?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing: Option<(i64, Vec<u8>)> = tx
            .query_row(
                "SELECT revision, signature FROM meta WHERE path_hash = ?1",
                params![&meta.path_hash[..]],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((old_revision, old_signature)) = existing {
            let old_revision = old_revision as u64;
            let newer = meta.revision > old_revision
                || (meta.revision == old_revision && signed.signature[..] > old_signature[..]);
            if !newer {
                return Err(IndexError::Stale);
            }
        }

        // The assembly mark describes the disk, which an upsert does not
        // touch; carry it over from the replaced row.
        let mark: Option<AssemblyMark> = tx
            .query_row(
                "SELECT assembled_mtime, assembled_size, mark_local
                 FROM meta WHERE path_hash = ?1",
                params![&meta.path_hash[..]],
                |row| {
                    let mtime: Option<i64> = row.get(0)?;
                    let size: Option<i64> = row.get(1)?;
                    let local: i64 = row.get(2)?;
                    Ok(mtime.zip(size).map(|(mtime, size)| AssemblyMark {
                        mtime,
                        size: size as u64,
                        local_origin: local != 0,
                    }))
                },
            )
            .optional()?
            .flatten();

        let bitmap = Bitmap::new(meta.chunks.len());
        let checksum = row_checksum(
            &meta.path_hash,
            &signed.meta_bytes,
            &signed.signature,
            meta.revision,
            bitmap.as_bytes(),
            mark,
        );

        tx.execute(
            "INSERT OR REPLACE INTO meta
                 (path_hash, meta, signature, revision, bitmap,
                  assembled_mtime, assembled_size, mark_local, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &meta.path_hash[..],
                &signed.meta_bytes,
                &signed.signature[..],
                meta.revision as i64,
                bitmap.as_bytes(),
                mark.map(|m| m.mtime),
                mark.map(|m| m.size as i64),
                mark.map(|m| m.local_origin as i64).unwrap_or(0),
                &checksum[..],
            ],
        )?;
        tx.commit()?;

        self.emit(IndexEvent {
            path_hash: meta.path_hash,
            new_meta: true,
            bitmap_changed: true,
        });
        Ok(())
    }

    /// Fetch the entry for a path hash.
    pub fn get(&self, path_hash: &[u8; 32]) -> Result<Option<IndexEntry>, IndexError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT meta, signature, revision, bitmap,
                        assembled_mtime, assembled_size, mark_local, checksum
                 FROM meta WHERE path_hash = ?1",
                params![&path_hash[..]],
                |row| {
                    Ok(RawRow {
                        meta: row.get(0)?,
                        signature: row.get(1)?,
                        revision: row.get(2)?,
                        bitmap: row.get(3)?,
                        assembled_mtime: row.get(4)?,
                        assembled_size: row.get(5)?,
                        mark_local: row.get(6)?,
                        checksum: row.get(7)?,
                    })
                },
            )
            .optional()?;
        row.map(|raw| raw.into_entry(path_hash)).transpose()
    }

    /// All entries, in unspecified order.
    pub fn iter_all(&self) -> Result<Vec<IndexEntry>, IndexError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT path_hash, meta, signature, revision, bitmap,
                    assembled_mtime, assembled_size, mark_local, checksum
             FROM meta",
        )?;
        let rows = stmt.query_map([], |row| {
            let path_hash: Vec<u8> = row.get(0)?;
            Ok((
                path_hash,
                RawRow {
                    meta: row.get(1)?,
                    signature: row.get(2)?,
                    revision: row.get(3)?,
                    bitmap: row.get(4)?,
                    assembled_mtime: row.get(5)?,
                    assembled_size: row.get(6)?,
                    mark_local: row.get(7)?,
                    checksum: row.get(8)?,
                },
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (path_hash, raw) = row?;
            let path_hash: [u8; 32] =
                path_hash.try_into().map_err(|_| IndexError::Corrupted)?;
            entries.push(raw.into_entry(&path_hash)?);
        }
        Ok(entries)
    }

    /// Flip one chunk-presence bit. Emits an event only when the bit
    /// actually changed.
    pub fn set_chunk_present(
        &self,
        path_hash: &[u8; 32],
        chunk_index: usize,
        present: bool,
    ) -> Result<(), IndexError> {
        let entry = self.get(path_hash)?.ok_or(IndexError::NotFound)?;
        if chunk_index >= entry.bitmap.len() {
            return Err(IndexError::BadChunkIndex(chunk_index));
        }
        if entry.bitmap.get(chunk_index) == present {
            return Ok(());
        }

        let mut bitmap = entry.bitmap.clone();
        bitmap.set(chunk_index, present);
        self.write_bookkeeping(path_hash, &entry, &bitmap, entry.assembly_mark)?;

        self.emit(IndexEvent {
            path_hash: *path_hash,
            new_meta: false,
            bitmap_changed: true,
        });
        Ok(())
    }

    /// The presence bitmap for a path.
    pub fn bitmap(&self, path_hash: &[u8; 32]) -> Result<Option<Bitmap>, IndexError> {
        Ok(self.get(path_hash)?.map(|entry| entry.bitmap))
    }

    /// Whether every chunk of the entry is locally present.
    pub fn is_complete(&self, path_hash: &[u8; 32]) -> Result<bool, IndexError> {
        Ok(self
            .get(path_hash)?
            .map(|entry| entry.is_complete())
            .unwrap_or(false))
    }

    /// Record the filesystem state the engine just produced for a path,
    /// so the Scanner recognizes the resulting event as self-caused and
    /// the Assembler can tell committed content from user edits.
    pub fn set_assembly_mark(
        &self,
        path_hash: &[u8; 32],
        mark: AssemblyMark,
    ) -> Result<(), IndexError> {
        let entry = self.get(path_hash)?.ok_or(IndexError::NotFound)?;
        self.write_bookkeeping(path_hash, &entry, &entry.bitmap, Some(mark))
    }

    /// The last assembly mark, if any.
    pub fn assembly_mark(&self, path_hash: &[u8; 32]) -> Result<Option<AssemblyMark>, IndexError> {
        Ok(self.get(path_hash)?.and_then(|entry| entry.assembly_mark))
    }

    fn write_bookkeeping(
        &self,
        path_hash: &[u8; 32],
        entry: &IndexEntry,
        bitmap: &Bitmap,
        mark: Option<AssemblyMark>,
    ) -> Result<(), IndexError> {
        let checksum = row_checksum(
            path_hash,
            &entry.signed_meta.meta_bytes,
            &entry.signed_meta.signature,
            entry.revision,
            bitmap.as_bytes(),
            mark,
        );
        self.conn().execute(
            "UPDATE meta SET bitmap = ?2, assembled_mtime = ?3,
                             assembled_size = ?4, mark_local = ?5, checksum = ?6
             WHERE path_hash = ?1",
            params![
                &path_hash[..],
                bitmap.as_bytes(),
                mark.map(|m| m.mtime),
                mark.map(|m| m.size as i64),
                mark.map(|m| m.local_origin as i64).unwrap_or(0),
                &checksum[..],
            ],
        )?;
        Ok(())
    }

    // ── Dedup secondary index ─────────────────────────────────────────────────

    /// Look up an already-encrypted chunk by its plaintext hash.
    pub fn lookup_dedup(&self, pt_hash: &[u8; 32]) -> Result<Option<DedupEntry>, IndexError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT ct_hash, iv, size FROM dedup WHERE pt_hash = ?1",
                params![&pt_hash[..]],
                |row| {
                    let ct_hash: Vec<u8> = row.get(0)?;
                    let iv: Vec<u8> = row.get(1)?;
                    let size: i64 = row.get(2)?;
                    Ok((ct_hash, iv, size))
                },
            )
            .optional()?;
        row.map(|(ct_hash, iv, size)| {
            Ok(DedupEntry {
                ct_hash: ct_hash.try_into().map_err(|_| IndexError::Corrupted)?,
                iv: iv.try_into().map_err(|_| IndexError::Corrupted)?,
                size: size as u32,
            })
        })
        .transpose()
    }

    pub fn record_dedup(
        &self,
        pt_hash: &[u8; 32],
        ct_hash: &[u8; 32],
        iv: &[u8; 12],
        size: u32,
    ) -> Result<(), IndexError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO dedup (pt_hash, ct_hash, iv, size)
             VALUES (?1, ?2, ?3, ?4)",
            params![&pt_hash[..], &ct_hash[..], &iv[..], size as i64],
        )?;
        Ok(())
    }

    // ── Garbage collection support ────────────────────────────────────────────

    /// Take the GC lease. Upserts block until it is dropped.
    pub fn gc_lease(&self) -> GcLease<'_> {
        GcLease(self.gc.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Every ct_hash referenced by any current entry.
    pub fn referenced_chunks(&self) -> Result<HashSet<[u8; 32]>, IndexError> {
        let mut referenced = HashSet::new();
        for entry in self.iter_all()? {
            for chunk in entry.meta()?.chunks {
                referenced.insert(chunk.ct_hash);
            }
        }
        Ok(referenced)
    }

    // ── Integrity ─────────────────────────────────────────────────────────────

    fn verify_integrity(&self) -> Result<(), IndexError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT path_hash, meta, signature, revision, bitmap,
                    assembled_mtime, assembled_size, mark_local, checksum
             FROM meta",
        )?;
        let rows = stmt.query_map([], |row| {
            let path_hash: Vec<u8> = row.get(0)?;
            Ok((
                path_hash,
                RawRow {
                    meta: row.get(1)?,
                    signature: row.get(2)?,
                    revision: row.get(3)?,
                    bitmap: row.get(4)?,
                    assembled_mtime: row.get(5)?,
                    assembled_size: row.get(6)?,
                    mark_local: row.get(7)?,
                    checksum: row.get(8)?,
                },
            ))
        })?;

        for row in rows {
            let (path_hash, raw) = row?;
            let path_hash: [u8; 32] =
                path_hash.try_into().map_err(|_| IndexError::Corrupted)?;
            raw.into_entry(&path_hash)?;
        }
        Ok(())
    }
}

struct RawRow {
    meta: Vec<u8>,
    signature: Vec<u8>,
    revision: i64,
    bitmap: Vec<u8>,
    assembled_mtime: Option<i64>,
    assembled_size: Option<i64>,
    mark_local: i64,
    checksum: Vec<u8>,
}

impl RawRow {
    fn into_entry(self, path_hash: &[u8; 32]) -> Result<IndexEntry, IndexError> {
        let signature: [u8; 64] = self
            .signature
            .try_into()
            .map_err(|_| IndexError::Corrupted)?;
        let mark = self
            .assembled_mtime
            .zip(self.assembled_size)
            .map(|(mtime, size)| AssemblyMark {
                mtime,
                size: size as u64,
                local_origin: self.mark_local != 0,
            });
        let expected = row_checksum(
            path_hash,
            &self.meta,
            &signature,
            self.revision as u64,
            &self.bitmap,
            mark,
        );
        if self.checksum != expected {
            tracing::error!(
                path_hash = hex::encode(&path_hash[..8]),
                "index row checksum mismatch"
            );
            return Err(IndexError::Corrupted);
        }

        let signed_meta = SignedMeta {
            meta_bytes: self.meta,
            signature,
        };
        let chunk_count = signed_meta.meta()?.chunks.len();
        Ok(IndexEntry {
            signed_meta,
            revision: self.revision as u64,
            bitmap: Bitmap::from_bytes(self.bitmap, chunk_count),
            assembly_mark: mark,
        })
    }
}

fn row_checksum(
    path_hash: &[u8; 32],
    meta: &[u8],
    signature: &[u8; 64],
    revision: u64,
    bitmap: &[u8],
    mark: Option<AssemblyMark>,
) -> [u8; 32] {
    let mut hasher = crypto::Hasher::new();
    hasher.update(path_hash);
    hasher.update(&(meta.len() as u64).to_le_bytes());
    hasher.update(meta);
    hasher.update(signature);
    hasher.update(&revision.to_le_bytes());
    hasher.update(&(bitmap.len() as u64).to_le_bytes());
    hasher.update(bitmap);
    hasher.update(&mark.map(|m| m.mtime).unwrap_or(i64::MIN).to_le_bytes());
    hasher.update(&mark.map(|m| m.size).unwrap_or(u64::MAX).to_le_bytes());
    hasher.update(&[mark.map(|m| m.local_origin as u8).unwrap_or(2)]);
    hasher.finalize()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("revision is not newer than the stored entry")]
    Stale,

    #[error("no entry for that path hash")]
    NotFound,

    #[error("index row failed its checksum — refusing to serve corrupted state")]
    Corrupted,

    #[error("chunk index {0} out of range for entry")]
    BadChunkIndex(usize),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error("index database error: {0}")]
    Db(#[from] rusqlite::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cove_core::meta::{FileChunk, Kind, StrongHashType};

    fn sample_meta(path_hash: [u8; 32], revision: u64, chunk_count: usize) -> Meta {
        let chunks = (0..chunk_count)
            .map(|i| FileChunk {
                ct_hash: [i as u8; 32],
                size: 1000 + i as u32,
                iv: [i as u8; 12],
                pt_hash_hmac: [0x10 + i as u8; 32],
            })
            .collect();
        Meta {
            path_hash,
            path_ct: vec![0xEE; 30],
            kind: Kind::File,
            revision,
            windows_attrib: None,
            unix_attrib: Some(0o644),
            symlink_target_ct: None,
            mtime: 1_700_000_000_000_000,
            strong_hash_type: StrongHashType::Blake3,
            chunks,
        }
    }

    fn open_index(dir: &Path) -> (Secret, Index) {
        let secret = Secret::generate();
        let index = Index::open(dir, secret.clone()).unwrap();
        (secret, index)
    }

    #[test]
    fn upsert_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, index) = open_index(dir.path());

        let meta = sample_meta([1u8; 32], 100, 2);
        let signed = SignedMeta::sign(&meta, &secret).unwrap();
        index.upsert(&signed).unwrap();

        let entry = index.get(&[1u8; 32]).unwrap().unwrap();
        assert_eq!(entry.signed_meta, signed);
        assert_eq!(entry.revision, 100);
        assert_eq!(entry.bitmap.len(), 2);
        assert!(!entry.is_complete());
    }

    #[test]
    fn stale_revision_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, index) = open_index(dir.path());

        let newer = SignedMeta::sign(&sample_meta([1u8; 32], 200, 1), &secret).unwrap();
        index.upsert(&newer).unwrap();

        let older = SignedMeta::sign(&sample_meta([1u8; 32], 100, 1), &secret).unwrap();
        assert!(matches!(index.upsert(&older), Err(IndexError::Stale)));

        // same revision, same signature → also stale
        assert!(matches!(index.upsert(&newer), Err(IndexError::Stale)));

        let entry = index.get(&[1u8; 32]).unwrap().unwrap();
        assert_eq!(entry.revision, 200);
    }

    #[test]
    fn equal_revision_breaks_ties_by_signature() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, index) = open_index(dir.path());

        // Two distinct metas at the same revision (different chunk lists)
        // get distinct signatures; the greater signature must win no matter
        // the insertion order.
        let a = SignedMeta::sign(&sample_meta([1u8; 32], 100, 1), &secret).unwrap();
        let b = SignedMeta::sign(&sample_meta([1u8; 32], 100, 2), &secret).unwrap();
        let (low, high) = if a.signature[..] < b.signature[..] {
            (a, b)
        } else {
            (b, a)
        };

        index.upsert(&low).unwrap();
        index.upsert(&high).unwrap();
        assert!(matches!(index.upsert(&low), Err(IndexError::Stale)));

        let entry = index.get(&[1u8; 32]).unwrap().unwrap();
        assert_eq!(entry.signed_meta, high);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, index) = open_index(dir.path());

        let mut signed = SignedMeta::sign(&sample_meta([1u8; 32], 100, 1), &secret).unwrap();
        signed.signature[5] ^= 0xFF;
        assert!(matches!(
            index.upsert(&signed),
            Err(IndexError::Meta(MetaError::SignatureInvalid))
        ));
        assert!(index.get(&[1u8; 32]).unwrap().is_none());
    }

    #[test]
    fn chunk_presence_bits() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, index) = open_index(dir.path());

        let signed = SignedMeta::sign(&sample_meta([1u8; 32], 100, 3), &secret).unwrap();
        index.upsert(&signed).unwrap();

        assert!(!index.is_complete(&[1u8; 32]).unwrap());
        index.set_chunk_present(&[1u8; 32], 0, true).unwrap();
        index.set_chunk_present(&[1u8; 32], 2, true).unwrap();
        let bitmap = index.bitmap(&[1u8; 32]).unwrap().unwrap();
        assert_eq!(bitmap.missing(), vec![1]);

        index.set_chunk_present(&[1u8; 32], 1, true).unwrap();
        assert!(index.is_complete(&[1u8; 32]).unwrap());

        assert!(matches!(
            index.set_chunk_present(&[1u8; 32], 3, true),
            Err(IndexError::BadChunkIndex(3))
        ));
    }

    #[test]
    fn events_fire_on_upsert_and_bitmap_change() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, index) = open_index(dir.path());
        let mut events = index.subscribe();

        let signed = SignedMeta::sign(&sample_meta([1u8; 32], 100, 1), &secret).unwrap();
        index.upsert(&signed).unwrap();
        index.set_chunk_present(&[1u8; 32], 0, true).unwrap();
        // unchanged bit → no event
        index.set_chunk_present(&[1u8; 32], 0, true).unwrap();

        let first = events.try_recv().unwrap();
        assert!(first.new_meta);
        let second = events.try_recv().unwrap();
        assert!(second.bitmap_changed && !second.new_meta);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn dedup_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (_secret, index) = open_index(dir.path());

        assert!(index.lookup_dedup(&[9u8; 32]).unwrap().is_none());
        index
            .record_dedup(&[9u8; 32], &[8u8; 32], &[7u8; 12], 4096)
            .unwrap();
        let entry = index.lookup_dedup(&[9u8; 32]).unwrap().unwrap();
        assert_eq!(entry.ct_hash, [8u8; 32]);
        assert_eq!(entry.iv, [7u8; 12]);
        assert_eq!(entry.size, 4096);
    }

    #[test]
    fn assembly_mark_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, index) = open_index(dir.path());

        let signed = SignedMeta::sign(&sample_meta([1u8; 32], 100, 0), &secret).unwrap();
        index.upsert(&signed).unwrap();

        assert!(index.assembly_mark(&[1u8; 32]).unwrap().is_none());
        let mark = AssemblyMark {
            mtime: 1_700_000_000_000_000,
            size: 2048,
            local_origin: true,
        };
        index.set_assembly_mark(&[1u8; 32], mark).unwrap();
        assert_eq!(index.assembly_mark(&[1u8; 32]).unwrap(), Some(mark));
        assert!(index.assembly_mark(&[1u8; 32]).unwrap().unwrap().matches(
            1_700_000_000_000_000,
            2048
        ));
    }

    #[test]
    fn upsert_preserves_assembly_mark() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, index) = open_index(dir.path());

        index
            .upsert(&SignedMeta::sign(&sample_meta([1u8; 32], 100, 0), &secret).unwrap())
            .unwrap();
        let mark = AssemblyMark {
            mtime: 1,
            size: 2,
            local_origin: false,
        };
        index.set_assembly_mark(&[1u8; 32], mark).unwrap();

        // A newer meta replaces the entry, but the disk did not change.
        index
            .upsert(&SignedMeta::sign(&sample_meta([1u8; 32], 200, 0), &secret).unwrap())
            .unwrap();
        assert_eq!(index.assembly_mark(&[1u8; 32]).unwrap(), Some(mark));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Secret::generate();
        let signed;
        {
            let index = Index::open(dir.path(), secret.clone()).unwrap();
            signed = SignedMeta::sign(&sample_meta([1u8; 32], 100, 2), &secret).unwrap();
            index.upsert(&signed).unwrap();
            index.set_chunk_present(&[1u8; 32], 1, true).unwrap();
        }
        let index = Index::open(dir.path(), secret).unwrap();
        let entry = index.get(&[1u8; 32]).unwrap().unwrap();
        assert_eq!(entry.signed_meta, signed);
        assert!(entry.bitmap.get(1));
        assert!(!entry.bitmap.get(0));
    }

    #[test]
    fn corrupted_row_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Secret::generate();
        {
            let index = Index::open(dir.path(), secret.clone()).unwrap();
            index
                .upsert(&SignedMeta::sign(&sample_meta([1u8; 32], 100, 1), &secret).unwrap())
                .unwrap();
        }
        // Flip a byte in the stored meta behind the index's back.
        {
            let conn = Connection::open(dir.path().join("index.db")).unwrap();
            conn.execute("UPDATE meta SET revision = revision + 1", [])
                .unwrap();
        }
        assert!(matches!(
            Index::open(dir.path(), secret),
            Err(IndexError::Corrupted)
        ));
    }

    #[test]
    fn referenced_chunks_covers_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, index) = open_index(dir.path());

        index
            .upsert(&SignedMeta::sign(&sample_meta([1u8; 32], 100, 2), &secret).unwrap())
            .unwrap();
        index
            .upsert(&SignedMeta::sign(&sample_meta([2u8; 32], 100, 3), &secret).unwrap())
            .unwrap();

        let referenced = index.referenced_chunks().unwrap();
        // chunk ct_hashes are [0;32], [1;32], [2;32] (shared between entries)
        assert_eq!(referenced.len(), 3);
        assert!(referenced.contains(&[0u8; 32]));
        assert!(referenced.contains(&[2u8; 32]));
    }

    #[test]
    fn empty_bitmap_is_trivially_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, index) = open_index(dir.path());

        let meta = Meta {
            kind: Kind::Directory,
            chunks: Vec::new(),
            ..sample_meta([3u8; 32], 50, 0)
        };
        index
            .upsert(&SignedMeta::sign(&meta, &secret).unwrap())
            .unwrap();
        assert!(index.is_complete(&[3u8; 32]).unwrap());
    }
}
