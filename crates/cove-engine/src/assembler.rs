//! Assembler — the inverse of the scanner. Given an index entry whose
//! chunks are all locally present, decrypts and reassembles the object at
//! its path with the recorded attributes.
//!
//! Files are written to a temp name under `system_path` and renamed into
//! place. After every write the resulting mtime+size are recorded in the
//! index as the assembly mark, so the scanner recognizes the ensuing
//! filesystem event as self-caused. A locally-modified file is never
//! overwritten silently: it is renamed to `<name>.sync-conflict.<revision>`
//! first and the remote revision written alongside it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::broadcast;

use cove_core::config::FolderParams;
use cove_core::crypto::{self, ChunkCipher};
use cove_core::meta::{self, Kind, Meta, MetaError};
use cove_core::secret::Secret;

use crate::chunk_store::{ChunkStore, StoreError};
use crate::index::{AssemblyMark, Index, IndexError};

/// Per-path mutual exclusion between the scanner and the assembler.
///
/// Whichever side holds a path's lock runs; the other defers. The
/// controller hands both components the same instance.
#[derive(Default)]
pub struct PathLocks {
    set: DashSet<[u8; 32]>,
}

impl PathLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Try to take the lock for a path. `None` means the other side holds
    /// it; the caller should defer and retry.
    pub fn try_acquire(self: &Arc<Self>, path_hash: [u8; 32]) -> Option<PathLockGuard> {
        if self.set.insert(path_hash) {
            Some(PathLockGuard {
                locks: self.clone(),
                path_hash,
            })
        } else {
            None
        }
    }
}

pub struct PathLockGuard {
    locks: Arc<PathLocks>,
    path_hash: [u8; 32],
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        self.locks.set.remove(&self.path_hash);
    }
}

/// Outcome of one assembly attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum AssembleOutcome {
    /// Filesystem already reflected this revision.
    AlreadyCurrent,
    /// Object written (or removed, for Deleted metas).
    Assembled,
    /// A local edit was preserved under a conflict name first.
    AssembledWithConflict(PathBuf),
    /// Entry incomplete or missing; nothing done.
    Skipped,
    /// The scanner holds this path; retry later.
    Deferred,
}

#[derive(Clone)]
pub struct Assembler {
    params: FolderParams,
    enc_key: [u8; 32],
    index: Arc<Index>,
    store: Arc<ChunkStore>,
    locks: Arc<PathLocks>,
}

impl Assembler {
    pub fn new(
        params: FolderParams,
        secret: &Secret,
        index: Arc<Index>,
        store: Arc<ChunkStore>,
        locks: Arc<PathLocks>,
    ) -> Result<Self, AssembleError> {
        let enc_key = *secret
            .derive_encryption_key()
            .map_err(|_| AssembleError::NoDecryptKey)?;
        Ok(Self {
            params,
            enc_key,
            index,
            store,
            locks,
        })
    }

    /// Event loop: watch the index for entries that became complete and
    /// reify them. Temp-write failures retry with backoff; everything else
    /// is logged and dropped (the next event or rescan retries).
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut events = self.index.subscribe();
        // Catch up on entries that became complete before we started
        // (e.g. across a restart).
        self.sweep().await;
        loop {
            let path_hash = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("assembler shutting down");
                    return;
                }
                event = events.recv() => match event {
                    Ok(event) => event.path_hash,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "assembler lagged; sweeping all entries");
                        self.sweep().await;
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            };
            self.apply_with_retry(path_hash).await;
        }
    }

    /// Apply every complete entry. Used after event lag and at startup.
    pub async fn sweep(&self) {
        let entries = match self.index.iter_all() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "assembler sweep failed to list entries");
                return;
            }
        };
        for entry in entries {
            if let Ok(meta) = entry.meta() {
                self.apply_with_retry(meta.path_hash).await;
            }
        }
    }

    async fn apply_with_retry(&self, path_hash: [u8; 32]) {
        let mut delay = Duration::from_millis(100);
        for attempt in 0..4 {
            let this = self.clone();
            let result =
                tokio::task::spawn_blocking(move || this.apply(&path_hash)).await;
            match result {
                Ok(Ok(outcome)) => {
                    if let AssembleOutcome::AssembledWithConflict(conflict) = &outcome {
                        tracing::info!(
                            path_hash = hex::encode(&path_hash[..8]),
                            conflict = %conflict.display(),
                            "local edit preserved as conflict copy"
                        );
                    }
                    if outcome == AssembleOutcome::Deferred {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return;
                }
                Ok(Err(AssembleError::Io(e))) if attempt < 3 => {
                    tracing::warn!(
                        path_hash = hex::encode(&path_hash[..8]),
                        error = %e,
                        attempt,
                        "assembly write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        path_hash = hex::encode(&path_hash[..8]),
                        error = %e,
                        "assembly failed"
                    );
                    return;
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "assembly task panicked");
                    return;
                }
            }
        }
    }

    /// Reify one index entry to the filesystem, if it is complete and the
    /// disk does not already reflect it.
    pub fn apply(&self, path_hash: &[u8; 32]) -> Result<AssembleOutcome, AssembleError> {
        // Take the path lock before reading the entry, so the mark and
        // bitmap we act on cannot be concurrently rewritten by the scanner.
        let Some(_guard) = self.locks.try_acquire(*path_hash) else {
            return Ok(AssembleOutcome::Deferred);
        };

        let Some(entry) = self.index.get(path_hash)? else {
            return Ok(AssembleOutcome::Skipped);
        };
        if !entry.is_complete() {
            return Ok(AssembleOutcome::Skipped);
        }

        let meta = entry.meta()?;
        let rel = self.cleartext_path(&meta)?;
        let abs = self.params.path.join(&rel);
        let mark = entry.assembly_mark;

        match meta.kind {
            Kind::File => self.apply_file(&meta, &rel, &abs, mark),
            Kind::Directory => self.apply_directory(&meta, &abs),
            Kind::Symlink => self.apply_symlink(&meta, &abs),
            Kind::Deleted => self.apply_deleted(&meta, &abs),
        }
    }

    fn cleartext_path(&self, meta: &Meta) -> Result<String, AssembleError> {
        let bytes = meta::open_name(
            &self.enc_key,
            &meta.path_hash,
            meta.revision,
            "path",
            &meta.path_ct,
        )?;
        String::from_utf8(bytes).map_err(|_| AssembleError::BadPath)
    }

    fn apply_file(
        &self,
        meta: &Meta,
        rel: &str,
        abs: &Path,
        mark: Option<AssemblyMark>,
    ) -> Result<AssembleOutcome, AssembleError> {
        let total = meta.total_size();
        if stat_matches(abs, meta.mtime, total) {
            // Disk already reflects this revision. Record a mark only if
            // none matches yet; a scanner-written mark keeps its origin so
            // a lost revision race still sides the local content.
            if !mark.is_some_and(|m| m.matches(meta.mtime, total)) {
                self.record_mark(&meta.path_hash, abs)?;
            }
            return Ok(AssembleOutcome::AlreadyCurrent);
        }

        // Decrypt and verify every chunk before touching the tree.
        let cipher = ChunkCipher::new(self.enc_key);
        let mut content = Vec::with_capacity(total as usize);
        for chunk in &meta.chunks {
            let ciphertext = self.store.get(&chunk.ct_hash)?;
            let plaintext = cipher.decrypt(&chunk.iv, &ciphertext)?;
            if crypto::keyed_hash(&self.enc_key, &plaintext) != chunk.pt_hash_hmac {
                return Err(AssembleError::PlaintextHashMismatch);
            }
            content.extend_from_slice(&plaintext);
        }

        // Decide whether the existing file must be preserved. An unsynced
        // user edit (no matching mark) always is; so is a locally-committed
        // revision that just lost a concurrent-edit race (mark written by
        // the scanner). Content the engine itself assembled from peers is
        // simply superseded.
        let mut conflict = None;
        if let Ok(stat) = std::fs::symlink_metadata(abs) {
            let keep_local = match mark {
                Some(m) if m.matches(mtime_micros(&stat), stat.len()) => m.local_origin,
                _ => true,
            };
            if keep_local {
                let conflict_path = self
                    .params
                    .path
                    .join(format!("{rel}.sync-conflict.{}", meta.revision));
                std::fs::rename(abs, &conflict_path)?;
                conflict = Some(conflict_path);
            }
        }

        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp = self.temp_path();
        std::fs::write(&temp, &content)?;
        set_mtime(&temp, meta.mtime)?;
        self.apply_attribs(&temp, meta)?;
        std::fs::rename(&temp, abs)?;

        self.record_mark(&meta.path_hash, abs)?;

        tracing::debug!(
            path_hash = hex::encode(&meta.path_hash[..8]),
            bytes = total,
            "file assembled"
        );
        Ok(match conflict {
            Some(path) => AssembleOutcome::AssembledWithConflict(path),
            None => AssembleOutcome::Assembled,
        })
    }

    fn apply_directory(&self, meta: &Meta, abs: &Path) -> Result<AssembleOutcome, AssembleError> {
        let existed = abs.is_dir();
        std::fs::create_dir_all(abs)?;
        self.apply_attribs(abs, meta)?;
        self.record_mark(&meta.path_hash, abs)?;
        Ok(if existed {
            AssembleOutcome::AlreadyCurrent
        } else {
            AssembleOutcome::Assembled
        })
    }

    fn apply_symlink(&self, meta: &Meta, abs: &Path) -> Result<AssembleOutcome, AssembleError> {
        if !self.params.preserve_symlinks {
            return Ok(AssembleOutcome::Skipped);
        }
        let target_ct = meta
            .symlink_target_ct
            .as_ref()
            .ok_or(AssembleError::BadPath)?;
        let target = meta::open_name(
            &self.enc_key,
            &meta.path_hash,
            meta.revision,
            "link",
            target_ct,
        )?;
        let target = String::from_utf8(target).map_err(|_| AssembleError::BadPath)?;

        if let Ok(existing) = std::fs::read_link(abs) {
            if existing == Path::new(&target) {
                return Ok(AssembleOutcome::AlreadyCurrent);
            }
            std::fs::remove_file(abs)?;
        }
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, abs)?;
        #[cfg(windows)]
        std::os::windows::fs::symlink_file(&target, abs)?;

        self.record_mark(&meta.path_hash, abs)?;
        Ok(AssembleOutcome::Assembled)
    }

    /// Record the on-disk state we just produced. Marks written here carry
    /// `local_origin = false`: the content came from peers.
    fn record_mark(&self, path_hash: &[u8; 32], abs: &Path) -> Result<(), AssembleError> {
        let stat = std::fs::symlink_metadata(abs)?;
        self.index.set_assembly_mark(
            path_hash,
            AssemblyMark {
                mtime: mtime_micros(&stat),
                size: if stat.is_dir() { 0 } else { stat.len() },
                local_origin: false,
            },
        )?;
        Ok(())
    }

    fn apply_deleted(&self, meta: &Meta, abs: &Path) -> Result<AssembleOutcome, AssembleError> {
        let Ok(stat) = std::fs::symlink_metadata(abs) else {
            return Ok(AssembleOutcome::AlreadyCurrent);
        };

        // Only remove what we know: local state must still match the last
        // assembly mark, otherwise the user's unsynced edit wins and the
        // next scan will index it as a new revision.
        let mark = self.index.assembly_mark(&meta.path_hash)?;
        let unchanged = mark.is_some_and(|m| m.matches(mtime_micros(&stat), stat.len()));
        if stat.is_file() && !unchanged {
            tracing::info!(
                path_hash = hex::encode(&meta.path_hash[..8]),
                "deletion skipped: local file modified since last sync"
            );
            return Ok(AssembleOutcome::Skipped);
        }

        if stat.is_dir() {
            // Only empty directories are removed; contents have their own
            // metas and get deleted first.
            if std::fs::remove_dir(abs).is_err() {
                return Ok(AssembleOutcome::Skipped);
            }
        } else {
            std::fs::remove_file(abs)?;
        }
        Ok(AssembleOutcome::Assembled)
    }

    fn apply_attribs(&self, path: &Path, meta: &Meta) -> Result<(), AssembleError> {
        #[cfg(unix)]
        if self.params.preserve_unix_attrib {
            if let Some(mode) = meta.unix_attrib {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
            }
        }
        #[cfg(not(unix))]
        let _ = (path, meta);
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut suffix = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut suffix);
        self.params
            .system_path()
            .join(format!(".assemble-{}", hex::encode(suffix)))
    }
}

fn mtime_micros(stat: &std::fs::Metadata) -> i64 {
    stat.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn stat_matches(path: &Path, mtime: i64, size: u64) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(stat) => stat.is_file() && stat.len() == size && mtime_micros(&stat) == mtime,
        Err(_) => false,
    }
}

fn set_mtime(path: &Path, mtime: i64) -> std::io::Result<()> {
    let time = std::time::UNIX_EPOCH + Duration::from_micros(mtime.max(0) as u64);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(std::fs::FileTimes::new().set_modified(time))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("secret cannot decrypt folder content")]
    NoDecryptKey,

    #[error("decrypted chunk does not match its recorded plaintext hash")]
    PlaintextHashMismatch,

    #[error("meta carries an undecodable path")]
    BadPath,

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] cove_core::crypto::CryptoError),

    #[error("assembly I/O: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
