//! Scanner / indexer — walks the live directory, detects changes, and
//! commits new signed metadata plus encrypted chunks.
//!
//! Two triggers feed it: filesystem watcher events, debounced per path
//! over `index_event_timeout` so a burst of writes produces one indexing
//! pass, and a periodic full rescan that catches whatever the watcher
//! missed. The watcher is a best-effort hint; correctness rests on the
//! rescan.
//!
//! A folder opened with a ReadOnly secret runs in verify-only mode: files
//! are chunked and hashed solely to confirm they match the index, and
//! mismatches are reported so the controller can re-assemble canonical
//! content. No metadata is ever produced without a writer secret.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use walkdir::WalkDir;

use cove_core::config::FolderParams;
use cove_core::crypto::{self, ChunkCipher};
use cove_core::meta::{self, FileChunk, Kind, Meta, SignedMeta, StrongHashType};
use cove_core::secret::{Secret, SecretError};

use crate::assembler::PathLocks;
use crate::chunk_store::{ChunkStore, StoreError};
use crate::chunker::{self, ChunkerParams};
use crate::ignore::IgnoreFilter;
use crate::index::{Index, IndexError};

/// Result of indexing one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Excluded by the ignore filter.
    Ignored,
    /// Index already reflects the filesystem.
    Unchanged,
    /// A new meta was committed.
    Indexed,
    /// A Deleted meta was committed.
    DeletedIndexed,
    /// Verify-only: local state diverges from the index.
    Mismatch,
    /// The assembler holds this path; retry after the debounce window.
    Deferred,
}

/// Summary of a full scan pass.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub indexed: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// (path_hash, rel path) pairs that diverge, verify-only mode.
    pub mismatched: Vec<([u8; 32], String)>,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Scanner {
    params: FolderParams,
    secret: Secret,
    enc_key: [u8; 32],
    chunker: ChunkerParams,
    index: Arc<Index>,
    store: Arc<ChunkStore>,
    ignore: Arc<IgnoreFilter>,
    locks: Arc<PathLocks>,
}

impl Scanner {
    pub fn new(
        params: FolderParams,
        secret: Secret,
        chunker: ChunkerParams,
        index: Arc<Index>,
        store: Arc<ChunkStore>,
        ignore: Arc<IgnoreFilter>,
        locks: Arc<PathLocks>,
    ) -> Result<Self, ScanError> {
        let enc_key = *secret.derive_encryption_key()?;
        Ok(Self {
            params,
            secret,
            enc_key,
            chunker,
            index,
            store,
            ignore,
            locks,
        })
    }

    /// Event loop: watcher events debounced per path, plus the periodic
    /// full rescan. The first rescan fires immediately on startup.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PathBuf>();

        let _watcher = match self.spawn_watcher(event_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "filesystem watcher unavailable; rescans only");
                None
            }
        };

        let mut rescan = tokio::time::interval(self.params.rescan_interval());
        let mut pending: HashMap<String, tokio::time::Instant> = HashMap::new();

        loop {
            let next_due = pending.values().min().copied();
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("scanner shutting down");
                    return;
                }

                _ = rescan.tick() => {
                    let worker = self.clone();
                    match tokio::task::spawn_blocking(move || worker.scan_all(false)).await {
                        Ok(report) => tracing::info!(
                            indexed = report.indexed,
                            deleted = report.deleted,
                            mismatched = report.mismatched.len(),
                            errors = report.errors,
                            "full rescan complete"
                        ),
                        Err(e) => tracing::error!(error = %e, "rescan task panicked"),
                    }
                }

                Some(path) = event_rx.recv() => {
                    if let Some(rel) = self.relativize(&path) {
                        if !self.ignore.is_ignored(&rel) {
                            pending.insert(
                                rel,
                                tokio::time::Instant::now() + self.params.event_timeout(),
                            );
                        }
                    }
                }

                _ = sleep_until_opt(next_due), if next_due.is_some() => {
                    let now = tokio::time::Instant::now();
                    let due: Vec<String> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(rel, _)| rel.clone())
                        .collect();
                    for rel in &due {
                        pending.remove(rel);
                    }

                    let worker = self.clone();
                    let batch = due.clone();
                    let deferred = tokio::task::spawn_blocking(move || {
                        let mut deferred = Vec::new();
                        for rel in batch {
                            match worker.scan_path(&rel, false) {
                                Ok(ScanOutcome::Deferred) => deferred.push(rel),
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::warn!(rel, error = %e, "indexing failed");
                                }
                            }
                        }
                        deferred
                    })
                    .await
                    .unwrap_or_default();

                    for rel in deferred {
                        pending.insert(
                            rel,
                            tokio::time::Instant::now() + self.params.event_timeout(),
                        );
                    }
                }
            }
        }
    }

    fn spawn_watcher(
        &self,
        tx: mpsc::UnboundedSender<PathBuf>,
    ) -> Result<notify::RecommendedWatcher, notify::Error> {
        use notify::Watcher;
        let mut watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                if let Ok(event) = result {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            })?;
        watcher.watch(&self.params.path, notify::RecursiveMode::Recursive)?;
        Ok(watcher)
    }

    fn relativize(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.params.path).ok()?;
        let rel = rel.to_str()?;
        (!rel.is_empty()).then(|| rel.to_string())
    }

    /// Walk the whole tree, then sweep index entries whose paths vanished.
    pub fn scan_all(&self, force_verify: bool) -> ScanReport {
        let mut report = ScanReport::default();

        let walker = WalkDir::new(&self.params.path)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                self.relativize(entry.path())
                    .map_or(true, |rel| !self.ignore.is_ignored(&rel))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "walk error");
                    report.errors += 1;
                    continue;
                }
            };
            let Some(rel) = self.relativize(entry.path()) else {
                continue;
            };
            self.tally(&mut report, &rel, self.scan_path(&rel, force_verify));
        }

        // Deletion sweep: index entries whose files no longer exist.
        match self.index.iter_all() {
            Ok(entries) => {
                for entry in entries {
                    let Ok(meta) = entry.meta() else {
                        report.errors += 1;
                        continue;
                    };
                    if meta.kind == Kind::Deleted {
                        continue;
                    }
                    let Ok(rel) = self.cleartext_path(&meta) else {
                        report.errors += 1;
                        continue;
                    };
                    if self.ignore.is_ignored(&rel) {
                        continue;
                    }
                    if std::fs::symlink_metadata(self.params.path.join(&rel)).is_err() {
                        self.tally(&mut report, &rel, self.scan_path(&rel, force_verify));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "deletion sweep failed to list index");
                report.errors += 1;
            }
        }

        report
    }

    fn tally(&self, report: &mut ScanReport, rel: &str, result: Result<ScanOutcome, ScanError>) {
        match result {
            Ok(ScanOutcome::Indexed) => report.indexed += 1,
            Ok(ScanOutcome::DeletedIndexed) => report.deleted += 1,
            Ok(ScanOutcome::Unchanged) | Ok(ScanOutcome::Ignored) => report.unchanged += 1,
            Ok(ScanOutcome::Mismatch) => {
                let path_hash = self.path_hash(rel);
                report.mismatched.push((path_hash, rel.to_string()));
            }
            // Deferred paths are picked up by the next rescan.
            Ok(ScanOutcome::Deferred) => {}
            Err(e) => {
                tracing::warn!(rel, error = %e, "indexing failed");
                report.errors += 1;
            }
        }
    }

    fn path_hash(&self, rel: &str) -> [u8; 32] {
        crypto::path_hash(&self.enc_key, rel, self.params.normalize_unicode)
    }

    fn cleartext_path(&self, meta: &Meta) -> Result<String, ScanError> {
        let bytes = meta::open_name(
            &self.enc_key,
            &meta.path_hash,
            meta.revision,
            "path",
            &meta.path_ct,
        )?;
        String::from_utf8(bytes).map_err(|_| ScanError::NonUnicodePath)
    }

    /// Index a single relative path.
    pub fn scan_path(&self, rel: &str, force_verify: bool) -> Result<ScanOutcome, ScanError> {
        if self.ignore.is_ignored(rel) {
            return Ok(ScanOutcome::Ignored);
        }

        let path_hash = self.path_hash(rel);
        let Some(_guard) = self.locks.try_acquire(path_hash) else {
            return Ok(ScanOutcome::Deferred);
        };

        let abs = self.params.path.join(rel);
        let stat = std::fs::symlink_metadata(&abs).ok();
        let existing = self.index.get(&path_hash)?;

        let Some(stat) = stat else {
            return self.index_deletion(rel, path_hash, existing);
        };

        let observed = Observed::from_stat(&stat, &self.params);

        if let Some(entry) = &existing {
            // Self-caused event: the engine itself wrote exactly this state.
            if !force_verify
                && entry
                    .assembly_mark
                    .is_some_and(|m| m.matches(observed.mtime, observed.size))
            {
                return Ok(ScanOutcome::Unchanged);
            }
            if !force_verify && self.matches_index(entry, &observed)? {
                return Ok(ScanOutcome::Unchanged);
            }
        }

        if !self.secret.can_sign() {
            return self.verify_only(rel, &abs, &observed, existing);
        }

        self.index_object(rel, path_hash, &abs, &observed, existing)
    }

    fn index_deletion(
        &self,
        rel: &str,
        path_hash: [u8; 32],
        existing: Option<crate::index::IndexEntry>,
    ) -> Result<ScanOutcome, ScanError> {
        let Some(entry) = existing else {
            return Ok(ScanOutcome::Unchanged);
        };
        let meta = entry.meta()?;
        if meta.kind == Kind::Deleted {
            return Ok(ScanOutcome::Unchanged);
        }

        if !self.secret.can_sign() {
            tracing::warn!(rel, "verify-only: indexed file missing from disk");
            return Ok(ScanOutcome::Mismatch);
        }

        let revision = next_revision(Some(entry.revision));
        let deleted = Meta {
            path_hash,
            path_ct: meta::seal_name(&self.enc_key, &path_hash, revision, "path", rel.as_bytes())?,
            kind: Kind::Deleted,
            revision,
            windows_attrib: None,
            unix_attrib: None,
            symlink_target_ct: None,
            mtime: now_micros() as i64,
            strong_hash_type: StrongHashType::Blake3,
            chunks: Vec::new(),
        };
        self.commit(&deleted)?;
        tracing::debug!(rel, "deletion indexed");
        Ok(ScanOutcome::DeletedIndexed)
    }

    /// Compare the filesystem object against a stored entry without
    /// reading content.
    fn matches_index(
        &self,
        entry: &crate::index::IndexEntry,
        observed: &Observed,
    ) -> Result<bool, ScanError> {
        let meta = entry.meta()?;
        if meta.kind != observed.kind {
            return Ok(false);
        }
        if self.params.preserve_unix_attrib && meta.unix_attrib != observed.unix_attrib {
            return Ok(false);
        }
        match meta.kind {
            Kind::File => {
                Ok(meta.mtime == observed.mtime && meta.total_size() == observed.size)
            }
            // Directory/symlink changes show up as kind or target changes;
            // mtime churn on directories is noise.
            _ => Ok(true),
        }
    }

    fn verify_only(
        &self,
        rel: &str,
        abs: &Path,
        observed: &Observed,
        existing: Option<crate::index::IndexEntry>,
    ) -> Result<ScanOutcome, ScanError> {
        let Some(entry) = existing else {
            tracing::warn!(rel, "verify-only: local object not in index");
            return Ok(ScanOutcome::Mismatch);
        };
        let meta = entry.meta()?;
        if meta.kind != observed.kind {
            return Ok(ScanOutcome::Mismatch);
        }
        if observed.kind == Kind::File {
            let data = std::fs::read(abs)?;
            let pieces = chunker::split(&data, &self.chunker);
            if pieces.len() != meta.chunks.len() {
                return Ok(ScanOutcome::Mismatch);
            }
            for (piece, chunk) in pieces.iter().zip(&meta.chunks) {
                if crypto::keyed_hash(&self.enc_key, piece) != chunk.pt_hash_hmac {
                    return Ok(ScanOutcome::Mismatch);
                }
            }
        }
        Ok(ScanOutcome::Unchanged)
    }

    fn index_object(
        &self,
        rel: &str,
        path_hash: [u8; 32],
        abs: &Path,
        observed: &Observed,
        existing: Option<crate::index::IndexEntry>,
    ) -> Result<ScanOutcome, ScanError> {
        let revision = next_revision(existing.as_ref().map(|e| e.revision));

        let (symlink_target_ct, chunks) = match observed.kind {
            Kind::File => {
                let data = std::fs::read(abs)?;
                (None, self.encrypt_chunks(&data)?)
            }
            Kind::Symlink => {
                let target = std::fs::read_link(abs)?;
                let target = target.to_str().ok_or(ScanError::NonUnicodePath)?;
                let sealed = meta::seal_name(
                    &self.enc_key,
                    &path_hash,
                    revision,
                    "link",
                    target.as_bytes(),
                )?;
                (Some(sealed), Vec::new())
            }
            _ => (None, Vec::new()),
        };

        let new_meta = Meta {
            path_hash,
            path_ct: meta::seal_name(&self.enc_key, &path_hash, revision, "path", rel.as_bytes())?,
            kind: observed.kind,
            revision,
            windows_attrib: observed.windows_attrib,
            unix_attrib: observed.unix_attrib,
            symlink_target_ct,
            mtime: observed.mtime,
            strong_hash_type: StrongHashType::Blake3,
            chunks,
        };
        self.commit(&new_meta)?;

        // The stat we just indexed is, by definition, already on disk.
        // local_origin marks this as our own committed content, which the
        // assembler preserves as a conflict copy if it ever loses a race.
        self.index.set_assembly_mark(
            &path_hash,
            crate::index::AssemblyMark {
                mtime: observed.mtime,
                size: observed.size,
                local_origin: true,
            },
        )?;

        tracing::debug!(
            rel,
            revision,
            chunks = new_meta.chunks.len(),
            "object indexed"
        );
        Ok(ScanOutcome::Indexed)
    }

    /// Chunk, dedup, encrypt, and store a file's content.
    fn encrypt_chunks(&self, data: &[u8]) -> Result<Vec<FileChunk>, ScanError> {
        let cipher = ChunkCipher::new(self.enc_key);
        let mut chunks = Vec::new();

        for piece in chunker::split(data, &self.chunker) {
            let pt_hash_hmac = crypto::keyed_hash(&self.enc_key, piece);

            // Dedup: an identical plaintext chunk may already be encrypted
            // and stored — reuse it rather than produce a second ciphertext.
            if let Some(dedup) = self.index.lookup_dedup(&pt_hash_hmac)? {
                if dedup.size as usize == piece.len() && self.store.has(&dedup.ct_hash) {
                    chunks.push(FileChunk {
                        ct_hash: dedup.ct_hash,
                        size: dedup.size,
                        iv: dedup.iv,
                        pt_hash_hmac,
                    });
                    continue;
                }
            }

            let iv = crypto::generate_iv();
            let ciphertext = cipher.encrypt(&iv, piece)?;
            let ct_hash = crypto::hash(&ciphertext);
            self.store.put(&ct_hash, &ciphertext)?;
            self.index
                .record_dedup(&pt_hash_hmac, &ct_hash, &iv, piece.len() as u32)?;

            chunks.push(FileChunk {
                ct_hash,
                size: piece.len() as u32,
                iv,
                pt_hash_hmac,
            });
        }

        Ok(chunks)
    }

    fn commit(&self, new_meta: &Meta) -> Result<(), ScanError> {
        let signed = SignedMeta::sign(new_meta, &self.secret)?;
        match self.index.upsert(&signed) {
            // A concurrent commit won the revision race; ours is obsolete.
            Err(IndexError::Stale) => return Ok(()),
            other => other?,
        }
        for i in 0..new_meta.chunks.len() {
            self.index.set_chunk_present(&new_meta.path_hash, i, true)?;
        }
        Ok(())
    }
}

/// What one stat call tells us, in index terms.
struct Observed {
    kind: Kind,
    mtime: i64,
    size: u64,
    unix_attrib: Option<u32>,
    windows_attrib: Option<u32>,
}

impl Observed {
    fn from_stat(stat: &std::fs::Metadata, params: &FolderParams) -> Self {
        let kind = if stat.file_type().is_symlink() {
            Kind::Symlink
        } else if stat.is_dir() {
            Kind::Directory
        } else {
            Kind::File
        };

        #[cfg(unix)]
        let unix_attrib = params.preserve_unix_attrib.then(|| {
            use std::os::unix::fs::PermissionsExt;
            stat.permissions().mode() & 0o7777
        });
        #[cfg(not(unix))]
        let unix_attrib = None;

        #[cfg(windows)]
        let windows_attrib = params.preserve_windows_attrib.then(|| {
            use std::os::windows::fs::MetadataExt;
            stat.file_attributes()
        });
        #[cfg(not(windows))]
        let windows_attrib = None;

        Self {
            kind,
            mtime: stat
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_micros() as i64)
                .unwrap_or(0),
            size: if kind == Kind::File { stat.len() } else { 0 },
            unix_attrib,
            windows_attrib,
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Strictly increasing revisions even when the clock stalls or rewinds.
fn next_revision(previous: Option<u64>) -> u64 {
    let now = now_micros();
    match previous {
        Some(prev) => now.max(prev + 1),
        None => now,
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("path is not valid unicode")]
    NonUnicodePath,

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Meta(#[from] cove_core::meta::MetaError),

    #[error(transparent)]
    Crypto(#[from] cove_core::crypto::CryptoError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("scan I/O: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
