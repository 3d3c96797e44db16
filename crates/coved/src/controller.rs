//! Folder controller — owns one folder's secret, index, chunk store,
//! scanner, assembler, and peer sessions, and arbitrates everything that
//! mutates them.
//!
//! Ownership is one-way: the controller owns session tasks, and sessions
//! hold an `Arc<FolderShared>` — never a reference back to the controller.
//! All cross-component traffic runs over the scheduler's message queues.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use zerocopy::AsBytes;

use cove_core::config::FolderParams;
use cove_core::crypto::{NodeIdentity, TAG_SIZE};
use cove_core::meta::{MetaError, SignedMeta};
use cove_core::secret::{FolderId, Secret};
use cove_core::wire::{HaveMeta, REQUEST_TIMEOUT_SECS};

use cove_engine::{
    Assembler, ChunkStore, ChunkerParams, IgnoreFilter, Index, IndexError, PathLocks, Scanner,
};

use crate::scheduler::RequestScheduler;
use crate::session::{run_session, CloseReason, SessionError};

const PUMP_INTERVAL: Duration = Duration::from_millis(500);
const ANNOUNCE_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const GC_INTERVAL: Duration = Duration::from_secs(3600);

/// Everything a session task needs, shared by Arc.
pub struct FolderShared {
    pub params: FolderParams,
    pub folder_id: FolderId,
    pub secret: Secret,
    pub auth_key: [u8; 32],
    pub node_pubkey: [u8; 32],
    pub index: Arc<Index>,
    pub store: Arc<ChunkStore>,
    pub scheduler: RequestScheduler,
    shutdown: broadcast::Sender<()>,
}

/// What became of an inbound SignedMeta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaDisposition {
    Accepted,
    Stale,
}

impl FolderShared {
    /// Should we ask the announcing peer for this meta?
    pub fn wants_meta(&self, path_hash: &[u8; 32], revision: u64) -> bool {
        match self.index.get(path_hash) {
            Ok(None) => true,
            Ok(Some(entry)) => entry.revision < revision,
            Err(e) => {
                self.fail_folder(&e);
                false
            }
        }
    }

    /// Route an inbound meta through the index. Signature and encoding
    /// failures close the originating session and never mutate state.
    pub fn accept_meta(&self, signed: &SignedMeta) -> Result<MetaDisposition, SessionError> {
        match self.index.upsert(signed) {
            Ok(()) => {
                self.register_needs(signed);
                Ok(MetaDisposition::Accepted)
            }
            Err(IndexError::Stale) => Ok(MetaDisposition::Stale),
            Err(IndexError::Meta(MetaError::SignatureInvalid)) => {
                Err(SessionError::SignatureInvalid)
            }
            Err(IndexError::Meta(MetaError::Malformed(_))) => Err(SessionError::MalformedMeta),
            Err(e) => {
                self.fail_folder(&e);
                Err(SessionError::FolderFailed)
            }
        }
    }

    /// Record which chunks of a just-accepted meta we still need. Chunks
    /// already in the store (dedup across revisions) are marked present
    /// immediately.
    fn register_needs(&self, signed: &SignedMeta) {
        let Ok(meta) = signed.meta() else { return };
        for (i, chunk) in meta.chunks.iter().enumerate() {
            if self.store.has(&chunk.ct_hash) {
                if let Err(e) = self.index.set_chunk_present(&meta.path_hash, i, true) {
                    tracing::warn!(error = %e, "failed to mark pre-existing chunk");
                }
            } else {
                // Requests address the encrypted blob: plaintext size plus
                // the AEAD tag.
                self.scheduler.register_need(
                    chunk.ct_hash,
                    chunk.size + TAG_SIZE as u32,
                    (meta.path_hash, i),
                );
            }
        }
    }

    /// A condition that is fatal to the folder: log it, stop every task.
    /// The user must intervene before the folder runs again.
    pub fn fail_folder(&self, error: &dyn std::fmt::Display) {
        tracing::error!(
            folder = %self.folder_id,
            error = %error,
            "fatal folder error — stopping folder"
        );
        let _ = self.shutdown.send(());
    }
}

pub struct FolderController {
    shared: Arc<FolderShared>,
}

impl FolderController {
    /// Open the folder's persistent state and spawn its task set. Fails —
    /// and therefore refuses to run the folder — on secret parse errors or
    /// index corruption.
    pub fn start(params: FolderParams, chunker: ChunkerParams) -> anyhow::Result<Arc<Self>> {
        let secret: Secret = params
            .secret
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid folder secret: {e}"))?;
        let folder_id = secret.derive_folder_id();

        let system_path = params.system_path();
        std::fs::create_dir_all(&system_path)
            .with_context(|| format!("creating {}", system_path.display()))?;

        let identity = NodeIdentity::load_or_generate(&system_path)?;
        let index = Arc::new(
            Index::open(&system_path, secret.clone())
                .with_context(|| format!("opening index for folder {folder_id}"))?,
        );
        let store = Arc::new(ChunkStore::open(&system_path)?);
        let ignore = Arc::new(IgnoreFilter::new(
            &params.ignore_paths,
            &params.path,
            &system_path,
        )?);
        let locks = PathLocks::new();
        let scheduler = RequestScheduler::new();
        let (shutdown, _) = broadcast::channel(8);

        let shared = Arc::new(FolderShared {
            folder_id,
            auth_key: secret.auth_key(),
            node_pubkey: identity.public(),
            secret: secret.clone(),
            params: params.clone(),
            index: index.clone(),
            store: store.clone(),
            scheduler,
            shutdown: shutdown.clone(),
        });

        // Resume needs for entries left incomplete by a previous run.
        shared.resume_incomplete_entries();

        if secret.can_decrypt() {
            let assembler = Assembler::new(
                params.clone(),
                &secret,
                index.clone(),
                store.clone(),
                locks.clone(),
            )?;

            let scanner = Scanner::new(
                params.clone(),
                secret.clone(),
                chunker,
                index.clone(),
                store.clone(),
                ignore,
                locks,
            )?;

            if secret.can_sign() {
                tokio::spawn(scanner.run(shutdown.subscribe()));
            } else {
                // ReadOnly: periodic verify pass; divergent paths are
                // restored from canonical content by the assembler.
                tokio::spawn(Self::verify_loop(
                    scanner,
                    assembler.clone(),
                    params.rescan_interval(),
                    shutdown.subscribe(),
                ));
            }
            tokio::spawn(assembler.run(shutdown.subscribe()));
        } else {
            tracing::info!(
                folder = %folder_id,
                "download-only secret: relaying ciphertext, no local tree"
            );
        }

        let controller = Arc::new(Self { shared });
        controller.spawn_gossip_task();
        controller.spawn_pump_task();
        controller.spawn_announce_flush_task();
        controller.spawn_gc_task();

        tracing::info!(folder = %folder_id, path = %params.path.display(), "folder started");
        Ok(controller)
    }

    pub fn folder_id(&self) -> FolderId {
        self.shared.folder_id
    }

    pub fn shared(&self) -> Arc<FolderShared> {
        self.shared.clone()
    }

    pub fn index(&self) -> Arc<Index> {
        self.shared.index.clone()
    }

    pub fn store(&self) -> Arc<ChunkStore> {
        self.shared.store.clone()
    }

    pub fn node_pubkey(&self) -> [u8; 32] {
        self.shared.node_pubkey
    }

    /// Hand an authenticated stream to a new session task.
    pub fn attach_session<S>(&self, stream: S, remote_pubkey: [u8; 32]) -> JoinHandle<CloseReason>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let shared = self.shared.clone();
        let shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(run_session(shared, stream, remote_pubkey, shutdown))
    }

    /// Stop every task belonging to this folder.
    pub fn stop(&self) {
        let _ = self.shared.shutdown.send(());
    }

    // ── Tasks ─────────────────────────────────────────────────────────────────

    /// Index events → outbound gossip: HaveMeta immediately, chunk
    /// announcements into the coalescing queue.
    fn spawn_gossip_task(&self) {
        let shared = self.shared.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut events = self.shared.index.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    event = events.recv() => {
                        let event = match event {
                            Ok(event) => event,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::debug!(skipped, "gossip lagged; peers catch up via announce");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        };
                        let entry = match shared.index.get(&event.path_hash) {
                            Ok(Some(entry)) => entry,
                            Ok(None) => continue,
                            Err(e) => {
                                shared.fail_folder(&e);
                                return;
                            }
                        };
                        let Ok(meta) = entry.meta() else { continue };
                        if event.new_meta {
                            let have = HaveMeta {
                                path_hash: meta.path_hash,
                                revision: meta.revision,
                            };
                            shared
                                .scheduler
                                .broadcast_have_meta(have.as_bytes().to_vec());
                        }
                        if event.bitmap_changed {
                            for (i, chunk) in meta.chunks.iter().enumerate() {
                                if entry.bitmap.get(i) {
                                    shared.scheduler.announce_chunk(chunk.ct_hash);
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_pump_task(&self) {
        let shared = self.shared.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PUMP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {
                        shared.scheduler.pump();
                        shared.scheduler.expire(Duration::from_secs(REQUEST_TIMEOUT_SECS));
                    }
                }
            }
        });
    }

    fn spawn_announce_flush_task(&self) {
        let shared = self.shared.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ANNOUNCE_FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {
                        let announcements = shared.scheduler.drain_announcements();
                        if !announcements.is_empty() {
                            shared.scheduler.broadcast_have_chunks(&announcements);
                        }
                    }
                }
            }
        });
    }

    fn spawn_gc_task(&self) {
        let shared = self.shared.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            interval.tick().await; // no sweep at startup
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {
                        let shared = shared.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            shared.store.collect_garbage(&shared.index)
                        })
                        .await;
                        if let Ok(Err(e)) = result {
                            tracing::warn!(error = %e, "garbage collection failed");
                        }
                    }
                }
            }
        });
    }

    /// ReadOnly folders: periodically verify local content against the
    /// index and restore anything that diverged.
    async fn verify_loop(
        scanner: Scanner,
        assembler: Assembler,
        every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    let scanner = scanner.clone();
                    let report = match tokio::task::spawn_blocking(move || scanner.scan_all(false))
                        .await
                    {
                        Ok(report) => report,
                        Err(e) => {
                            tracing::error!(error = %e, "verify scan panicked");
                            continue;
                        }
                    };
                    for (path_hash, rel) in &report.mismatched {
                        tracing::warn!(rel, "local content diverges from index; restoring");
                        let assembler = assembler.clone();
                        let path_hash = *path_hash;
                        match tokio::task::spawn_blocking(move || assembler.apply(&path_hash))
                            .await
                        {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => tracing::warn!(error = %e, "restore failed"),
                            Err(e) => tracing::error!(error = %e, "restore task panicked"),
                        }
                    }
                }
            }
        }
    }
}

impl FolderShared {
    /// After a restart, re-register needs for every incomplete entry so
    /// outstanding chunk fetches resume without re-downloading what the
    /// store already holds.
    fn resume_incomplete_entries(&self) {
        let entries = match self.index.iter_all() {
            Ok(entries) => entries,
            Err(e) => {
                self.fail_folder(&e);
                return;
            }
        };
        let mut resumed = 0usize;
        for entry in entries {
            if entry.is_complete() {
                continue;
            }
            let Ok(meta) = entry.meta() else { continue };
            for (i, chunk) in meta.chunks.iter().enumerate() {
                if entry.bitmap.get(i) {
                    continue;
                }
                if self.store.has(&chunk.ct_hash) {
                    let _ = self.index.set_chunk_present(&meta.path_hash, i, true);
                } else {
                    self.scheduler.register_need(
                        chunk.ct_hash,
                        chunk.size + TAG_SIZE as u32,
                        (meta.path_hash, i),
                    );
                }
            }
            resumed += 1;
        }
        if resumed > 0 {
            tracing::info!(entries = resumed, "resumed incomplete entries from index");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
