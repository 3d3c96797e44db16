//! Peer session — one authenticated duplex stream to one peer for one
//! folder, running the gossip protocol.
//!
//! Per session the state machine is
//!
//!   Connecting → HandshakeSent → HandshakeAcked → Active → Closing → Closed
//!
//! Any protocol violation, signature failure, or handshake mismatch moves
//! the session to Closing with a reason; such closes do not reset the
//! dialer's reconnect backoff. Session state is owned exclusively by the
//! session task; the controller and scheduler reach it only through its
//! message queues.

pub mod framed;

use std::collections::HashSet;
use std::time::Duration;

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use zerocopy::AsBytes;

use cove_core::crypto;
use cove_core::wire::{
    self, ChunkRequest, FrameKind, Handshake, HaveChunk, HaveMeta, MetaRequest, WireError,
    CHUNK_REPLY_SEGMENT,
};

use crate::controller::{FolderShared, MetaDisposition};
use crate::scheduler::{ReplyProgress, ReplyViolation, SessionId};

use framed::{read_frame, write_frame};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const FRAME_QUEUE: usize = 256;

/// Why a session ended. Carried into logs and the dialer's backoff logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close (shutdown or peer EOF).
    Done,
    /// Handshake named a different folder.
    FolderMismatch,
    /// Handshake auth token did not verify.
    BadAuth,
    /// Malformed or out-of-contract frame.
    Protocol,
    /// A SignedMeta failed verification.
    SignatureInvalid,
    /// A chunk reply hashed to the wrong ct_hash.
    HashMismatch,
    /// Too many request timeouts.
    Timeouts,
    /// Transport failed.
    Io,
    /// The folder itself stopped (corruption or index commit failure).
    FolderFailed,
}

impl CloseReason {
    /// Whether the dialer may reset its backoff after this close.
    pub fn resets_backoff(&self) -> bool {
        matches!(self, CloseReason::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    HandshakeSent,
    HandshakeAcked,
    Active,
    Closing,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(WireError),

    #[error("peer handshake targets a different folder")]
    FolderMismatch,

    #[error("peer auth token invalid")]
    BadAuth,

    #[error("meta signature verification failed")]
    SignatureInvalid,

    #[error("malformed meta from peer")]
    MalformedMeta,

    #[error("chunk bytes do not hash to the requested ct_hash")]
    HashMismatch,

    #[error("chunk request while choked")]
    ChokedRequest,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("folder stopped")]
    FolderFailed,

    #[error("session I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    fn close_reason(&self) -> CloseReason {
        match self {
            SessionError::Protocol(_)
            | SessionError::MalformedMeta
            | SessionError::ChokedRequest => CloseReason::Protocol,
            SessionError::FolderMismatch => CloseReason::FolderMismatch,
            SessionError::BadAuth | SessionError::HandshakeTimeout => CloseReason::BadAuth,
            SessionError::SignatureInvalid => CloseReason::SignatureInvalid,
            SessionError::HashMismatch => CloseReason::HashMismatch,
            SessionError::FolderFailed => CloseReason::FolderFailed,
            SessionError::Io(_) => CloseReason::Io,
        }
    }
}

/// Drive one session to completion. Returns why it closed.
pub async fn run_session<S>(
    shared: Arc<FolderShared>,
    stream: S,
    expected_pubkey: [u8; 32],
    mut shutdown: broadcast::Receiver<()>,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut phase = Phase::Connecting;

    // ── Handshake ─────────────────────────────────────────────────────────────

    let ours = Handshake {
        folder_id: shared.folder_id.0,
        node_pubkey: shared.node_pubkey,
        auth_token: crypto::keyed_hash(&shared.auth_key, &shared.node_pubkey),
    };
    tracing::debug!(?phase, "session starting");
    if let Err(e) = write_frame(&mut writer, FrameKind::Handshake, ours.as_bytes()).await {
        tracing::debug!(error = %e, "handshake send failed");
        return CloseReason::Io;
    }
    phase = Phase::HandshakeSent;
    tracing::trace!(?phase, "handshake sent");

    let peer_pubkey = match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        read_handshake(&shared, &mut reader, expected_pubkey),
    )
    .await
    {
        Ok(Ok(pubkey)) => pubkey,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "handshake rejected");
            return e.close_reason();
        }
        Err(_) => {
            tracing::warn!("handshake timed out");
            return CloseReason::BadAuth;
        }
    };
    phase = Phase::HandshakeAcked;
    tracing::trace!(?phase, "handshake verified");

    // ── Registration ──────────────────────────────────────────────────────────

    let (frame_tx, mut frame_rx) = mpsc::channel(FRAME_QUEUE);
    let (close_tx, mut close_rx) = mpsc::channel(4);
    let id = shared
        .scheduler
        .register_session(peer_pubkey, frame_tx, close_tx);

    phase = Phase::Active;
    tracing::info!(
        session = id,
        peer = hex::encode(&peer_pubkey[..8]),
        folder = %shared.folder_id,
        ?phase,
        "session active"
    );

    // Frame reads run in their own task: a read_exact in progress must
    // never be cancelled by another select branch, or the stream desyncs.
    // Channel recv is cancellation-safe.
    let (in_tx, mut in_rx) = mpsc::channel::<Result<(FrameKind, Bytes), SessionError>>(16);
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = read_frame(&mut reader).await;
            let failed = frame.is_err();
            if in_tx.send(frame).await.is_err() || failed {
                return;
            }
        }
    });

    let mut we_choke_peer = true;
    let result: Result<CloseReason, SessionError> = async {
        // We serve everyone: unchoke immediately.
        write_frame(&mut writer, FrameKind::Unchoke, &[]).await?;
        we_choke_peer = false;

        announce_state(&shared, &mut writer).await?;

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(CloseReason::Done),

                Some(reason) = close_rx.recv() => return Ok(reason),

                Some((kind, payload)) = frame_rx.recv() => {
                    write_frame(&mut writer, kind, &payload).await?;
                }

                inbound = in_rx.recv() => {
                    let (kind, payload) = match inbound {
                        Some(frame) => frame?,
                        None => return Ok(CloseReason::Done),
                    };
                    handle_frame(
                        &shared,
                        id,
                        &mut writer,
                        &mut we_choke_peer,
                        kind,
                        &payload,
                    )
                    .await?;
                }
            }
        }
    }
    .await;

    phase = Phase::Closing;
    tracing::trace!(?phase, "session tearing down");
    reader_task.abort();
    shared.scheduler.drop_session(id);

    let reason = match result {
        Ok(reason) => reason,
        Err(SessionError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            CloseReason::Done
        }
        Err(e) => {
            tracing::warn!(session = id, error = %e, "session closing on error");
            e.close_reason()
        }
    };

    tracing::info!(session = id, reason = ?reason, "session closed");
    reason
}

async fn read_handshake<R: AsyncRead + Unpin>(
    shared: &FolderShared,
    reader: &mut R,
    expected_pubkey: [u8; 32],
) -> Result<[u8; 32], SessionError> {
    let (kind, payload) = read_frame(reader).await?;
    if kind != FrameKind::Handshake {
        return Err(SessionError::Protocol(WireError::BadPayload(
            "first frame must be Handshake",
        )));
    }
    let handshake: Handshake = wire::parse_exact(&payload).map_err(SessionError::Protocol)?;
    let folder_id = handshake.folder_id;
    let node_pubkey = handshake.node_pubkey;
    let auth_token = handshake.auth_token;

    if folder_id != shared.folder_id.0 {
        return Err(SessionError::FolderMismatch);
    }
    if node_pubkey != expected_pubkey {
        return Err(SessionError::BadAuth);
    }
    if auth_token != crypto::keyed_hash(&shared.auth_key, &node_pubkey) {
        return Err(SessionError::BadAuth);
    }
    Ok(node_pubkey)
}

/// Tell a fresh peer everything we hold: every meta, and every present
/// chunk of incomplete knowledge they might want.
async fn announce_state<W: AsyncWrite + Unpin>(
    shared: &FolderShared,
    writer: &mut W,
) -> Result<(), SessionError> {
    let entries = shared.index.iter_all().map_err(|e| {
        tracing::error!(error = %e, "index unavailable during announce");
        SessionError::FolderFailed
    })?;

    let mut announced: HashSet<[u8; 32]> = HashSet::new();
    for entry in &entries {
        let Ok(meta) = entry.meta() else { continue };
        let have = HaveMeta {
            path_hash: meta.path_hash,
            revision: meta.revision,
        };
        write_frame(writer, FrameKind::HaveMeta, have.as_bytes()).await?;

        for (i, chunk) in meta.chunks.iter().enumerate() {
            if entry.bitmap.get(i) && announced.insert(chunk.ct_hash) {
                let have = HaveChunk {
                    ct_hash: chunk.ct_hash,
                };
                write_frame(writer, FrameKind::HaveChunk, have.as_bytes()).await?;
            }
        }
    }
    Ok(())
}

async fn handle_frame<W: AsyncWrite + Unpin>(
    shared: &FolderShared,
    id: SessionId,
    writer: &mut W,
    we_choke_peer: &mut bool,
    kind: FrameKind,
    payload: &[u8],
) -> Result<(), SessionError> {
    match kind {
        FrameKind::Handshake => Err(SessionError::Protocol(WireError::BadPayload(
            "duplicate handshake",
        ))),

        FrameKind::Choke => {
            shared.scheduler.mark_choked(id, true);
            Ok(())
        }
        FrameKind::Unchoke => {
            shared.scheduler.mark_choked(id, false);
            Ok(())
        }
        FrameKind::Interested | FrameKind::NotInterested => {
            // Advisory; we serve requests either way.
            tracing::trace!(session = id, ?kind, "peer interest changed");
            Ok(())
        }

        FrameKind::HaveMeta => {
            let have: HaveMeta = wire::parse_exact(payload).map_err(SessionError::Protocol)?;
            let path_hash = have.path_hash;
            let revision = have.revision;
            if shared.wants_meta(&path_hash, revision) {
                let request = MetaRequest { path_hash };
                write_frame(writer, FrameKind::MetaRequest, request.as_bytes()).await?;
            }
            Ok(())
        }

        FrameKind::HaveChunk => {
            let have: HaveChunk = wire::parse_exact(payload).map_err(SessionError::Protocol)?;
            shared.scheduler.add_availability(id, have.ct_hash);
            Ok(())
        }

        FrameKind::MetaRequest => {
            let request: MetaRequest = wire::parse_exact(payload).map_err(SessionError::Protocol)?;
            let path_hash = request.path_hash;
            match shared.index.get(&path_hash) {
                Ok(Some(entry)) => {
                    let reply = wire::encode_meta_reply(&entry.signed_meta);
                    write_frame(writer, FrameKind::MetaReply, &reply).await?;
                }
                Ok(None) => {
                    tracing::debug!(session = id, "meta request for unknown path");
                }
                Err(e) => {
                    shared.fail_folder(&e);
                    return Err(SessionError::FolderFailed);
                }
            }
            Ok(())
        }

        FrameKind::MetaReply => {
            let signed = wire::decode_meta_reply(payload).map_err(SessionError::Protocol)?;
            match shared.accept_meta(&signed)? {
                MetaDisposition::Accepted => {
                    tracing::debug!(session = id, "meta accepted from peer");
                }
                MetaDisposition::Stale => {
                    tracing::trace!(session = id, "stale meta ignored");
                }
            }
            Ok(())
        }

        FrameKind::ChunkRequest => {
            if *we_choke_peer {
                return Err(SessionError::ChokedRequest);
            }
            let request: ChunkRequest = wire::parse_exact(payload).map_err(SessionError::Protocol)?;
            serve_chunk(shared, id, writer, &request).await
        }

        FrameKind::ChunkReply => {
            let (header, data) = wire::decode_chunk_reply(payload).map_err(SessionError::Protocol)?;
            let ct_hash = header.ct_hash;
            let offset = header.offset;
            accept_chunk_reply(shared, id, ct_hash, offset, data)
        }

        FrameKind::Cancel => {
            // Replies are produced synchronously on request, so there is
            // nothing in flight to cancel; validate and move on.
            let _request: ChunkRequest =
                wire::parse_exact(payload).map_err(SessionError::Protocol)?;
            Ok(())
        }
    }
}

async fn serve_chunk<W: AsyncWrite + Unpin>(
    shared: &FolderShared,
    id: SessionId,
    writer: &mut W,
    request: &ChunkRequest,
) -> Result<(), SessionError> {
    let ct_hash = request.ct_hash;
    let offset = request.offset as usize;
    let length = request.length as usize;

    let blob = match shared.store.get(&ct_hash) {
        Ok(blob) => blob,
        Err(_) => {
            tracing::debug!(
                session = id,
                ct_hash = hex::encode(&ct_hash[..8]),
                "chunk request for blob we do not hold"
            );
            return Ok(());
        }
    };

    let end = offset
        .checked_add(length)
        .filter(|&end| end <= blob.len())
        .ok_or(SessionError::Protocol(WireError::BadPayload(
            "chunk request out of range",
        )))?;

    let mut cursor = offset;
    while cursor < end {
        let segment_end = end.min(cursor + CHUNK_REPLY_SEGMENT);
        let reply = wire::encode_chunk_reply(ct_hash, cursor as u32, &blob[cursor..segment_end]);
        write_frame(writer, FrameKind::ChunkReply, &reply).await?;
        cursor = segment_end;
    }
    Ok(())
}

fn accept_chunk_reply(
    shared: &FolderShared,
    id: SessionId,
    ct_hash: [u8; 32],
    offset: u32,
    data: &[u8],
) -> Result<(), SessionError> {
    let progress = shared
        .scheduler
        .on_chunk_reply(id, &ct_hash, offset, data)
        .map_err(|violation| {
            SessionError::Protocol(WireError::BadPayload(match violation {
                ReplyViolation::OutOfOrder => "chunk reply out of order",
                ReplyViolation::Overrun => "chunk reply overruns request",
            }))
        })?;

    let bytes = match progress {
        ReplyProgress::Complete(bytes) => bytes,
        ReplyProgress::Partial => return Ok(()),
        ReplyProgress::Unmatched => {
            tracing::debug!(session = id, "late chunk reply ignored");
            return Ok(());
        }
    };

    if crypto::hash(&bytes) != ct_hash {
        shared.scheduler.requeue(&ct_hash);
        return Err(SessionError::HashMismatch);
    }

    if let Err(e) = shared.store.put(&ct_hash, &bytes) {
        tracing::warn!(error = %e, "storing fetched chunk failed, re-queued");
        shared.scheduler.requeue(&ct_hash);
        return Ok(());
    }

    for (path_hash, chunk_index) in shared.scheduler.complete_need(&ct_hash) {
        match shared.index.set_chunk_present(&path_hash, chunk_index, true) {
            Ok(()) => {}
            // Entry replaced by a newer revision since the need was
            // registered; the chunk stays in the store for dedup.
            Err(cove_engine::IndexError::NotFound)
            | Err(cove_engine::IndexError::BadChunkIndex(_)) => {}
            Err(e) => {
                shared.fail_folder(&e);
                return Err(SessionError::FolderFailed);
            }
        }
    }
    shared.scheduler.announce_chunk(ct_hash);
    Ok(())
}
