//! Chunk request scheduler — one per folder controller, spanning all of
//! that folder's peer sessions.
//!
//! The scheduler is also the session registry: each session registers its
//! outgoing frame queue here, and the controller talks to sessions only
//! through these handles (message passing, never shared mutation of
//! session state).
//!
//! Needed chunks are requested rarest-first — fewest announcing peers
//! wins, ties broken randomly — with a bounded number of outstanding
//! requests per session. A request that times out is re-queued and costs
//! the session a trust point; three strikes and the session is closed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use rand::Rng;
use tokio::sync::mpsc;
use zerocopy::AsBytes;

use cove_core::wire::{
    ChunkRequest, FrameKind, MAX_OUTSTANDING_REQUESTS, MAX_REQUEST_TIMEOUTS,
};

use crate::session::CloseReason;

pub type SessionId = u64;

/// A frame queued for a session's writer.
pub type OutFrame = (FrameKind, Vec<u8>);

/// Where a completed chunk must be recorded: (path_hash, chunk index).
pub type ChunkRef = ([u8; 32], usize);

struct Need {
    size: u32,
    refs: Vec<ChunkRef>,
}

struct Pending {
    buf: Vec<u8>,
    received: usize,
    size: u32,
    sent_at: Instant,
}

struct SessionState {
    peer_pubkey: [u8; 32],
    frame_tx: mpsc::Sender<OutFrame>,
    close_tx: mpsc::Sender<CloseReason>,
    outstanding: HashMap<[u8; 32], Pending>,
    timeouts: u32,
    /// Peer told us not to request.
    choked_us: bool,
    /// Last Interested/NotInterested we declared to this peer.
    interested: bool,
}

#[derive(Clone)]
pub struct RequestScheduler {
    needs: Arc<DashMap<[u8; 32], Need>>,
    availability: Arc<DashMap<[u8; 32], HashSet<SessionId>>>,
    sessions: Arc<DashMap<SessionId, SessionState>>,
    /// ct_hashes with a request currently outstanding somewhere.
    in_flight: Arc<DashSet<[u8; 32]>>,
    /// Chunks that became locally present since the last announce flush.
    announce: Arc<DashSet<[u8; 32]>>,
    next_id: Arc<AtomicU64>,
}

/// What a ChunkReply did to its pending request.
#[derive(Debug)]
pub enum ReplyProgress {
    /// More segments expected.
    Partial,
    /// Request satisfied; here are the complete encrypted bytes.
    Complete(Vec<u8>),
    /// No matching request (late reply after timeout/cancel); ignore.
    Unmatched,
}

impl RequestScheduler {
    pub fn new() -> Self {
        Self {
            needs: Arc::new(DashMap::new()),
            availability: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashSet::new()),
            announce: Arc::new(DashSet::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    // ── Session registry ──────────────────────────────────────────────────────

    pub fn register_session(
        &self,
        peer_pubkey: [u8; 32],
        frame_tx: mpsc::Sender<OutFrame>,
        close_tx: mpsc::Sender<CloseReason>,
    ) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            id,
            SessionState {
                peer_pubkey,
                frame_tx,
                close_tx,
                outstanding: HashMap::new(),
                timeouts: 0,
                choked_us: false,
                interested: false,
            },
        );
        id
    }

    /// Remove a session; its outstanding requests become requestable again.
    pub fn drop_session(&self, id: SessionId) {
        if let Some((_, state)) = self.sessions.remove(&id) {
            for ct_hash in state.outstanding.keys() {
                self.in_flight.remove(ct_hash);
            }
        }
        self.availability.retain(|_, holders| {
            holders.remove(&id);
            !holders.is_empty()
        });
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn peer_pubkeys(&self) -> Vec<[u8; 32]> {
        self.sessions
            .iter()
            .map(|entry| entry.value().peer_pubkey)
            .collect()
    }

    pub fn mark_choked(&self, id: SessionId, choked: bool) {
        if let Some(mut state) = self.sessions.get_mut(&id) {
            state.choked_us = choked;
        }
    }

    // ── Availability & needs ──────────────────────────────────────────────────

    pub fn add_availability(&self, id: SessionId, ct_hash: [u8; 32]) {
        self.availability.entry(ct_hash).or_default().insert(id);
    }

    /// Record that `ct_hash` is needed to complete `chunk_ref`.
    pub fn register_need(&self, ct_hash: [u8; 32], size: u32, chunk_ref: ChunkRef) {
        let mut need = self.needs.entry(ct_hash).or_insert_with(|| Need {
            size,
            refs: Vec::new(),
        });
        if !need.refs.contains(&chunk_ref) {
            need.refs.push(chunk_ref);
        }
    }

    /// Forget a satisfied need, returning every place the chunk must be
    /// recorded.
    pub fn complete_need(&self, ct_hash: &[u8; 32]) -> Vec<ChunkRef> {
        self.in_flight.remove(ct_hash);
        self.needs
            .remove(ct_hash)
            .map(|(_, need)| need.refs)
            .unwrap_or_default()
    }

    /// Put a chunk back on the queue (timeout, hash mismatch, lost session).
    pub fn requeue(&self, ct_hash: &[u8; 32]) {
        self.in_flight.remove(ct_hash);
    }

    pub fn needed_count(&self) -> usize {
        self.needs.len()
    }

    /// Queue a chunk announcement for the next coalesced flush.
    pub fn announce_chunk(&self, ct_hash: [u8; 32]) {
        self.announce.insert(ct_hash);
    }

    pub fn drain_announcements(&self) -> Vec<[u8; 32]> {
        let drained: Vec<[u8; 32]> = self.announce.iter().map(|h| *h).collect();
        for ct_hash in &drained {
            self.announce.remove(ct_hash);
        }
        drained
    }

    // ── Reply accounting ──────────────────────────────────────────────────────

    /// Fold one ChunkReply segment into its pending request. Segments must
    /// arrive in order and must not overrun the requested length — either
    /// is a protocol violation the session turns into a close.
    pub fn on_chunk_reply(
        &self,
        id: SessionId,
        ct_hash: &[u8; 32],
        offset: u32,
        data: &[u8],
    ) -> Result<ReplyProgress, ReplyViolation> {
        let Some(mut state) = self.sessions.get_mut(&id) else {
            return Ok(ReplyProgress::Unmatched);
        };
        let Some(pending) = state.outstanding.get(ct_hash) else {
            return Ok(ReplyProgress::Unmatched);
        };
        let (received, size) = (pending.received, pending.size as usize);

        if offset as usize != received {
            state.outstanding.remove(ct_hash);
            return Err(ReplyViolation::OutOfOrder);
        }
        if received + data.len() > size {
            state.outstanding.remove(ct_hash);
            return Err(ReplyViolation::Overrun);
        }

        if received + data.len() == size {
            let Some(mut pending) = state.outstanding.remove(ct_hash) else {
                return Ok(ReplyProgress::Unmatched);
            };
            pending.buf.extend_from_slice(data);
            Ok(ReplyProgress::Complete(pending.buf))
        } else {
            if let Some(pending) = state.outstanding.get_mut(ct_hash) {
                pending.buf.extend_from_slice(data);
                pending.received += data.len();
            }
            Ok(ReplyProgress::Partial)
        }
    }

    // ── Scheduling ────────────────────────────────────────────────────────────

    /// One scheduling round: update interest declarations and hand out
    /// requests, rarest-first.
    pub fn pump(&self) {
        self.update_interest();

        // Rank needed chunks by how few peers announce them.
        let mut candidates: Vec<([u8; 32], usize, u64)> = self
            .needs
            .iter()
            .filter(|entry| !self.in_flight.contains(entry.key()))
            .map(|entry| {
                let holders = self
                    .availability
                    .get(entry.key())
                    .map(|h| h.len())
                    .unwrap_or(0);
                (*entry.key(), holders, rand::thread_rng().gen())
            })
            .filter(|(_, holders, _)| *holders > 0)
            .collect();
        candidates.sort_by_key(|(_, holders, tiebreak)| (*holders, *tiebreak));

        for (ct_hash, _, _) in candidates {
            let Some(need_size) = self.needs.get(&ct_hash).map(|n| n.size) else {
                continue;
            };
            let Some(holders) = self.availability.get(&ct_hash).map(|h| h.clone()) else {
                continue;
            };

            // Any holder with request budget, chosen at random.
            let mut eligible: Vec<SessionId> = holders
                .into_iter()
                .filter(|id| {
                    self.sessions
                        .get(id)
                        .map(|s| !s.choked_us && s.outstanding.len() < MAX_OUTSTANDING_REQUESTS)
                        .unwrap_or(false)
                })
                .collect();
            if eligible.is_empty() {
                continue;
            }
            let pick = eligible.remove(rand::thread_rng().gen_range(0..eligible.len()));

            let request = ChunkRequest {
                ct_hash,
                offset: 0,
                length: need_size,
            };
            let Some(mut state) = self.sessions.get_mut(&pick) else {
                continue;
            };
            if state
                .frame_tx
                .try_send((FrameKind::ChunkRequest, request.as_bytes().to_vec()))
                .is_ok()
            {
                state.outstanding.insert(
                    ct_hash,
                    Pending {
                        buf: Vec::with_capacity(need_size as usize),
                        received: 0,
                        size: need_size,
                        sent_at: Instant::now(),
                    },
                );
                self.in_flight.insert(ct_hash);
            }
        }
    }

    fn update_interest(&self) {
        for mut entry in self.sessions.iter_mut() {
            let id = *entry.key();
            let wants_any = self.needs.iter().any(|need| {
                self.availability
                    .get(need.key())
                    .is_some_and(|holders| holders.contains(&id))
            });
            if wants_any != entry.interested {
                let kind = if wants_any {
                    FrameKind::Interested
                } else {
                    FrameKind::NotInterested
                };
                if entry.frame_tx.try_send((kind, Vec::new())).is_ok() {
                    entry.interested = wants_any;
                }
            }
        }
    }

    /// Expire requests older than `timeout`. Each expiry re-queues its
    /// chunk and decrements the session's trust; a session that has timed
    /// out three times is closed.
    pub fn expire(&self, timeout: Duration) {
        let now = Instant::now();
        let mut to_close = Vec::new();

        for mut entry in self.sessions.iter_mut() {
            let id = *entry.key();
            let expired: Vec<[u8; 32]> = entry
                .outstanding
                .iter()
                .filter(|(_, pending)| now.duration_since(pending.sent_at) > timeout)
                .map(|(ct_hash, _)| *ct_hash)
                .collect();
            for ct_hash in expired {
                entry.outstanding.remove(&ct_hash);
                self.in_flight.remove(&ct_hash);
                entry.timeouts += 1;
                tracing::debug!(
                    session = id,
                    ct_hash = hex::encode(&ct_hash[..8]),
                    timeouts = entry.timeouts,
                    "chunk request timed out, re-queued"
                );
            }
            if entry.timeouts >= MAX_REQUEST_TIMEOUTS {
                to_close.push((id, entry.close_tx.clone()));
            }
        }

        for (id, close_tx) in to_close {
            tracing::warn!(session = id, "dropping session after repeated timeouts");
            let _ = close_tx.try_send(CloseReason::Timeouts);
        }
    }

    // ── Broadcast helpers ─────────────────────────────────────────────────────

    /// Announce a meta to every session. Droppable under backpressure.
    pub fn broadcast_have_meta(&self, payload: Vec<u8>) {
        for entry in self.sessions.iter() {
            let _ = entry.frame_tx.try_send((FrameKind::HaveMeta, payload.clone()));
        }
    }

    /// Announce chunks to every session. Droppable under backpressure.
    pub fn broadcast_have_chunks(&self, ct_hashes: &[[u8; 32]]) {
        for entry in self.sessions.iter() {
            for ct_hash in ct_hashes {
                let _ = entry
                    .frame_tx
                    .try_send((FrameKind::HaveChunk, ct_hash.to_vec()));
            }
        }
    }
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Reply shapes that are protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyViolation {
    OutOfOrder,
    Overrun,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
