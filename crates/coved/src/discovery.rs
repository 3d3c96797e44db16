//! Discovery intake and dialer.
//!
//! Discovery mechanisms (multicast, DHT, trackers — all external) and the
//! static `nodes` folder option deliver candidate endpoints here. Each new
//! candidate gets a dial loop with exponential backoff, 1 s doubling to a
//! 60 s cap, reset only after an orderly session close — sessions torn
//! down for protocol violations keep their backoff growing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::broadcast;

use cove_core::secret::FolderId;

use crate::controller::FolderController;
use crate::transport;

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// One peer lead: where to try connecting for which folder.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub folder_id: FolderId,
    pub endpoint: String,
    /// Known public key, when the discovery source provides one.
    pub pubkey: Option<[u8; 32]>,
}

pub struct Discovery {
    controllers: Arc<DashMap<FolderId, Arc<FolderController>>>,
    /// Dedup key: folder plus pubkey (when known) or endpoint.
    seen: DashSet<(FolderId, String)>,
    shutdown: broadcast::Sender<()>,
}

impl Discovery {
    pub fn new(
        controllers: Arc<DashMap<FolderId, Arc<FolderController>>>,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            controllers,
            seen: DashSet::new(),
            shutdown,
        })
    }

    /// Feed one candidate. Duplicates (same folder and identity/endpoint)
    /// are dropped; new ones get a dial loop.
    pub fn submit(self: &Arc<Self>, candidate: Candidate) {
        let identity = candidate
            .pubkey
            .map(hex::encode)
            .unwrap_or_else(|| candidate.endpoint.clone());
        if !self.seen.insert((candidate.folder_id, identity)) {
            return;
        }

        tracing::debug!(
            folder = %candidate.folder_id,
            endpoint = %candidate.endpoint,
            "new peer candidate"
        );
        let this = self.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(this.dial_loop(candidate, shutdown));
    }

    async fn dial_loop(
        self: Arc<Self>,
        candidate: Candidate,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut backoff = BACKOFF_START;

        loop {
            let Some(controller) = self
                .controllers
                .get(&candidate.folder_id)
                .map(|entry| entry.value().clone())
            else {
                tracing::debug!(folder = %candidate.folder_id, "folder gone; dialer exiting");
                return;
            };

            match transport::connect(
                &candidate.endpoint,
                candidate.folder_id,
                controller.node_pubkey(),
            )
            .await
            {
                Ok((stream, remote_pubkey)) => {
                    if let Some(expected) = candidate.pubkey {
                        if expected != remote_pubkey {
                            tracing::warn!(
                                endpoint = %candidate.endpoint,
                                "peer identity does not match discovery lead"
                            );
                        }
                    }
                    let session = controller.attach_session(stream, remote_pubkey);
                    let reason = session.await.unwrap_or(crate::session::CloseReason::Io);
                    if reason.resets_backoff() {
                        backoff = BACKOFF_START;
                    } else {
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        endpoint = %candidate.endpoint,
                        error = %e,
                        next_retry = ?backoff,
                        "dial failed"
                    );
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }

            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}
