//! Cove integration test harness.
//!
//! Each test runs two or more full folder controllers in-process and wires
//! their peer sessions over in-memory duplex streams — the session layer is
//! transport-generic, so everything above the socket is exercised exactly
//! as in production. Filesystem state lives in per-node temp dirs.

mod adversarial;
mod durability;
mod readonly;
mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cove_core::config::FolderParams;
use cove_core::crypto;
use cove_engine::ChunkerParams;
use coved::FolderController;

pub use cove_core::secret::Secret;

/// Small chunks so multi-chunk files stay cheap to generate.
pub fn test_chunker() -> ChunkerParams {
    ChunkerParams {
        min: 1024,
        target: 4096,
        max: 16384,
    }
}

pub struct Node {
    pub dir: tempfile::TempDir,
    pub params: FolderParams,
    pub secret: Secret,
    pub enc_key: [u8; 32],
    pub controller: Arc<FolderController>,
}

impl Node {
    /// Start a node on a fresh temp folder.
    pub fn start(secret: &Secret) -> Node {
        let dir = tempfile::tempdir().expect("tempdir");
        Self::start_at(secret, dir)
    }

    /// Start a node over an existing folder directory (restarts).
    pub fn start_at(secret: &Secret, dir: tempfile::TempDir) -> Node {
        let params = FolderParams {
            secret: secret.to_string(),
            path: dir.path().to_path_buf(),
            index_event_timeout: 100,
            full_rescan_interval: 2,
            ..FolderParams::default()
        };
        let controller = FolderController::start(params.clone(), test_chunker())
            .expect("controller start");
        Node {
            dir,
            params,
            secret: secret.clone(),
            enc_key: *secret
                .derive_encryption_key()
                .expect("test secrets can decrypt"),
            controller,
        }
    }

    /// Stop the controller, keep the on-disk state, return the directory
    /// for a later restart.
    pub fn stop(self) -> tempfile::TempDir {
        self.controller.stop();
        self.dir
    }

    pub fn abs(&self, rel: &str) -> PathBuf {
        self.params.path.join(rel)
    }

    pub fn path_hash(&self, rel: &str) -> [u8; 32] {
        crypto::path_hash(&self.enc_key, rel, true)
    }

    pub fn write(&self, rel: &str, bytes: &[u8]) {
        if let Some(parent) = self.abs(rel).parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(self.abs(rel), bytes).unwrap();
    }

    pub fn read(&self, rel: &str) -> Option<Vec<u8>> {
        std::fs::read(self.abs(rel)).ok()
    }

    pub fn mtime_micros(&self, rel: &str) -> i64 {
        let stat = std::fs::symlink_metadata(self.abs(rel)).unwrap();
        stat.modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_micros() as i64
    }

    /// The current meta revision for a path, if indexed.
    pub fn revision(&self, rel: &str) -> Option<u64> {
        self.controller
            .index()
            .get(&self.path_hash(rel))
            .unwrap()
            .map(|entry| entry.revision)
    }
}

/// Wire two nodes together with an in-memory duplex link.
pub fn connect(a: &Node, b: &Node) {
    let (stream_a, stream_b) = tokio::io::duplex(256 * 1024);
    a.controller
        .attach_session(stream_a, b.controller.node_pubkey());
    b.controller
        .attach_session(stream_b, a.controller.node_pubkey());
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

pub const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait until `rel` on `node` holds exactly `expected`.
pub async fn wait_for_content(node: &Node, rel: &str, expected: &[u8]) -> bool {
    wait_for(SYNC_TIMEOUT, || {
        node.read(rel).as_deref() == Some(expected)
    })
    .await
}

/// Convergence check: both indexes hold byte-identical signed metas for
/// every path either of them knows.
pub fn indexes_converged(a: &Node, b: &Node) -> bool {
    let entries_a = a.controller.index().iter_all().unwrap();
    let entries_b = b.controller.index().iter_all().unwrap();
    if entries_a.len() != entries_b.len() {
        return false;
    }
    let mut by_hash: std::collections::HashMap<[u8; 32], _> = entries_a
        .into_iter()
        .map(|entry| (entry.meta().unwrap().path_hash, entry.signed_meta))
        .collect();
    for entry in entries_b {
        let path_hash = entry.meta().unwrap().path_hash;
        match by_hash.remove(&path_hash) {
            Some(signed) if signed == entry.signed_meta => {}
            _ => return false,
        }
    }
    by_hash.is_empty()
}

/// Deterministic pseudo-random content (xorshift).
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}
