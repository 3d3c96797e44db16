//! ReadOnly peers: verify-only scanning, canonical restoration, and the
//! privilege boundary on signing.

use crate::*;
use cove_core::secret::Level;

#[tokio::test(flavor = "multi_thread")]
async fn readonly_peer_verifies_and_restores() {
    let owner = Secret::generate();
    let a = Node::start(&owner);

    let ro = owner.derive(Level::ReadOnly).unwrap();
    let b = Node::start(&ro);

    a.write("canon.txt", b"canonical content");
    connect(&a, &b);
    assert!(
        wait_for_content(&b, "canon.txt", b"canonical content").await,
        "readonly peer did not receive content"
    );

    // Tamper with B's copy outside the engine. The verify-only scanner
    // flags the divergence and the canonical content is restored.
    b.write("canon.txt", b"tampered locally!");
    assert!(
        wait_for_content(&b, "canon.txt", b"canonical content").await,
        "readonly peer did not restore canonical content"
    );

    // The tampered bytes were preserved as a conflict copy, not destroyed.
    let revision = b.revision("canon.txt").unwrap();
    let conflict_rel = format!("canon.txt.sync-conflict.{revision}");
    assert_eq!(
        b.read(&conflict_rel).as_deref(),
        Some(b"tampered locally!".as_slice())
    );

    // And the index still carries the canonical meta, not a new one.
    assert!(indexes_converged(&a, &b) || {
        // the conflict copy may still be propagating on A's side; compare
        // just the canonical path
        let entry_a = a
            .controller
            .index()
            .get(&a.path_hash("canon.txt"))
            .unwrap()
            .unwrap();
        let entry_b = b
            .controller
            .index()
            .get(&b.path_hash("canon.txt"))
            .unwrap()
            .unwrap();
        entry_a.signed_meta == entry_b.signed_meta
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn readonly_secret_cannot_sign() {
    use cove_core::meta::{Kind, Meta, SignedMeta, StrongHashType};
    use cove_core::secret::SecretError;

    let ro = Secret::generate().derive(Level::ReadOnly).unwrap();
    let meta = Meta {
        path_hash: [1u8; 32],
        path_ct: vec![0u8; 16],
        kind: Kind::Directory,
        revision: 1,
        windows_attrib: None,
        unix_attrib: None,
        symlink_target_ct: None,
        mtime: 0,
        strong_hash_type: StrongHashType::Blake3,
        chunks: Vec::new(),
    };
    assert_eq!(
        SignedMeta::sign(&meta, &ro).unwrap_err(),
        SecretError::InsufficientPrivilege
    );
}

/// A ReadOnly node never originates metas, even for files dropped into
/// its tree.
#[tokio::test(flavor = "multi_thread")]
async fn readonly_peer_does_not_index_local_additions() {
    let owner = Secret::generate();
    let ro = owner.derive(Level::ReadOnly).unwrap();
    let b = Node::start(&ro);

    b.write("rogue.txt", b"should never be signed");
    // Give the verify loop a few cycles.
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    assert!(b.controller.index().iter_all().unwrap().is_empty());
}
