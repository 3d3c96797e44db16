//! Core synchronization scenarios: single-file add, concurrent edit with
//! conflict siding, and deletion propagation.

use crate::*;

/// A creates a file; B attaches with the same secret and receives it,
/// content and mtime intact.
#[tokio::test(flavor = "multi_thread")]
async fn single_file_add_propagates() {
    let secret = Secret::generate();
    let a = Node::start(&secret);
    let b = Node::start(&secret);

    a.write("hello.txt", b"hi");
    assert!(
        wait_for(SYNC_TIMEOUT, || a.revision("hello.txt").is_some()).await,
        "A did not index hello.txt"
    );

    // A's index holds one File meta with one 2-byte chunk in the store.
    let entry = a
        .controller
        .index()
        .get(&a.path_hash("hello.txt"))
        .unwrap()
        .unwrap();
    let meta = entry.meta().unwrap();
    assert_eq!(meta.chunks.len(), 1);
    assert_eq!(meta.chunks[0].size, 2);
    assert!(a.controller.store().has(&meta.chunks[0].ct_hash));

    connect(&a, &b);
    assert!(
        wait_for_content(&b, "hello.txt", b"hi").await,
        "B did not receive hello.txt"
    );
    assert_eq!(b.mtime_micros("hello.txt"), meta.mtime);

    assert!(wait_for(SYNC_TIMEOUT, || indexes_converged(&a, &b)).await);
}

/// No frame on the wire may carry a cleartext path or file content, even
/// when the peer pulls the meta and the chunk.
#[tokio::test(flavor = "multi_thread")]
async fn no_cleartext_on_the_wire() {
    use cove_core::crypto as core_crypto;
    use cove_core::wire::{ChunkRequest, FrameKind, Handshake, HaveChunk, HaveMeta, MetaRequest};
    use coved::session::framed::{read_frame, write_frame};
    use zerocopy::AsBytes;

    let secret = Secret::generate();
    let a = Node::start(&secret);
    let needle_content = b"very private payload";
    a.write("secret-name.txt", needle_content);
    assert!(wait_for(SYNC_TIMEOUT, || a.revision("secret-name.txt").is_some()).await);

    // Tap: a hand-driven peer that handshakes, pulls everything A offers,
    // and records every payload byte A sends.
    let (stream_a, mut tap) = tokio::io::duplex(256 * 1024);
    let tap_pubkey = [0xEE; 32];
    a.controller.attach_session(stream_a, tap_pubkey);

    let handshake = Handshake {
        folder_id: secret.derive_folder_id().0,
        node_pubkey: tap_pubkey,
        auth_token: core_crypto::keyed_hash(&secret.auth_key(), &tap_pubkey),
    };
    write_frame(&mut tap, FrameKind::Handshake, handshake.as_bytes())
        .await
        .unwrap();

    // Ciphertext length of the single chunk: plaintext plus AEAD tag.
    let ct_len = (needle_content.len() + core_crypto::TAG_SIZE) as u32;

    let mut captured = Vec::new();
    let mut got_meta_reply = false;
    let mut got_chunk_reply = false;
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline && !(got_meta_reply && got_chunk_reply) {
        let frame = tokio::time::timeout_at(deadline, read_frame(&mut tap)).await;
        let Ok(Ok((kind, payload))) = frame else { break };
        captured.extend_from_slice(&payload);
        match kind {
            FrameKind::HaveMeta => {
                let have: HaveMeta = cove_core::wire::parse_exact(&payload).unwrap();
                let request = MetaRequest {
                    path_hash: have.path_hash,
                };
                write_frame(&mut tap, FrameKind::MetaRequest, request.as_bytes())
                    .await
                    .unwrap();
            }
            FrameKind::HaveChunk => {
                let have: HaveChunk = cove_core::wire::parse_exact(&payload).unwrap();
                let request = ChunkRequest {
                    ct_hash: have.ct_hash,
                    offset: 0,
                    length: ct_len,
                };
                write_frame(&mut tap, FrameKind::ChunkRequest, request.as_bytes())
                    .await
                    .unwrap();
            }
            FrameKind::MetaReply => got_meta_reply = true,
            FrameKind::ChunkReply => got_chunk_reply = true,
            _ => {}
        }
    }

    assert!(got_meta_reply, "tap never received the meta");
    assert!(got_chunk_reply, "tap never received the chunk");

    let needle_path = b"secret-name.txt";
    assert!(
        !captured.windows(needle_path.len()).any(|w| w == needle_path),
        "cleartext path leaked onto the wire"
    );
    assert!(
        !captured
            .windows(needle_content.len())
            .any(|w| w == needle_content),
        "file content leaked onto the wire"
    );
}

/// Divergent offline edits: the higher revision wins everywhere and the
/// losing node keeps its content as a conflict copy.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_edit_sides_conflict() {
    let secret = Secret::generate();
    let a = Node::start(&secret);
    let b = Node::start(&secret);

    let content_a = random_bytes(32 * 1024, 1);
    let content_b = random_bytes(32 * 1024, 2);

    // Partitioned from the start: each node commits its own revision.
    a.write("x.bin", &content_a);
    assert!(wait_for(SYNC_TIMEOUT, || a.revision("x.bin").is_some()).await);

    // Strictly later wall clock → B's revision is the winner.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    b.write("x.bin", &content_b);
    assert!(wait_for(SYNC_TIMEOUT, || b.revision("x.bin").is_some()).await);

    let rev_a = a.revision("x.bin").unwrap();
    let rev_b = b.revision("x.bin").unwrap();
    assert!(rev_b > rev_a, "test clock assumption violated");

    // Heal the partition.
    connect(&a, &b);

    // Winner's content lands on both nodes.
    assert!(wait_for_content(&a, "x.bin", &content_b).await);
    assert_eq!(b.read("x.bin").as_deref(), Some(content_b.as_slice()));
    assert!(
        wait_for(SYNC_TIMEOUT, || a.revision("x.bin") == Some(rev_b)).await
    );

    // Loser's content survives as a conflict copy on the losing node.
    let conflict_rel = format!("x.bin.sync-conflict.{rev_b}");
    assert!(
        wait_for(SYNC_TIMEOUT, || a.read(&conflict_rel).is_some()).await,
        "conflict copy missing on losing node"
    );
    assert_eq!(a.read(&conflict_rel).unwrap(), content_a);
}

/// A deletion on one node removes the file on the other and leaves a
/// Deleted tombstone in both indexes.
#[tokio::test(flavor = "multi_thread")]
async fn deletion_propagates() {
    let secret = Secret::generate();
    let a = Node::start(&secret);
    let b = Node::start(&secret);

    a.write("x.bin", &random_bytes(8 * 1024, 3));
    connect(&a, &b);
    assert!(wait_for(SYNC_TIMEOUT, || b.read("x.bin").is_some()).await);

    std::fs::remove_file(a.abs("x.bin")).unwrap();
    assert!(
        wait_for(SYNC_TIMEOUT, || b.read("x.bin").is_none()).await,
        "deletion did not reach B"
    );

    let entry = b
        .controller
        .index()
        .get(&b.path_hash("x.bin"))
        .unwrap()
        .expect("tombstone entry");
    assert_eq!(
        entry.meta().unwrap().kind,
        cove_core::meta::Kind::Deleted
    );
}

/// Directory trees and nested files propagate.
#[tokio::test(flavor = "multi_thread")]
async fn nested_tree_propagates() {
    let secret = Secret::generate();
    let a = Node::start(&secret);
    let b = Node::start(&secret);

    a.write("docs/notes/todo.md", b"- ship it\n");
    a.write("docs/readme.md", b"# hello\n");

    connect(&a, &b);
    assert!(wait_for_content(&b, "docs/notes/todo.md", b"- ship it\n").await);
    assert!(wait_for_content(&b, "docs/readme.md", b"# hello\n").await);
    assert!(b.abs("docs/notes").is_dir());

    assert!(wait_for(SYNC_TIMEOUT, || indexes_converged(&a, &b)).await);
}

/// Multi-chunk content arrives intact.
#[tokio::test(flavor = "multi_thread")]
async fn large_file_propagates() {
    let secret = Secret::generate();
    let a = Node::start(&secret);
    let b = Node::start(&secret);

    let content = random_bytes(200 * 1024, 4);
    a.write("big.bin", &content);
    assert!(wait_for(SYNC_TIMEOUT, || a.revision("big.bin").is_some()).await);

    let meta = a
        .controller
        .index()
        .get(&a.path_hash("big.bin"))
        .unwrap()
        .unwrap()
        .meta()
        .unwrap();
    assert!(meta.chunks.len() > 4, "expected a multi-chunk file");

    connect(&a, &b);
    assert!(wait_for_content(&b, "big.bin", &content).await);
}
