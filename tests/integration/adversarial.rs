//! Misbehaving peers: corrupt chunk replies, wrong-folder handshakes, and
//! bad auth tokens all close the session without poisoning state.

use crate::*;

use cove_core::crypto as core_crypto;
use cove_core::wire::{ChunkRequest, FrameKind, Handshake, HaveChunk, HaveMeta};
use coved::session::framed::{read_frame, write_frame};
use tokio::io::DuplexStream;
use zerocopy::AsBytes;

const EVIL_PUBKEY: [u8; 32] = [0x66; 32];

async fn evil_handshake(stream: &mut DuplexStream, secret: &Secret) {
    let handshake = Handshake {
        folder_id: secret.derive_folder_id().0,
        node_pubkey: EVIL_PUBKEY,
        auth_token: core_crypto::keyed_hash(&secret.auth_key(), &EVIL_PUBKEY),
    };
    write_frame(stream, FrameKind::Handshake, handshake.as_bytes())
        .await
        .unwrap();
}

/// Read frames until one of `kind` arrives; panics after 15 s.
async fn expect_frame(stream: &mut DuplexStream, kind: FrameKind) -> Vec<u8> {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(15);
    loop {
        let frame = tokio::time::timeout_at(deadline, read_frame(stream))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {kind:?}"))
            .unwrap_or_else(|e| panic!("stream failed waiting for {kind:?}: {e}"));
        if frame.0 == kind {
            return frame.1.to_vec();
        }
    }
}

/// Wait until the remote closes the stream (reads return EOF or error).
async fn expect_close(stream: &mut DuplexStream) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(15);
    loop {
        match tokio::time::timeout_at(deadline, read_frame(stream)).await {
            Ok(Err(_)) => return,
            Ok(Ok(_)) => continue,
            Err(_) => panic!("session was not closed"),
        }
    }
}

/// A peer answers a ChunkRequest with bytes that hash to the wrong
/// ct_hash. The victim closes the session, re-queues the chunk, and
/// fetches it from an honest peer instead.
#[tokio::test(flavor = "multi_thread")]
async fn corrupt_chunk_reply_closes_session_and_refetches() {
    let secret = Secret::generate();

    // Honest node H holds the real content.
    let h = Node::start(&secret);
    let content = random_bytes(4 * 1024, 66);
    h.write("data.bin", &content);
    assert!(wait_for(SYNC_TIMEOUT, || h.revision("data.bin").is_some()).await);
    let entry = h
        .controller
        .index()
        .get(&h.path_hash("data.bin"))
        .unwrap()
        .unwrap();
    let meta = entry.meta().unwrap();
    assert_eq!(meta.chunks.len(), 1);
    let ct_hash = meta.chunks[0].ct_hash;
    let ct_len = meta.chunks[0].size as usize + core_crypto::TAG_SIZE;

    // Victim node A, empty, talks to the evil peer first.
    let a = Node::start(&secret);
    let (stream_a, mut evil) = tokio::io::duplex(256 * 1024);
    a.controller.attach_session(stream_a, EVIL_PUBKEY);

    evil_handshake(&mut evil, &secret).await;
    expect_frame(&mut evil, FrameKind::Handshake).await;

    // Offer the meta; serve it when asked.
    let have = HaveMeta {
        path_hash: meta.path_hash,
        revision: meta.revision,
    };
    write_frame(&mut evil, FrameKind::HaveMeta, have.as_bytes())
        .await
        .unwrap();
    expect_frame(&mut evil, FrameKind::MetaRequest).await;
    write_frame(
        &mut evil,
        FrameKind::MetaReply,
        &cove_core::wire::encode_meta_reply(&entry.signed_meta),
    )
    .await
    .unwrap();

    // Offer the chunk, then answer the request with garbage of the right
    // length but the wrong bytes.
    let have = HaveChunk { ct_hash };
    write_frame(&mut evil, FrameKind::HaveChunk, have.as_bytes())
        .await
        .unwrap();
    let request = expect_frame(&mut evil, FrameKind::ChunkRequest).await;
    let request: ChunkRequest = cove_core::wire::parse_exact(&request).unwrap();
    let requested_len = request.length;
    assert_eq!(requested_len as usize, ct_len);

    let garbage = vec![0xAB; ct_len];
    write_frame(
        &mut evil,
        FrameKind::ChunkReply,
        &cove_core::wire::encode_chunk_reply(ct_hash, 0, &garbage),
    )
    .await
    .unwrap();

    // HashMismatch closes the session...
    expect_close(&mut evil).await;
    assert!(!a.controller.store().has(&ct_hash), "garbage must not be stored");

    // ...and the chunk is re-fetched from an honest peer.
    connect(&a, &h);
    assert!(
        wait_for_content(&a, "data.bin", &content).await,
        "victim did not recover from the honest peer"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_folder_handshake_is_rejected() {
    let secret = Secret::generate();
    let a = Node::start(&secret);

    let (stream_a, mut evil) = tokio::io::duplex(64 * 1024);
    a.controller.attach_session(stream_a, EVIL_PUBKEY);

    let handshake = Handshake {
        folder_id: [0u8; 32],
        node_pubkey: EVIL_PUBKEY,
        auth_token: core_crypto::keyed_hash(&secret.auth_key(), &EVIL_PUBKEY),
    };
    write_frame(&mut evil, FrameKind::Handshake, handshake.as_bytes())
        .await
        .unwrap();
    expect_close(&mut evil).await;
    assert_eq!(a.controller.index().iter_all().unwrap().len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_auth_token_is_rejected() {
    let secret = Secret::generate();
    let a = Node::start(&secret);

    let (stream_a, mut evil) = tokio::io::duplex(64 * 1024);
    a.controller.attach_session(stream_a, EVIL_PUBKEY);

    let handshake = Handshake {
        folder_id: secret.derive_folder_id().0,
        node_pubkey: EVIL_PUBKEY,
        auth_token: [0xFF; 32],
    };
    write_frame(&mut evil, FrameKind::Handshake, handshake.as_bytes())
        .await
        .unwrap();
    expect_close(&mut evil).await;
}

/// A tampered SignedMeta closes the session and never reaches the index.
#[tokio::test(flavor = "multi_thread")]
async fn forged_meta_closes_session() {
    let secret = Secret::generate();
    let h = Node::start(&secret);
    h.write("real.txt", b"real");
    assert!(wait_for(SYNC_TIMEOUT, || h.revision("real.txt").is_some()).await);
    let mut signed = h
        .controller
        .index()
        .get(&h.path_hash("real.txt"))
        .unwrap()
        .unwrap()
        .signed_meta;

    let a = Node::start(&secret);
    let (stream_a, mut evil) = tokio::io::duplex(64 * 1024);
    a.controller.attach_session(stream_a, EVIL_PUBKEY);

    evil_handshake(&mut evil, &secret).await;
    expect_frame(&mut evil, FrameKind::Handshake).await;

    let have = HaveMeta {
        path_hash: h.path_hash("real.txt"),
        revision: u64::MAX,
    };
    write_frame(&mut evil, FrameKind::HaveMeta, have.as_bytes())
        .await
        .unwrap();
    let _request = expect_frame(&mut evil, FrameKind::MetaRequest).await;

    // Tamper with the meta bytes: signature no longer verifies.
    signed.meta_bytes[40] ^= 0x01;
    write_frame(
        &mut evil,
        FrameKind::MetaReply,
        &cove_core::wire::encode_meta_reply(&signed),
    )
    .await
    .unwrap();

    expect_close(&mut evil).await;
    assert!(a
        .controller
        .index()
        .get(&a.path_hash("real.txt"))
        .unwrap()
        .is_none());
}

/// Unparseable frames are protocol violations.
#[tokio::test(flavor = "multi_thread")]
async fn malformed_frame_closes_session() {
    let secret = Secret::generate();
    let a = Node::start(&secret);

    let (stream_a, mut evil) = tokio::io::duplex(64 * 1024);
    a.controller.attach_session(stream_a, EVIL_PUBKEY);
    evil_handshake(&mut evil, &secret).await;
    expect_frame(&mut evil, FrameKind::Handshake).await;

    // HaveMeta payload of the wrong size.
    write_frame(&mut evil, FrameKind::HaveMeta, &[0u8; 7])
        .await
        .unwrap();
    expect_close(&mut evil).await;
}
