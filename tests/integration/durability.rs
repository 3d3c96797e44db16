//! Restart durability: persisted index and chunk state survive a stop, and
//! an interrupted sync resumes where it left off.

use crate::*;

#[tokio::test(flavor = "multi_thread")]
async fn restart_preserves_index_and_chunks() {
    let secret = Secret::generate();
    let a = Node::start(&secret);

    for i in 0..30u32 {
        a.write(
            &format!("file-{i:02}.bin"),
            &random_bytes(512 + (i as usize * 137) % 4096, i as u64 + 10),
        );
    }
    assert!(
        wait_for(SYNC_TIMEOUT, || {
            a.controller.index().iter_all().unwrap().len() == 30
        })
        .await,
        "not all files indexed before shutdown"
    );

    let snapshot: Vec<_> = {
        let mut entries = a.controller.index().iter_all().unwrap();
        entries.sort_by_key(|entry| entry.meta().unwrap().path_hash);
        entries
            .into_iter()
            .map(|entry| entry.signed_meta)
            .collect()
    };
    let mut chunks_before: Vec<[u8; 32]> = a.controller.store().iter().collect();
    chunks_before.sort();

    // Shut down and restart over the same directory.
    let dir = a.stop();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let a = Node::start_at(&secret, dir);

    let restored: Vec<_> = {
        let mut entries = a.controller.index().iter_all().unwrap();
        entries.sort_by_key(|entry| entry.meta().unwrap().path_hash);
        entries
            .into_iter()
            .map(|entry| entry.signed_meta)
            .collect()
    };
    assert_eq!(restored, snapshot, "index changed across restart");

    let mut chunks_after: Vec<[u8; 32]> = a.controller.store().iter().collect();
    chunks_after.sort();
    assert_eq!(chunks_after, chunks_before, "chunk store changed across restart");

    // A restarted node still syncs.
    let b = Node::start(&secret);
    connect(&a, &b);
    assert!(
        wait_for(SYNC_TIMEOUT, || {
            (0..30u32).all(|i| {
                b.read(&format!("file-{i:02}.bin")).as_deref()
                    == a.read(&format!("file-{i:02}.bin")).as_deref()
                    && b.read(&format!("file-{i:02}.bin")).is_some()
            })
        })
        .await,
        "post-restart sync incomplete"
    );
}

/// A node that already holds a meta and some of its chunks resumes the
/// fetch on startup instead of starting over.
#[tokio::test(flavor = "multi_thread")]
async fn partial_sync_resumes_after_restart() {
    use cove_engine::{ChunkStore, Index};

    let secret = Secret::generate();
    let a = Node::start(&secret);

    let content = random_bytes(64 * 1024, 99);
    a.write("resume.bin", &content);
    assert!(wait_for(SYNC_TIMEOUT, || a.revision("resume.bin").is_some()).await);
    let entry = a
        .controller
        .index()
        .get(&a.path_hash("resume.bin"))
        .unwrap()
        .unwrap();
    let meta = entry.meta().unwrap();
    assert!(meta.chunks.len() > 2, "need a multi-chunk file");

    // Pre-seed B's on-disk state as if a previous run had fetched the meta
    // and the first chunk, then died.
    let b_dir = tempfile::tempdir().unwrap();
    let system_path = b_dir.path().join(".cove");
    {
        let index = Index::open(&system_path, secret.clone()).unwrap();
        index.upsert(&entry.signed_meta).unwrap();

        let store = ChunkStore::open(&system_path).unwrap();
        let first = &meta.chunks[0];
        let blob = a.controller.store().get(&first.ct_hash).unwrap();
        store.put(&first.ct_hash, &blob).unwrap();
        index
            .set_chunk_present(&meta.path_hash, 0, true)
            .unwrap();
    }

    let b = Node::start_at(&secret, b_dir);
    assert!(
        b.controller.store().has(&meta.chunks[0].ct_hash),
        "pre-seeded chunk lost"
    );

    connect(&a, &b);
    assert!(
        wait_for_content(&b, "resume.bin", &content).await,
        "resumed sync did not complete"
    );
    for chunk in &meta.chunks {
        assert!(b.controller.store().has(&chunk.ct_hash));
    }
}
