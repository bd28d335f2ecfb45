//! Single-node behaviour: publish, retrieve, boundaries, idempotence.

use pando_core::DEFAULT_CHUNK_SIZE;
use pando_engine::EngineError;
use pando_store::StoreError;
use pando_tests::{init_tracing, TestNode};
use rand::RngCore;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[tokio::test]
async fn publish_then_fetch_small_file() {
    init_tracing();
    let node = TestNode::start(vec![]).await.unwrap();

    let content = b"hello, distributed content store!\n";
    let input = node.write_file("hello.txt", content);

    let digest = node.publish(&input, 4, 1).await.unwrap();
    assert_eq!(digest.to_hex().len(), 64);

    let records = node.records().await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.size, content.len() as u64);
    assert_eq!(record.data_chunks.len(), 4);
    assert_eq!(record.parity_chunks.len(), 1);
    for chunk in record.all_chunks() {
        let bytes = node
            .supervisor
            .engine()
            .store()
            .read_chunk(chunk)
            .unwrap();
        assert_eq!(bytes.len(), DEFAULT_CHUNK_SIZE as usize);
    }

    let out = node.out_path("hello.out");
    node.fetch(digest, &out).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), content);

    node.shutdown().await;
}

#[tokio::test]
async fn empty_file_roundtrip() {
    init_tracing();
    let node = TestNode::start(vec![]).await.unwrap();

    let input = node.write_file("empty", b"");
    let digest = node.publish(&input, 4, 1).await.unwrap();

    let record = &node.records().await[0];
    assert!(record.data_chunks.is_empty());
    assert!(record.parity_chunks.is_empty());

    let out = node.out_path("empty.out");
    node.fetch(digest, &out).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap().len(), 0);

    node.shutdown().await;
}

#[tokio::test]
async fn exact_stripe_has_no_padding_chunks() {
    init_tracing();
    let node = TestNode::start(vec![]).await.unwrap();

    let content = random_bytes(4 * DEFAULT_CHUNK_SIZE as usize);
    let input = node.write_file("exact.bin", &content);
    let digest = node.publish(&input, 4, 1).await.unwrap();

    let record = &node.records().await[0];
    assert_eq!(record.data_chunks.len(), 4);
    assert_eq!(record.stripe_count(), 1);

    let out = node.out_path("exact.out");
    node.fetch(digest, &out).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), content);

    node.shutdown().await;
}

#[tokio::test]
async fn one_byte_over_stripe_truncates_correctly() {
    init_tracing();
    let node = TestNode::start(vec![]).await.unwrap();

    let content = random_bytes(4 * DEFAULT_CHUNK_SIZE as usize + 1);
    let input = node.write_file("over.bin", &content);
    let digest = node.publish(&input, 4, 1).await.unwrap();

    let record = &node.records().await[0];
    assert_eq!(record.data_chunks.len(), 8);
    assert_eq!(record.stripe_count(), 2);

    let out = node.out_path("over.out");
    node.fetch(digest, &out).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), content);

    node.shutdown().await;
}

#[tokio::test]
async fn zero_parity_publish_succeeds() {
    init_tracing();
    let node = TestNode::start(vec![]).await.unwrap();

    let content = random_bytes(100_000);
    let input = node.write_file("plain.bin", &content);
    let digest = node.publish(&input, 4, 0).await.unwrap();

    let record = &node.records().await[0];
    assert!(record.parity_chunks.is_empty());

    let out = node.out_path("plain.out");
    node.fetch(digest, &out).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), content);

    node.shutdown().await;
}

#[tokio::test]
async fn republish_is_idempotent() {
    init_tracing();
    let node = TestNode::start(vec![]).await.unwrap();

    let content = random_bytes(50_000);
    let input = node.write_file("dup.bin", &content);

    let first = node.publish(&input, 4, 1).await.unwrap();
    let chunk_count = node
        .supervisor
        .engine()
        .store()
        .list_local_chunks()
        .unwrap()
        .len();
    let second = node.publish(&input, 4, 1).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(node.records().await.len(), 1);
    assert_eq!(
        node.supervisor
            .engine()
            .store()
            .list_local_chunks()
            .unwrap()
            .len(),
        chunk_count
    );

    node.shutdown().await;
}

#[tokio::test]
async fn delete_then_retrieve_is_not_found() {
    init_tracing();
    let node = TestNode::start(vec![]).await.unwrap();

    let content = random_bytes(10_000);
    let input = node.write_file("gone.bin", &content);
    let digest = node.publish(&input, 2, 1).await.unwrap();

    node.supervisor.delete(digest).await.unwrap();

    let out = node.out_path("gone.out");
    let err = node
        .supervisor
        .engine()
        .store()
        .retrieve(&digest, &out)
        .unwrap_err();
    assert!(matches!(err, StoreError::FileNotFound(_)));
    assert!(node
        .supervisor
        .engine()
        .store()
        .list_local_chunks()
        .unwrap()
        .is_empty());

    node.shutdown().await;
}

#[tokio::test]
async fn fetch_unknown_digest_terminates() {
    init_tracing();
    let node = TestNode::start(vec![]).await.unwrap();

    let out = node.out_path("never");
    let unknown = pando_core::Digest::of(b"no such file anywhere");
    let started = std::time::Instant::now();
    let err = node.fetch(unknown, &out).await.unwrap_err();

    assert!(matches!(err, EngineError::FileNotFound(_)));
    // A single-node lookup must terminate promptly, not spin.
    assert!(started.elapsed() < std::time::Duration::from_secs(10));

    node.shutdown().await;
}
