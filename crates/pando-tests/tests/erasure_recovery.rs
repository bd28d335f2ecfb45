//! Erasure recovery and corrupt-holder fallback during network fetch.

use std::time::Duration;

use pando_core::DEFAULT_CHUNK_SIZE;
use pando_engine::engine::chunk_key;
use pando_engine::EngineError;
use pando_tests::{corrupt_chunk_server, init_tracing, wait_until, TestNetwork};
use rand::RngCore;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[tokio::test]
async fn reconstructs_after_losing_two_data_chunks() {
    init_tracing();
    let network = TestNetwork::with_nodes(2).await.unwrap();

    // 262,144 bytes with k=4: exactly one stripe of four data chunks plus
    // two parity chunks.
    let content = random_bytes(4 * DEFAULT_CHUNK_SIZE as usize);
    let input = network.node(0).write_file("striped.bin", &content);
    let digest = network.node(0).publish(&input, 4, 2).await.unwrap();

    let announced = wait_until(Duration::from_secs(10), || async {
        network.node(0).has_announced(&digest)
    })
    .await;
    assert!(announced);

    // Lose two data chunks at the only holder; m=2 covers exactly that.
    let record = network.node(0).records().await.into_iter().next().unwrap();
    network.node(0).corrupt_lose_chunk(&record.data_chunks[0]);
    network.node(0).corrupt_lose_chunk(&record.data_chunks[2]);

    let out = network.node(1).out_path("striped.out");
    network.node(1).fetch(digest, &out).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), content);

    network.shutdown().await;
}

#[tokio::test]
async fn too_many_lost_chunks_is_unrecoverable() {
    init_tracing();
    let network = TestNetwork::with_nodes(2).await.unwrap();

    let content = random_bytes(2 * DEFAULT_CHUNK_SIZE as usize);
    let input = network.node(0).write_file("fragile.bin", &content);
    // No parity at all: any loss is fatal.
    let digest = network.node(0).publish(&input, 2, 0).await.unwrap();

    wait_until(Duration::from_secs(10), || async {
        network.node(0).has_announced(&digest)
    })
    .await;

    let record = network.node(0).records().await.into_iter().next().unwrap();
    network.node(0).corrupt_lose_chunk(&record.data_chunks[1]);

    let out = network.node(1).out_path("fragile.out");
    let err = network.node(1).fetch(digest, &out).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Unrecoverable {
            required: 2,
            ..
        }
    ));
    assert!(!out.exists());

    network.shutdown().await;
}

#[tokio::test]
async fn corrupt_holder_falls_back_to_honest_one() {
    init_tracing();
    let network = TestNetwork::with_nodes(2).await.unwrap();

    let content = random_bytes(2 * DEFAULT_CHUNK_SIZE as usize);
    let input = network.node(0).write_file("target.bin", &content);
    let digest = network.node(0).publish(&input, 2, 0).await.unwrap();

    let announced = wait_until(Duration::from_secs(10), || async {
        network.node(0).has_announced(&digest)
    })
    .await;
    assert!(announced);

    // A holder that serves the right sizes but the wrong bytes.
    let evil_addr = corrupt_chunk_server(DEFAULT_CHUNK_SIZE as usize)
        .await
        .unwrap();
    let evil = pando_core::PeerHandle::new(
        pando_core::NodeId::random(),
        evil_addr.ip().to_string(),
        evil_addr.port(),
    );
    let honest = network.node(0).supervisor.engine().serve_handle().clone();

    // Rewrite the fetcher's local holder lists so the corrupt server is
    // dialed first: overwrite whatever replicated, then seed the ordered
    // list (a non-array value always overwrites, an array then replaces it).
    let record = network.node(0).records().await.into_iter().next().unwrap();
    let fetcher_dht = network.node(1).supervisor.engine().dht().clone();
    for chunk in record.all_chunks() {
        let key = chunk_key(chunk);
        fetcher_dht
            .store()
            .insert(&key, serde_json::json!(null), Duration::from_secs(60));
        fetcher_dht.store().insert(
            &key,
            serde_json::json!([evil, honest]),
            Duration::from_secs(60),
        );
    }

    // Every chunk hits the corrupt holder, rejects it on digest mismatch,
    // and retries against the honest one.
    let out = network.node(1).out_path("target.out");
    network.node(1).fetch(digest, &out).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), content);

    network.shutdown().await;
}
