//! Test harness for multi-node integration testing.

#![deny(unsafe_code)]

pub mod harness;
pub mod node;

pub use harness::{corrupt_chunk_server, wait_until, TestNetwork};
pub use node::TestNode;

/// Installs a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    use tracing_subscriber::FmtSubscriber;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
