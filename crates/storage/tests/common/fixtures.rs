use bytes::Bytes;
use quarry_storage::{FilesystemKeyValueStore, KeyValueStore, MemoryKeyValueStore};
use std::sync::Arc;
use tempfile::TempDir;

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // Simple LCG (Linear Congruential Generator)
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Every key-value backend, each freshly created. The temp dir must outlive
/// the filesystem store.
pub async fn backends() -> (TempDir, Vec<Arc<dyn KeyValueStore>>) {
    let temp = TempDir::new().expect("create temp dir");
    let filesystem = FilesystemKeyValueStore::open(temp.path().join("kv"))
        .await
        .expect("open filesystem store");
    let stores: Vec<Arc<dyn KeyValueStore>> =
        vec![Arc::new(MemoryKeyValueStore::new()), Arc::new(filesystem)];
    (temp, stores)
}
