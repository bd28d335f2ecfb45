//! Storage configuration.

use std::path::{Path, PathBuf};

use pando_core::DEFAULT_CHUNK_SIZE;

/// Suffix of transient files; anything carrying it is deleted at open.
pub const TMP_SUFFIX: &str = ".tmp";

/// Name of the index file inside the storage directory.
pub const INDEX_FILE: &str = "index.json";

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the index and every chunk blob.
    pub storage_dir: PathBuf,
    /// Chunking unit in bytes.
    pub chunk_size: u32,
}

impl StoreConfig {
    /// Creates a configuration rooted at `storage_dir` with the default
    /// chunk size.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Overrides the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Path of the index file.
    pub fn index_path(&self) -> PathBuf {
        self.storage_dir.join(INDEX_FILE)
    }

    /// Path of a chunk blob.
    pub fn blob_path(&self, hex_digest: &str) -> PathBuf {
        self.storage_dir.join(hex_digest)
    }

    /// Creates the storage directory if absent.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.storage_dir)
    }
}

/// Returns the transient sibling of `path`, written first and renamed into
/// place so readers never observe a partial file.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(TMP_SUFFIX);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let config = StoreConfig::new("/data/pando");
        assert_eq!(config.index_path(), PathBuf::from("/data/pando/index.json"));
        assert_eq!(config.blob_path("abcd"), PathBuf::from("/data/pando/abcd"));
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_tmp_path() {
        assert_eq!(
            tmp_path(Path::new("/data/pando/index.json")),
            PathBuf::from("/data/pando/index.json.tmp")
        );
    }
}
