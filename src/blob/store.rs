//! Blob store capability.
//!
//! A blob store is a flat key → bytes map with `get`/`set`/`delete`/`list`.
//! Keys are content addresses produced upstream, so a key's bytes never
//! change once written — stores reconcile presence, not content.
//!
//! Two implementations ship here: [`MemoryBlobStore`] for tests and local
//! caches, and [`RocksBlobStore`], a RocksDB-backed store with
//! LZ4-compressed values.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteOptions,
};
use tokio::sync::RwLock;

/// Blob storage errors.
#[derive(Debug, Clone)]
pub enum BlobError {
    /// Underlying database error.
    DatabaseError(String),
    /// Stored value failed to decompress.
    CompressionError(String),
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobError::DatabaseError(e) => write!(f, "Database error: {e}"),
            BlobError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for BlobError {}

impl From<rocksdb::Error> for BlobError {
    fn from(e: rocksdb::Error) -> Self {
        BlobError::DatabaseError(e.to_string())
    }
}

/// The storage capability consumed by [`crate::blob::BlobPeer`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Fetch a blob. `Ok(None)` means the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError>;

    /// Store a blob under `key`.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BlobError>;

    /// Delete a blob. Stores may leave this unimplemented (no-op).
    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    /// List all keys.
    async fn list(&self) -> Result<Vec<String>, BlobError>;
}

/// In-memory blob store.
pub struct MemoryBlobStore {
    name: String,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-populate a key, bypassing the trait (test setup helper).
    pub async fn preload(&self, key: impl Into<String>, value: Vec<u8>) {
        self.blobs.write().await.insert(key.into(), value);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BlobError> {
        self.blobs.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), BlobError> {
        // Blobs are content-addressed and immutable; deletion is unsupported.
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, BlobError> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }
}

/// RocksDB store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB).
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10).
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false).
    pub sync_writes: bool,
}

impl RocksConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
        }
    }
}

/// RocksDB-backed blob store with LZ4-compressed values.
pub struct RocksBlobStore {
    name: String,
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
}

impl RocksBlobStore {
    /// Open (or create) the store at the configured path.
    pub fn open(name: impl Into<String>, config: RocksConfig) -> Result<Self, BlobError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_keep_log_file_num(5);

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed by us before the write; the table
        // itself stays uncompressed.
        opts.set_compression_type(DBCompressionType::None);

        let db = DBWithThreadMode::<SingleThreaded>::open(&opts, &config.path)?;
        Ok(Self {
            name: name.into(),
            db,
            config,
        })
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

#[async_trait]
impl BlobStore for RocksBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        match self.db.get(key.as_bytes())? {
            Some(compressed) => {
                let value = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| BlobError::CompressionError(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BlobError> {
        let compressed = lz4_flex::compress_prepend_size(&value);
        self.db
            .put_opt(key.as_bytes(), &compressed, &self.write_options())?;
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), BlobError> {
        // Unsupported by design, same as the other stores.
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, BlobError> {
        let mut keys = Vec::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }
}
