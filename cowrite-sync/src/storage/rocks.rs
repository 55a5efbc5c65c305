//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: versioned document snapshots (LZ4 compressed, keyed by doc_id:version)
//! - `metadata`: per-document metadata (bincode: latest version, counts, sizes)
//!
//! A snapshot and its metadata update land in one `WriteBatch`, so a write
//! is either fully visible or not at all.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use super::{unix_now, Snapshot, SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every snapshot write (default: true, so a save ack means durable)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cowrite_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Document metadata stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Highest stored snapshot version
    pub latest_version: u64,
    pub snapshot_count: u64,
    /// Uncompressed size of the latest snapshot
    pub payload_size: u64,
    /// Compressed size of the latest snapshot
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            latest_version: 0,
            snapshot_count: 0,
            payload_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Value stored under a snapshot key.
#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    created_at: u64,
    compressed: Vec<u8>,
}

/// RocksDB-backed snapshot store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes the version check and the batch write of `put_snapshot`
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened snapshot store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Payloads are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Load document metadata.
    pub fn load_metadata(&self, doc_id: Uuid) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all document IDs that have at least one snapshot.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?;
            doc_ids.push(Uuid::from_bytes(bytes));
        }

        Ok(doc_ids)
    }

    /// Force a flush of memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn load_version(&self, doc_id: Uuid, version: u64) -> Result<Option<Snapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(bytes) = self.db.get_cf(cf, Self::snapshot_key(doc_id, version))? else {
            return Ok(None);
        };

        let (record, _): (SnapshotRecord, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        let payload = lz4_flex::decompress_size_prepended(&record.compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;

        Ok(Some(Snapshot {
            doc_id,
            version,
            payload,
            created_at: record.created_at,
        }))
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// doc_id (16 bytes) + version (8 bytes big-endian), so keys of one
    /// document sort by version.
    fn snapshot_key(doc_id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }
}

impl SnapshotStore for RocksStore {
    fn latest_snapshot(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        match self.load_metadata(doc_id)? {
            Some(meta) if meta.snapshot_count > 0 => {
                let snapshot = self.load_version(doc_id, meta.latest_version)?;
                if snapshot.is_none() {
                    return Err(StoreError::DatabaseError(format!(
                        "Metadata for {doc_id} points at missing version {}",
                        meta.latest_version
                    )));
                }
                Ok(snapshot)
            }
            _ => Ok(None),
        }
    }

    fn put_snapshot(
        &self,
        doc_id: Uuid,
        version: u64,
        payload: &[u8],
    ) -> Result<Snapshot, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("write lock poisoned".into()))?;

        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        if meta.snapshot_count > 0 && version <= meta.latest_version {
            return Err(StoreError::VersionConflict {
                doc_id,
                attempted: version,
                latest: meta.latest_version,
            });
        }

        let created_at = unix_now();
        let compressed = lz4_flex::compress_prepend_size(payload);
        meta.latest_version = version;
        meta.snapshot_count += 1;
        meta.payload_size = payload.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = created_at;

        let record = bincode::serde::encode_to_vec(
            SnapshotRecord {
                created_at,
                compressed,
            },
            bincode::config::standard(),
        )
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, Self::snapshot_key(doc_id, version), &record);
        batch.put_cf(cf_meta, doc_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Stored snapshot v{version} of {doc_id} ({} → {} bytes)",
            meta.payload_size,
            meta.compressed_size
        );

        Ok(Snapshot {
            doc_id,
            version,
            payload: payload.to_vec(),
            created_at,
        })
    }

    fn list_versions(&self, doc_id: Uuid) -> Result<Vec<u64>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let start_key = Self::snapshot_key(doc_id, 0);

        let mut versions = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward))
        {
            let (key, _) = item?;
            if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let mut ver_buf = [0u8; 8];
            ver_buf.copy_from_slice(&key[16..24]);
            versions.push(u64::from_be_bytes(ver_buf));
        }

        Ok(versions)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
