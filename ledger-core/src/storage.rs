//! Storage layer using RocksDB
//!
//! Every record lives in a column family declared as a [`Table`]. Tables
//! marked append-only hold ledger-of-record facts: the only way to write them
//! is [`WriteSet::insert`], which fails at commit time if the key already
//! exists. There is no delete method on [`Storage`] at all, so no write path
//! (admin tooling included) can remove or rewrite a recorded fact.
//!
//! # Column Families
//!
//! - `wallets` - Wallet rows (key: wallet_id)
//! - `wallet_entries` - Append-only wallet ledger (key: wallet_id || sequence)
//! - `entry_index` - entry_id -> location of the entry
//! - `transaction_index` - transaction_id -> entry_id (idempotency)
//! - `entries_by_reference` - reference || entry_id
//! - `entry_reversals` - entry_id -> reversal link
//! - `archive_flags` - bookkeeping flag per entry (the only mutable ledger metadata)
//! - `fund_locks` / `fund_locks_by_wallet` - fund reservations
//! - `postings` / `postings_by_reference` / `posting_reversals` - double-entry pairs
//!
//! Downstream crates register their own tables when opening the store so
//! that multi-component writes commit in one atomic batch.

use crate::{
    error::{Error, Result},
    Config,
};
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction as ScanDirection,
    IteratorMode, Options, WriteBatch, WriteOptions, DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Declared column family and its mutability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Table {
    name: &'static str,
    append_only: bool,
}

impl Table {
    /// Table whose rows can never be overwritten
    pub const fn append_only(name: &'static str) -> Self {
        Self {
            name,
            append_only: true,
        }
    }

    /// Table whose rows may be upserted
    pub const fn mutable(name: &'static str) -> Self {
        Self {
            name,
            append_only: false,
        }
    }

    /// Column family name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Rows are immutable once written
    pub fn is_append_only(&self) -> bool {
        self.append_only
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Ledger tables
pub mod tables {
    use super::Table;

    /// Wallet rows
    pub const WALLETS: Table = Table::mutable("wallets");
    /// user_id -> wallet_id
    pub const WALLETS_BY_USER: Table = Table::append_only("wallets_by_user");
    /// wallet_id || sequence -> LedgerEntry
    pub const WALLET_ENTRIES: Table = Table::append_only("wallet_entries");
    /// entry_id -> (wallet_id, sequence)
    pub const ENTRY_INDEX: Table = Table::append_only("entry_index");
    /// transaction_id -> entry_id
    pub const TRANSACTION_INDEX: Table = Table::append_only("transaction_index");
    /// reference || entry_id -> ()
    pub const ENTRIES_BY_REFERENCE: Table = Table::append_only("entries_by_reference");
    /// entry_id -> EntryReversal
    pub const ENTRY_REVERSALS: Table = Table::append_only("entry_reversals");
    /// entry_id -> archived flag
    pub const ARCHIVE_FLAGS: Table = Table::mutable("archive_flags");
    /// lock_id -> FundLock
    pub const FUND_LOCKS: Table = Table::mutable("fund_locks");
    /// wallet_id || lock_id -> ()
    pub const FUND_LOCKS_BY_WALLET: Table = Table::append_only("fund_locks_by_wallet");
    /// pair_id || leg -> AdminLedgerEntry
    pub const POSTINGS: Table = Table::append_only("postings");
    /// reference || pair_id -> ()
    pub const POSTINGS_BY_REFERENCE: Table = Table::append_only("postings_by_reference");
    /// pair_id -> reversing pair_id
    pub const POSTING_REVERSALS: Table = Table::append_only("posting_reversals");

    /// Every table owned by the ledger
    pub const LEDGER_TABLES: &[Table] = &[
        WALLETS,
        WALLETS_BY_USER,
        WALLET_ENTRIES,
        ENTRY_INDEX,
        TRANSACTION_INDEX,
        ENTRIES_BY_REFERENCE,
        ENTRY_REVERSALS,
        ARCHIVE_FLAGS,
        FUND_LOCKS,
        FUND_LOCKS_BY_WALLET,
        POSTINGS,
        POSTINGS_BY_REFERENCE,
        POSTING_REVERSALS,
    ];
}

/// Concatenate key parts
pub fn compose_key(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

/// Hex rendering for log and error messages
pub fn hex_key(key: &[u8]) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug)]
enum WriteOp {
    Insert {
        table: Table,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Upsert {
        table: Table,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

/// Rows staged for one atomic commit
#[derive(Debug, Default)]
pub struct WriteSet {
    ops: Vec<WriteOp>,
}

impl WriteSet {
    /// Empty write set
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a new row; commit fails if the key already exists
    pub fn insert<T: Serialize + ?Sized>(
        &mut self,
        table: Table,
        key: impl AsRef<[u8]>,
        value: &T,
    ) -> Result<()> {
        self.ops.push(WriteOp::Insert {
            table,
            key: key.as_ref().to_vec(),
            value: bincode::serialize(value)?,
        });
        Ok(())
    }

    /// Stage an overwrite of a mutable row
    pub fn upsert<T: Serialize + ?Sized>(
        &mut self,
        table: Table,
        key: impl AsRef<[u8]>,
        value: &T,
    ) -> Result<()> {
        if table.is_append_only() {
            return Err(Error::ImmutabilityViolation(format!(
                "update of append-only table {} rejected (key {})",
                table,
                hex_key(key.as_ref())
            )));
        }

        self.ops.push(WriteOp::Upsert {
            table,
            key: key.as_ref().to_vec(),
            value: bincode::serialize(value)?,
        });
        Ok(())
    }

    /// Move all staged rows of `other` into this set
    pub fn append(&mut self, other: WriteSet) {
        self.ops.extend(other.ops);
    }

    /// Number of staged rows
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Nothing staged
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    tables: HashMap<&'static str, Table>,
    write_opts: WriteOptions,
    // Serializes the exists-check of append-only inserts with the batch write
    commit_lock: Mutex<()>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("tables", &self.tables.len())
            .finish()
    }
}

impl Storage {
    /// Open or create database with the ledger tables plus `extra_tables`
    pub fn open(config: &Config, extra_tables: &[Table]) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let mut tables = HashMap::new();
        for table in tables::LEDGER_TABLES.iter().chain(extra_tables) {
            if let Some(existing) = tables.insert(table.name(), *table) {
                if existing != *table {
                    return Err(Error::Config(format!(
                        "table {} declared twice with different mutability",
                        table
                    )));
                }
            }
        }

        let cf_descriptors = tables
            .keys()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(config.rocksdb.sync_writes);

        tracing::info!(
            path = ?path,
            column_families = tables.len(),
            "Opened RocksDB"
        );

        Ok(Self {
            db,
            tables,
            write_opts,
            commit_lock: Mutex::new(()),
        })
    }

    fn cf_options() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_handle(&self, table: Table) -> Result<&ColumnFamily> {
        if !self.tables.contains_key(table.name()) {
            return Err(Error::Storage(format!("Table {} not registered", table)));
        }
        self.db
            .cf_handle(table.name())
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", table)))
    }

    /// Commit a write set atomically
    ///
    /// Any insert whose key already exists (on disk or earlier in the same
    /// set) aborts the whole batch with `ImmutabilityViolation`.
    pub fn commit(&self, writes: WriteSet) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let _guard = self.commit_lock.lock();
        let mut batch = WriteBatch::default();
        let mut staged: HashSet<(&'static str, Vec<u8>)> = HashSet::new();

        for op in writes.ops {
            match op {
                WriteOp::Insert { table, key, value } => {
                    let cf = self.cf_handle(table)?;
                    let duplicate_in_batch = !staged.insert((table.name(), key.clone()));
                    if duplicate_in_batch || self.db.get_pinned_cf(cf, &key)?.is_some() {
                        tracing::error!(
                            table = table.name(),
                            key = %hex_key(&key),
                            "Rejected overwrite of recorded row"
                        );
                        return Err(Error::ImmutabilityViolation(format!(
                            "{} key {} already recorded",
                            table,
                            hex_key(&key)
                        )));
                    }
                    batch.put_cf(cf, &key, &value);
                }
                WriteOp::Upsert { table, key, value } => {
                    if table.is_append_only() {
                        return Err(Error::ImmutabilityViolation(format!(
                            "update of append-only table {} rejected",
                            table
                        )));
                    }
                    let cf = self.cf_handle(table)?;
                    staged.insert((table.name(), key.clone()));
                    batch.put_cf(cf, &key, &value);
                }
            }
        }

        self.db.write_opt(batch, &self.write_opts)?;
        Ok(())
    }

    /// Get a row
    pub fn get<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(table)?;
        match self.db.get_pinned_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Whether a row exists
    pub fn contains(&self, table: Table, key: &[u8]) -> Result<bool> {
        let cf = self.cf_handle(table)?;
        Ok(self.db.get_pinned_cf(cf, key)?.is_some())
    }

    /// All rows whose key starts with `prefix`, in key order
    pub fn scan_prefix<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, T)>> {
        self.scan_prefix_from(table, prefix, prefix, usize::MAX)
    }

    /// Up to `limit` rows with `prefix`, starting at key `start` (inclusive)
    pub fn scan_prefix_from<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &[u8],
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, T)>> {
        let cf = self.cf_handle(table)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start, ScanDirection::Forward));

        let mut rows = Vec::new();
        for item in iter {
            if rows.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), bincode::deserialize(&value)?));
        }

        Ok(rows)
    }

    /// Every row of a table, in key order
    pub fn scan_all<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<(Vec<u8>, T)>> {
        let cf = self.cf_handle(table)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            rows.push((key.to_vec(), bincode::deserialize(&value)?));
        }
        Ok(rows)
    }

    /// Approximate row count of a table
    pub fn approximate_count(&self, table: Table) -> Result<u64> {
        let cf = self.cf_handle(table)?;
        Ok(self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0))
    }

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_wallets: self.approximate_count(tables::WALLETS)?,
            total_entries: self.approximate_count(tables::WALLET_ENTRIES)?,
            total_postings: self.approximate_count(tables::POSTINGS)?,
        })
    }

    /// Flush memtables (graceful shutdown)
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        tracing::info!("RocksDB flushed");
        Ok(())
    }
}

/// Storage statistics (approximate)
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Wallet rows
    pub total_wallets: u64,
    /// Wallet ledger entries
    pub total_entries: u64,
    /// Double-entry rows
    pub total_postings: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EXTRA: Table = Table::mutable("scratch");

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (Storage::open(&config, &[EXTRA]).unwrap(), temp_dir)
    }

    #[test]
    fn test_insert_and_get() {
        let (storage, _temp) = test_storage();

        let mut writes = WriteSet::new();
        writes
            .insert(tables::WALLET_ENTRIES, b"k1", &42u64)
            .unwrap();
        storage.commit(writes).unwrap();

        let value: Option<u64> = storage.get(tables::WALLET_ENTRIES, b"k1").unwrap();
        assert_eq!(value, Some(42));
        assert!(storage.contains(tables::WALLET_ENTRIES, b"k1").unwrap());
    }

    #[test]
    fn test_append_only_rejects_upsert() {
        let mut writes = WriteSet::new();
        let result = writes.upsert(tables::WALLET_ENTRIES, b"k1", &1u64);
        assert!(matches!(result, Err(Error::ImmutabilityViolation(_))));
        assert!(writes.is_empty());
    }

    #[test]
    fn test_append_only_rejects_second_insert() {
        let (storage, _temp) = test_storage();

        let mut first = WriteSet::new();
        first.insert(tables::POSTINGS, b"pair", &1u64).unwrap();
        storage.commit(first).unwrap();

        let mut second = WriteSet::new();
        second.insert(tables::POSTINGS, b"pair", &2u64).unwrap();
        second.upsert(EXTRA, b"other", &7u64).unwrap();
        let result = storage.commit(second);
        assert!(matches!(result, Err(Error::ImmutabilityViolation(_))));

        // Nothing from the rejected batch landed
        let value: Option<u64> = storage.get(tables::POSTINGS, b"pair").unwrap();
        assert_eq!(value, Some(1));
        assert!(!storage.contains(EXTRA, b"other").unwrap());
    }

    #[test]
    fn test_duplicate_insert_within_batch_rejected() {
        let (storage, _temp) = test_storage();

        let mut writes = WriteSet::new();
        writes.insert(tables::POSTINGS, b"same", &1u64).unwrap();
        writes.insert(tables::POSTINGS, b"same", &2u64).unwrap();
        assert!(matches!(
            storage.commit(writes),
            Err(Error::ImmutabilityViolation(_))
        ));
    }

    #[test]
    fn test_mutable_upsert_overwrites() {
        let (storage, _temp) = test_storage();

        for value in [1u64, 2, 3] {
            let mut writes = WriteSet::new();
            writes.upsert(EXTRA, b"row", &value).unwrap();
            storage.commit(writes).unwrap();
        }

        let value: Option<u64> = storage.get(EXTRA, b"row").unwrap();
        assert_eq!(value, Some(3));
    }

    #[test]
    fn test_scan_prefix_stops_at_prefix_boundary() {
        let (storage, _temp) = test_storage();

        let mut writes = WriteSet::new();
        writes.insert(tables::ENTRIES_BY_REFERENCE, b"a1", &()).unwrap();
        writes.insert(tables::ENTRIES_BY_REFERENCE, b"a2", &()).unwrap();
        writes.insert(tables::ENTRIES_BY_REFERENCE, b"b1", &()).unwrap();
        storage.commit(writes).unwrap();

        let rows: Vec<(Vec<u8>, ())> = storage
            .scan_prefix(tables::ENTRIES_BY_REFERENCE, b"a")
            .unwrap();
        assert_eq!(rows.len(), 2);

        let page: Vec<(Vec<u8>, ())> = storage
            .scan_prefix_from(tables::ENTRIES_BY_REFERENCE, b"a", b"a2", 10)
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].0, b"a2".to_vec());
    }

    #[test]
    fn test_unregistered_table_rejected() {
        let (storage, _temp) = test_storage();
        let unknown = Table::mutable("unknown");
        let result: Result<Option<u64>> = storage.get(unknown, b"k");
        assert!(result.is_err());
    }
}
