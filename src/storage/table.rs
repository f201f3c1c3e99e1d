//! Chunked tables
//!
//! Each table is an array of opaque chunks addressed by slot index, with a
//! header recording the type tag, a SHA-224 hash per chunk (checked on
//! read), a free list of reusable slots and the table size. Mutations are
//! staged and become durable only on `commit`, which writes the chunks,
//! the headers and any metadata in one atomic batch.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// SHA-224 of a chunk
pub type ChunkHash = [u8; 28];

/// Tables kept by a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TableType {
    #[default]
    Null,
    /// Full name blocks, one per slot
    Blocks,
    /// Claim history, one name per slot
    NameRegistry,
}

impl TableType {
    fn tag(self) -> u8 {
        match self {
            TableType::Null => 0,
            TableType::Blocks => 1,
            TableType::NameRegistry => 2,
        }
    }
}

/// Per-table bookkeeping persisted with every batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableHeader {
    pub table_type: TableType,
    /// Hash of every chunk; zero for unused slots
    pub chunk_hashes: Vec<ChunkHash>,
    /// Slots that are unused
    pub free_list: Vec<u32>,
    /// Highest used slot + 1
    pub size: u32,
}

impl TableHeader {
    pub fn new(table_type: TableType) -> Self {
        Self {
            table_type,
            ..Self::default()
        }
    }

    fn is_live(&self, index: u32) -> bool {
        index < self.size && !self.free_list.contains(&index)
    }

    /// Slots currently holding data, ascending
    pub fn live_slots(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.size).filter(move |i| !self.free_list.contains(i))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("chunk {index} of table {table:?} failed hash verification")]
    CorruptChunk { table: TableType, index: u32 },
    #[error("chunk {index} of table {table:?} is not allocated")]
    MissingChunk { table: TableType, index: u32 },
    #[error("commit rejected: {0}")]
    CommitRejected(String),
}

/// Storage collaborator used by the chain state
pub trait TableStore: Send + Sync {
    /// Header of a table including staged changes
    fn header(&self, table: TableType) -> TableHeader;

    /// Read a chunk, verifying its hash
    fn get_chunk(&self, table: TableType, index: u32) -> Result<Vec<u8>, StorageError>;

    /// Reserve a slot, reusing the free list first
    fn alloc(&mut self, table: TableType) -> u32;

    fn put_chunk(&mut self, table: TableType, index: u32, bytes: Vec<u8>) -> Result<(), StorageError>;

    fn free(&mut self, table: TableType, index: u32) -> Result<(), StorageError>;

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn put_meta(&mut self, key: &str, value: Vec<u8>);

    /// Persist all staged changes atomically
    fn commit(&mut self) -> Result<(), StorageError>;

    /// Drop all staged changes
    fn discard(&mut self);
}

fn chunk_hash(bytes: &[u8]) -> ChunkHash {
    let digest = Sha224::digest(bytes);
    let mut out = [0u8; 28];
    out.copy_from_slice(digest.as_slice());
    out
}

/// Changes staged since the last commit
#[derive(Debug, Default)]
struct PendingBatch {
    headers: HashMap<TableType, TableHeader>,
    chunks: BTreeMap<(TableType, u32), Option<Vec<u8>>>,
    meta: BTreeMap<String, Vec<u8>>,
}

impl PendingBatch {
    fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.chunks.is_empty() && self.meta.is_empty()
    }

    fn header(&self, committed: &HashMap<TableType, TableHeader>, table: TableType) -> TableHeader {
        self.headers
            .get(&table)
            .or_else(|| committed.get(&table))
            .cloned()
            .unwrap_or_else(|| TableHeader::new(table))
    }

    fn header_mut(
        &mut self,
        committed: &HashMap<TableType, TableHeader>,
        table: TableType,
    ) -> &mut TableHeader {
        self.headers.entry(table).or_insert_with(|| {
            committed
                .get(&table)
                .cloned()
                .unwrap_or_else(|| TableHeader::new(table))
        })
    }

    fn alloc(&mut self, committed: &HashMap<TableType, TableHeader>, table: TableType) -> u32 {
        let header = self.header_mut(committed, table);
        if let Some(index) = header.free_list.pop() {
            return index;
        }
        let index = header.size;
        header.size += 1;
        header.chunk_hashes.push([0u8; 28]);
        index
    }

    fn put(
        &mut self,
        committed: &HashMap<TableType, TableHeader>,
        table: TableType,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError> {
        let header = self.header_mut(committed, table);
        if !header.is_live(index) {
            return Err(StorageError::MissingChunk { table, index });
        }
        header.chunk_hashes[index as usize] = chunk_hash(&bytes);
        self.chunks.insert((table, index), Some(bytes));
        Ok(())
    }

    fn free(
        &mut self,
        committed: &HashMap<TableType, TableHeader>,
        table: TableType,
        index: u32,
    ) -> Result<(), StorageError> {
        let header = self.header_mut(committed, table);
        if !header.is_live(index) {
            return Err(StorageError::MissingChunk { table, index });
        }
        header.free_list.push(index);
        header.chunk_hashes[index as usize] = [0u8; 28];
        self.chunks.insert((table, index), None);
        Ok(())
    }

    /// Staged chunk lookup: `Some(Ok)` staged bytes, `Some(Err)` staged free
    fn staged_chunk(&self, table: TableType, index: u32) -> Option<Result<Vec<u8>, StorageError>> {
        self.chunks.get(&(table, index)).map(|slot| {
            slot.clone()
                .ok_or(StorageError::MissingChunk { table, index })
        })
    }
}

fn verify_chunk(
    header: Option<&TableHeader>,
    table: TableType,
    index: u32,
    bytes: Vec<u8>,
) -> Result<Vec<u8>, StorageError> {
    let expected = header
        .filter(|h| h.is_live(index))
        .map(|h| h.chunk_hashes[index as usize])
        .ok_or(StorageError::MissingChunk { table, index })?;
    if chunk_hash(&bytes) != expected {
        return Err(StorageError::CorruptChunk { table, index });
    }
    Ok(bytes)
}

/// Limits how many more commits a [`MemoryTableStore`] accepts
#[derive(Debug, Clone)]
pub struct CommitBudget(Arc<AtomicI64>);

impl CommitBudget {
    /// Allow exactly `commits` more commits, then fail
    pub fn limit(&self, commits: u32) {
        self.0.store(i64::from(commits), Ordering::SeqCst);
    }

    pub fn unlimited(&self) {
        self.0.store(-1, Ordering::SeqCst);
    }

    fn consume(&self) -> bool {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            if current < 0 {
                return true;
            }
            if current == 0 {
                return false;
            }
            match self
                .0
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Volatile table store for tests and ephemeral nodes
#[derive(Debug)]
pub struct MemoryTableStore {
    headers: HashMap<TableType, TableHeader>,
    chunks: HashMap<(TableType, u32), Vec<u8>>,
    meta: HashMap<String, Vec<u8>>,
    pending: PendingBatch,
    budget: CommitBudget,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self {
            headers: HashMap::new(),
            chunks: HashMap::new(),
            meta: HashMap::new(),
            pending: PendingBatch::default(),
            budget: CommitBudget(Arc::new(AtomicI64::new(-1))),
        }
    }

    /// Handle for injecting commit failures
    pub fn commit_budget(&self) -> CommitBudget {
        self.budget.clone()
    }
}

impl Default for MemoryTableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStore for MemoryTableStore {
    fn header(&self, table: TableType) -> TableHeader {
        self.pending.header(&self.headers, table)
    }

    fn get_chunk(&self, table: TableType, index: u32) -> Result<Vec<u8>, StorageError> {
        if let Some(staged) = self.pending.staged_chunk(table, index) {
            return staged;
        }
        let bytes = self
            .chunks
            .get(&(table, index))
            .cloned()
            .ok_or(StorageError::MissingChunk { table, index })?;
        verify_chunk(self.headers.get(&table), table, index, bytes)
    }

    fn alloc(&mut self, table: TableType) -> u32 {
        self.pending.alloc(&self.headers, table)
    }

    fn put_chunk(&mut self, table: TableType, index: u32, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.pending.put(&self.headers, table, index, bytes)
    }

    fn free(&mut self, table: TableType, index: u32) -> Result<(), StorageError> {
        self.pending.free(&self.headers, table, index)
    }

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .pending
            .meta
            .get(key)
            .or_else(|| self.meta.get(key))
            .cloned())
    }

    fn put_meta(&mut self, key: &str, value: Vec<u8>) {
        self.pending.meta.insert(key.to_string(), value);
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if !self.budget.consume() {
            self.discard();
            return Err(StorageError::CommitRejected("commit budget exhausted".to_string()));
        }
        let batch = std::mem::take(&mut self.pending);
        for (key, slot) in batch.chunks {
            match slot {
                Some(bytes) => self.chunks.insert(key, bytes),
                None => self.chunks.remove(&key),
            };
        }
        self.headers.extend(batch.headers);
        self.meta.extend(batch.meta);
        Ok(())
    }

    fn discard(&mut self) {
        self.pending = PendingBatch::default();
    }
}

const HEADER_PREFIX: u8 = b'h';
const CHUNK_PREFIX: u8 = b'c';
const META_PREFIX: u8 = b'm';

fn header_key(table: TableType) -> [u8; 2] {
    [HEADER_PREFIX, table.tag()]
}

fn chunk_key(table: TableType, index: u32) -> [u8; 6] {
    let i = index.to_be_bytes();
    [CHUNK_PREFIX, table.tag(), i[0], i[1], i[2], i[3]]
}

fn meta_key(key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(META_PREFIX);
    out.extend_from_slice(key.as_bytes());
    out
}

/// Durable table store on a single sled tree
#[derive(Debug)]
pub struct SledTableStore {
    db: sled::Db,
    tree: sled::Tree,
    headers: HashMap<TableType, TableHeader>,
    pending: PendingBatch,
}

impl SledTableStore {
    /// Open or create the store under `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let tree = db.open_tree("tables")?;

        let mut headers = HashMap::new();
        for table in [TableType::Blocks, TableType::NameRegistry] {
            if let Some(bytes) = tree.get(header_key(table))? {
                let header: TableHeader = bincode::deserialize(&bytes)?;
                headers.insert(table, header);
            }
        }

        Ok(Self {
            db,
            tree,
            headers,
            pending: PendingBatch::default(),
        })
    }
}

impl SledTableStore {
    fn pending_batch(&self) -> Result<sled::Batch, StorageError> {
        let mut batch = sled::Batch::default();
        for ((table, index), slot) in &self.pending.chunks {
            match slot {
                Some(bytes) => batch.insert(&chunk_key(*table, *index)[..], bytes.as_slice()),
                None => batch.remove(&chunk_key(*table, *index)[..]),
            }
        }
        for (table, header) in &self.pending.headers {
            batch.insert(&header_key(*table)[..], bincode::serialize(header)?);
        }
        for (key, value) in &self.pending.meta {
            batch.insert(meta_key(key), value.as_slice());
        }
        Ok(batch)
    }
}

impl TableStore for SledTableStore {
    fn header(&self, table: TableType) -> TableHeader {
        self.pending.header(&self.headers, table)
    }

    fn get_chunk(&self, table: TableType, index: u32) -> Result<Vec<u8>, StorageError> {
        if let Some(staged) = self.pending.staged_chunk(table, index) {
            return staged;
        }
        let bytes = self
            .tree
            .get(chunk_key(table, index))?
            .ok_or(StorageError::MissingChunk { table, index })?;
        verify_chunk(self.headers.get(&table), table, index, bytes.to_vec())
    }

    fn alloc(&mut self, table: TableType) -> u32 {
        self.pending.alloc(&self.headers, table)
    }

    fn put_chunk(&mut self, table: TableType, index: u32, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.pending.put(&self.headers, table, index, bytes)
    }

    fn free(&mut self, table: TableType, index: u32) -> Result<(), StorageError> {
        self.pending.free(&self.headers, table, index)
    }

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(value) = self.pending.meta.get(key) {
            return Ok(Some(value.clone()));
        }
        Ok(self.tree.get(meta_key(key))?.map(|v| v.to_vec()))
    }

    fn put_meta(&mut self, key: &str, value: Vec<u8>) {
        self.pending.meta.insert(key.to_string(), value);
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let written = self
            .pending_batch()
            .and_then(|batch| Ok(self.tree.apply_batch(batch)?))
            .and_then(|_| Ok(self.db.flush().map(|_| ())?));
        if let Err(e) = written {
            self.discard();
            return Err(e);
        }

        let pending = std::mem::take(&mut self.pending);
        self.headers.extend(pending.headers);
        Ok(())
    }

    fn discard(&mut self) {
        self.pending = PendingBatch::default();
    }
}
