use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteKey, WriteOp, WriteValue};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
    max_value_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store rejecting values larger than `limit` with `RecordTooBig`,
    /// mimicking the per-record cap of a production backend.
    pub fn with_max_value_bytes(limit: usize) -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            max_value_bytes: Some(limit),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("memory store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_size(&self, value: &[u8]) -> Result<(), StoreError> {
        if let Some(limit) = self.max_value_bytes {
            if value.len() > limit {
                return Err(StoreError::RecordTooBig);
            }
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_size(value)?;
        let mut guard = self.inner.write().expect("memory store lock");
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn put_create(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        let entry = (column, key.to_vec());
        if guard.contains_key(&entry) {
            return Err(StoreError::KeyExists);
        }
        self.check_size(value)?;
        guard.insert(entry, value.to_vec());
        Ok(())
    }

    fn put_create_many(
        &self,
        column: Column,
        entries: &[(WriteKey, WriteValue)],
    ) -> Result<Vec<Result<(), StoreError>>, StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        let mut results = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let entry = (column, key.as_slice().to_vec());
            if guard.contains_key(&entry) {
                results.push(Err(StoreError::KeyExists));
                continue;
            }
            if let Err(err) = self.check_size(value.as_slice()) {
                results.push(Err(err));
                continue;
            }
            guard.insert(entry, value.as_slice().to_vec());
            results.push(Ok(()));
        }
        Ok(results)
    }

    fn compare_and_swap(
        &self,
        column: Column,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, StoreError> {
        if let Some(value) = new {
            self.check_size(value)?;
        }
        let mut guard = self.inner.write().expect("memory store lock");
        let entry = (column, key.to_vec());
        let current = guard.get(&entry).map(Vec::as_slice);
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                guard.insert(entry, value.to_vec());
            }
            None => {
                guard.remove(&entry);
            }
        }
        Ok(true)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        let mut results = Vec::new();
        for ((entry_column, key), value) in guard.iter() {
            if *entry_column == column && key.starts_with(prefix) {
                results.push((key.clone(), value.clone()));
            }
        }
        Ok(results)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}
