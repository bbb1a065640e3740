use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bsvd_blob::{BlobStore, FileType};
use bsvd_consensus::{ChainParams, Hash256};
use bsvd_primitives::encoding::decode;
use bsvd_primitives::transaction::{Transaction, TxOut};
use bsvd_storage::{Column, KeyValueStore, StoreError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::cleanup::CleanerHandle;
use crate::config::UtxoStoreConfig;
use crate::create::{run_collector, BatchStoreItem};
use crate::errors::UtxoStoreError;
use crate::events::{EventBus, UtxoEvent};
use crate::metrics::{StoreMetrics, StoreMetricsSnapshot};
use crate::record::{OutputSet, TxRecord};

pub(crate) const BLOCK_HEIGHT_META_KEY: &[u8] = b"block_height";

pub(crate) struct StoreInner<S> {
    pub(crate) store: Arc<S>,
    pub(crate) blob: Arc<dyn BlobStore>,
    pub(crate) params: ChainParams,
    pub(crate) config: UtxoStoreConfig,
    pub(crate) block_height: AtomicU32,
    pub(crate) metrics: StoreMetrics,
    pub(crate) events: EventBus,
}

impl<S: KeyValueStore> StoreInner<S> {
    pub(crate) fn coinbase_maturity(&self) -> u32 {
        self.config
            .coinbase_maturity
            .unwrap_or(self.params.coinbase_maturity)
    }

    pub(crate) fn current_height(&self) -> u32 {
        self.block_height.load(Ordering::Acquire)
    }

    pub(crate) fn read_record(&self, key: &Hash256) -> Result<Option<TxRecord>, UtxoStoreError> {
        Ok(self.read_record_raw(key)?.map(|(_, record)| record))
    }

    /// Record plus its stored bytes, for compare-and-swap updates.
    pub(crate) fn read_record_raw(
        &self,
        key: &Hash256,
    ) -> Result<Option<(Vec<u8>, TxRecord)>, UtxoStoreError> {
        match self.store.get(Column::TxMeta, key)? {
            Some(bytes) => {
                let record = TxRecord::decode(&bytes)
                    .map_err(|_| UtxoStoreError::Processing("corrupt transaction record"))?;
                Ok(Some((bytes, record)))
            }
            None => Ok(None),
        }
    }

    /// Runs a storage operation, retrying transient backend failures with
    /// exponential backoff. Deterministic refusals (`KeyExists`,
    /// `RecordTooBig`) surface immediately.
    pub(crate) async fn retry_store<T, F>(&self, mut op: F) -> Result<T, UtxoStoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let mut backoff = self.config.store_retry_backoff;
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(StoreError::Backend(message)) => {
                    attempt += 1;
                    if attempt > self.config.store_retry_attempts {
                        return Err(UtxoStoreError::Storage(StoreError::Backend(message)));
                    }
                    bsvd_log::log_warn!(
                        "storage operation failed (attempt {attempt}): {message}; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Satoshis and locking script of output `index`, from the record
    /// payload or from the blob store for external records.
    pub(crate) fn lookup_output(
        &self,
        primary: &TxRecord,
        index: u32,
    ) -> Result<TxOut, UtxoStoreError> {
        let tx = primary.tx_id;
        if let Some(outputs) = &primary.outputs {
            let bytes = outputs
                .get(index as usize)
                .ok_or(UtxoStoreError::UtxoNotFound { tx, index })?;
            return decode::<TxOut>(bytes)
                .map_err(|_| UtxoStoreError::Processing("corrupt stored output"));
        }
        if let Some(bytes) = self.blob.get(&tx, FileType::Tx)? {
            let full = Transaction::extended_decode(&bytes)
                .map_err(|_| UtxoStoreError::Processing("corrupt external transaction"))?;
            return full
                .vout
                .get(index as usize)
                .cloned()
                .ok_or(UtxoStoreError::UtxoNotFound { tx, index });
        }
        if let Some(bytes) = self.blob.get(&tx, FileType::Outputs)? {
            let set = OutputSet::decode(&bytes)
                .map_err(|_| UtxoStoreError::Processing("corrupt external output set"))?;
            return set
                .output_at(index)
                .cloned()
                .ok_or(UtxoStoreError::UtxoNotFound { tx, index });
        }
        Err(UtxoStoreError::Processing("missing external payload"))
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// The UTXO store: durable transaction records over a key-value backend,
/// with batched creation, atomic spends, and lifecycle management.
pub struct UtxoStore<S> {
    pub(crate) inner: Arc<StoreInner<S>>,
    batch_tx: Mutex<Option<mpsc::Sender<BatchStoreItem>>>,
    collector: Mutex<Option<JoinHandle<()>>>,
    cleaner: Mutex<Option<CleanerHandle>>,
}

impl<S: KeyValueStore + 'static> UtxoStore<S> {
    pub fn new(
        store: Arc<S>,
        blob: Arc<dyn BlobStore>,
        params: ChainParams,
        config: UtxoStoreConfig,
    ) -> Self {
        // Resume the height last pushed by the blockchain collaborator so
        // maturity checks hold across restarts.
        let initial_height = store
            .get(Column::Meta, BLOCK_HEIGHT_META_KEY)
            .ok()
            .flatten()
            .and_then(|bytes| bytes.try_into().ok().map(u32::from_le_bytes))
            .unwrap_or(0);

        let inner = Arc::new(StoreInner {
            store,
            blob,
            params,
            block_height: AtomicU32::new(initial_height),
            metrics: StoreMetrics::default(),
            events: EventBus::new(config.event_capacity),
            config,
        });

        let (batch_tx, batch_rx) =
            mpsc::channel(inner.config.utxo_batch_write_size.max(1).saturating_mul(4));
        let collector = tokio::spawn(run_collector(Arc::clone(&inner), batch_rx));
        let cleaner = if inner.config.disable_dah_cleaner {
            None
        } else {
            Some(crate::cleanup::spawn_cleaner(Arc::clone(&inner)))
        };

        Self {
            inner,
            batch_tx: Mutex::new(Some(batch_tx)),
            collector: Mutex::new(Some(collector)),
            cleaner: Mutex::new(cleaner),
        }
    }

    pub(crate) fn batch_sender(&self) -> Option<mpsc::Sender<BatchStoreItem>> {
        self.batch_tx.lock().expect("batch sender lock").clone()
    }

    /// Pushed by the blockchain collaborator on every new tip.
    pub fn set_block_height(&self, height: u32) {
        self.inner.block_height.store(height, Ordering::Release);
        if let Err(err) = self.inner.store.put(
            Column::Meta,
            BLOCK_HEIGHT_META_KEY,
            &height.to_le_bytes(),
        ) {
            bsvd_log::log_warn!("failed to persist block height {height}: {err}");
        }
    }

    pub fn block_height(&self) -> u32 {
        self.inner.current_height()
    }

    /// Primary record of a transaction, if stored.
    pub fn get(&self, tx_hash: &Hash256) -> Result<Option<TxRecord>, UtxoStoreError> {
        self.inner.read_record(tx_hash)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UtxoEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Stops the background cleaner and the batch collector. Queued create
    /// items are drained and still get their replies; new `create` calls
    /// fail with `Cancelled`.
    pub async fn shutdown(&self) {
        let cleaner = self.cleaner.lock().expect("cleaner lock").take();
        if let Some(handle) = cleaner {
            handle.stop().await;
        }
        // Dropping the sender lets the collector drain and exit.
        self.batch_tx.lock().expect("batch sender lock").take();
        let collector = self.collector.lock().expect("collector lock").take();
        if let Some(handle) = collector {
            let _ = handle.await;
        }
    }
}
