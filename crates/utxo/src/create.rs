//! Batched transaction creation.
//!
//! `create` queues a `BatchStoreItem`; a collector task coalesces items by
//! count or latency and hands each batch to a bounded pool of writers. A
//! batch issues one create-only multi-key write with independent per-item
//! outcomes. Items that need more than one record, or whose payload is too
//! big for a record, leave the batch and take the external path: payload to
//! the blob store, records written extensions-first so an interrupted
//! attempt can always be finished off by a retry.

use std::sync::Arc;
use std::time::Duration;

use bsvd_consensus::Hash256;
use bsvd_primitives::encoding::{encode, Encoder};
use bsvd_primitives::transaction::Transaction;
use bsvd_storage::{Column, KeyValueStore, StoreError, WriteKey, WriteValue};
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::errors::UtxoStoreError;
use crate::events::UtxoEvent;
use crate::meta::{self, TxMeta};
use crate::record::{
    dah_index_key, encode_dah_index_value, record_count, record_key, OutputSet, TxRecord, UtxoSlot,
};
use crate::store::{now_ms, StoreInner, UtxoStore};

const TAKEOVER_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MinedBlockInfo {
    pub block_id: u32,
    pub block_height: u32,
    pub subtree_idx: u32,
}

#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    /// Overrides the transaction id instead of hashing the body.
    pub tx_id: Option<Hash256>,
    /// Overrides coinbase detection.
    pub is_coinbase: Option<bool>,
    /// Block inclusions already known at creation time.
    pub mined_block_infos: Vec<MinedBlockInfo>,
    pub conflicting: bool,
    pub locked: bool,
}

pub(crate) struct BatchStoreItem {
    pub(crate) tx: Arc<Transaction>,
    pub(crate) tx_hash: Hash256,
    pub(crate) is_coinbase: bool,
    pub(crate) block_height: u32,
    pub(crate) block_ids: Vec<u32>,
    pub(crate) block_heights: Vec<u32>,
    pub(crate) subtree_idxs: Vec<u32>,
    pub(crate) conflicting: bool,
    pub(crate) locked: bool,
    pub(crate) done: oneshot::Sender<Result<(), UtxoStoreError>>,
}

impl<S: KeyValueStore + 'static> UtxoStore<S> {
    /// Stores a transaction's outputs as spendable UTXOs.
    ///
    /// Returns the derived metadata on success. `TxExists` means another
    /// creator won; the caller re-reads for the winning state.
    pub async fn create(
        &self,
        tx: &Transaction,
        block_height: u32,
        options: CreateOptions,
    ) -> Result<TxMeta, UtxoStoreError> {
        if tx.vout.is_empty() {
            return Err(UtxoStoreError::InvalidArgument("transaction has no outputs"));
        }

        let tx_hash = options.tx_id.unwrap_or_else(|| tx.txid());
        let is_coinbase = options.is_coinbase.unwrap_or_else(|| tx.is_coinbase());
        let fee = meta::compute_fee(tx)?;
        let utxo_hashes =
            meta::compute_utxo_hashes(tx, &tx_hash, is_coinbase, block_height, &self.inner.params);
        let total_utxos = utxo_hashes.iter().filter(|hash| hash.is_some()).count() as u32;

        // Parents must carry the conflicting child before the child record
        // becomes readable, so a reader that sees the child conflicting can
        // always reach the annotated parent.
        if options.conflicting {
            self.inner
                .update_parent_conflicting_children(tx, &tx_hash)
                .await?;
        }

        let tx_meta = TxMeta {
            tx_id: tx_hash,
            fee,
            size_bytes: if tx.vin.is_empty() { 0 } else { tx.size() as u64 },
            extended_size_bytes: payload_size(tx) as u64,
            lock_time: tx.lock_time,
            is_coinbase,
            total_utxos,
            utxo_hashes,
            conflicting: options.conflicting,
            locked: options.locked,
        };

        let mut block_ids = Vec::with_capacity(options.mined_block_infos.len());
        let mut block_heights = Vec::with_capacity(options.mined_block_infos.len());
        let mut subtree_idxs = Vec::with_capacity(options.mined_block_infos.len());
        for info in &options.mined_block_infos {
            block_ids.push(info.block_id);
            block_heights.push(info.block_height);
            subtree_idxs.push(info.subtree_idx);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let item = BatchStoreItem {
            tx: Arc::new(tx.clone()),
            tx_hash,
            is_coinbase,
            block_height,
            block_ids,
            block_heights,
            subtree_idxs,
            conflicting: options.conflicting,
            locked: options.locked,
            done: done_tx,
        };

        let Some(sender) = self.batch_sender() else {
            return Err(UtxoStoreError::Cancelled);
        };
        if sender.send(item).await.is_err() {
            return Err(UtxoStoreError::Cancelled);
        }
        match done_rx.await {
            Ok(Ok(())) => {
                self.inner.metrics.record_create();
                Ok(tx_meta)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(UtxoStoreError::Cancelled),
        }
    }
}

impl<S: KeyValueStore + 'static> UtxoStore<S> {
    /// Completes a partial transaction once its inputs are learned: the full
    /// extended payload supersedes the output set in the blob store, and the
    /// record picks up the real fee and sizes. Both blob variants may
    /// coexist briefly; the output set is retired last.
    pub async fn attach_inputs(&self, tx: &Transaction) -> Result<(), UtxoStoreError> {
        if tx.vin.is_empty() {
            return Err(UtxoStoreError::InvalidArgument("transaction has no inputs"));
        }
        let tx_hash = tx.txid();
        let primary = self
            .inner
            .read_record(&tx_hash)?
            .ok_or(UtxoStoreError::TxNotFound(tx_hash))?;
        let fee = meta::compute_fee(tx)?;

        if primary.external {
            match self
                .inner
                .blob
                .put(&tx_hash, bsvd_blob::FileType::Tx, &tx.extended_encode())
            {
                Ok(()) | Err(bsvd_blob::BlobError::AlreadyExists) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let inputs: Option<Vec<Vec<u8>>> = if primary.external {
            None
        } else {
            Some(
                tx.vin
                    .iter()
                    .map(|input| {
                        let mut encoder = Encoder::new();
                        input.encode_extended(&mut encoder);
                        encoder.into_inner()
                    })
                    .collect(),
            )
        };
        let size = tx.size() as u64;
        let extended_size = tx.extended_size() as u64;
        self.inner
            .update_record(&tx_hash, |record| {
                record.fee = fee;
                record.size_bytes = size;
                record.extended_size_bytes = extended_size;
                if let Some(inputs) = &inputs {
                    record.inputs = Some(inputs.clone());
                }
                Ok(())
            })
            .await?;

        if primary.external {
            if let Err(err) = self
                .inner
                .blob
                .delete(&tx_hash, bsvd_blob::FileType::Outputs)
            {
                bsvd_log::log_warn!(
                    "failed to retire output set for {}: {err}",
                    bsvd_primitives::hash256_to_hex(&tx_hash)
                );
            }
        }
        Ok(())
    }
}

/// Extended payload size driving the external-offload decision: for partial
/// transactions only the outputs count, otherwise the full extended bytes.
fn payload_size(tx: &Transaction) -> usize {
    if tx.vin.is_empty() {
        tx.vout.iter().map(|output| output.serialized_len()).sum()
    } else {
        tx.extended_size()
    }
}

pub(crate) async fn run_collector<S: KeyValueStore + 'static>(
    inner: Arc<StoreInner<S>>,
    mut rx: mpsc::Receiver<BatchStoreItem>,
) {
    let workers = Arc::new(Semaphore::new(inner.config.effective_worker_count()));
    let max_items = inner.config.utxo_batch_write_size.max(1);
    let window = inner.config.batch_coalesce_window;

    loop {
        let Some(first) = rx.recv().await else {
            break;
        };
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + window;
        let mut closed = false;
        while batch.len() < max_items {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) => {
                    closed = true;
                    break;
                }
                // Coalescing window expired; flush what we have.
                Err(_) => break,
            }
        }

        let permit = match Arc::clone(&workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            send_store_batch(&inner, batch).await;
            drop(permit);
        });

        if closed {
            break;
        }
    }
}

async fn send_store_batch<S: KeyValueStore + 'static>(
    inner: &Arc<StoreInner<S>>,
    batch: Vec<BatchStoreItem>,
) {
    inner.metrics.record_batch(batch.len());
    if inner.config.verbose_debug {
        bsvd_log::log_debug!("sending create batch of {} items", batch.len());
    }

    let mut writes: Vec<(WriteKey, WriteValue)> = Vec::new();
    let mut write_items: Vec<(BatchStoreItem, TxRecord)> = Vec::new();

    for item in batch {
        let records = match build_records(inner, &item, false) {
            Ok(records) => records,
            Err(err) => {
                let _ = item.done.send(Err(err));
                continue;
            }
        };

        if records.len() > 1 {
            // Multi-record transactions bypass the batch entirely.
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                store_externally(&inner, item, records).await;
            });
            continue;
        }

        let primary = match records.into_iter().next() {
            Some(record) => record,
            None => {
                let _ = item
                    .done
                    .send(Err(UtxoStoreError::Processing("no records built")));
                continue;
            }
        };

        if primary.external {
            if let Err(err) = write_payload_blob(inner, &item).await {
                let _ = item.done.send(Err(err));
                continue;
            }
        }

        writes.push((
            WriteKey::from(item.tx_hash),
            WriteValue::from(primary.encode()),
        ));
        write_items.push((item, primary));
    }

    if writes.is_empty() {
        return;
    }

    let results = match inner
        .retry_store(|| inner.store.put_create_many(Column::TxMeta, &writes))
        .await
    {
        Ok(results) => results,
        Err(err) => {
            let message = err.to_string();
            bsvd_log::log_error!("create batch write failed: {message}");
            for (item, _) in write_items {
                let _ = item
                    .done
                    .send(Err(UtxoStoreError::Storage(StoreError::Backend(
                        message.clone(),
                    ))));
            }
            return;
        }
    };

    for ((item, record), result) in write_items.into_iter().zip(results) {
        match result {
            Ok(()) => {
                finish_create(inner, &record);
                let _ = item.done.send(Ok(()));
            }
            Err(StoreError::KeyExists) => {
                inner.metrics.record_tx_exists();
                let _ = item.done.send(Err(UtxoStoreError::TxExists(item.tx_hash)));
            }
            Err(StoreError::RecordTooBig) => {
                // Too big for one record after all; promote to the external
                // path and retry outside the batch.
                inner.metrics.record_too_big_promotion();
                match build_records(inner, &item, true) {
                    Ok(records) => {
                        let inner = Arc::clone(inner);
                        tokio::spawn(async move {
                            store_externally(&inner, item, records).await;
                        });
                    }
                    Err(err) => {
                        let _ = item.done.send(Err(err));
                    }
                }
            }
            Err(err) => {
                let _ = item.done.send(Err(UtxoStoreError::Storage(err)));
            }
        }
    }
}

/// Post-commit bookkeeping shared by the batch and external paths.
fn finish_create<S: KeyValueStore>(inner: &StoreInner<S>, primary: &TxRecord) {
    if let Some(dah) = primary.delete_at_height {
        let key = dah_index_key(dah, &primary.tx_id);
        let value = encode_dah_index_value(primary.total_extra_recs, primary.external);
        if let Err(err) = inner.store.put(Column::DeleteAtHeight, &key, &value) {
            bsvd_log::log_warn!("failed to index delete-at-height {dah}: {err}");
        } else {
            inner.metrics.record_dah_assigned();
        }
    }
    inner.events.emit(UtxoEvent::Created {
        tx: primary.tx_id,
    });
}

/// Builds the record set for a transaction: one primary, plus an extension
/// per further `utxo_batch_size` outputs. Identity fields are duplicated on
/// every record; payload and block inclusions stay on the primary.
fn build_records<S: KeyValueStore>(
    inner: &StoreInner<S>,
    item: &BatchStoreItem,
    force_external: bool,
) -> Result<Vec<TxRecord>, UtxoStoreError> {
    let tx = item.tx.as_ref();
    if tx.vout.is_empty() {
        return Err(UtxoStoreError::InvalidArgument("transaction has no outputs"));
    }

    let fee = meta::compute_fee(tx)?;
    let utxo_hashes = meta::compute_utxo_hashes(
        tx,
        &item.tx_hash,
        item.is_coinbase,
        item.block_height,
        &inner.params,
    );
    let slots: Vec<UtxoSlot> = utxo_hashes
        .iter()
        .map(|hash| match hash {
            Some(hash) => UtxoSlot::Unspent(*hash),
            None => UtxoSlot::Unspendable,
        })
        .collect();
    let total_utxos = slots
        .iter()
        .filter(|slot| matches!(slot, UtxoSlot::Unspent(_)))
        .count() as u32;

    let batch_size = inner.config.utxo_batch_size.max(1);
    let shard_count = record_count(slots.len(), batch_size);
    let payload = payload_size(tx);
    let external = force_external
        || inner.config.externalize_all_transactions
        || payload > inner.config.max_tx_in_record_bytes
        || shard_count > 1;

    let inputs = if external {
        None
    } else {
        Some(
            tx.vin
                .iter()
                .map(|input| {
                    let mut encoder = Encoder::new();
                    input.encode_extended(&mut encoder);
                    encoder.into_inner()
                })
                .collect(),
        )
    };
    let outputs = if external {
        None
    } else {
        Some(tx.vout.iter().map(encode).collect())
    };

    let spending_height = if item.is_coinbase {
        item.block_height + inner.coinbase_maturity()
    } else {
        0
    };
    let unmined_since = if item.block_ids.is_empty() && item.block_heights.is_empty() {
        Some(item.block_height)
    } else {
        None
    };
    let delete_at_height = if item.conflicting {
        Some(item.block_height + inner.config.dah_retention_window)
    } else {
        None
    };
    let created_at_ms = now_ms();

    let mut records = Vec::with_capacity(shard_count as usize);
    for (shard_index, chunk) in slots.chunks(batch_size).enumerate() {
        let is_primary = shard_index == 0;
        let record_utxos = chunk
            .iter()
            .filter(|slot| matches!(slot, UtxoSlot::Unspent(_)))
            .count() as u32;
        records.push(TxRecord {
            tx_id: item.tx_hash,
            version: tx.version,
            lock_time: tx.lock_time,
            fee,
            size_bytes: if tx.vin.is_empty() { 0 } else { tx.size() as u64 },
            extended_size_bytes: payload as u64,
            is_coinbase: item.is_coinbase,
            spending_height,
            conflicting: item.conflicting,
            locked: item.locked,
            // Extensions stay guarded until the primary record commits.
            creating: !is_primary,
            external,
            created_at_ms,
            record_utxos,
            spent_utxos: 0,
            total_utxos,
            total_extra_recs: if is_primary { shard_count - 1 } else { 0 },
            utxos: chunk.to_vec(),
            block_ids: if is_primary {
                item.block_ids.clone()
            } else {
                Vec::new()
            },
            block_heights: if is_primary {
                item.block_heights.clone()
            } else {
                Vec::new()
            },
            subtree_idxs: if is_primary {
                item.subtree_idxs.clone()
            } else {
                Vec::new()
            },
            unmined_since: if is_primary { unmined_since } else { None },
            conflicting_children: Vec::new(),
            delete_at_height: if is_primary { delete_at_height } else { None },
            frozen_utxos: Vec::new(),
            reassignments: 0,
            inputs: if is_primary { inputs.clone() } else { None },
            outputs: if is_primary { outputs.clone() } else { None },
        });
    }
    Ok(records)
}

/// Blob write preceding any external record: full extended transaction, or
/// the output set for a partial transaction. `AlreadyExists` is success.
async fn write_payload_blob<S: KeyValueStore>(
    inner: &StoreInner<S>,
    item: &BatchStoreItem,
) -> Result<(), UtxoStoreError> {
    let tx = item.tx.as_ref();
    let result = if tx.vin.is_empty() {
        let set = OutputSet {
            tx_id: item.tx_hash,
            block_height: item.block_height,
            is_coinbase: item.is_coinbase,
            outputs: tx
                .vout
                .iter()
                .enumerate()
                .map(|(index, output)| (index as u32, output.clone()))
                .collect(),
        };
        inner
            .blob
            .put(&item.tx_hash, bsvd_blob::FileType::Outputs, &set.encode())
    } else {
        inner
            .blob
            .put(&item.tx_hash, bsvd_blob::FileType::Tx, &tx.extended_encode())
    };
    match result {
        Ok(()) | Err(bsvd_blob::BlobError::AlreadyExists) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn store_externally<S: KeyValueStore + 'static>(
    inner: &Arc<StoreInner<S>>,
    item: BatchStoreItem,
    records: Vec<TxRecord>,
) {
    match store_externally_inner(inner, &item, records).await {
        Ok(()) => {
            inner.metrics.record_create_external();
            let _ = item.done.send(Ok(()));
        }
        Err(err) => {
            let _ = item.done.send(Err(err));
        }
    }
}

/// Writes a multi-record (or oversize single-record) transaction.
///
/// Records go in reverse order: extensions first with `creating` set, the
/// primary last. The primary's create-only write is the linearization
/// point. A crash between writes leaves only guarded extensions; a retry
/// observes `KeyExists` on them and finishes off the previous attempt.
async fn store_externally_inner<S: KeyValueStore + 'static>(
    inner: &Arc<StoreInner<S>>,
    item: &BatchStoreItem,
    records: Vec<TxRecord>,
) -> Result<(), UtxoStoreError> {
    if records.len() > 1 {
        wait_out_fresh_writer(inner, item, records.len() as u32 - 1).await?;
    }

    write_payload_blob(inner, item).await?;

    for record_index in (0..records.len()).rev() {
        let key = record_key(&item.tx_hash, record_index as u32);
        let bytes = records[record_index].encode();
        match inner
            .retry_store(|| inner.store.put_create(Column::TxMeta, &key, &bytes))
            .await
        {
            Ok(()) => {}
            Err(UtxoStoreError::Storage(StoreError::KeyExists)) => {
                if record_index == 0 {
                    // Another creator completed first.
                    inner.metrics.record_tx_exists();
                    return Err(UtxoStoreError::TxExists(item.tx_hash));
                }
                bsvd_log::log_debug!(
                    "record {record_index} already exists for {}; finishing previous attempt",
                    bsvd_primitives::hash256_to_hex(&item.tx_hash)
                );
            }
            Err(err) => return Err(err),
        }
    }

    // The transaction is live; lift the guard off the extensions.
    for record_index in 1..records.len() {
        clear_creating(inner, &record_key(&item.tx_hash, record_index as u32));
    }

    finish_create(inner, &records[0]);
    Ok(())
}

/// Takeover policy for interrupted multi-record writes: if another writer's
/// extensions are fresher than the grace period, poll briefly for its
/// primary record instead of duplicating its writes. Stale extensions are
/// taken over and completed.
async fn wait_out_fresh_writer<S: KeyValueStore + 'static>(
    inner: &Arc<StoreInner<S>>,
    item: &BatchStoreItem,
    last_extension: u32,
) -> Result<(), UtxoStoreError> {
    let extension = match inner.read_record(&record_key(&item.tx_hash, last_extension))? {
        Some(record) => record,
        None => return Ok(()),
    };
    if inner.read_record(&item.tx_hash)?.is_some() {
        inner.metrics.record_tx_exists();
        return Err(UtxoStoreError::TxExists(item.tx_hash));
    }

    let grace_ms = inner.config.creating_takeover_grace.as_millis() as u64;
    let age_ms = now_ms().saturating_sub(extension.created_at_ms);
    if age_ms >= grace_ms {
        bsvd_log::log_info!(
            "taking over interrupted multi-record write for {}",
            bsvd_primitives::hash256_to_hex(&item.tx_hash)
        );
        return Ok(());
    }

    let mut waited = Duration::ZERO;
    let budget = Duration::from_millis(grace_ms.saturating_sub(age_ms));
    while waited < budget {
        tokio::time::sleep(TAKEOVER_POLL_INTERVAL).await;
        waited += TAKEOVER_POLL_INTERVAL;
        if inner.read_record(&item.tx_hash)?.is_some() {
            inner.metrics.record_tx_exists();
            return Err(UtxoStoreError::TxExists(item.tx_hash));
        }
    }
    bsvd_log::log_info!(
        "grace period elapsed; taking over multi-record write for {}",
        bsvd_primitives::hash256_to_hex(&item.tx_hash)
    );
    Ok(())
}

fn clear_creating<S: KeyValueStore>(inner: &StoreInner<S>, key: &Hash256) {
    let Ok(Some((bytes, mut record))) = inner.read_record_raw(key) else {
        return;
    };
    if !record.creating {
        return;
    }
    record.creating = false;
    let _ = inner
        .store
        .compare_and_swap(Column::TxMeta, key, Some(&bytes), Some(&record.encode()));
}
