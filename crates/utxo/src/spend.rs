//! Atomic spend-side operations.
//!
//! Every mutation here is a read → validate → compare-and-swap loop against
//! a single record (the shard owning the targeted output), so concurrent
//! spenders of the same output resolve to exactly one winner; the loser sees
//! the slot already consumed and reports a double-spend.

use std::collections::BTreeMap;

use bsvd_consensus::Hash256;
use bsvd_primitives::encoding::encode;
use bsvd_primitives::outpoint::OutPoint;
use bsvd_primitives::transaction::TxOut;
use bsvd_storage::{Column, KeyValueStore, StoreError};

use crate::errors::UtxoStoreError;
use crate::events::UtxoEvent;
use crate::meta;
use crate::record::{record_key, shard_for_output, TxRecord, UtxoSlot};
use crate::store::{StoreInner, UtxoStore};

const CAS_MAX_ATTEMPTS: u32 = 10;

/// One input of a spending transaction: the consumed outpoint plus the
/// caller-computed canonical UTXO hash the store verifies before committing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpendRequest {
    pub outpoint: OutPoint,
    pub utxo_hash: Hash256,
}

/// A consumed previous output, returned to the validator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentOutput {
    pub outpoint: OutPoint,
    pub satoshis: u64,
    pub locking_script: Vec<u8>,
}

impl<S: KeyValueStore + 'static> UtxoStore<S> {
    /// Consumes the UTXOs referenced by `requests` on behalf of
    /// `spending_tx`. All-or-nothing from the caller's view: a mid-vector
    /// refusal rolls back the inputs already consumed by this call.
    pub async fn spend(
        &self,
        spending_tx: &Hash256,
        requests: &[SpendRequest],
    ) -> Result<Vec<SpentOutput>, UtxoStoreError> {
        if requests.is_empty() {
            return Err(UtxoStoreError::InvalidArgument("no inputs to spend"));
        }

        let mut spent = Vec::with_capacity(requests.len());
        for (position, request) in requests.iter().enumerate() {
            match self
                .inner
                .spend_single(&request.outpoint, &request.utxo_hash)
                .await
            {
                Ok(output) => spent.push(output),
                Err(err) => {
                    self.inner.metrics.record_spend_rejection();
                    bsvd_log::log_debug!(
                        "spend of {} input {position} refused: {err}",
                        bsvd_primitives::hash256_to_hex(spending_tx)
                    );
                    for rolled_back in &requests[..spent.len()] {
                        if let Err(undo_err) = self
                            .inner
                            .unspend_single(&rolled_back.outpoint, Some(rolled_back.utxo_hash))
                            .await
                        {
                            bsvd_log::log_warn!(
                                "failed to roll back spend of {}:{}: {undo_err}",
                                bsvd_primitives::hash256_to_hex(&rolled_back.outpoint.hash),
                                rolled_back.outpoint.index
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }

        self.inner.metrics.record_spends(spent.len());
        for (tx, indices) in group_by_tx(requests) {
            self.inner.events.emit(UtxoEvent::Spent { tx, indices });
            // Fully consumed transactions become candidates for expiry.
            if let Err(err) = self.inner.maybe_assign_dah(&tx).await {
                bsvd_log::log_warn!(
                    "delete-at-height check for {} failed: {err}",
                    bsvd_primitives::hash256_to_hex(&tx)
                );
            }
        }
        Ok(spent)
    }

    /// Reverses prior spends during a reorg. Refuses outputs that are not
    /// recorded as spent. Re-opened records lose their delete-at-height.
    pub async fn unspend(
        &self,
        tx_hash: &Hash256,
        indices: &[u32],
    ) -> Result<(), UtxoStoreError> {
        if indices.is_empty() {
            return Err(UtxoStoreError::InvalidArgument("no outputs to unspend"));
        }
        for &index in indices {
            self.inner
                .unspend_single(&OutPoint::new(*tx_hash, index), None)
                .await?;
        }
        self.inner.clear_dah(tx_hash).await?;
        self.inner.metrics.record_unspends(indices.len());
        self.inner.events.emit(UtxoEvent::Unspent {
            tx: *tx_hash,
            indices: indices.to_vec(),
        });
        Ok(())
    }

    /// Freezes outputs. A frozen output can be read but not spent.
    pub async fn freeze(&self, tx_hash: &Hash256, indices: &[u32]) -> Result<(), UtxoStoreError> {
        for &index in indices {
            self.inner
                .update_shard(tx_hash, index, |record, offset| {
                    match record.utxos[offset] {
                        UtxoSlot::Unspent(_) => {}
                        UtxoSlot::Spent => {
                            return Err(UtxoStoreError::UtxoAlreadySpent {
                                tx: *tx_hash,
                                index,
                            })
                        }
                        UtxoSlot::Unspendable => {
                            return Err(UtxoStoreError::UtxoNotFound {
                                tx: *tx_hash,
                                index,
                            })
                        }
                    }
                    if !record.frozen_utxos.contains(&index) {
                        record.frozen_utxos.push(index);
                    }
                    Ok(())
                })
                .await?;
        }
        self.inner.metrics.record_freezes(indices.len());
        self.inner.events.emit(UtxoEvent::Frozen {
            tx: *tx_hash,
            indices: indices.to_vec(),
        });
        Ok(())
    }

    pub async fn unfreeze(
        &self,
        tx_hash: &Hash256,
        indices: &[u32],
    ) -> Result<(), UtxoStoreError> {
        for &index in indices {
            self.inner
                .update_shard(tx_hash, index, |record, _offset| {
                    if !record.frozen_utxos.contains(&index) {
                        return Err(UtxoStoreError::InvalidArgument("output not frozen"));
                    }
                    record.frozen_utxos.retain(|frozen| *frozen != index);
                    Ok(())
                })
                .await?;
        }
        self.inner.metrics.record_unfreezes(indices.len());
        self.inner.events.emit(UtxoEvent::Unfrozen {
            tx: *tx_hash,
            indices: indices.to_vec(),
        });
        Ok(())
    }

    /// Rewrites one output's locking script, used by alert-system-driven
    /// confiscation. The output must be frozen first; afterwards it is
    /// spendable under the hash of the new script.
    pub async fn reassign(
        &self,
        tx_hash: &Hash256,
        index: u32,
        new_locking_script: Vec<u8>,
    ) -> Result<(), UtxoStoreError> {
        self.inner
            .reassign_output(tx_hash, index, new_locking_script)
            .await?;
        self.inner.metrics.record_reassignment();
        self.inner.events.emit(UtxoEvent::Reassigned {
            tx: *tx_hash,
            index,
        });
        Ok(())
    }

    /// Clears the locked flag on the primary and every extension record.
    pub async fn unlock(&self, tx_hash: &Hash256) -> Result<(), UtxoStoreError> {
        let primary = self
            .inner
            .read_record(tx_hash)?
            .ok_or(UtxoStoreError::TxNotFound(*tx_hash))?;
        for record_index in 0..=primary.total_extra_recs {
            let key = record_key(tx_hash, record_index);
            if self.inner.read_record(&key)?.is_none() {
                bsvd_log::log_warn!(
                    "record {record_index} missing while unlocking {}",
                    bsvd_primitives::hash256_to_hex(tx_hash)
                );
                continue;
            }
            self.inner
                .update_record(&key, |record| {
                    record.locked = false;
                    Ok(())
                })
                .await?;
        }
        self.inner.metrics.record_unlock();
        Ok(())
    }
}

fn group_by_tx(requests: &[SpendRequest]) -> BTreeMap<Hash256, Vec<u32>> {
    let mut grouped: BTreeMap<Hash256, Vec<u32>> = BTreeMap::new();
    for request in requests {
        grouped
            .entry(request.outpoint.hash)
            .or_default()
            .push(request.outpoint.index);
    }
    grouped
}

impl<S: KeyValueStore> StoreInner<S> {
    /// Generic single-record update loop: read, apply, compare-and-swap,
    /// retry on contention.
    pub(crate) async fn update_record<F, T>(
        &self,
        key: &Hash256,
        mut apply: F,
    ) -> Result<T, UtxoStoreError>
    where
        F: FnMut(&mut TxRecord) -> Result<T, UtxoStoreError>,
    {
        for _ in 0..CAS_MAX_ATTEMPTS {
            let Some((bytes, mut record)) = self.read_record_raw(key)? else {
                return Err(UtxoStoreError::TxNotFound(*key));
            };
            let value = apply(&mut record)?;
            let new_bytes = record.encode();
            let swapped = self
                .retry_store(|| {
                    self.store
                        .compare_and_swap(Column::TxMeta, key, Some(&bytes), Some(&new_bytes))
                })
                .await?;
            if swapped {
                return Ok(value);
            }
        }
        Err(UtxoStoreError::Storage(StoreError::Backend(
            "record update contention".to_string(),
        )))
    }

    /// Update loop targeting the shard that owns output `index`.
    pub(crate) async fn update_shard<F>(
        &self,
        tx_hash: &Hash256,
        index: u32,
        mut apply: F,
    ) -> Result<(), UtxoStoreError>
    where
        F: FnMut(&mut TxRecord, usize) -> Result<(), UtxoStoreError>,
    {
        let (record_index, offset) = shard_for_output(index, self.config.utxo_batch_size);
        let key = record_key(tx_hash, record_index);
        for _ in 0..CAS_MAX_ATTEMPTS {
            let Some((bytes, mut record)) = self.read_record_raw(&key)? else {
                return Err(UtxoStoreError::UtxoNotFound {
                    tx: *tx_hash,
                    index,
                });
            };
            if record.utxos.len() <= offset {
                return Err(UtxoStoreError::UtxoNotFound {
                    tx: *tx_hash,
                    index,
                });
            }
            apply(&mut record, offset)?;
            let new_bytes = record.encode();
            let swapped = self
                .retry_store(|| {
                    self.store
                        .compare_and_swap(Column::TxMeta, &key, Some(&bytes), Some(&new_bytes))
                })
                .await?;
            if swapped {
                return Ok(());
            }
        }
        Err(UtxoStoreError::Storage(StoreError::Backend(
            "record update contention".to_string(),
        )))
    }

    pub(crate) async fn spend_single(
        &self,
        outpoint: &OutPoint,
        expected: &Hash256,
    ) -> Result<SpentOutput, UtxoStoreError> {
        let tx = outpoint.hash;
        let index = outpoint.index;
        let (record_index, offset) = shard_for_output(index, self.config.utxo_batch_size);
        let key = record_key(&tx, record_index);
        let height = self.current_height();

        for _ in 0..CAS_MAX_ATTEMPTS {
            let Some((bytes, mut record)) = self.read_record_raw(&key)? else {
                return Err(UtxoStoreError::UtxoNotFound { tx, index });
            };

            if record.creating {
                // A guarded extension is only usable once its primary record
                // is settled; repair the stale flag in the same swap.
                if record_index == 0 {
                    return Err(UtxoStoreError::UtxoNotFound { tx, index });
                }
                match self.read_record(&tx)? {
                    Some(primary) if !primary.creating => record.creating = false,
                    _ => return Err(UtxoStoreError::UtxoNotFound { tx, index }),
                }
            }
            if record.locked {
                return Err(UtxoStoreError::TxLocked(tx));
            }
            if record.conflicting {
                return Err(UtxoStoreError::TxConflicting(tx));
            }
            if record.is_frozen(index) {
                return Err(UtxoStoreError::UtxoFrozen { tx, index });
            }
            if record.is_coinbase && height < record.spending_height {
                return Err(UtxoStoreError::CoinbaseImmature {
                    spendable_at: record.spending_height,
                    height,
                });
            }

            let slot = record
                .utxos
                .get(offset)
                .copied()
                .ok_or(UtxoStoreError::UtxoNotFound { tx, index })?;
            match slot {
                UtxoSlot::Unspendable => {
                    return Err(UtxoStoreError::UtxoNotFound { tx, index })
                }
                UtxoSlot::Spent => {
                    return Err(UtxoStoreError::UtxoAlreadySpent { tx, index })
                }
                UtxoSlot::Unspent(stored) => {
                    if stored != *expected {
                        return Err(UtxoStoreError::UtxoNotFound { tx, index });
                    }
                }
            }

            let primary = if record_index == 0 {
                record.clone()
            } else {
                self.read_record(&tx)?
                    .ok_or(UtxoStoreError::UtxoNotFound { tx, index })?
            };
            let previous = self.lookup_output(&primary, index)?;

            record.utxos[offset] = UtxoSlot::Spent;
            record.spent_utxos += 1;
            let new_bytes = record.encode();
            let swapped = self
                .retry_store(|| {
                    self.store
                        .compare_and_swap(Column::TxMeta, &key, Some(&bytes), Some(&new_bytes))
                })
                .await?;
            if swapped {
                return Ok(SpentOutput {
                    outpoint: *outpoint,
                    satoshis: previous.satoshis,
                    locking_script: previous.script_pubkey,
                });
            }
            // Lost the swap to a concurrent update; re-read and re-validate.
        }
        Err(UtxoStoreError::Storage(StoreError::Backend(
            "spend contention".to_string(),
        )))
    }

    /// Reverses one consumed slot. `known_hash` short-circuits the hash
    /// recomputation when the caller still holds it (spend rollback).
    pub(crate) async fn unspend_single(
        &self,
        outpoint: &OutPoint,
        known_hash: Option<Hash256>,
    ) -> Result<(), UtxoStoreError> {
        let tx = outpoint.hash;
        let index = outpoint.index;
        let (record_index, offset) = shard_for_output(index, self.config.utxo_batch_size);
        let key = record_key(&tx, record_index);

        for _ in 0..CAS_MAX_ATTEMPTS {
            let Some((bytes, mut record)) = self.read_record_raw(&key)? else {
                return Err(UtxoStoreError::UtxoNotFound { tx, index });
            };
            let slot = record
                .utxos
                .get(offset)
                .copied()
                .ok_or(UtxoStoreError::UtxoNotFound { tx, index })?;
            if !matches!(slot, UtxoSlot::Spent) {
                return Err(UtxoStoreError::InvalidArgument(
                    "output not recorded as spent",
                ));
            }

            let restored = match known_hash {
                Some(hash) => hash,
                None => {
                    let primary = if record_index == 0 {
                        record.clone()
                    } else {
                        self.read_record(&tx)?
                            .ok_or(UtxoStoreError::UtxoNotFound { tx, index })?
                    };
                    let output = self.lookup_output(&primary, index)?;
                    meta::utxo_hash(&tx, index, output.satoshis, &output.script_pubkey)
                }
            };

            if record.spent_utxos == 0 {
                return Err(UtxoStoreError::Processing("spent counter underflow"));
            }
            record.utxos[offset] = UtxoSlot::Unspent(restored);
            record.spent_utxos -= 1;
            let new_bytes = record.encode();
            let swapped = self
                .retry_store(|| {
                    self.store
                        .compare_and_swap(Column::TxMeta, &key, Some(&bytes), Some(&new_bytes))
                })
                .await?;
            if swapped {
                return Ok(());
            }
        }
        Err(UtxoStoreError::Storage(StoreError::Backend(
            "unspend contention".to_string(),
        )))
    }

    pub(crate) async fn reassign_output(
        &self,
        tx_hash: &Hash256,
        index: u32,
        new_locking_script: Vec<u8>,
    ) -> Result<(), UtxoStoreError> {
        let primary = self
            .read_record(tx_hash)?
            .ok_or(UtxoStoreError::TxNotFound(*tx_hash))?;
        if primary.external {
            return Err(UtxoStoreError::Processing(
                "reassignment unsupported for externally stored transactions",
            ));
        }
        let current = self.lookup_output(&primary, index)?;
        let new_hash = meta::utxo_hash(tx_hash, index, current.satoshis, &new_locking_script);
        let new_output_bytes = encode(&TxOut {
            satoshis: current.satoshis,
            script_pubkey: new_locking_script,
        });

        // Non-external transactions always fit one record, so the slot and
        // the output payload live on the same record and move in one swap.
        self.update_shard(tx_hash, index, |record, offset| {
            if !record.is_frozen(index) {
                return Err(UtxoStoreError::InvalidArgument(
                    "output must be frozen before reassignment",
                ));
            }
            match record.utxos[offset] {
                UtxoSlot::Unspent(_) => {}
                UtxoSlot::Spent => {
                    return Err(UtxoStoreError::UtxoAlreadySpent {
                        tx: *tx_hash,
                        index,
                    })
                }
                UtxoSlot::Unspendable => {
                    return Err(UtxoStoreError::UtxoNotFound {
                        tx: *tx_hash,
                        index,
                    })
                }
            }
            record.utxos[offset] = UtxoSlot::Unspent(new_hash);
            record.frozen_utxos.retain(|frozen| *frozen != index);
            record.reassignments += 1;
            if let Some(outputs) = &mut record.outputs {
                if let Some(slot) = outputs.get_mut(index as usize) {
                    *slot = new_output_bytes.clone();
                }
            }
            Ok(())
        })
        .await
    }
}
