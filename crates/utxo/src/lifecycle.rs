//! Record lifecycle: mined/unmined transitions, delete-at-height
//! assignment, and conflicting-transaction propagation.

use std::collections::{HashSet, VecDeque};

use bsvd_consensus::Hash256;
use bsvd_primitives::transaction::Transaction;
use bsvd_storage::{Column, KeyValueStore};

use crate::create::MinedBlockInfo;
use crate::errors::UtxoStoreError;
use crate::events::UtxoEvent;
use crate::record::{
    dah_index_key, encode_dah_index_value, record_key,
};
use crate::store::{StoreInner, UtxoStore};

impl<S: KeyValueStore + 'static> UtxoStore<S> {
    /// Records a block inclusion. A transaction observed in several blocks
    /// is the common reorg case; inclusions accumulate. Idempotent per
    /// block id.
    pub async fn set_mined(
        &self,
        tx_hash: &Hash256,
        info: MinedBlockInfo,
    ) -> Result<(), UtxoStoreError> {
        let appended = self
            .inner
            .update_record(tx_hash, |record| {
                if record.block_ids.contains(&info.block_id) {
                    return Ok(false);
                }
                record.block_ids.push(info.block_id);
                record.block_heights.push(info.block_height);
                record.subtree_idxs.push(info.subtree_idx);
                record.unmined_since = None;
                Ok(true)
            })
            .await?;
        if appended {
            self.inner.metrics.record_mined();
            self.inner.events.emit(UtxoEvent::Mined {
                tx: *tx_hash,
                block_id: info.block_id,
                block_height: info.block_height,
                subtree_idx: info.subtree_idx,
            });
        }
        Ok(())
    }

    /// Removes one block inclusion during a reorg. When the last inclusion
    /// goes, the record is marked unmined as of the current height.
    pub async fn set_unmined(
        &self,
        tx_hash: &Hash256,
        block_id: u32,
    ) -> Result<(), UtxoStoreError> {
        let height = self.inner.current_height();
        let removed = self
            .inner
            .update_record(tx_hash, |record| {
                let Some(position) = record.block_ids.iter().position(|id| *id == block_id)
                else {
                    return Ok(false);
                };
                record.block_ids.remove(position);
                if position < record.block_heights.len() {
                    record.block_heights.remove(position);
                }
                if position < record.subtree_idxs.len() {
                    record.subtree_idxs.remove(position);
                }
                if record.block_ids.is_empty() {
                    record.unmined_since = Some(height);
                }
                Ok(true)
            })
            .await?;
        if removed {
            self.inner.metrics.record_unmined();
            self.inner.events.emit(UtxoEvent::Unmined {
                tx: *tx_hash,
                block_id,
            });
        }
        Ok(())
    }

    /// Marks a transaction conflicting and propagates the flag to every
    /// transitive descendant reachable through the conflicting-children
    /// sets. Bounded BFS with a visited set handles diamond dependencies;
    /// repeated marking is a no-op.
    pub async fn mark_conflicting(&self, tx_hash: &Hash256) -> Result<(), UtxoStoreError> {
        let mut queue = VecDeque::from([*tx_hash]);
        let mut visited: HashSet<Hash256> = HashSet::new();

        while let Some(tx) = queue.pop_front() {
            if !visited.insert(tx) {
                continue;
            }
            let Some(primary) = self.inner.read_record(&tx)? else {
                if tx == *tx_hash {
                    return Err(UtxoStoreError::TxNotFound(tx));
                }
                bsvd_log::log_warn!(
                    "conflicting descendant {} missing from store",
                    bsvd_primitives::hash256_to_hex(&tx)
                );
                continue;
            };

            let dah = self.inner.current_height() + self.inner.config.dah_retention_window;
            let (children, newly_marked, assigned_dah) = self
                .inner
                .update_record(&tx, |record| {
                    if record.conflicting {
                        return Ok((record.conflicting_children.clone(), false, None));
                    }
                    record.conflicting = true;
                    let assigned = if record.delete_at_height.is_none() {
                        record.delete_at_height = Some(dah);
                        Some(dah)
                    } else {
                        None
                    };
                    Ok((record.conflicting_children.clone(), true, assigned))
                })
                .await?;

            if !newly_marked {
                // Marked earlier; its descendants were handled then.
                continue;
            }

            for record_index in 1..=primary.total_extra_recs {
                let key = record_key(&tx, record_index);
                if self.inner.read_record(&key)?.is_none() {
                    continue;
                }
                self.inner
                    .update_record(&key, |record| {
                        record.conflicting = true;
                        Ok(())
                    })
                    .await?;
            }

            if let Some(dah) = assigned_dah {
                let row_key = dah_index_key(dah, &tx);
                let row_value =
                    encode_dah_index_value(primary.total_extra_recs, primary.external);
                if let Err(err) = self
                    .inner
                    .store
                    .put(Column::DeleteAtHeight, &row_key, &row_value)
                {
                    bsvd_log::log_warn!("failed to index delete-at-height {dah}: {err}");
                } else {
                    self.inner.metrics.record_dah_assigned();
                }
            }

            self.inner.metrics.record_conflicting_marked();
            self.inner
                .events
                .emit(UtxoEvent::ConflictingMarked { tx });
            queue.extend(children);
        }
        Ok(())
    }
}

impl<S: KeyValueStore> StoreInner<S> {
    /// Annotates every parent of a conflicting child before the child's own
    /// record is written, so the annotation is always reachable from the
    /// child.
    pub(crate) async fn update_parent_conflicting_children(
        &self,
        tx: &Transaction,
        child: &Hash256,
    ) -> Result<(), UtxoStoreError> {
        let mut parents: Vec<Hash256> = Vec::new();
        for input in &tx.vin {
            if input.prevout.is_null() {
                continue;
            }
            if !parents.contains(&input.prevout.hash) {
                parents.push(input.prevout.hash);
            }
        }
        for parent in parents {
            if self.read_record(&parent)?.is_none() {
                return Err(UtxoStoreError::TxNotFound(parent));
            }
            self.update_record(&parent, |record| {
                record.add_conflicting_child(*child);
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// Assigns a delete-at-height once every record of the transaction is
    /// fully spent. Advisory: the cross-record check is not linearized, but
    /// a fully spent shard is never served as spendable regardless.
    pub(crate) async fn maybe_assign_dah(&self, tx_hash: &Hash256) -> Result<(), UtxoStoreError> {
        let Some(primary) = self.read_record(tx_hash)? else {
            return Ok(());
        };
        if primary.delete_at_height.is_some() || !primary.is_fully_spent() {
            return Ok(());
        }
        for record_index in 1..=primary.total_extra_recs {
            match self.read_record(&record_key(tx_hash, record_index))? {
                Some(extension) if extension.is_fully_spent() => {}
                _ => return Ok(()),
            }
        }

        let dah = self.current_height() + self.config.dah_retention_window;
        let assigned = self
            .update_record(tx_hash, |record| {
                if record.delete_at_height.is_some() || !record.is_fully_spent() {
                    return Ok(false);
                }
                record.delete_at_height = Some(dah);
                Ok(true)
            })
            .await?;
        if assigned {
            let row_key = dah_index_key(dah, tx_hash);
            let row_value = encode_dah_index_value(primary.total_extra_recs, primary.external);
            self.store
                .put(Column::DeleteAtHeight, &row_key, &row_value)?;
            self.metrics.record_dah_assigned();
            bsvd_log::log_debug!(
                "tx {} fully spent; delete at height {dah}",
                bsvd_primitives::hash256_to_hex(tx_hash)
            );
        }
        Ok(())
    }

    /// Clears a pending delete-at-height; used when a reorg revives
    /// outputs. The index row goes first so a crash in between leaves only
    /// a dangling row the sweeper ignores.
    pub(crate) async fn clear_dah(&self, tx_hash: &Hash256) -> Result<(), UtxoStoreError> {
        let Some(primary) = self.read_record(tx_hash)? else {
            return Ok(());
        };
        let Some(dah) = primary.delete_at_height else {
            return Ok(());
        };
        self.store
            .delete(Column::DeleteAtHeight, &dah_index_key(dah, tx_hash))?;
        self.update_record(tx_hash, |record| {
            record.delete_at_height = None;
            Ok(())
        })
        .await?;
        self.metrics.record_dah_cleared();
        Ok(())
    }
}
