//! Background delete-at-height sweeper.
//!
//! Fully spent (or conflicting) records carry a `delete_at_height`; once the
//! tip reaches it, the sweeper removes the primary record, its extensions,
//! and any external blobs. The sweep walks the height-ordered index column,
//! so it only ever touches rows that are due. Sweeps are restartable: a
//! partially deleted transaction is finished off from the index row alone.

use std::sync::Arc;

use bsvd_consensus::Hash256;
use bsvd_storage::{Column, KeyValueStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::UtxoStoreError;
use crate::events::UtxoEvent;
use crate::record::{decode_dah_index_value, extension_key, parse_dah_index_key};
use crate::store::{StoreInner, UtxoStore};

pub(crate) struct CleanerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CleanerHandle {
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

pub(crate) fn spawn_cleaner<S: KeyValueStore + 'static>(
    inner: Arc<StoreInner<S>>,
) -> CleanerHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.cleaner_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match inner.sweep_expired().await {
                        Ok(0) => {}
                        Ok(count) => {
                            bsvd_log::log_info!("swept {count} expired transaction records");
                        }
                        Err(err) => {
                            bsvd_log::log_warn!("delete-at-height sweep failed: {err}");
                        }
                    }
                }
            }
        }
    });
    CleanerHandle {
        shutdown: shutdown_tx,
        handle,
    }
}

impl<S: KeyValueStore + 'static> UtxoStore<S> {
    /// One sweep pass over the due portion of the delete-at-height index.
    /// Runs on the cleaner's schedule; callable directly when the cleaner
    /// is disabled.
    pub async fn sweep_expired(&self) -> Result<usize, UtxoStoreError> {
        self.inner.sweep_expired().await
    }
}

impl<S: KeyValueStore> StoreInner<S> {
    pub(crate) async fn sweep_expired(&self) -> Result<usize, UtxoStoreError> {
        let tip = self.current_height();
        if tip == 0 {
            return Ok(0);
        }
        let rows = self
            .retry_store(|| self.store.scan_prefix(Column::DeleteAtHeight, &[]))
            .await?;

        let mut swept = 0usize;
        for (key, value) in rows {
            let Some((height, tx_id)) = parse_dah_index_key(&key) else {
                self.store.delete(Column::DeleteAtHeight, &key)?;
                continue;
            };
            if height > tip {
                // Height-ordered keys; nothing further is due.
                break;
            }

            let (total_extra_recs, external) = match self.read_record(&tx_id)? {
                Some(record) => match record.delete_at_height {
                    Some(dah) if dah == height => (record.total_extra_recs, record.external),
                    // The record field is authoritative; drop the dangling row.
                    _ => {
                        self.store.delete(Column::DeleteAtHeight, &key)?;
                        continue;
                    }
                },
                // Primary already gone: a previous sweep was interrupted.
                // The row carries enough to finish off the extensions.
                None => decode_dah_index_value(&value)
                    .map_err(|_| UtxoStoreError::Processing("corrupt sweep index row"))?,
            };

            self.delete_transaction(&tx_id, total_extra_recs, external)?;
            self.store.delete(Column::DeleteAtHeight, &key)?;
            self.events.emit(UtxoEvent::Deleted { tx: tx_id });
            swept += 1;
        }

        if swept > 0 {
            self.metrics.record_swept(swept);
        }
        Ok(swept)
    }

    fn delete_transaction(
        &self,
        tx_id: &Hash256,
        total_extra_recs: u32,
        external: bool,
    ) -> Result<(), UtxoStoreError> {
        for record_index in 1..=total_extra_recs {
            self.store
                .delete(Column::TxMeta, &extension_key(tx_id, record_index))?;
        }
        self.store.delete(Column::TxMeta, tx_id)?;
        if external {
            self.blob.delete(tx_id, bsvd_blob::FileType::Tx)?;
            self.blob.delete(tx_id, bsvd_blob::FileType::Outputs)?;
        }
        Ok(())
    }
}
