use std::time::Duration;

/// Runtime configuration of the UTXO store.
#[derive(Clone, Debug)]
pub struct UtxoStoreConfig {
    /// Spendable outputs per record; transactions with more outputs are
    /// split across extension records.
    pub utxo_batch_size: usize,
    /// Payload threshold above which the transaction body is offloaded to
    /// the blob store.
    pub max_tx_in_record_bytes: usize,
    /// Offload every transaction body regardless of size.
    pub externalize_all_transactions: bool,
    /// Maximum wait before an under-full create batch is flushed.
    pub batch_coalesce_window: Duration,
    /// Create items coalesced into one batched write.
    pub utxo_batch_write_size: usize,
    /// Concurrent batch writers.
    pub worker_count: usize,
    /// Overrides the chain's coinbase maturity when set.
    pub coinbase_maturity: Option<u32>,
    /// Blocks between a record becoming fully spent and sweep eligibility.
    pub dah_retention_window: u32,
    pub disable_dah_cleaner: bool,
    /// Pause between cleaner sweeps.
    pub cleaner_interval: Duration,
    /// Multiple services share this process; worker pools run halved.
    pub all_in_one_mode: bool,
    pub verbose_debug: bool,
    /// Transient storage failures are retried this many times.
    pub store_retry_attempts: u32,
    /// Base backoff between retries, doubled per attempt.
    pub store_retry_backoff: Duration,
    /// Age after which an interrupted multi-record write may be taken over
    /// and completed by another creator.
    pub creating_takeover_grace: Duration,
    /// Event broadcast ring capacity.
    pub event_capacity: usize,
}

impl Default for UtxoStoreConfig {
    fn default() -> Self {
        Self {
            utxo_batch_size: 20_000,
            max_tx_in_record_bytes: 1024 * 1024,
            externalize_all_transactions: false,
            batch_coalesce_window: Duration::from_millis(10),
            utxo_batch_write_size: 256,
            worker_count: 4,
            coinbase_maturity: None,
            dah_retention_window: 288,
            disable_dah_cleaner: false,
            cleaner_interval: Duration::from_secs(60),
            all_in_one_mode: false,
            verbose_debug: false,
            store_retry_attempts: 3,
            store_retry_backoff: Duration::from_millis(20),
            creating_takeover_grace: Duration::from_secs(30),
            event_capacity: 1024,
        }
    }
}

impl UtxoStoreConfig {
    pub fn effective_worker_count(&self) -> usize {
        if self.all_in_one_mode {
            (self.worker_count / 2).max(1)
        } else {
            self.worker_count.max(1)
        }
    }
}
