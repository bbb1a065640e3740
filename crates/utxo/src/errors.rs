use bsvd_blob::BlobError;
use bsvd_consensus::Hash256;
use bsvd_primitives::hash256_to_hex;
use bsvd_storage::StoreError;

#[derive(Debug)]
pub enum UtxoStoreError {
    /// Malformed input; not retriable.
    InvalidArgument(&'static str),
    /// Primary record already present; caller re-reads for the winner's state.
    TxExists(Hash256),
    TxNotFound(Hash256),
    UtxoNotFound { tx: Hash256, index: u32 },
    UtxoAlreadySpent { tx: Hash256, index: u32 },
    UtxoFrozen { tx: Hash256, index: u32 },
    CoinbaseImmature { spendable_at: u32, height: u32 },
    TxLocked(Hash256),
    TxConflicting(Hash256),
    /// Deterministic internal failure; not retriable without a code change.
    Processing(&'static str),
    /// Transient backing-store failure, surfaced after bounded retries.
    Storage(StoreError),
    Blob(BlobError),
    Cancelled,
}

impl std::fmt::Display for UtxoStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UtxoStoreError::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            UtxoStoreError::TxExists(tx) => {
                write!(f, "tx {} already exists in store", hash256_to_hex(tx))
            }
            UtxoStoreError::TxNotFound(tx) => {
                write!(f, "tx {} not found", hash256_to_hex(tx))
            }
            UtxoStoreError::UtxoNotFound { tx, index } => {
                write!(f, "utxo {}:{index} not found", hash256_to_hex(tx))
            }
            UtxoStoreError::UtxoAlreadySpent { tx, index } => {
                write!(f, "utxo {}:{index} already spent", hash256_to_hex(tx))
            }
            UtxoStoreError::UtxoFrozen { tx, index } => {
                write!(f, "utxo {}:{index} is frozen", hash256_to_hex(tx))
            }
            UtxoStoreError::CoinbaseImmature {
                spendable_at,
                height,
            } => write!(
                f,
                "coinbase immature: spendable at height {spendable_at}, current {height}"
            ),
            UtxoStoreError::TxLocked(tx) => {
                write!(f, "tx {} is locked", hash256_to_hex(tx))
            }
            UtxoStoreError::TxConflicting(tx) => {
                write!(f, "tx {} is conflicting", hash256_to_hex(tx))
            }
            UtxoStoreError::Processing(message) => write!(f, "processing error: {message}"),
            UtxoStoreError::Storage(err) => write!(f, "storage error: {err}"),
            UtxoStoreError::Blob(err) => write!(f, "blob error: {err}"),
            UtxoStoreError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for UtxoStoreError {}

impl From<StoreError> for UtxoStoreError {
    fn from(err: StoreError) -> Self {
        UtxoStoreError::Storage(err)
    }
}

impl From<BlobError> for UtxoStoreError {
    fn from(err: BlobError) -> Self {
        UtxoStoreError::Blob(err)
    }
}
