//! UTXO store core: durable transaction records over a pluggable key-value
//! backend, batched creation with external offload for oversize payloads,
//! atomic spend/unspend, and lifecycle management (coinbase maturity,
//! mined/unmined transitions, conflict tracking, delete-at-height expiry).

pub mod config;
pub mod create;
pub mod errors;
pub mod events;
pub mod meta;
pub mod metrics;
pub mod record;
pub mod spend;
pub mod store;

mod cleanup;
mod lifecycle;

pub use config::UtxoStoreConfig;
pub use create::{CreateOptions, MinedBlockInfo};
pub use errors::UtxoStoreError;
pub use events::UtxoEvent;
pub use meta::{utxo_hash, TxMeta};
pub use metrics::StoreMetricsSnapshot;
pub use record::{TxRecord, UtxoSlot};
pub use spend::{SpendRequest, SpentOutput};
pub use store::UtxoStore;
