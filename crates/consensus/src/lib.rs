//! Chain parameters consumed by the UTXO store.

pub mod params;

pub use params::{chain_params, ChainParams, Network};

pub type Hash256 = [u8; 32];
