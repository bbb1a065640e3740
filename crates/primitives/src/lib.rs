//! Transaction types and consensus serialization for the UTXO store.

pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
pub use hash::{hash256_to_hex, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TransactionError, TxIn, TxOut};
