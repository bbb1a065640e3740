//! Persistent record layout.
//!
//! A transaction is stored as one primary record keyed by its hash, plus
//! extension records for every further `utxo_batch_size` outputs, keyed by
//! `sha256(tx_hash ‖ be_u32(n))`. Identity fields are duplicated onto every
//! record so a single-record atomic update can validate locally; the
//! payload (inputs, outputs, block inclusions) lives on the primary only.

use bsvd_consensus::Hash256;
use bsvd_primitives::encoding::{DecodeError, Decoder, Encoder};
use bsvd_primitives::hash::sha256;
use bsvd_primitives::transaction::TxOut;

pub const RECORD_FORMAT_VERSION: u8 = 1;

/// State of one output position within a record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UtxoSlot {
    /// Output was never stored as a UTXO (provably unspendable or
    /// policy-rejected). Terminal.
    Unspendable,
    /// Spendable and unconsumed; holds the canonical UTXO hash.
    Unspent(Hash256),
    /// Consumed by a spend. Reversible by `unspend` during reorg.
    Spent,
}

impl UtxoSlot {
    fn encode(&self, encoder: &mut Encoder) {
        match self {
            UtxoSlot::Unspendable => encoder.write_u8(0),
            UtxoSlot::Unspent(hash) => {
                encoder.write_u8(1);
                encoder.write_hash(hash);
            }
            UtxoSlot::Spent => encoder.write_u8(2),
        }
    }

    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        match decoder.read_u8()? {
            0 => Ok(UtxoSlot::Unspendable),
            1 => Ok(UtxoSlot::Unspent(decoder.read_hash()?)),
            2 => Ok(UtxoSlot::Spent),
            _ => Err(DecodeError::InvalidData("unknown utxo slot tag")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRecord {
    pub tx_id: Hash256,
    pub version: u32,
    pub lock_time: u32,
    pub fee: u64,
    pub size_bytes: u64,
    pub extended_size_bytes: u64,
    pub is_coinbase: bool,
    /// Earliest height a coinbase output may be spent; 0 for non-coinbase.
    pub spending_height: u32,
    pub conflicting: bool,
    pub locked: bool,
    /// Multi-record write in progress; never spendable while set.
    pub creating: bool,
    /// Payload lives in the blob store.
    pub external: bool,
    pub created_at_ms: u64,
    /// Spendable slots in this record.
    pub record_utxos: u32,
    /// Consumed slots in this record. Never exceeds `record_utxos`.
    pub spent_utxos: u32,
    /// Spendable outputs across the whole transaction.
    pub total_utxos: u32,
    /// Extension record count; 0 when the transaction fits one record.
    pub total_extra_recs: u32,
    /// This record's slice of output slots.
    pub utxos: Vec<UtxoSlot>,
    pub block_ids: Vec<u32>,
    pub block_heights: Vec<u32>,
    pub subtree_idxs: Vec<u32>,
    pub unmined_since: Option<u32>,
    pub conflicting_children: Vec<Hash256>,
    pub delete_at_height: Option<u32>,
    /// Frozen output indices (transaction-global).
    pub frozen_utxos: Vec<u32>,
    pub reassignments: u32,
    /// Serialized extended inputs; absent on external and partial records.
    pub inputs: Option<Vec<Vec<u8>>>,
    /// Serialized outputs; absent on external records.
    pub outputs: Option<Vec<Vec<u8>>>,
}

impl TxRecord {
    pub fn is_fully_spent(&self) -> bool {
        self.spent_utxos == self.record_utxos
    }

    /// Adds a child to the conflicting-children set. Returns false when the
    /// child was already present.
    pub fn add_conflicting_child(&mut self, child: Hash256) -> bool {
        if self.conflicting_children.contains(&child) {
            return false;
        }
        self.conflicting_children.push(child);
        true
    }

    pub fn is_frozen(&self, index: u32) -> bool {
        self.frozen_utxos.contains(&index)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(128 + self.utxos.len() * 33);
        encoder.write_u8(RECORD_FORMAT_VERSION);
        encoder.write_hash(&self.tx_id);
        encoder.write_u32_le(self.version);
        encoder.write_u32_le(self.lock_time);
        encoder.write_u64_le(self.fee);
        encoder.write_u64_le(self.size_bytes);
        encoder.write_u64_le(self.extended_size_bytes);
        encoder.write_bool(self.is_coinbase);
        encoder.write_u32_le(self.spending_height);
        encoder.write_bool(self.conflicting);
        encoder.write_bool(self.locked);
        encoder.write_bool(self.creating);
        encoder.write_bool(self.external);
        encoder.write_u64_le(self.created_at_ms);
        encoder.write_u32_le(self.record_utxos);
        encoder.write_u32_le(self.spent_utxos);
        encoder.write_u32_le(self.total_utxos);
        encoder.write_u32_le(self.total_extra_recs);
        encoder.write_varint(self.utxos.len() as u64);
        for slot in &self.utxos {
            slot.encode(&mut encoder);
        }
        write_u32_seq(&mut encoder, &self.block_ids);
        write_u32_seq(&mut encoder, &self.block_heights);
        write_u32_seq(&mut encoder, &self.subtree_idxs);
        write_opt_u32(&mut encoder, self.unmined_since);
        encoder.write_varint(self.conflicting_children.len() as u64);
        for child in &self.conflicting_children {
            encoder.write_hash(child);
        }
        write_opt_u32(&mut encoder, self.delete_at_height);
        write_u32_seq(&mut encoder, &self.frozen_utxos);
        encoder.write_u32_le(self.reassignments);
        write_opt_bytes_seq(&mut encoder, self.inputs.as_deref());
        write_opt_bytes_seq(&mut encoder, self.outputs.as_deref());
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let format = decoder.read_u8()?;
        if format != RECORD_FORMAT_VERSION {
            return Err(DecodeError::InvalidData("unsupported record format"));
        }
        let tx_id = decoder.read_hash()?;
        let version = decoder.read_u32_le()?;
        let lock_time = decoder.read_u32_le()?;
        let fee = decoder.read_u64_le()?;
        let size_bytes = decoder.read_u64_le()?;
        let extended_size_bytes = decoder.read_u64_le()?;
        let is_coinbase = decoder.read_bool()?;
        let spending_height = decoder.read_u32_le()?;
        let conflicting = decoder.read_bool()?;
        let locked = decoder.read_bool()?;
        let creating = decoder.read_bool()?;
        let external = decoder.read_bool()?;
        let created_at_ms = decoder.read_u64_le()?;
        let record_utxos = decoder.read_u32_le()?;
        let spent_utxos = decoder.read_u32_le()?;
        let total_utxos = decoder.read_u32_le()?;
        let total_extra_recs = decoder.read_u32_le()?;
        let slot_count = decoder.read_varint()? as usize;
        let mut utxos = Vec::with_capacity(slot_count.min(1 << 16));
        for _ in 0..slot_count {
            utxos.push(UtxoSlot::decode(&mut decoder)?);
        }
        let block_ids = read_u32_seq(&mut decoder)?;
        let block_heights = read_u32_seq(&mut decoder)?;
        let subtree_idxs = read_u32_seq(&mut decoder)?;
        let unmined_since = read_opt_u32(&mut decoder)?;
        let child_count = decoder.read_varint()? as usize;
        let mut conflicting_children = Vec::with_capacity(child_count.min(1 << 16));
        for _ in 0..child_count {
            conflicting_children.push(decoder.read_hash()?);
        }
        let delete_at_height = read_opt_u32(&mut decoder)?;
        let frozen_utxos = read_u32_seq(&mut decoder)?;
        let reassignments = decoder.read_u32_le()?;
        let inputs = read_opt_bytes_seq(&mut decoder)?;
        let outputs = read_opt_bytes_seq(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            tx_id,
            version,
            lock_time,
            fee,
            size_bytes,
            extended_size_bytes,
            is_coinbase,
            spending_height,
            conflicting,
            locked,
            creating,
            external,
            created_at_ms,
            record_utxos,
            spent_utxos,
            total_utxos,
            total_extra_recs,
            utxos,
            block_ids,
            block_heights,
            subtree_idxs,
            unmined_since,
            conflicting_children,
            delete_at_height,
            frozen_utxos,
            reassignments,
            inputs,
            outputs,
        })
    }
}

fn write_u32_seq(encoder: &mut Encoder, values: &[u32]) {
    encoder.write_varint(values.len() as u64);
    for value in values {
        encoder.write_u32_le(*value);
    }
}

fn read_u32_seq(decoder: &mut Decoder) -> Result<Vec<u32>, DecodeError> {
    let count = decoder.read_varint()? as usize;
    let mut values = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        values.push(decoder.read_u32_le()?);
    }
    Ok(values)
}

fn write_opt_u32(encoder: &mut Encoder, value: Option<u32>) {
    match value {
        Some(value) => {
            encoder.write_bool(true);
            encoder.write_u32_le(value);
        }
        None => encoder.write_bool(false),
    }
}

fn read_opt_u32(decoder: &mut Decoder) -> Result<Option<u32>, DecodeError> {
    if decoder.read_bool()? {
        Ok(Some(decoder.read_u32_le()?))
    } else {
        Ok(None)
    }
}

fn write_opt_bytes_seq(encoder: &mut Encoder, values: Option<&[Vec<u8>]>) {
    match values {
        Some(values) => {
            encoder.write_bool(true);
            encoder.write_varint(values.len() as u64);
            for value in values {
                encoder.write_var_bytes(value);
            }
        }
        None => encoder.write_bool(false),
    }
}

fn read_opt_bytes_seq(decoder: &mut Decoder) -> Result<Option<Vec<Vec<u8>>>, DecodeError> {
    if !decoder.read_bool()? {
        return Ok(None);
    }
    let count = decoder.read_varint()? as usize;
    let mut values = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        values.push(decoder.read_var_bytes()?);
    }
    Ok(Some(values))
}

/// Key of extension record `index` (index ≥ 1).
pub fn extension_key(tx_id: &Hash256, index: u32) -> Hash256 {
    let mut buf = [0u8; 36];
    buf[..32].copy_from_slice(tx_id);
    buf[32..].copy_from_slice(&index.to_be_bytes());
    sha256(&buf)
}

/// Key of record `record_index`: the tx hash itself for 0, an extension
/// digest otherwise.
pub fn record_key(tx_id: &Hash256, record_index: u32) -> Hash256 {
    if record_index == 0 {
        *tx_id
    } else {
        extension_key(tx_id, record_index)
    }
}

/// Record index and in-record offset of a transaction-global output index.
pub fn shard_for_output(index: u32, batch_size: usize) -> (u32, usize) {
    let batch = batch_size.max(1) as u32;
    (index / batch, (index % batch) as usize)
}

/// Number of records needed for `total_outputs` output slots.
pub fn record_count(total_outputs: usize, batch_size: usize) -> u32 {
    let batch = batch_size.max(1);
    (total_outputs.max(1)).div_ceil(batch) as u32
}

/// Sweep index key: `be_u32(height) ‖ tx_hash`, ordered by height.
pub fn dah_index_key(height: u32, tx_id: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(tx_id);
    key
}

pub fn parse_dah_index_key(key: &[u8]) -> Option<(u32, Hash256)> {
    if key.len() != 36 {
        return None;
    }
    let height = u32::from_be_bytes(key[..4].try_into().ok()?);
    let tx_id: Hash256 = key[4..].try_into().ok()?;
    Some((height, tx_id))
}

/// Sweep index value: extension count and external flag, enough to finish a
/// sweep whose primary record is already gone.
pub fn encode_dah_index_value(total_extra_recs: u32, external: bool) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(5);
    encoder.write_u32_le(total_extra_recs);
    encoder.write_bool(external);
    encoder.into_inner()
}

pub fn decode_dah_index_value(bytes: &[u8]) -> Result<(u32, bool), DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let total_extra_recs = decoder.read_u32_le()?;
    let external = decoder.read_bool()?;
    Ok((total_extra_recs, external))
}

/// Output-set payload stored at the `Outputs` blob address for partial
/// transactions: only the storable outputs, each with its index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputSet {
    pub tx_id: Hash256,
    pub block_height: u32,
    pub is_coinbase: bool,
    pub outputs: Vec<(u32, TxOut)>,
}

impl OutputSet {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash(&self.tx_id);
        encoder.write_u32_le(self.block_height);
        encoder.write_bool(self.is_coinbase);
        encoder.write_varint(self.outputs.len() as u64);
        for (index, output) in &self.outputs {
            encoder.write_u32_le(*index);
            encoder.write_u64_le(output.satoshis);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx_id = decoder.read_hash()?;
        let block_height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_bool()?;
        let count = decoder.read_varint()? as usize;
        let mut outputs = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            let index = decoder.read_u32_le()?;
            let satoshis = decoder.read_u64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            outputs.push((
                index,
                TxOut {
                    satoshis,
                    script_pubkey,
                },
            ));
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            tx_id,
            block_height,
            is_coinbase,
            outputs,
        })
    }

    pub fn output_at(&self, index: u32) -> Option<&TxOut> {
        self.outputs
            .iter()
            .find(|(entry_index, _)| *entry_index == index)
            .map(|(_, output)| output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> TxRecord {
        TxRecord {
            tx_id: [5u8; 32],
            version: 2,
            lock_time: 0,
            fee: 150,
            size_bytes: 250,
            extended_size_bytes: 300,
            is_coinbase: false,
            spending_height: 0,
            conflicting: false,
            locked: false,
            creating: false,
            external: false,
            created_at_ms: 1_700_000_000_123,
            record_utxos: 2,
            spent_utxos: 1,
            total_utxos: 2,
            total_extra_recs: 0,
            utxos: vec![
                UtxoSlot::Unspent([1u8; 32]),
                UtxoSlot::Spent,
                UtxoSlot::Unspendable,
            ],
            block_ids: vec![12],
            block_heights: vec![820_000],
            subtree_idxs: vec![3],
            unmined_since: None,
            conflicting_children: vec![[9u8; 32]],
            delete_at_height: Some(820_288),
            frozen_utxos: vec![0],
            reassignments: 0,
            inputs: Some(vec![vec![1, 2, 3]]),
            outputs: Some(vec![vec![4, 5], vec![6]]),
        }
    }

    #[test]
    fn record_roundtrip() {
        let record = sample_record();
        let decoded = TxRecord::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn record_roundtrip_minimal_extension() {
        let mut record = sample_record();
        record.inputs = None;
        record.outputs = None;
        record.block_ids.clear();
        record.block_heights.clear();
        record.subtree_idxs.clear();
        record.conflicting_children.clear();
        record.delete_at_height = None;
        record.unmined_since = Some(800_000);
        record.creating = true;
        let decoded = TxRecord::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn decode_rejects_unknown_format() {
        let mut bytes = sample_record().encode();
        bytes[0] = 99;
        assert!(TxRecord::decode(&bytes).is_err());
    }

    #[test]
    fn extension_keys_are_distinct() {
        let tx_id = [7u8; 32];
        assert_eq!(record_key(&tx_id, 0), tx_id);
        let first = record_key(&tx_id, 1);
        let second = record_key(&tx_id, 2);
        assert_ne!(first, tx_id);
        assert_ne!(first, second);
        // Deterministic.
        assert_eq!(extension_key(&tx_id, 1), first);
    }

    #[test]
    fn shard_math() {
        assert_eq!(shard_for_output(0, 20_000), (0, 0));
        assert_eq!(shard_for_output(19_999, 20_000), (0, 19_999));
        assert_eq!(shard_for_output(20_000, 20_000), (1, 0));
        assert_eq!(shard_for_output(45_000, 20_000), (2, 5_000));
        assert_eq!(record_count(1, 20_000), 1);
        assert_eq!(record_count(20_000, 20_000), 1);
        assert_eq!(record_count(20_001, 20_000), 2);
        assert_eq!(record_count(45_000, 20_000), 3);
    }

    #[test]
    fn dah_index_key_roundtrip() {
        let key = dah_index_key(820_288, &[3u8; 32]);
        let (height, tx_id) = parse_dah_index_key(&key).expect("parse");
        assert_eq!(height, 820_288);
        assert_eq!(tx_id, [3u8; 32]);
        // Height-major ordering.
        assert!(dah_index_key(1, &[0xffu8; 32]) < dah_index_key(2, &[0u8; 32]));
    }

    #[test]
    fn dah_index_value_roundtrip() {
        let bytes = encode_dah_index_value(2, true);
        assert_eq!(decode_dah_index_value(&bytes).expect("decode"), (2, true));
    }

    #[test]
    fn output_set_roundtrip_and_lookup() {
        let set = OutputSet {
            tx_id: [8u8; 32],
            block_height: 500,
            is_coinbase: false,
            outputs: vec![
                (
                    0,
                    TxOut {
                        satoshis: 1_000,
                        script_pubkey: vec![0x51],
                    },
                ),
                (
                    5,
                    TxOut {
                        satoshis: 2_000,
                        script_pubkey: vec![0x52],
                    },
                ),
            ],
        };
        let decoded = OutputSet::decode(&set.encode()).expect("decode");
        assert_eq!(decoded, set);
        assert_eq!(decoded.output_at(5).expect("output").satoshis, 2_000);
        assert!(decoded.output_at(1).is_none());
    }
}
