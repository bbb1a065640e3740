//! BSV transaction types and serialization.
//!
//! Two wire encodings are supported: the standard consensus serialization,
//! and the extended format in which every input additionally carries the
//! satoshis and locking script of the output it consumes. The extended form
//! is what the UTXO store persists, since it makes fees computable without
//! any lookups.

use bsvd_consensus::Hash256;

use crate::encoding::{varint_len, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

/// Marker inserted after the version field in the extended serialization.
pub const EXTENDED_FORMAT_MARKER: [u8; 6] = [0x00, 0x00, 0x00, 0x00, 0x00, 0xEF];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// Satoshis of the consumed output (extended format; 0 when unknown).
    pub previous_satoshis: u64,
    /// Locking script of the consumed output (extended format).
    pub previous_script: Option<Vec<u8>>,
}

impl TxIn {
    pub fn encode_extended(&self, encoder: &mut Encoder) {
        self.consensus_encode(encoder);
        encoder.write_u64_le(self.previous_satoshis);
        match &self.previous_script {
            Some(script) => encoder.write_var_bytes(script),
            None => encoder.write_varint(0),
        }
    }

    pub fn decode_extended(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let mut input = Self::consensus_decode(decoder)?;
        input.previous_satoshis = decoder.read_u64_le()?;
        let script = decoder.read_var_bytes()?;
        input.previous_script = if script.is_empty() {
            None
        } else {
            Some(script)
        };
        Ok(input)
    }

    fn standard_len(&self) -> usize {
        36 + varint_len(self.script_sig.len() as u64) + self.script_sig.len() + 4
    }

    fn extended_len(&self) -> usize {
        let script_len = self.previous_script.as_ref().map_or(0, Vec::len);
        self.standard_len() + 8 + varint_len(script_len as u64) + script_len
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
            previous_satoshis: 0,
            previous_script: None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub satoshis: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn serialized_len(&self) -> usize {
        8 + varint_len(self.script_pubkey.len() as u64) + self.script_pubkey.len()
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.satoshis);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let satoshis = decoder.read_u64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            satoshis,
            script_pubkey,
        })
    }
}

#[derive(Debug)]
pub enum TransactionError {
    Decode(DecodeError),
    MissingExtendedMarker,
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionError::Decode(err) => write!(f, "{err}"),
            TransactionError::MissingExtendedMarker => {
                write!(f, "missing extended format marker")
            }
        }
    }
}

impl std::error::Error for TransactionError {}

impl From<DecodeError> for TransactionError {
    fn from(err: DecodeError) -> Self {
        TransactionError::Decode(err)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode_to_vec())
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    /// Whether every input carries its previous locking script, i.e. the
    /// transaction is complete in the extended sense and fees are computable.
    pub fn is_extended(&self) -> bool {
        self.vin
            .iter()
            .all(|input| input.previous_script.is_some())
    }

    /// Standard serialization length without allocating.
    pub fn size(&self) -> usize {
        let mut size = 4 + varint_len(self.vin.len() as u64) + varint_len(self.vout.len() as u64) + 4;
        for input in &self.vin {
            size += input.standard_len();
        }
        for output in &self.vout {
            size += output.serialized_len();
        }
        size
    }

    /// Extended serialization length without allocating.
    pub fn extended_size(&self) -> usize {
        let mut size = 4
            + EXTENDED_FORMAT_MARKER.len()
            + varint_len(self.vin.len() as u64)
            + varint_len(self.vout.len() as u64)
            + 4;
        for input in &self.vin {
            size += input.extended_len();
        }
        for output in &self.vout {
            size += output.serialized_len();
        }
        size
    }

    pub fn consensus_encode_to_vec(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.size());
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn extended_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.extended_size());
        encoder.write_u32_le(self.version);
        encoder.write_bytes(&EXTENDED_FORMAT_MARKER);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.encode_extended(&mut encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(&mut encoder);
        }
        encoder.write_u32_le(self.lock_time);
        encoder.into_inner()
    }

    pub fn extended_decode(bytes: &[u8]) -> Result<Self, TransactionError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u32_le()?;
        let marker = decoder.read_bytes(EXTENDED_FORMAT_MARKER.len())?;
        if marker != EXTENDED_FORMAT_MARKER {
            return Err(TransactionError::MissingExtendedMarker);
        }
        let vin_len = decoder.read_varint()? as usize;
        let mut vin = Vec::with_capacity(vin_len.min(1024));
        for _ in 0..vin_len {
            vin.push(TxIn::decode_extended(&mut decoder)?);
        }
        let vout_len = decoder.read_varint()? as usize;
        let mut vout = Vec::with_capacity(vout_len.min(1024));
        for _ in 0..vout_len {
            vout.push(TxOut::consensus_decode(&mut decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(TransactionError::Decode(DecodeError::TrailingBytes));
        }
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let vin_len = decoder.read_varint()? as usize;
        let mut vin = Vec::with_capacity(vin_len.min(1024));
        for _ in 0..vin_len {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let vout_len = decoder.read_varint()? as usize;
        let mut vout = Vec::with_capacity(vout_len.min(1024));
        for _ in 0..vout_len {
            vout.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}
