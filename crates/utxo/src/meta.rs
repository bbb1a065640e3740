//! Transaction metadata derivation: fees, canonical UTXO hashes, and the
//! output-storability policy.

use bsvd_consensus::{ChainParams, Hash256};
use bsvd_primitives::encoding::Encoder;
use bsvd_primitives::hash::sha256d;
use bsvd_primitives::transaction::{Transaction, TxOut};

use crate::errors::UtxoStoreError;

const OP_FALSE: u8 = 0x00;
const OP_RETURN: u8 = 0x6a;

/// Metadata returned to the caller of `create`.
#[derive(Clone, Debug)]
pub struct TxMeta {
    pub tx_id: Hash256,
    pub fee: u64,
    pub size_bytes: u64,
    pub extended_size_bytes: u64,
    pub lock_time: u32,
    pub is_coinbase: bool,
    pub total_utxos: u32,
    /// Entry per output; `None` when the output is not stored as a UTXO.
    pub utxo_hashes: Vec<Option<Hash256>>,
    pub conflicting: bool,
    pub locked: bool,
}

/// Canonical UTXO hash:
/// `SHA256d(tx_hash ‖ u32_le(index) ‖ u64_le(satoshis) ‖ varint(len) ‖ script)`.
pub fn utxo_hash(tx_id: &Hash256, index: u32, satoshis: u64, locking_script: &[u8]) -> Hash256 {
    let mut encoder = Encoder::with_capacity(32 + 4 + 8 + 9 + locking_script.len());
    encoder.write_hash(tx_id);
    encoder.write_u32_le(index);
    encoder.write_u64_le(satoshis);
    encoder.write_var_bytes(locking_script);
    sha256d(&encoder.into_inner())
}

/// Whether an output is stored as a spendable UTXO.
///
/// Coinbase outputs are always stored. Zero-value outputs and data-carrier
/// outputs (`OP_FALSE OP_RETURN`; bare `OP_RETURN` before the genesis
/// activation) never become UTXOs.
pub fn should_store_output(
    is_coinbase: bool,
    output: &TxOut,
    block_height: u32,
    params: &ChainParams,
) -> bool {
    if is_coinbase {
        return true;
    }
    if output.satoshis == 0 {
        return false;
    }
    let script = output.script_pubkey.as_slice();
    if script.len() >= 2 && script[0] == OP_FALSE && script[1] == OP_RETURN {
        return false;
    }
    if block_height < params.genesis_activation_height
        && script.first() == Some(&OP_RETURN)
    {
        return false;
    }
    true
}

/// Fee of an extended transaction: sum of previous-output satoshis minus sum
/// of output satoshis. Zero for partial transactions (no inputs) and for
/// coinbases.
pub fn compute_fee(tx: &Transaction) -> Result<u64, UtxoStoreError> {
    if tx.vin.is_empty() || tx.is_coinbase() {
        return Ok(0);
    }
    let mut input_total: u64 = 0;
    for input in &tx.vin {
        if input.previous_script.is_none() {
            return Err(UtxoStoreError::Processing(
                "input missing extended previous-output data",
            ));
        }
        input_total = input_total
            .checked_add(input.previous_satoshis)
            .ok_or(UtxoStoreError::Processing("input satoshis overflow"))?;
    }
    let mut output_total: u64 = 0;
    for output in &tx.vout {
        output_total = output_total
            .checked_add(output.satoshis)
            .ok_or(UtxoStoreError::Processing("output satoshis overflow"))?;
    }
    input_total
        .checked_sub(output_total)
        .ok_or(UtxoStoreError::Processing("outputs exceed inputs"))
}

/// UTXO hash per output, `None` for outputs the policy rejects.
pub fn compute_utxo_hashes(
    tx: &Transaction,
    tx_id: &Hash256,
    is_coinbase: bool,
    block_height: u32,
    params: &ChainParams,
) -> Vec<Option<Hash256>> {
    tx.vout
        .iter()
        .enumerate()
        .map(|(index, output)| {
            if should_store_output(is_coinbase, output, block_height, params) {
                Some(utxo_hash(
                    tx_id,
                    index as u32,
                    output.satoshis,
                    &output.script_pubkey,
                ))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsvd_consensus::{chain_params, Network};
    use bsvd_primitives::outpoint::OutPoint;
    use bsvd_primitives::transaction::TxIn;

    fn params() -> ChainParams {
        chain_params(Network::Mainnet)
    }

    fn extended_input(satoshis: u64) -> TxIn {
        TxIn {
            prevout: OutPoint::new([3u8; 32], 0),
            script_sig: Vec::new(),
            sequence: u32::MAX,
            previous_satoshis: satoshis,
            previous_script: Some(vec![0x51]),
        }
    }

    fn output(satoshis: u64, script: Vec<u8>) -> TxOut {
        TxOut {
            satoshis,
            script_pubkey: script,
        }
    }

    #[test]
    fn fee_is_inputs_minus_outputs() {
        let tx = Transaction {
            version: 1,
            vin: vec![extended_input(10_000), extended_input(5_000)],
            vout: vec![output(14_000, vec![0x51])],
            lock_time: 0,
        };
        assert_eq!(compute_fee(&tx).expect("fee"), 1_000);
    }

    #[test]
    fn fee_zero_for_partial() {
        let tx = Transaction {
            version: 1,
            vin: Vec::new(),
            vout: vec![output(1_000, vec![0x51])],
            lock_time: 0,
        };
        assert_eq!(compute_fee(&tx).expect("fee"), 0);
    }

    #[test]
    fn fee_rejects_non_extended_inputs() {
        let mut input = extended_input(10_000);
        input.previous_script = None;
        let tx = Transaction {
            version: 1,
            vin: vec![input],
            vout: vec![output(9_000, vec![0x51])],
            lock_time: 0,
        };
        assert!(matches!(
            compute_fee(&tx),
            Err(UtxoStoreError::Processing(_))
        ));
    }

    #[test]
    fn fee_rejects_negative() {
        let tx = Transaction {
            version: 1,
            vin: vec![extended_input(100)],
            vout: vec![output(200, vec![0x51])],
            lock_time: 0,
        };
        assert!(matches!(
            compute_fee(&tx),
            Err(UtxoStoreError::Processing(_))
        ));
    }

    #[test]
    fn storability_policy() {
        let params = params();
        let spendable = output(1_000, vec![0x51]);
        assert!(should_store_output(false, &spendable, 700_000, &params));

        let zero = output(0, vec![0x51]);
        assert!(!should_store_output(false, &zero, 700_000, &params));
        // Coinbase outputs are stored no matter what.
        assert!(should_store_output(true, &zero, 700_000, &params));

        let data_carrier = output(1_000, vec![OP_FALSE, OP_RETURN, 0x01]);
        assert!(!should_store_output(false, &data_carrier, 700_000, &params));

        let bare_op_return = output(1_000, vec![OP_RETURN, 0x01]);
        // Unspendable before genesis activation, spendable after.
        assert!(!should_store_output(false, &bare_op_return, 100_000, &params));
        assert!(should_store_output(false, &bare_op_return, 700_000, &params));
    }

    #[test]
    fn utxo_hash_is_deterministic_and_input_sensitive() {
        let tx_id = [0xabu8; 32];
        let base = utxo_hash(&tx_id, 0, 5_000, &[0x51]);
        assert_eq!(utxo_hash(&tx_id, 0, 5_000, &[0x51]), base);
        assert_ne!(utxo_hash(&tx_id, 1, 5_000, &[0x51]), base);
        assert_ne!(utxo_hash(&tx_id, 0, 5_001, &[0x51]), base);
        assert_ne!(utxo_hash(&tx_id, 0, 5_000, &[0x52]), base);
    }
}
