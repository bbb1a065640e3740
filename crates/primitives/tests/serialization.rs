use bsvd_primitives::encoding::{decode, encode, Decoder, Encoder};
use bsvd_primitives::outpoint::OutPoint;
use bsvd_primitives::transaction::{Transaction, TxIn, TxOut, EXTENDED_FORMAT_MARKER};

fn two_in_two_out() -> Transaction {
    Transaction {
        version: 2,
        vin: vec![
            TxIn {
                prevout: OutPoint::new([0x11u8; 32], 0),
                script_sig: vec![0x47, 0x30, 0x44],
                sequence: 0xffff_ffff,
                previous_satoshis: 60_000,
                previous_script: Some(vec![0x76, 0xa9, 0x14]),
            },
            TxIn {
                prevout: OutPoint::new([0x22u8; 32], 3),
                script_sig: vec![0x00],
                sequence: 0xffff_fffe,
                previous_satoshis: 40_000,
                previous_script: Some(vec![0x51]),
            },
        ],
        vout: vec![
            TxOut {
                satoshis: 70_000,
                script_pubkey: vec![0x76, 0xa9, 0x14, 0x01],
            },
            TxOut {
                satoshis: 29_000,
                script_pubkey: vec![0xac],
            },
        ],
        lock_time: 820_000,
    }
}

#[test]
fn standard_encoding_layout() {
    let tx = two_in_two_out();
    let bytes = encode(&tx);
    // version | vin count | ... | lock_time
    assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
    assert_eq!(bytes[4], 2); // two inputs, single-byte CompactSize
    assert_eq!(&bytes[bytes.len() - 4..], &820_000u32.to_le_bytes());
    assert_eq!(bytes.len(), tx.size());

    let decoded: Transaction = decode(&bytes).expect("decode");
    assert_eq!(decoded.vin.len(), 2);
    assert_eq!(decoded.vout, tx.vout);
    assert_eq!(decoded.lock_time, tx.lock_time);
}

#[test]
fn extended_encoding_carries_marker_and_prev_data() {
    let tx = two_in_two_out();
    let bytes = tx.extended_encode();
    assert_eq!(&bytes[4..10], &EXTENDED_FORMAT_MARKER);
    let decoded = Transaction::extended_decode(&bytes).expect("decode");
    assert_eq!(decoded, tx);
    assert_eq!(decoded.vin[0].previous_satoshis, 60_000);
}

#[test]
fn txid_is_stable_across_encodings() {
    let tx = two_in_two_out();
    let standard = tx.txid();
    let roundtripped =
        Transaction::extended_decode(&tx.extended_encode()).expect("decode");
    assert_eq!(roundtripped.txid(), standard);
}

#[test]
fn decoder_tracks_remaining_bytes() {
    let mut encoder = Encoder::new();
    encoder.write_varint(300);
    encoder.write_var_bytes(b"abc");
    let bytes = encoder.into_inner();

    let mut decoder = Decoder::new(&bytes);
    assert_eq!(decoder.read_varint().expect("varint"), 300);
    assert_eq!(decoder.read_var_bytes().expect("bytes"), b"abc".to_vec());
    assert!(decoder.is_empty());
    assert_eq!(decoder.remaining(), 0);
}
