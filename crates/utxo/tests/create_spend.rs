use std::sync::Arc;
use std::time::Duration;

use bsvd_blob::MemoryBlobStore;
use bsvd_consensus::{chain_params, Network};
use bsvd_primitives::outpoint::OutPoint;
use bsvd_primitives::transaction::{Transaction, TxIn, TxOut};
use bsvd_storage::memory::MemoryStore;
use bsvd_utxo::{
    CreateOptions, SpendRequest, TxMeta, UtxoSlot, UtxoStore, UtxoStoreConfig, UtxoStoreError,
};

fn test_config() -> UtxoStoreConfig {
    UtxoStoreConfig {
        batch_coalesce_window: Duration::from_millis(1),
        dah_retention_window: 5,
        creating_takeover_grace: Duration::from_millis(50),
        disable_dah_cleaner: true,
        ..Default::default()
    }
}

fn new_store(config: UtxoStoreConfig) -> (UtxoStore<MemoryStore>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let utxo_store = UtxoStore::new(
        Arc::clone(&store),
        Arc::new(MemoryBlobStore::new()),
        chain_params(Network::Regtest),
        config,
    );
    (utxo_store, store)
}

fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn make_tx(vin: Vec<TxIn>, vout: Vec<TxOut>) -> Transaction {
    Transaction {
        version: 1,
        vin,
        vout,
        lock_time: 0,
    }
}

fn coinbase_tx(height: u32, satoshis: u64) -> Transaction {
    make_tx(
        vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
            previous_satoshis: 0,
            previous_script: None,
        }],
        vec![TxOut {
            satoshis,
            script_pubkey: p2pkh_script(1),
        }],
    )
}

fn spending_tx(prev: &TxMeta, prev_outputs: &[(u32, u64, u8)], out_satoshis: u64) -> Transaction {
    let vin = prev_outputs
        .iter()
        .map(|(index, satoshis, tag)| TxIn {
            prevout: OutPoint::new(prev.tx_id, *index),
            script_sig: vec![0x00],
            sequence: u32::MAX,
            previous_satoshis: *satoshis,
            previous_script: Some(p2pkh_script(*tag)),
        })
        .collect();
    make_tx(
        vin,
        vec![TxOut {
            satoshis: out_satoshis,
            script_pubkey: p2pkh_script(9),
        }],
    )
}

fn spend_request(meta: &TxMeta, index: u32) -> SpendRequest {
    SpendRequest {
        outpoint: OutPoint::new(meta.tx_id, index),
        utxo_hash: meta.utxo_hashes[index as usize].expect("spendable output"),
    }
}

#[tokio::test]
async fn fresh_coinbase_matures_at_the_right_height() {
    let (store, _) = new_store(test_config());
    let coinbase = coinbase_tx(100, 50 * 100_000_000);
    let meta = store
        .create(&coinbase, 100, CreateOptions::default())
        .await
        .expect("create coinbase");
    assert!(meta.is_coinbase);
    assert_eq!(meta.fee, 0);
    assert_eq!(meta.total_utxos, 1);

    let spender = [0xaau8; 32];
    store.set_block_height(199);
    let err = store
        .spend(&spender, &[spend_request(&meta, 0)])
        .await
        .expect_err("immature");
    assert!(matches!(
        err,
        UtxoStoreError::CoinbaseImmature {
            spendable_at: 200,
            height: 199,
        }
    ));

    store.set_block_height(200);
    let spent = store
        .spend(&spender, &[spend_request(&meta, 0)])
        .await
        .expect("mature spend");
    assert_eq!(spent.len(), 1);
    assert_eq!(spent[0].satoshis, 50 * 100_000_000);

    let record = store
        .get(&meta.tx_id)
        .expect("get")
        .expect("record present");
    assert_eq!(record.spent_utxos, 1);
    assert_eq!(record.record_utxos, 1);
    // Fully spent; scheduled for expiry after the retention window.
    assert_eq!(record.delete_at_height, Some(200 + 5));
}

#[tokio::test]
async fn duplicate_create_returns_tx_exists() {
    let (store, _) = new_store(test_config());
    let tx = coinbase_tx(1, 5_000);
    let meta = store
        .create(&tx, 1, CreateOptions::default())
        .await
        .expect("first create");
    let before = store.get(&meta.tx_id).expect("get").expect("record");

    let err = store
        .create(&tx, 1, CreateOptions::default())
        .await
        .expect_err("duplicate");
    assert!(matches!(err, UtxoStoreError::TxExists(hash) if hash == meta.tx_id));
    // Losing creator leaves the winner's state untouched.
    let after = store.get(&meta.tx_id).expect("get").expect("record");
    assert_eq!(before, after);
}

#[tokio::test]
async fn create_rejects_zero_outputs() {
    let (store, _) = new_store(test_config());
    let tx = make_tx(
        vec![TxIn {
            prevout: OutPoint::new([1u8; 32], 0),
            script_sig: Vec::new(),
            sequence: u32::MAX,
            previous_satoshis: 1_000,
            previous_script: Some(p2pkh_script(1)),
        }],
        Vec::new(),
    );
    let err = store
        .create(&tx, 1, CreateOptions::default())
        .await
        .expect_err("no outputs");
    assert!(matches!(err, UtxoStoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn double_spend_race_has_exactly_one_winner() {
    let (store, _) = new_store(test_config());
    let coinbase = coinbase_tx(1, 10_000);
    let meta = store
        .create(&coinbase, 1, CreateOptions::default())
        .await
        .expect("create");
    store.set_block_height(101);

    let request = spend_request(&meta, 0);
    let first_requests = [request];
    let second_requests = [request];
    let (first, second) = tokio::join!(
        store.spend(&[0x01u8; 32], &first_requests),
        store.spend(&[0x02u8; 32], &second_requests),
    );
    let outcomes = [first, second];
    let winners = outcomes.iter().filter(|result| result.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = outcomes
        .iter()
        .find(|result| result.is_err())
        .expect("one loser");
    assert!(matches!(
        loser.as_ref().expect_err("loser"),
        UtxoStoreError::UtxoAlreadySpent { .. }
    ));
}

#[tokio::test]
async fn unspend_is_the_left_inverse_of_spend() {
    let (store, _) = new_store(test_config());
    let coinbase = coinbase_tx(1, 10_000);
    let meta = store
        .create(&coinbase, 1, CreateOptions::default())
        .await
        .expect("create");
    store.set_block_height(101);
    let original = store.get(&meta.tx_id).expect("get").expect("record");

    store
        .spend(&[0x01u8; 32], &[spend_request(&meta, 0)])
        .await
        .expect("spend");
    let spent = store.get(&meta.tx_id).expect("get").expect("record");
    assert_eq!(spent.spent_utxos, 1);
    assert_eq!(spent.utxos[0], UtxoSlot::Spent);
    assert!(spent.delete_at_height.is_some());

    store.unspend(&meta.tx_id, &[0]).await.expect("unspend");
    let restored = store.get(&meta.tx_id).expect("get").expect("record");
    // Byte-for-byte restoration, counters included.
    assert_eq!(restored, original);

    // Unspending an unspent output is refused.
    let err = store
        .unspend(&meta.tx_id, &[0])
        .await
        .expect_err("not spent");
    assert!(matches!(err, UtxoStoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn frozen_outputs_refuse_spends_until_unfrozen() {
    let (store, _) = new_store(test_config());
    let coinbase = coinbase_tx(1, 10_000);
    let meta = store
        .create(&coinbase, 1, CreateOptions::default())
        .await
        .expect("create");
    store.set_block_height(101);

    store.freeze(&meta.tx_id, &[0]).await.expect("freeze");
    let err = store
        .spend(&[0x01u8; 32], &[spend_request(&meta, 0)])
        .await
        .expect_err("frozen");
    assert!(matches!(err, UtxoStoreError::UtxoFrozen { index: 0, .. }));

    // Frozen outputs can still be read.
    let record = store.get(&meta.tx_id).expect("get").expect("record");
    assert_eq!(record.frozen_utxos, vec![0]);
    assert!(matches!(record.utxos[0], UtxoSlot::Unspent(_)));

    store.unfreeze(&meta.tx_id, &[0]).await.expect("unfreeze");
    store
        .spend(&[0x01u8; 32], &[spend_request(&meta, 0)])
        .await
        .expect("spend after unfreeze");
}

#[tokio::test]
async fn locked_transactions_refuse_spends_until_unlocked() {
    let (store, _) = new_store(test_config());
    let coinbase = coinbase_tx(1, 10_000);
    let options = CreateOptions {
        locked: true,
        ..Default::default()
    };
    let meta = store.create(&coinbase, 1, options).await.expect("create");
    store.set_block_height(101);

    let err = store
        .spend(&[0x01u8; 32], &[spend_request(&meta, 0)])
        .await
        .expect_err("locked");
    assert!(matches!(err, UtxoStoreError::TxLocked(_)));

    store.unlock(&meta.tx_id).await.expect("unlock");
    store
        .spend(&[0x01u8; 32], &[spend_request(&meta, 0)])
        .await
        .expect("spend after unlock");
}

#[tokio::test]
async fn conflicting_child_annotates_parents_and_refuses_spends() {
    let (store, _) = new_store(test_config());
    let parent_tx = coinbase_tx(1, 10_000);
    let parent = store
        .create(&parent_tx, 1, CreateOptions::default())
        .await
        .expect("create parent");

    let child_tx = spending_tx(&parent, &[(0, 10_000, 1)], 9_000);
    let options = CreateOptions {
        conflicting: true,
        ..Default::default()
    };
    let child = store
        .create(&child_tx, 2, options)
        .await
        .expect("create child");
    assert!(child.conflicting);

    let parent_record = store.get(&parent.tx_id).expect("get").expect("record");
    assert_eq!(parent_record.conflicting_children, vec![child.tx_id]);

    let child_record = store.get(&child.tx_id).expect("get").expect("record");
    assert!(child_record.conflicting);
    // Conflicting records are born with a delete-at-height.
    assert_eq!(child_record.delete_at_height, Some(2 + 5));

    store.set_block_height(10);
    let err = store
        .spend(&[0x01u8; 32], &[spend_request(&child, 0)])
        .await
        .expect_err("conflicting");
    assert!(matches!(err, UtxoStoreError::TxConflicting(_)));
}

#[tokio::test]
async fn wrong_expected_hash_is_not_found() {
    let (store, _) = new_store(test_config());
    let coinbase = coinbase_tx(1, 10_000);
    let meta = store
        .create(&coinbase, 1, CreateOptions::default())
        .await
        .expect("create");
    store.set_block_height(101);

    let bogus = SpendRequest {
        outpoint: OutPoint::new(meta.tx_id, 0),
        utxo_hash: [0xeeu8; 32],
    };
    let err = store
        .spend(&[0x01u8; 32], &[bogus])
        .await
        .expect_err("hash mismatch");
    assert!(matches!(err, UtxoStoreError::UtxoNotFound { .. }));
}

#[tokio::test]
async fn policy_rejected_outputs_are_never_spendable() {
    let (store, _) = new_store(test_config());
    // Two outputs: a real payment and a zero-value one the policy skips.
    let tx = make_tx(
        vec![TxIn {
            prevout: OutPoint::new([4u8; 32], 0),
            script_sig: Vec::new(),
            sequence: u32::MAX,
            previous_satoshis: 5_000,
            previous_script: Some(p2pkh_script(1)),
        }],
        vec![
            TxOut {
                satoshis: 4_000,
                script_pubkey: p2pkh_script(2),
            },
            TxOut {
                satoshis: 0,
                script_pubkey: p2pkh_script(3),
            },
        ],
    );
    let meta = store
        .create(&tx, 1, CreateOptions::default())
        .await
        .expect("create");
    assert_eq!(meta.total_utxos, 1);
    assert!(meta.utxo_hashes[0].is_some());
    assert!(meta.utxo_hashes[1].is_none());

    let record = store.get(&meta.tx_id).expect("get").expect("record");
    assert_eq!(record.utxos[1], UtxoSlot::Unspendable);
    assert_eq!(record.record_utxos, 1);
}

#[tokio::test]
async fn failed_multi_input_spend_rolls_back() {
    let (store, _) = new_store(test_config());
    let tx = make_tx(
        vec![TxIn {
            prevout: OutPoint::new([4u8; 32], 0),
            script_sig: Vec::new(),
            sequence: u32::MAX,
            previous_satoshis: 10_000,
            previous_script: Some(p2pkh_script(1)),
        }],
        vec![
            TxOut {
                satoshis: 4_000,
                script_pubkey: p2pkh_script(2),
            },
            TxOut {
                satoshis: 5_000,
                script_pubkey: p2pkh_script(3),
            },
        ],
    );
    let meta = store
        .create(&tx, 1, CreateOptions::default())
        .await
        .expect("create");
    store.set_block_height(10);

    // Second request carries a bogus hash; the first must be rolled back.
    let requests = [
        spend_request(&meta, 0),
        SpendRequest {
            outpoint: OutPoint::new(meta.tx_id, 1),
            utxo_hash: [0xddu8; 32],
        },
    ];
    let err = store
        .spend(&[0x01u8; 32], &requests)
        .await
        .expect_err("second input bogus");
    assert!(matches!(err, UtxoStoreError::UtxoNotFound { index: 1, .. }));

    let record = store.get(&meta.tx_id).expect("get").expect("record");
    assert_eq!(record.spent_utxos, 0);
    assert!(matches!(record.utxos[0], UtxoSlot::Unspent(_)));
}

#[tokio::test]
async fn reassignment_requires_freeze_and_swaps_the_hash() {
    let (store, _) = new_store(test_config());
    let coinbase = coinbase_tx(1, 10_000);
    let meta = store
        .create(&coinbase, 1, CreateOptions::default())
        .await
        .expect("create");
    store.set_block_height(101);

    let confiscation_script = p2pkh_script(0x42);
    let err = store
        .reassign(&meta.tx_id, 0, confiscation_script.clone())
        .await
        .expect_err("not frozen");
    assert!(matches!(err, UtxoStoreError::InvalidArgument(_)));

    store.freeze(&meta.tx_id, &[0]).await.expect("freeze");
    store
        .reassign(&meta.tx_id, 0, confiscation_script.clone())
        .await
        .expect("reassign");

    // The old hash no longer matches; the new-script hash spends.
    let err = store
        .spend(&[0x01u8; 32], &[spend_request(&meta, 0)])
        .await
        .expect_err("old hash");
    assert!(matches!(err, UtxoStoreError::UtxoNotFound { .. }));

    let new_hash = bsvd_utxo::utxo_hash(&meta.tx_id, 0, 10_000, &confiscation_script);
    let spent = store
        .spend(
            &[0x01u8; 32],
            &[SpendRequest {
                outpoint: OutPoint::new(meta.tx_id, 0),
                utxo_hash: new_hash,
            }],
        )
        .await
        .expect("spend reassigned");
    assert_eq!(spent[0].locking_script, confiscation_script);
}
