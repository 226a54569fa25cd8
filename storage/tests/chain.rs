//! Chain and UTXO index behavior against a real (temporary) database.

use std::collections::HashMap;
use std::sync::Arc;

use embercoin_consensus::{create_block, new_genesis_block};
use embercoin_core::{RefType, Transaction, TxInput, TxOutput, TxType};
use embercoin_crypto::{get_address, hash_pub_key, Keypair};
use embercoin_storage::{ChainStore, StoreError, UtxoIndex};

fn funded_chain(owner: &Keypair, value: f64) -> (tempfile::TempDir, Arc<ChainStore>, UtxoIndex) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ChainStore::open(dir.path().join("blocks")).unwrap());
    let utxo = UtxoIndex::new(Arc::clone(&store));

    let address = get_address(&owner.public_key());
    let coinbase = Transaction::new_coinbase(&address, b"genesis", value).unwrap();
    let genesis = new_genesis_block(coinbase).unwrap();
    store.initialize(&genesis).unwrap();
    utxo.compute().unwrap();
    (dir, store, utxo)
}

fn coinbase_to(owner: &Keypair, tag: &str, value: f64) -> Transaction {
    let address = get_address(&owner.public_key());
    Transaction::new_coinbase(&address, tag.as_bytes(), value).unwrap()
}

/// Build and sign a transfer of `amount` from `from` to `to` against the
/// current UTXO index.
fn transfer(
    store: &ChainStore,
    utxo: &UtxoIndex,
    from: &Keypair,
    to: &str,
    amount: f64,
) -> Transaction {
    let pub_key_hash = hash_pub_key(&from.public_key());
    let (accumulated, spendable) = utxo.find_spendable_outputs(&pub_key_hash, amount).unwrap();
    assert!(accumulated >= amount, "fixture lacks funds");

    let mut inputs = Vec::new();
    for (txid, indexes) in &spendable {
        for &index in indexes {
            inputs.push(TxInput::new(
                txid.clone(),
                index as i32,
                from.public_key(),
                RefType::Token,
            ));
        }
    }
    let from_address = get_address(&from.public_key());
    let mut outputs = vec![TxOutput::new(amount, to).unwrap()];
    if accumulated > amount {
        outputs.push(TxOutput::new(accumulated - amount, &from_address).unwrap());
    }
    let mut tx = Transaction::new(inputs, outputs, TxType::Transfer).unwrap();

    let mut prev = HashMap::new();
    for input in &tx.vin {
        let prev_tx = store.find_transaction(&input.prev_tx_id).unwrap().unwrap();
        prev.insert(prev_tx.id.clone(), prev_tx);
    }
    tx.sign(from, &prev).unwrap();
    tx
}

fn balance(utxo: &UtxoIndex, key: &Keypair) -> f64 {
    utxo.outputs_locked_with(&hash_pub_key(&key.public_key()))
        .unwrap()
        .iter()
        .filter(|output| output.is_fungible())
        .map(|output| output.value)
        .sum()
}

#[test]
fn heights_and_iteration_after_sequential_mining() {
    let miner = Keypair::random();
    let (_dir, store, utxo) = funded_chain(&miner, 50.0);

    for round in 0..3 {
        let block = store
            .mine_block(vec![coinbase_to(&miner, &format!("round-{round}"), 50.0)])
            .unwrap();
        utxo.update(&block).unwrap();
    }

    assert_eq!(store.get_best_height().unwrap(), 4);

    let blocks: Vec<_> = store
        .iter()
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(blocks.len(), 4);
    assert_eq!(blocks.first().unwrap().height, 4);
    assert!(blocks.last().unwrap().prev_hash.is_empty());
    assert_eq!(blocks.last().unwrap().height, 1);
}

#[test]
fn block_hash_listing_is_ascending_and_bounded() {
    let miner = Keypair::random();
    let (_dir, store, utxo) = funded_chain(&miner, 50.0);
    for round in 0..3 {
        let block = store
            .mine_block(vec![coinbase_to(&miner, &format!("round-{round}"), 50.0)])
            .unwrap();
        utxo.update(&block).unwrap();
    }

    let hashes = store.get_block_hashes(1).unwrap();
    assert_eq!(hashes.len(), 3);
    let heights: Vec<u64> = hashes
        .iter()
        .map(|hash| store.get_block(hash).unwrap().height)
        .collect();
    assert_eq!(heights, vec![2, 3, 4]);

    assert!(store.get_block_hashes(4).unwrap().is_empty());
}

#[test]
fn append_is_idempotent() {
    let miner = Keypair::random();
    let (_dir, store, utxo) = funded_chain(&miner, 50.0);

    let block = store
        .mine_block(vec![coinbase_to(&miner, "once", 50.0)])
        .unwrap();
    utxo.update(&block).unwrap();
    let before = utxo.materialized().unwrap();

    assert!(!store.add_block(&block).unwrap());
    assert_eq!(store.get_best_height().unwrap(), 2);
    assert_eq!(utxo.materialized().unwrap(), before);
}

#[test]
fn transfer_moves_balances_and_prunes_spent_outputs() {
    let alice = Keypair::random();
    let bob = Keypair::random();
    let (_dir, store, utxo) = funded_chain(&alice, 50.0);

    let bob_address = get_address(&bob.public_key());
    let tx = transfer(&store, &utxo, &alice, &bob_address, 20.0);
    let block = store
        .mine_block(vec![tx, coinbase_to(&alice, "reward", 50.0)])
        .unwrap();
    utxo.update(&block).unwrap();

    // 30 change + 50 fresh subsidy for Alice, 20 for Bob.
    assert_eq!(balance(&utxo, &alice), 80.0);
    assert_eq!(balance(&utxo, &bob), 20.0);
}

#[test]
fn incremental_index_matches_full_scan() {
    let alice = Keypair::random();
    let bob = Keypair::random();
    let (_dir, store, utxo) = funded_chain(&alice, 50.0);
    let bob_address = get_address(&bob.public_key());

    for (round, amount) in [(0, 20.0), (1, 7.5)] {
        let tx = transfer(&store, &utxo, &alice, &bob_address, amount);
        let block = store
            .mine_block(vec![tx, coinbase_to(&alice, &format!("round-{round}"), 50.0)])
            .unwrap();
        utxo.update(&block).unwrap();

        assert_eq!(utxo.materialized().unwrap(), utxo.find_utxo().unwrap());
    }

    // A full rebuild lands on the same mapping.
    let before = utxo.materialized().unwrap();
    utxo.compute().unwrap();
    assert_eq!(utxo.materialized().unwrap(), before);
}

#[test]
fn spendable_selection_reports_shortfall() {
    let alice = Keypair::random();
    let (_dir, _store, utxo) = funded_chain(&alice, 10.0);

    let pub_key_hash = hash_pub_key(&alice.public_key());
    let (accumulated, _) = utxo.find_spendable_outputs(&pub_key_hash, 20.0).unwrap();
    assert!(accumulated < 20.0);
}

#[test]
fn tampered_block_is_rejected() {
    let miner = Keypair::random();
    let (_dir, store, _utxo) = funded_chain(&miner, 50.0);

    let tip = store.tip_hash();
    let mut block = create_block(vec![coinbase_to(&miner, "tamper", 50.0)], tip, 2).unwrap();
    block.transactions[0].vout[0].value += 1.0;

    assert!(matches!(
        store.add_block(&block),
        Err(StoreError::InvalidBlock(_))
    ));
    assert_eq!(store.get_best_height().unwrap(), 1);
}

#[test]
fn misheighted_and_unlinked_blocks_are_rejected() {
    let miner = Keypair::random();
    let (_dir, store, _utxo) = funded_chain(&miner, 50.0);
    let tip = store.tip_hash();

    let skipped = create_block(vec![coinbase_to(&miner, "skip", 50.0)], tip, 5).unwrap();
    assert!(matches!(
        store.add_block(&skipped),
        Err(StoreError::InvalidBlock(_))
    ));

    let unlinked =
        create_block(vec![coinbase_to(&miner, "stray", 50.0)], vec![0xaa; 32], 2).unwrap();
    assert!(matches!(
        store.add_block(&unlinked),
        Err(StoreError::InvalidBlock(_))
    ));
}

#[test]
fn transactions_are_found_by_full_scan() {
    let miner = Keypair::random();
    let (_dir, store, utxo) = funded_chain(&miner, 50.0);
    let block = store
        .mine_block(vec![coinbase_to(&miner, "findme", 50.0)])
        .unwrap();
    utxo.update(&block).unwrap();

    let wanted = &block.transactions[0];
    let found = store.find_transaction(&wanted.id).unwrap().unwrap();
    assert_eq!(found, *wanted);

    assert!(store.find_transaction(&[0u8; 32]).unwrap().is_none());
}

#[test]
fn asset_outputs_are_tracked_and_spendable() {
    let alice = Keypair::random();
    let (_dir, store, utxo) = funded_chain(&alice, 50.0);
    let alice_address = get_address(&alice.public_key());

    let asset_id = vec![0x5a; 32];
    let mint = Transaction::new(
        Vec::new(),
        vec![TxOutput::new_asset(asset_id.clone(), &alice_address).unwrap()],
        TxType::Casting,
    )
    .unwrap();
    let block = store
        .mine_block(vec![mint.clone(), coinbase_to(&alice, "mint", 50.0)])
        .unwrap();
    utxo.update(&block).unwrap();

    let pub_key_hash = hash_pub_key(&alice.public_key());
    let found = utxo.is_asset_spendable(&pub_key_hash, &asset_id).unwrap();
    assert_eq!(found, Some((mint.id.clone(), 0)));

    // Asset outputs never count as spendable fungible value.
    let (accumulated, _) = utxo.find_spendable_outputs(&pub_key_hash, 1000.0).unwrap();
    assert_eq!(accumulated, 100.0);
}
