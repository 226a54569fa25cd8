//! UTXO transactions
//!
//! A transaction spends previously created outputs and locks new ones under
//! pay-to-public-key-hash scripts. It is content-addressed: `id` is the
//! SHA-256 of the canonical serialization with `id` cleared. Signing uses a
//! trimmed copy in which each input's `pub_key` field is temporarily
//! replaced by the referenced output's locking script, so the signature
//! binds both the spent output and the whole shape of the spending
//! transaction.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use embercoin_crypto::{
    hash_pub_key, parse_p2pkh_script, pub_key_hash_from_address, script, sha256,
    verify_signature, CryptoError, Keypair,
};

use crate::codec::{self, CodecError};
use crate::current_timestamp;

/// Transaction format version.
pub const TX_VERSION: u32 = 1;

/// Output index carried by the single coinbase input.
pub const COINBASE_VOUT: i32 = -1;

#[derive(Debug, Error)]
pub enum TransactionError {
    /// An input references a transaction absent from the supplied map.
    #[error("referenced transaction {0} not found")]
    PrevTxNotFound(String),

    /// An input references an output index the producing transaction
    /// does not have.
    #[error("referenced output {1} of transaction {0} does not exist")]
    PrevOutputMissing(String, i32),

    /// The referenced output is not locked by a standard P2PKH script.
    #[error("referenced output is not pay-to-public-key-hash")]
    NonStandardScript,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Kind tag carried by every transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    /// Subsidy payout, first transaction of every block.
    Coinbase,
    /// Fungible value transfer.
    Transfer,
    /// Mints a new non-fungible asset output.
    Casting,
    /// Moves an existing asset to a new owner.
    Trade,
    /// Gift transfer; consensus treats it exactly like [`TxType::Transfer`].
    Handsel,
    /// Re-locks an asset under an unspendable script.
    Destroy,
}

/// What an input spends: fungible tokens or a non-fungible asset output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefType {
    Token,
    Asset,
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the producing transaction; empty for coinbase.
    pub prev_tx_id: Vec<u8>,

    /// Output index inside the producing transaction; −1 for coinbase.
    pub vout_index: i32,

    /// `r || s` ECDSA signature over the trimmed-copy digest.
    pub signature: Vec<u8>,

    /// Spender's raw `X || Y` public key. Coinbase inputs reuse the field
    /// for arbitrary data instead.
    pub pub_key: Vec<u8>,

    /// Whether the referenced output is fungible or an asset.
    pub ref_type: RefType,
}

impl TxInput {
    pub fn new(prev_tx_id: Vec<u8>, vout_index: i32, pub_key: Vec<u8>, ref_type: RefType) -> Self {
        TxInput {
            prev_tx_id,
            vout_index,
            signature: Vec::new(),
            pub_key,
            ref_type,
        }
    }

    /// Whether this input's public key hashes to `pub_key_hash`.
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(&self.pub_key) == pub_key_hash
    }
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Fungible amount; 0 for asset outputs.
    pub value: f64,

    /// Asset identifier; `None` for fungible outputs.
    pub asset_id: Option<Vec<u8>>,

    /// The full P2PKH locking script bytes.
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    /// A fungible output locked to `address`.
    pub fn new(value: f64, address: &str) -> Result<TxOutput, TransactionError> {
        let mut output = TxOutput {
            value,
            asset_id: None,
            pub_key_hash: Vec::new(),
        };
        output.lock(address)?;
        Ok(output)
    }

    /// An asset output (zero value) locked to `address`.
    pub fn new_asset(asset_id: Vec<u8>, address: &str) -> Result<TxOutput, TransactionError> {
        let mut output = TxOutput {
            value: 0.0,
            asset_id: Some(asset_id),
            pub_key_hash: Vec::new(),
        };
        output.lock(address)?;
        Ok(output)
    }

    /// Replace the locking script with one committing to `address`.
    pub fn lock(&mut self, address: &str) -> Result<(), TransactionError> {
        let hash = pub_key_hash_from_address(address)?;
        self.pub_key_hash = script::build_p2pkh_script(&hash);
        Ok(())
    }

    /// Whether the locking script commits to `pub_key_hash`. Non-P2PKH
    /// scripts are locked to nobody.
    pub fn is_locked_with(&self, pub_key_hash: &[u8]) -> bool {
        parse_p2pkh_script(&self.pub_key_hash) == Some(pub_key_hash)
    }

    /// Fungible outputs carry positive value and no asset id.
    pub fn is_fungible(&self) -> bool {
        self.value > 0.0 && self.asset_id.is_none()
    }
}

/// The unspent outputs of one transaction, keyed by original output index.
///
/// Stored as a whole under `utxo-<txid>`; keying by the original index keeps
/// spend references valid after the list has been partially pruned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxOutputs {
    pub outputs: BTreeMap<u32, TxOutput>,
}

impl TxOutputs {
    pub fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<TxOutputs, CodecError> {
        codec::decode(bytes)
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Content address: SHA-256 of the serialization with `id` cleared.
    pub id: Vec<u8>,

    pub vin: Vec<TxInput>,
    pub vout: Vec<TxOutput>,
    pub trans_type: TxType,

    // Metadata; not consensus-critical but bound by the id.
    pub status: i32,
    pub fee: f64,
    pub created_time: i64,
    pub expire_time: i64,
    pub lock_time: i64,
    pub version: u32,
}

impl Transaction {
    /// Assemble a transaction, stamping `created_time` and `id`.
    pub fn new(
        vin: Vec<TxInput>,
        vout: Vec<TxOutput>,
        trans_type: TxType,
    ) -> Result<Transaction, TransactionError> {
        let mut tx = Transaction {
            id: Vec::new(),
            vin,
            vout,
            trans_type,
            status: 0,
            fee: 0.0,
            created_time: current_timestamp(),
            expire_time: 0,
            lock_time: 0,
            version: TX_VERSION,
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Build the coinbase paying `value` to `address`. `data` is embedded in
    /// the input's `pub_key` field (the genesis block carries its motto
    /// there).
    pub fn new_coinbase(
        address: &str,
        data: &[u8],
        value: f64,
    ) -> Result<Transaction, TransactionError> {
        let input = TxInput {
            prev_tx_id: Vec::new(),
            vout_index: COINBASE_VOUT,
            signature: Vec::new(),
            pub_key: data.to_vec(),
            ref_type: RefType::Token,
        };
        let output = TxOutput::new(value, address)?;
        Transaction::new(vec![input], vec![output], TxType::Coinbase)
    }

    /// A transaction is coinbase iff it has exactly one input with an empty
    /// reference and the −1 index sentinel.
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1
            && self.vin[0].prev_tx_id.is_empty()
            && self.vin[0].vout_index == COINBASE_VOUT
    }

    /// Content hash: SHA-256 over the canonical serialization with `id`
    /// cleared. Depends on every field except `id` itself.
    pub fn hash(&self) -> Result<Vec<u8>, CodecError> {
        let mut cleared = self.clone();
        cleared.id = Vec::new();
        Ok(sha256(&codec::encode(&cleared)?))
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction, CodecError> {
        codec::decode(bytes)
    }

    /// Copy with signatures and public keys stripped from every input.
    /// Signing and verification both derive their digests from this copy.
    fn trimmed_copy(&self) -> Transaction {
        let vin = self
            .vin
            .iter()
            .map(|input| TxInput {
                prev_tx_id: input.prev_tx_id.clone(),
                vout_index: input.vout_index,
                signature: Vec::new(),
                pub_key: Vec::new(),
                ref_type: input.ref_type,
            })
            .collect();
        Transaction {
            id: self.id.clone(),
            vin,
            vout: self.vout.clone(),
            trans_type: self.trans_type,
            status: self.status,
            fee: self.fee,
            created_time: self.created_time,
            expire_time: self.expire_time,
            lock_time: self.lock_time,
            version: self.version,
        }
    }

    /// Resolve the output an input spends out of `prev`.
    fn referenced_output<'a>(
        input: &TxInput,
        prev: &'a HashMap<Vec<u8>, Transaction>,
    ) -> Result<&'a TxOutput, TransactionError> {
        let prev_tx = prev
            .get(&input.prev_tx_id)
            .ok_or_else(|| TransactionError::PrevTxNotFound(hex::encode(&input.prev_tx_id)))?;
        usize::try_from(input.vout_index)
            .ok()
            .and_then(|index| prev_tx.vout.get(index))
            .ok_or_else(|| {
                TransactionError::PrevOutputMissing(
                    hex::encode(&input.prev_tx_id),
                    input.vout_index,
                )
            })
    }

    /// Sign every input with `keypair`. `prev` must cover each input's
    /// producing transaction. For each input the trimmed copy temporarily
    /// carries the referenced locking script in `pub_key`, the digest is the
    /// hash of that shape, and the resulting `r || s` signature lands in the
    /// real input. The input's own `pub_key` keeps the signer's key so that
    /// verifiers can recover it.
    pub fn sign(
        &mut self,
        keypair: &Keypair,
        prev: &HashMap<Vec<u8>, Transaction>,
    ) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }
        let mut trimmed = self.trimmed_copy();
        for index in 0..self.vin.len() {
            let output = Self::referenced_output(&self.vin[index], prev)?;
            trimmed.vin[index].signature = Vec::new();
            trimmed.vin[index].pub_key = output.pub_key_hash.clone();
            let digest = trimmed.hash()?;
            trimmed.vin[index].pub_key = Vec::new();

            self.vin[index].signature = keypair.sign(&digest);
        }
        Ok(())
    }

    /// Verify every input against the outputs it spends. Returns `Ok(false)`
    /// when a signature or ownership check fails, an error when the
    /// references themselves are broken. Coinbase transactions are always
    /// valid.
    pub fn verify(&self, prev: &HashMap<Vec<u8>, Transaction>) -> Result<bool, TransactionError> {
        if self.is_coinbase() {
            return Ok(true);
        }
        let mut trimmed = self.trimmed_copy();
        for (index, input) in self.vin.iter().enumerate() {
            let output = Self::referenced_output(input, prev)?;
            let script_hash = parse_p2pkh_script(&output.pub_key_hash)
                .ok_or(TransactionError::NonStandardScript)?;
            if hash_pub_key(&input.pub_key) != script_hash {
                return Ok(false);
            }

            trimmed.vin[index].signature = Vec::new();
            trimmed.vin[index].pub_key = output.pub_key_hash.clone();
            let digest = trimmed.hash()?;
            trimmed.vin[index].pub_key = Vec::new();

            if !verify_signature(&input.pub_key, &input.signature, &digest) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tx {{ id: {}, type: {:?}, ins: {}, outs: {} }}",
            hex::encode(self.id.get(..8).unwrap_or(&self.id)),
            self.trans_type,
            self.vin.len(),
            self.vout.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embercoin_crypto::get_address;

    fn keyed_address() -> (Keypair, String) {
        let keypair = Keypair::random();
        let address = get_address(&keypair.public_key());
        (keypair, address)
    }

    /// A coinbase to `owner` plus a signed transfer spending it to `to`.
    fn funded_transfer(
        owner: &Keypair,
        owner_address: &str,
        to: &str,
        amount: f64,
    ) -> (Transaction, Transaction, HashMap<Vec<u8>, Transaction>) {
        let coinbase = Transaction::new_coinbase(owner_address, b"subsidy", 50.0).unwrap();

        let input = TxInput::new(coinbase.id.clone(), 0, owner.public_key(), RefType::Token);
        let outputs = vec![
            TxOutput::new(amount, to).unwrap(),
            TxOutput::new(50.0 - amount, owner_address).unwrap(),
        ];
        let mut tx = Transaction::new(vec![input], outputs, TxType::Transfer).unwrap();

        let mut prev = HashMap::new();
        prev.insert(coinbase.id.clone(), coinbase.clone());
        tx.sign(owner, &prev).unwrap();
        (coinbase, tx, prev)
    }

    #[test]
    fn coinbase_shape() {
        let (_, address) = keyed_address();
        let coinbase = Transaction::new_coinbase(&address, b"genesis motto", 50.0).unwrap();

        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.vin.len(), 1);
        assert_eq!(coinbase.vin[0].vout_index, COINBASE_VOUT);
        assert!(coinbase.vin[0].prev_tx_id.is_empty());
        assert_eq!(coinbase.vin[0].pub_key, b"genesis motto");
        assert_eq!(coinbase.id.len(), 32);

        // Valid with no previous transactions at all.
        assert!(coinbase.verify(&HashMap::new()).unwrap());
    }

    #[test]
    fn non_coinbase_shape_is_detected() {
        let (owner, address) = keyed_address();
        let input = TxInput::new(vec![1; 32], 0, owner.public_key(), RefType::Token);
        let output = TxOutput::new(1.0, &address).unwrap();
        let tx = Transaction::new(vec![input], vec![output], TxType::Transfer).unwrap();
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn hash_ignores_id_but_binds_everything_else() {
        let (_, address) = keyed_address();
        let tx = Transaction::new_coinbase(&address, b"data", 50.0).unwrap();

        let mut relabeled = tx.clone();
        relabeled.id = vec![0xab; 32];
        assert_eq!(tx.hash().unwrap(), relabeled.hash().unwrap());

        let mut retyped = tx.clone();
        retyped.trans_type = TxType::Transfer;
        assert_ne!(tx.hash().unwrap(), retyped.hash().unwrap());

        let mut refeed = tx.clone();
        refeed.fee = 0.25;
        assert_ne!(tx.hash().unwrap(), refeed.hash().unwrap());

        let mut revalued = tx;
        revalued.vout[0].value += 1.0;
        assert_ne!(revalued.hash().unwrap(), revalued.id);
    }

    #[test]
    fn serialization_roundtrip() {
        let (owner, address) = keyed_address();
        let (_, to) = keyed_address();
        let (coinbase, tx, _) = funded_transfer(&owner, &address, &to, 20.0);

        for sample in [coinbase, tx] {
            let decoded = Transaction::deserialize(&sample.serialize().unwrap()).unwrap();
            assert_eq!(sample, decoded);
        }
    }

    #[test]
    fn sign_then_verify() {
        let (owner, address) = keyed_address();
        let (_, to) = keyed_address();
        let (_, tx, prev) = funded_transfer(&owner, &address, &to, 20.0);

        assert_eq!(tx.vin[0].signature.len(), 64);
        assert!(tx.verify(&prev).unwrap());
    }

    #[test]
    fn verify_rejects_mutated_output() {
        let (owner, address) = keyed_address();
        let (_, to) = keyed_address();
        let (_, mut tx, prev) = funded_transfer(&owner, &address, &to, 20.0);

        tx.vout[0].value += 5.0;
        assert!(!tx.verify(&prev).unwrap());
    }

    #[test]
    fn verify_rejects_mutated_input_reference() {
        let (owner, address) = keyed_address();
        let (_, to) = keyed_address();
        let (coinbase, mut tx, prev) = funded_transfer(&owner, &address, &to, 20.0);

        // Point at a different (nonexistent) output of the same tx.
        tx.vin[0].vout_index = 1;
        assert!(matches!(
            tx.verify(&prev),
            Err(TransactionError::PrevOutputMissing(_, 1))
        ));

        // Point at an unknown transaction.
        tx.vin[0].vout_index = 0;
        tx.vin[0].prev_tx_id = vec![0xee; 32];
        assert!(matches!(
            tx.verify(&prev),
            Err(TransactionError::PrevTxNotFound(_))
        ));
        let _ = coinbase;
    }

    #[test]
    fn verify_rejects_foreign_spender() {
        let (owner, address) = keyed_address();
        let (thief, to) = keyed_address();
        let (_, mut tx, prev) = funded_transfer(&owner, &address, &to, 20.0);

        // A different key claiming the input fails the ownership check.
        tx.vin[0].pub_key = thief.public_key();
        assert!(!tx.verify(&prev).unwrap());
    }

    #[test]
    fn outputs_lock_and_report_ownership() {
        let (owner, address) = keyed_address();
        let output = TxOutput::new(3.5, &address).unwrap();

        assert!(output.is_fungible());
        assert!(output.is_locked_with(&hash_pub_key(&owner.public_key())));
        assert!(!output.is_locked_with(&[0u8; 20]));

        let asset = TxOutput::new_asset(vec![7; 32], &address).unwrap();
        assert!(!asset.is_fungible());
        assert_eq!(asset.value, 0.0);
    }
}
