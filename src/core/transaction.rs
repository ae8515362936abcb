// Value-transfer transactions: inputs spend earlier outputs, outputs lock value
// to a public-key hash. Identity is the SHA-256 of the encoding with `id` cleared.

use crate::error::{BlockchainError, Result};
use crate::storage::UTXOSet;
use crate::utils::{
    deserialize, ecdsa_p256_sha256_sign, ecdsa_p256_sha256_sign_verify, serialize, sha256_digest,
};
use crate::wallet::{hash_pub_key, pub_key_hash_from_address, Wallet};
use data_encoding::HEXLOWER;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Reward paid by a coinbase transaction.
pub const SUBSIDY: u64 = 10;

/// Output index marking a coinbase input.
pub const COINBASE_VOUT: i64 = -1;

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXInput {
    txid: Vec<u8>,
    vout: i64,
    signature: Vec<u8>,
    // spender's X ‖ Y public key; coinbase inputs carry arbitrary data here
    pub_key: Vec<u8>,
}

impl TXInput {
    pub fn new(txid: &[u8], vout: i64) -> TXInput {
        TXInput {
            txid: txid.to_vec(),
            vout,
            signature: vec![],
            pub_key: vec![],
        }
    }

    pub fn with_key(txid: &[u8], vout: i64, pub_key: &[u8]) -> TXInput {
        TXInput {
            pub_key: pub_key.to_vec(),
            ..TXInput::new(txid, vout)
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_vout(&self) -> i64 {
        self.vout
    }

    /// The referenced output index, `None` for the coinbase marker.
    pub fn output_index(&self) -> Option<usize> {
        usize::try_from(self.vout).ok()
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }

    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(self.pub_key.as_slice()).eq(pub_key_hash)
    }

    #[cfg(test)]
    pub(crate) fn signature_mut(&mut self) -> &mut Vec<u8> {
        &mut self.signature
    }

    #[cfg(test)]
    pub(crate) fn set_pub_key(&mut self, pub_key: &[u8]) {
        self.pub_key = pub_key.to_vec();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    /// Creates an output locked to `address`.
    pub fn new(value: u64, address: &str) -> Result<TXOutput> {
        Ok(TXOutput {
            value,
            pub_key_hash: pub_key_hash_from_address(address)?,
        })
    }

    pub fn new_locked(value: u64, pub_key_hash: &[u8]) -> TXOutput {
        TXOutput {
            value,
            pub_key_hash: pub_key_hash.to_vec(),
        }
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }
}

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    id: Vec<u8>,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
}

impl Transaction {
    /// Builds an unsigned transaction and assigns its id.
    pub fn new(vin: Vec<TXInput>, vout: Vec<TXOutput>) -> Result<Transaction> {
        let mut tx = Transaction {
            id: vec![],
            vin,
            vout,
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Reward transaction paying `SUBSIDY` to `to`.
    ///
    /// `data` fills the input's key field; random data is used when absent so
    /// two coinbases to the same address still get distinct ids.
    pub fn new_coinbase_tx(to: &str, data: Option<&str>) -> Result<Transaction> {
        let data = match data {
            Some(data) => data.to_string(),
            None => Uuid::new_v4().simple().to_string(),
        };
        let txin = TXInput::with_key(&[], COINBASE_VOUT, data.as_bytes());
        let txout = TXOutput::new(SUBSIDY, to)?;
        Transaction::new(vec![txin], vec![txout])
    }

    /// Transfers `amount` from `wallet` to `to`, paying change back to the
    /// wallet's own address.
    pub fn new_utxo_transaction(
        wallet: &Wallet,
        to: &str,
        amount: u64,
        utxo_set: &UTXOSet,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(BlockchainError::Transaction(
                "Amount must be positive".to_string(),
            ));
        }
        let to_output = TXOutput::new(amount, to)?;

        let public_key_hash = hash_pub_key(wallet.get_public_key());
        let (accumulated, valid_outputs) =
            utxo_set.find_spendable_outputs(public_key_hash.as_slice(), amount)?;
        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let mut sources: Vec<(String, Vec<usize>)> = valid_outputs.into_iter().collect();
        sources.sort();

        let mut inputs = vec![];
        for (txid_hex, outs) in sources {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Serialization(format!("Invalid transaction ID: {e}"))
            })?;
            for out in outs {
                let vout = i64::try_from(out).map_err(|_| {
                    BlockchainError::Transaction(format!("Output index {out} out of range"))
                })?;
                inputs.push(TXInput::with_key(&txid, vout, wallet.get_public_key()));
            }
        }

        let mut outputs = vec![to_output];
        if accumulated > amount {
            outputs.push(TXOutput::new_locked(
                accumulated - amount,
                public_key_hash.as_slice(),
            ));
        }

        let mut tx = Transaction {
            id: vec![],
            vin: inputs,
            vout: outputs,
        };
        utxo_set.get_blockchain().sign_transaction(&mut tx, wallet)?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].txid.is_empty() && self.vin[0].vout == COINBASE_VOUT
    }

    /// Copy with every input's signature and public key cleared, and no id.
    pub fn trimmed_copy(&self) -> Transaction {
        Transaction {
            id: vec![],
            vin: self
                .vin
                .iter()
                .map(|input| TXInput::new(input.get_txid(), input.get_vout()))
                .collect(),
            vout: self.vout.clone(),
        }
    }

    /// The text each input signature covers: hex of the trimmed copy plus a newline.
    fn signing_payload(tx_copy: &Transaction) -> Result<Vec<u8>> {
        let encoded = tx_copy.serialize()?;
        Ok(format!("{}\n", HEXLOWER.encode(&encoded)).into_bytes())
    }

    /// Resolves the output an input spends from `prev_txs` (keyed by hex id).
    fn referenced_output<'p>(
        input: &TXInput,
        prev_txs: &'p HashMap<String, Transaction>,
    ) -> Result<&'p TXOutput> {
        let txid_hex = HEXLOWER.encode(input.get_txid());
        let prev_tx = prev_txs.get(&txid_hex).ok_or_else(|| {
            BlockchainError::NotFound(format!("Previous transaction {txid_hex}"))
        })?;
        input
            .output_index()
            .and_then(|idx| prev_tx.vout.get(idx))
            .ok_or_else(|| {
                BlockchainError::Transaction(format!(
                    "Output {} does not exist in transaction {txid_hex}",
                    input.get_vout()
                ))
            })
    }

    /// Signs every input and then assigns the id over the signed transaction.
    pub fn sign(&mut self, pkcs8: &[u8], prev_txs: &HashMap<String, Transaction>) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut tx_copy = self.trimmed_copy();
        for (idx, vin) in self.vin.iter_mut().enumerate() {
            let prev_output = Self::referenced_output(vin, prev_txs)?;

            tx_copy.vin[idx].signature = vec![];
            tx_copy.vin[idx].pub_key = prev_output.pub_key_hash.clone();
            let payload = Self::signing_payload(&tx_copy)?;
            tx_copy.vin[idx].pub_key = vec![];

            vin.signature = ecdsa_p256_sha256_sign(pkcs8, &payload)?;
        }
        self.id = self.hash()?;
        Ok(())
    }

    /// Whether the stored id is the hash of the transaction's content.
    pub fn has_valid_id(&self) -> Result<bool> {
        Ok(self.id == self.hash()?)
    }

    /// Checks the id, then every input's signature against the outputs it
    /// spends.
    ///
    /// A missing previous transaction is an error, not a failed verification.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool> {
        if !self.has_valid_id()? {
            warn!(
                "Transaction {} does not hash to its id",
                HEXLOWER.encode(&self.id)
            );
            return Ok(false);
        }
        if self.is_coinbase() {
            return Ok(true);
        }

        let mut tx_copy = self.trimmed_copy();
        for (idx, vin) in self.vin.iter().enumerate() {
            let prev_output = match Self::referenced_output(vin, prev_txs) {
                Ok(output) => output,
                Err(BlockchainError::Transaction(msg)) => {
                    warn!("Rejecting transaction: {msg}");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };

            if !vin.uses_key(prev_output.get_pub_key_hash()) {
                warn!(
                    "Input {idx} of {} presents a key that does not unlock its output",
                    HEXLOWER.encode(&self.id)
                );
                return Ok(false);
            }

            tx_copy.vin[idx].signature = vec![];
            tx_copy.vin[idx].pub_key = prev_output.pub_key_hash.clone();
            let payload = Self::signing_payload(&tx_copy)?;
            tx_copy.vin[idx].pub_key = vec![];

            if !ecdsa_p256_sha256_sign_verify(
                vin.pub_key.as_slice(),
                vin.signature.as_slice(),
                &payload,
            ) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// SHA-256 of the encoding with `id` cleared.
    pub fn hash(&self) -> Result<Vec<u8>> {
        let tx_copy = Transaction {
            id: vec![],
            vin: self.vin.clone(),
            vout: self.vout.clone(),
        };
        Ok(sha256_digest(&tx_copy.serialize()?))
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_id_hex(&self) -> String {
        HEXLOWER.encode(&self.id)
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }

    #[cfg(test)]
    pub(crate) fn vin_mut(&mut self) -> &mut Vec<TXInput> {
        &mut self.vin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testnet::test_utils::TEST_ADDRESS;

    fn prev_map(txs: &[&Transaction]) -> HashMap<String, Transaction> {
        txs.iter()
            .map(|tx| (tx.get_id_hex(), (*tx).clone()))
            .collect()
    }

    /// A coinbase paying `wallet`, and a spend of its output signed by `wallet`.
    fn signed_spend(wallet: &Wallet) -> (Transaction, Transaction) {
        let funding = Transaction::new_coinbase_tx(&wallet.get_address(), None).unwrap();
        let recipient = Wallet::new().unwrap();
        let mut spend = Transaction {
            id: vec![],
            vin: vec![TXInput::with_key(
                funding.get_id(),
                0,
                wallet.get_public_key(),
            )],
            vout: vec![
                TXOutput::new(4, &recipient.get_address()).unwrap(),
                TXOutput::new(6, &wallet.get_address()).unwrap(),
            ],
        };
        spend
            .sign(wallet.get_pkcs8(), &prev_map(&[&funding]))
            .unwrap();
        (funding, spend)
    }

    #[test]
    fn test_coinbase_recognition() {
        let coinbase = Transaction::new_coinbase_tx(TEST_ADDRESS, Some("genesis")).unwrap();
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.get_vout()[0].get_value(), SUBSIDY);
        assert!(coinbase.get_vin()[0].get_signature().is_empty());
    }

    #[test]
    fn test_empty_txid_with_real_index_is_not_coinbase() {
        let out = TXOutput::new(1, TEST_ADDRESS).unwrap();
        let crafted = Transaction::new(vec![TXInput::new(&[], 0)], vec![out.clone()]).unwrap();
        assert!(!crafted.is_coinbase());

        let two_inputs = Transaction::new(
            vec![
                TXInput::new(&[], COINBASE_VOUT),
                TXInput::new(&[], COINBASE_VOUT),
            ],
            vec![out.clone()],
        )
        .unwrap();
        assert!(!two_inputs.is_coinbase());

        let real_txid =
            Transaction::new(vec![TXInput::new(&[1, 2, 3], COINBASE_VOUT)], vec![out]).unwrap();
        assert!(!real_txid.is_coinbase());
    }

    #[test]
    fn test_coinbases_get_distinct_ids() {
        let a = Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap();
        let b = Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap();
        assert_ne!(a.get_id(), b.get_id());
    }

    #[test]
    fn test_id_excludes_itself() {
        let (_, spend) = signed_spend(&Wallet::new().unwrap());
        assert_eq!(spend.get_id(), spend.hash().unwrap().as_slice());
        assert_eq!(spend.get_id().len(), 32);
    }

    #[test]
    fn test_trimmed_copy_clears_signatures_and_keys() {
        let (_, spend) = signed_spend(&Wallet::new().unwrap());
        let trimmed = spend.trimmed_copy();
        assert!(trimmed.get_id().is_empty());
        for (original, input) in spend.get_vin().iter().zip(trimmed.get_vin()) {
            assert!(input.get_signature().is_empty());
            assert!(input.get_pub_key().is_empty());
            assert_eq!(input.get_txid(), original.get_txid());
            assert_eq!(input.get_vout(), original.get_vout());
        }
        assert_eq!(trimmed.get_vout(), spend.get_vout());
    }

    #[test]
    fn test_round_trip_serialization() {
        let (funding, spend) = signed_spend(&Wallet::new().unwrap());
        for tx in [funding, spend, Transaction::default()] {
            let bytes = tx.serialize().unwrap();
            assert_eq!(Transaction::deserialize(&bytes).unwrap(), tx);
        }
    }

    #[test]
    fn test_signature_verifies() {
        let wallet = Wallet::new().unwrap();
        let (funding, spend) = signed_spend(&wallet);
        assert_eq!(spend.get_vin()[0].get_signature().len(), 64);
        assert!(spend.verify(&prev_map(&[&funding])).unwrap());
    }

    #[test]
    fn test_flipped_signature_byte_fails() {
        let (funding, spend) = signed_spend(&Wallet::new().unwrap());
        let prev = prev_map(&[&funding]);
        for position in [0usize, 31, 32, 63] {
            let mut tampered = spend.clone();
            tampered.vin_mut()[0].signature_mut()[position] ^= 0x01;
            tampered.id = tampered.hash().unwrap();
            assert!(!tampered.verify(&prev).unwrap());
        }
    }

    #[test]
    fn test_substituted_public_key_fails() {
        let (funding, spend) = signed_spend(&Wallet::new().unwrap());
        let other = Wallet::new().unwrap();
        let mut tampered = spend.clone();
        tampered.vin_mut()[0].set_pub_key(other.get_public_key());
        tampered.id = tampered.hash().unwrap();
        assert!(!tampered.verify(&prev_map(&[&funding])).unwrap());
    }

    #[test]
    fn test_altered_output_fails() {
        let (funding, spend) = signed_spend(&Wallet::new().unwrap());
        let thief = Wallet::new().unwrap();
        let mut tampered = spend.clone();
        tampered.vout[0] = TXOutput::new(4, &thief.get_address()).unwrap();
        tampered.id = tampered.hash().unwrap();
        assert!(!tampered.verify(&prev_map(&[&funding])).unwrap());
    }

    #[test]
    fn test_missing_previous_transaction_is_not_found() {
        let (_, spend) = signed_spend(&Wallet::new().unwrap());
        let result = spend.verify(&HashMap::new());
        assert!(matches!(result, Err(BlockchainError::NotFound(_))));
    }

    #[test]
    fn test_out_of_range_output_index_fails() {
        let wallet = Wallet::new().unwrap();
        let (funding, spend) = signed_spend(&wallet);
        let mut tampered = spend.clone();
        tampered.vin_mut()[0] = TXInput::with_key(funding.get_id(), 5, wallet.get_public_key());
        tampered.id = tampered.hash().unwrap();
        assert!(!tampered.verify(&prev_map(&[&funding])).unwrap());
    }

    #[test]
    fn test_coinbase_needs_no_previous_transactions() {
        let coinbase = Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap();
        assert!(coinbase.verify(&HashMap::new()).unwrap());
    }

    #[test]
    fn test_forged_id_fails() {
        let (funding, spend) = signed_spend(&Wallet::new().unwrap());
        let prev = prev_map(&[&funding]);

        let mut forged = spend.clone();
        forged.id[1] ^= 0x01;
        assert!(!forged.has_valid_id().unwrap());
        assert!(!forged.verify(&prev).unwrap());

        // reusing another transaction's id
        let mut reused = spend;
        reused.id = funding.get_id().to_vec();
        assert!(!reused.verify(&prev).unwrap());

        let mut coinbase = Transaction::new_coinbase_tx(TEST_ADDRESS, None).unwrap();
        coinbase.id = vec![0; 32];
        assert!(!coinbase.verify(&HashMap::new()).unwrap());
    }

    #[test]
    fn test_signing_payload_is_hex_text() {
        let (_, spend) = signed_spend(&Wallet::new().unwrap());
        let payload = Transaction::signing_payload(&spend.trimmed_copy()).unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text
            .trim_end()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
