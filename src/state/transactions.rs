// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Raw request transactions. Relay messages arrive carrying only a transfer
//! tx id, so request transactions are persisted together with the outputs
//! they spend and re-inspected on load.

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::hex::{FromHex, ToHex};
use bitcoin::{Transaction, Txid};

use super::StateError;
use crate::chain::{ParsedTx, Utxo};
use crate::storage::Storage;

const STORAGE_KEY: &str = "txs";

#[derive(Serialize, Deserialize)]
struct StoredUtxo {
    txid: Txid,
    index: u32,
    value: u64,
    locking_script: String,
}

#[derive(Serialize, Deserialize)]
struct StoredTx {
    raw: String,
    spent_outputs: Vec<StoredUtxo>,
}

fn path(txid: &Txid) -> String {
    format!("{}/{}", STORAGE_KEY, txid)
}

/// Persists an inspected transaction, keeping the spent outputs so it can
/// be re-inspected without the funding transactions at hand.
pub fn add_tx(storage: &dyn Storage, itx: &ParsedTx) -> Result<(), StateError> {
    let stored = StoredTx {
        raw: serialize(&itx.tx).to_hex(),
        spent_outputs: itx
            .inputs
            .iter()
            .map(|input| StoredUtxo {
                txid: input.utxo.txid,
                index: input.utxo.index,
                value: input.utxo.value,
                locking_script: input.utxo.locking_script.to_hex(),
            })
            .collect(),
    };
    let data = serde_json::to_vec(&stored).map_err(|err| StateError::Record(err.to_string()))?;
    storage.put(&path(&itx.txid), &data)?;
    Ok(())
}

/// Loads and re-inspects a persisted transaction.
pub fn get_tx(storage: &dyn Storage, txid: &Txid, is_test: bool) -> Result<ParsedTx, StateError> {
    let data = storage.fetch(&path(txid))?;
    let stored: StoredTx =
        serde_json::from_slice(&data).map_err(|err| StateError::Record(err.to_string()))?;

    let raw = Vec::<u8>::from_hex(&stored.raw)
        .map_err(|err| StateError::Record(err.to_string()))?;
    let tx: Transaction =
        deserialize(&raw).map_err(|err| StateError::Record(err.to_string()))?;

    let spent_outputs = stored
        .spent_outputs
        .into_iter()
        .map(|utxo| {
            Ok(Utxo {
                txid: utxo.txid,
                index: utxo.index,
                value: utxo.value,
                locking_script: Vec::<u8>::from_hex(&utxo.locking_script)
                    .map_err(|err| StateError::Record(err.to_string()))?
                    .into(),
            })
        })
        .collect::<Result<Vec<_>, StateError>>()?;

    ParsedTx::parse(tx, spent_outputs, is_test)
        .map_err(|err| StateError::Record(err.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemStorage;
    use bitcoin::hashes::Hash;
    use bitcoin::{OutPoint, Script, TxIn, TxOut, Witness};

    #[test]
    fn stored_tx_reinspects_identically() {
        let storage = MemStorage::new();
        let funding = Txid::hash(b"funding");
        let tx = Transaction {
            version: 1,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: funding,
                    vout: 0,
                },
                script_sig: Script::new(),
                sequence: 0xffff_ffff,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: 1_000,
                script_pubkey: crate::chain::RawAddress::from_hash20([9; 20]).lock_script(),
            }],
        };
        let spent = vec![Utxo {
            txid: funding,
            index: 0,
            value: 2_000,
            locking_script: crate::chain::RawAddress::from_hash20([8; 20]).lock_script(),
        }];
        let itx = ParsedTx::parse(tx, spent, true).unwrap();

        add_tx(&storage, &itx).unwrap();
        let restored = get_tx(&storage, &itx.txid, true).unwrap();
        assert_eq!(restored, itx);
    }
}
