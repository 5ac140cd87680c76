// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Pending multi-contract transfers. Plain key-value persistence with no
//! in-memory shadow; existence of a record means this contract is inside a
//! live transfer whose settlement has not been broadcast or aborted.

use bitcoin::Txid;

use super::{PendingTransfer, StateError, STORAGE_KEY};
use crate::chain::RawAddress;
use crate::storage::Storage;

const STORAGE_SUB_KEY: &str = "transfers";

fn path(contract_address: &RawAddress, transfer_tx_id: &Txid) -> String {
    format!(
        "{}/{}/{}/{}",
        STORAGE_KEY,
        contract_address.hash(),
        STORAGE_SUB_KEY,
        transfer_tx_id
    )
}

/// Persists a pending transfer record.
pub fn save(
    storage: &dyn Storage,
    contract_address: &RawAddress,
    transfer: &PendingTransfer,
) -> Result<(), StateError> {
    let data =
        serde_json::to_vec(transfer).map_err(|err| StateError::Record(err.to_string()))?;
    storage.put(&path(contract_address, &transfer.transfer_tx_id), &data)?;
    Ok(())
}

/// Fetches a single pending transfer.
pub fn fetch(
    storage: &dyn Storage,
    contract_address: &RawAddress,
    transfer_tx_id: &Txid,
) -> Result<PendingTransfer, StateError> {
    let data = storage.fetch(&path(contract_address, transfer_tx_id))?;
    serde_json::from_slice(&data).map_err(|err| StateError::Record(err.to_string()))
}

/// Removes a pending transfer once the settlement broadcast, a rejection
/// or a timeout resolved it.
pub fn remove(
    storage: &dyn Storage,
    contract_address: &RawAddress,
    transfer_tx_id: &Txid,
) -> Result<(), StateError> {
    storage.remove(&path(contract_address, transfer_tx_id))?;
    Ok(())
}

/// Lists all pending transfers of a contract.
pub fn list(
    storage: &dyn Storage,
    contract_address: &RawAddress,
) -> Result<Vec<PendingTransfer>, StateError> {
    let prefix = format!(
        "{}/{}/{}",
        STORAGE_KEY,
        contract_address.hash(),
        STORAGE_SUB_KEY
    );
    let mut transfers = vec![];
    for key in storage.list(&prefix)? {
        let data = storage.fetch(&key)?;
        transfers.push(
            serde_json::from_slice(&data).map_err(|err| StateError::Record(err.to_string()))?,
        );
    }
    Ok(transfers)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::Timestamp;
    use crate::storage::MemStorage;
    use bitcoin::hashes::Hash;

    #[test]
    fn save_fetch_remove() {
        let storage = MemStorage::new();
        let contract = RawAddress::from_hash20([0xC0; 20]);
        let transfer = PendingTransfer {
            transfer_tx_id: Txid::hash(b"transfer"),
            timeout: Timestamp::from_nanos(99),
        };

        save(&storage, &contract, &transfer).unwrap();
        assert_eq!(
            fetch(&storage, &contract, &transfer.transfer_tx_id).unwrap(),
            transfer
        );
        assert_eq!(list(&storage, &contract).unwrap(), vec![transfer.clone()]);

        remove(&storage, &contract, &transfer.transfer_tx_id).unwrap();
        assert_eq!(
            remove(&storage, &contract, &transfer.transfer_tx_id),
            Err(StateError::NotFound)
        );
    }
}
