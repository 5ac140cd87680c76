// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use super::{Contract, StateError, STORAGE_KEY};
use crate::chain::RawAddress;
use crate::storage::Storage;

fn path(contract_address: &RawAddress) -> String {
    format!("{}/{}/contract", STORAGE_KEY, contract_address.hash())
}

/// Retrieves the contract record for `contract_address`.
pub fn retrieve(
    storage: &dyn Storage,
    contract_address: &RawAddress,
) -> Result<Contract, StateError> {
    let data = storage.fetch(&path(contract_address))?;
    serde_json::from_slice(&data).map_err(|err| StateError::Record(err.to_string()))
}

/// Persists the contract record. Contract formation lives outside the
/// settlement core; this is used at bootstrap and by the test harness.
pub fn save(storage: &dyn Storage, contract: &Contract) -> Result<(), StateError> {
    let data =
        serde_json::to_vec(contract).map_err(|err| StateError::Record(err.to_string()))?;
    storage.put(&path(&contract.address), &data)?;
    Ok(())
}
