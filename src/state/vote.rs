// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use bitcoin::Txid;

use super::{StateError, Vote, STORAGE_KEY};
use crate::chain::RawAddress;
use crate::storage::Storage;

fn path(contract_address: &RawAddress, vote_tx_id: &Txid) -> String {
    format!(
        "{}/{}/votes/{}",
        STORAGE_KEY,
        contract_address.hash(),
        vote_tx_id
    )
}

/// Fetches a governance vote record.
pub fn fetch(
    storage: &dyn Storage,
    contract_address: &RawAddress,
    vote_tx_id: &Txid,
) -> Result<Vote, StateError> {
    let data = storage.fetch(&path(contract_address, vote_tx_id))?;
    serde_json::from_slice(&data).map_err(|err| StateError::Record(err.to_string()))
}

/// Persists a governance vote record on behalf of the governance engine.
pub fn save(
    storage: &dyn Storage,
    contract_address: &RawAddress,
    vote: &Vote,
) -> Result<(), StateError> {
    let data = serde_json::to_vec(vote).map_err(|err| StateError::Record(err.to_string()))?;
    storage.put(&path(contract_address, &vote.vote_tx_id), &data)?;
    Ok(())
}
