// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use super::{Asset, StateError, STORAGE_KEY};
use crate::chain::RawAddress;
use crate::protocol::{AssetCode, RejectCode, Timestamp};
use crate::storage::Storage;

fn path(contract_address: &RawAddress, asset_code: &AssetCode) -> String {
    format!(
        "{}/{}/assets/{}",
        STORAGE_KEY,
        contract_address.hash(),
        asset_code
    )
}

/// Retrieves the asset record for `asset_code` under `contract_address`.
pub fn retrieve(
    storage: &dyn Storage,
    contract_address: &RawAddress,
    asset_code: &AssetCode,
) -> Result<Asset, StateError> {
    let data = storage.fetch(&path(contract_address, asset_code))?;
    serde_json::from_slice(&data).map_err(|err| StateError::Record(err.to_string()))
}

/// Persists the asset record. Asset issuance lives outside the settlement
/// core; this is used at bootstrap and by the test harness.
pub fn save(
    storage: &dyn Storage,
    contract_address: &RawAddress,
    asset_code: &AssetCode,
    asset: &Asset,
) -> Result<(), StateError> {
    let data = serde_json::to_vec(asset).map_err(|err| StateError::Record(err.to_string()))?;
    storage.put(&path(contract_address, asset_code), &data)?;
    Ok(())
}

/// Checks that the asset may move at all right now. Returns the rejection
/// code barring it, if any.
pub fn transfer_gate(asset: &Asset, now: Timestamp) -> Option<RejectCode> {
    if !asset.freeze_period.is_zero() && asset.freeze_period > now {
        return Some(RejectCode::HoldingsFrozen);
    }
    None
}
