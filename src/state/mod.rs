// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Persistent node state besides holdings: contract and asset records
//! (read-only to the settlement core), pending multi-contract transfers,
//! governance votes, and the raw transactions the relay needs to re-load.

pub mod asset;
pub mod contract;
pub mod transactions;
pub mod transfer;
pub mod vote;

use bitcoin::Txid;

use crate::chain::RawAddress;
use crate::protocol::Timestamp;
use crate::storage::StorageError;

pub(crate) const STORAGE_KEY: &str = "contracts";

/// State store failures.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum StateError {
    /// record not found.
    NotFound,

    /// storage failure: {0}.
    Storage(StorageError),

    /// malformed state record: {0}.
    Record(String),
}

impl From<StorageError> for StateError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => StateError::NotFound,
            other => StateError::Storage(other),
        }
    }
}

/// On-chain contract state consumed by the settlement core.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Contract {
    pub address: RawAddress,
    pub administration_address: RawAddress,
    /// Fee in satoshis this contract charges per settlement.
    pub contract_fee: u64,
    /// Set once the contract has been moved to a successor address.
    pub moved_to: Option<RawAddress>,
    /// Processing is suspended until this instant; zero when not frozen.
    pub freeze_period: Timestamp,
    /// Contract lifetime end; zero for no expiration.
    pub expiration: Timestamp,
}

/// Per-asset state consumed by the settlement core.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Asset {
    pub transfers_permitted: bool,
    /// Asset-level freeze; zero when not frozen.
    pub freeze_period: Timestamp,
}

/// A live multi-contract transfer this contract initiated, awaiting the
/// settlement broadcast or an abort.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PendingTransfer {
    pub transfer_tx_id: Txid,
    pub timeout: Timestamp,
}

/// A governance vote record. Read-only to the settlement core; persisted
/// here so the storage layout stays in one place.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Vote {
    pub vote_tx_id: Txid,
    pub completed_at: Timestamp,
}
