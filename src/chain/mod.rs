// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Host-ledger plumbing: raw addresses, transaction inspection and response
//! transaction building on top of the `bitcoin` crate's wire types.

mod address;
mod builder;
mod inspect;

pub use address::{Hash20, RawAddress, ADDRESS_TYPE_P2PKH};
pub use builder::{BuilderError, InputSupplement, TxBuilder};
pub use inspect::{InspectError, ParsedTx, TxInput, TxOutput, Utxo};
