// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Settlement engine for a tokenized asset protocol layered on a
//! bitcoin-family UTXO ledger. Token ownership lives in server-maintained
//! holdings keyed by `(contract, asset, party)`; state changes are driven by
//! on-chain transactions carrying protocol payloads in data-only outputs.
//! The engine validates incoming requests against persistent state, composes
//! and signs response transactions, and coordinates multi-contract transfers
//! through a boomerang-funded off-chain relay that collects every contract's
//! settlement contribution and signatures onto a single settlement tx.

#![allow(clippy::too_many_arguments)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

pub mod chain;
pub mod config;
pub mod constants;
mod error;
pub mod handlers;
pub mod holdings;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod spynode;
pub mod state;
pub mod storage;
pub mod wallet;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use error::BootstrapError;
