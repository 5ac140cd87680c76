// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Peer-announcement plumbing: de-duplicates `inv` announcements across
//! peers and guarantees that every announced transaction is fetched at
//! least once even when the first peer asked goes silent.

mod inv;
mod mempool;
mod tx_tracker;

pub use inv::{handle_inv, InvError};
pub use mempool::MemPool;
pub use tx_tracker::TxTracker;
