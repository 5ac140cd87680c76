// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

/// Smallest output value accepted by the network for a spendable output.
pub const DUST_LIMIT: u64 = 546;

/// Default miner fee rate, satoshis per byte.
pub const DEFAULT_FEE_RATE: f32 = 1.0;

/// Default time allowed for peer contracts to contribute their settlement
/// data before a pending transfer is aborted, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Estimated serialized size of a signed P2PKH input.
pub const ESTIMATED_INPUT_SIZE: usize = 32 + 4 + 1 + 107 + 4;

/// Serialized size of a P2PKH output.
pub const P2PKH_OUTPUT_SIZE: usize = 8 + 1 + 25;

/// Base serialized size of a transaction (version, in/out counts, lock time).
pub const BASE_TX_SIZE: usize = 4 + 2 + 4;

/// Maximum number of inventory items allowed in a single wire message.
pub const MAX_INV_ENTRIES: usize = 50_000;

/// How long a transaction request to a single peer is allowed to remain
/// unanswered before another peer may claim it, in seconds.
pub const MEMPOOL_REQUEST_TIMEOUT_SECS: u64 = 3;

/// Interval between tracker sweeps re-requesting undelivered transactions,
/// in seconds.
pub const TX_TRACKER_SWEEP_SECS: u64 = 10;
