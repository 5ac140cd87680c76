// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::Txid;

use crate::constants::MEMPOOL_REQUEST_TIMEOUT_SECS;
use crate::protocol::Timestamp;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum RequestState {
    /// Announced; no peer has been asked yet.
    None,
    /// Requested from one peer at the given instant.
    Requested(Timestamp),
    /// Transaction body received.
    Received,
}

/// Tracks announced transactions and arbitrates which peer fetches each
/// one. A transaction is requested from exactly one peer at a time; if that
/// peer stays silent past the request timeout, the next caller is promoted
/// to requester. One mutex guards the whole table because the claim must be
/// atomic across entries.
#[derive(Debug, Default)]
pub struct MemPool {
    entries: Mutex<HashMap<Txid, RequestState>>,
}

impl MemPool {
    pub fn new() -> MemPool {
        MemPool::default()
    }

    /// Atomically claims the fetch of `txid` for the caller.
    ///
    /// Returns `(already_have, should_request)`: `(true, _)` when the body
    /// is already present; `(false, true)` when the caller is the
    /// designated requester and must emit a get-data; `(false, false)` when
    /// another peer is on the hook; remember the announcement and check
    /// back later. Concurrent callers never both get `should_request`.
    pub fn add_request(&self, txid: &Txid, now: Timestamp) -> (bool, bool) {
        let mut entries = self.entries.lock().expect("mempool mutex poisoned");
        match entries.get(txid).copied() {
            Some(RequestState::Received) => (true, false),
            Some(RequestState::Requested(at))
                if now < at.plus_secs(MEMPOOL_REQUEST_TIMEOUT_SECS) =>
            {
                (false, false)
            }
            // never requested, or the previous request timed out
            _ => {
                entries.insert(*txid, RequestState::Requested(now));
                (false, true)
            }
        }
    }

    /// Records the arrival of a transaction body. Returns false when the
    /// transaction was never announced here.
    pub fn add_tx(&self, txid: &Txid) -> bool {
        let mut entries = self.entries.lock().expect("mempool mutex poisoned");
        entries.insert(*txid, RequestState::Received).is_some()
    }

    pub fn has_tx(&self, txid: &Txid) -> bool {
        let entries = self.entries.lock().expect("mempool mutex poisoned");
        entries.get(txid) == Some(&RequestState::Received)
    }

    /// Drops entries once their transactions confirm in a block.
    pub fn remove_txs(&self, txids: &[Txid]) {
        let mut entries = self.entries.lock().expect("mempool mutex poisoned");
        for txid in txids {
            entries.remove(txid);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;
    use std::sync::Arc;

    #[test]
    fn first_caller_wins_the_claim() {
        let mempool = MemPool::new();
        let txid = Txid::hash(b"tx");
        let now = Timestamp::from_secs(100);

        assert_eq!(mempool.add_request(&txid, now), (false, true));
        assert_eq!(mempool.add_request(&txid, now), (false, false));
    }

    #[test]
    fn silent_peer_is_replaced_after_timeout() {
        let mempool = MemPool::new();
        let txid = Txid::hash(b"tx");
        let now = Timestamp::from_secs(100);

        assert_eq!(mempool.add_request(&txid, now), (false, true));
        let later = now.plus_secs(MEMPOOL_REQUEST_TIMEOUT_SECS);
        assert_eq!(mempool.add_request(&txid, later), (false, true));
    }

    #[test]
    fn received_tx_reports_already_have() {
        let mempool = MemPool::new();
        let txid = Txid::hash(b"tx");
        let now = Timestamp::from_secs(100);

        mempool.add_request(&txid, now);
        assert!(mempool.add_tx(&txid));
        assert_eq!(mempool.add_request(&txid, now), (true, false));
        assert!(mempool.has_tx(&txid));

        mempool.remove_txs(&[txid]);
        assert!(!mempool.has_tx(&txid));
    }

    #[test]
    fn concurrent_claims_produce_one_requester() {
        let mempool = Arc::new(MemPool::new());
        let txid = Txid::hash(b"race");
        let now = Timestamp::from_secs(100);

        let winners: usize = (0..8)
            .map(|_| {
                let mempool = Arc::clone(&mempool);
                std::thread::spawn(move || mempool.add_request(&txid, now).1 as usize)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }
}
