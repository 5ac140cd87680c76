// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Remembers transaction hashes a peer announced while another peer was
//! already being asked for them. If the chosen source never delivers, the
//! periodic sweep re-requests the hash from this peer.

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::network::message::NetworkMessage;
use bitcoin::Txid;

use super::inv::{flush_get_data, push_get_data_item, InvError};
use super::mempool::MemPool;
use crate::protocol::Timestamp;

const NAME: &str = "tx-tracker";

/// Per-peer memory of announced-but-unrequested transactions.
#[derive(Debug, Default)]
pub struct TxTracker {
    txids: Mutex<HashMap<Txid, Timestamp>>,
}

impl TxTracker {
    pub fn new() -> TxTracker {
        TxTracker::default()
    }

    /// Starts monitoring `txid` for a failed fetch elsewhere.
    pub fn add(&self, txid: &Txid, now: Timestamp) {
        let mut txids = self.txids.lock().expect("tracker mutex poisoned");
        txids.entry(*txid).or_insert(now);
    }

    /// Stops tracking delivered or confirmed transactions.
    pub fn remove(&self, txids: &[Txid]) {
        let mut tracked = self.txids.lock().expect("tracker mutex poisoned");
        for txid in txids {
            if let Some(first_seen) = tracked.remove(txid) {
                log::trace!(
                    target: NAME,
                    "Removing tracking for tx (first seen {}): {}",
                    first_seen,
                    txid
                );
            }
        }
    }

    /// Periodic sweep. Every hash still outstanding is offered to the
    /// mempool again; where the mempool promotes this node to requester, a
    /// get-data entry is emitted and the hash dropped from tracking.
    pub fn check(
        &self,
        mempool: &MemPool,
        now: Timestamp,
    ) -> Result<Vec<NetworkMessage>, InvError> {
        let mut tracked = self.txids.lock().expect("tracker mutex poisoned");

        let mut messages = vec![];
        let mut items = vec![];
        let mut resolved = vec![];
        for txid in tracked.keys() {
            let (already_have, should_request) = mempool.add_request(txid, now);
            if already_have {
                resolved.push(*txid);
            } else if should_request {
                log::debug!(target: NAME, "Re-requesting tx: {}", txid);
                push_get_data_item(&mut messages, &mut items, *txid)?;
                resolved.push(*txid);
            }
            // otherwise wait and check again later
        }
        for txid in resolved {
            tracked.remove(&txid);
        }

        flush_get_data(&mut messages, items);
        Ok(messages)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.txids.lock().expect("tracker mutex poisoned").len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::network::message_blockdata::Inventory;
    use crate::constants::MEMPOOL_REQUEST_TIMEOUT_SECS;

    #[test]
    fn delivered_tx_is_dropped_without_rerequest() {
        let tracker = TxTracker::new();
        let mempool = MemPool::new();
        let txid = Txid::hash(b"tx");
        let now = Timestamp::from_secs(100);

        // another peer got the request first
        assert_eq!(mempool.add_request(&txid, now), (false, true));
        tracker.add(&txid, now);

        // the body arrives before the sweep
        mempool.add_tx(&txid);
        let messages = tracker.check(&mempool, now.plus_secs(10)).unwrap();
        assert!(messages.is_empty());
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn silent_peer_triggers_rerequest() {
        let tracker = TxTracker::new();
        let mempool = MemPool::new();
        let txid = Txid::hash(b"tx");
        let now = Timestamp::from_secs(100);

        assert_eq!(mempool.add_request(&txid, now), (false, true));
        tracker.add(&txid, now);

        // sweep before the request timeout: keep waiting
        let messages = tracker.check(&mempool, now.plus_secs(1)).unwrap();
        assert!(messages.is_empty());
        assert_eq!(tracker.len(), 1);

        // sweep after the timeout: this node claims the fetch
        let messages = tracker
            .check(&mempool, now.plus_secs(MEMPOOL_REQUEST_TIMEOUT_SECS + 1))
            .unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            NetworkMessage::GetData(items) => {
                assert_eq!(items, &vec![Inventory::Transaction(txid)]);
            }
            other => panic!("expected get-data, got {:?}", other),
        }
        assert_eq!(tracker.len(), 0);
    }
}
