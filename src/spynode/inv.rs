// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use bitcoin::network::message::NetworkMessage;
use bitcoin::network::message_blockdata::Inventory;
use bitcoin::Txid;

use super::mempool::MemPool;
use super::tx_tracker::TxTracker;
use crate::constants::MAX_INV_ENTRIES;
use crate::protocol::Timestamp;

const NAME: &str = "inv";

/// Inventory handling failures.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum InvError {
    /// a single inventory item cannot fit a wire message.
    Overflow,
}

/// Appends a transaction to the get-data under construction, flushing a
/// full message and starting a new one when the protocol limit is reached.
pub(super) fn push_get_data_item(
    messages: &mut Vec<NetworkMessage>,
    items: &mut Vec<Inventory>,
    txid: Txid,
) -> Result<(), InvError> {
    if items.len() >= MAX_INV_ENTRIES {
        // message is full; emit it and start a new one
        messages.push(NetworkMessage::GetData(std::mem::take(items)));
    }
    if items.len() >= MAX_INV_ENTRIES {
        // a freshly started message still cannot take the item
        return Err(InvError::Overflow);
    }
    items.push(Inventory::Transaction(txid));
    Ok(())
}

/// Emits the final partial get-data message, if any.
pub(super) fn flush_get_data(messages: &mut Vec<NetworkMessage>, items: Vec<Inventory>) {
    if !items.is_empty() {
        messages.push(NetworkMessage::GetData(items));
    }
}

/// Handles a peer `inv` announcement. For every transaction hash the
/// mempool decides whether this peer should be asked for the body; hashes
/// already being fetched from another peer are remembered in the tracker
/// for a later re-request.
pub fn handle_inv(
    mempool: &MemPool,
    tracker: &TxTracker,
    inventory: &[Inventory],
    now: Timestamp,
) -> Result<Vec<NetworkMessage>, InvError> {
    let mut messages = vec![];
    let mut items = vec![];

    for item in inventory {
        match item {
            Inventory::Transaction(txid) => {
                let (already_have, should_request) = mempool.add_request(txid, now);
                if already_have {
                    continue;
                }
                if should_request {
                    push_get_data_item(&mut messages, &mut items, *txid)?;
                } else {
                    // another peer is on the hook; re-request from this one
                    // if the body never arrives
                    log::trace!(target: NAME, "Tracking announced tx: {}", txid);
                    tracker.add(txid, now);
                }
            }
            // blocks arrive through headers announcements
            _ => {}
        }
    }

    flush_get_data(&mut messages, items);
    Ok(messages)
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn double_announcement_single_requester() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new();
        let txid = Txid::hash(b"tx");
        let now = Timestamp::from_secs(100);

        // peer one announces: designated requester
        let messages =
            handle_inv(&mempool, &tracker, &[Inventory::Transaction(txid)], now).unwrap();
        assert_eq!(messages.len(), 1);

        // peer two announces the same hash: tracked, no duplicate get-data
        let messages =
            handle_inv(&mempool, &tracker, &[Inventory::Transaction(txid)], now).unwrap();
        assert!(messages.is_empty());
        assert_eq!(tracker.len(), 1);

        // peer one delivers within the check interval: tracking cleared
        mempool.add_tx(&txid);
        let messages = tracker.check(&mempool, now.plus_secs(1)).unwrap();
        assert!(messages.is_empty());
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn block_announcements_are_ignored() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new();
        let block = Inventory::Block(bitcoin::BlockHash::hash(b"block"));
        let messages = handle_inv(&mempool, &tracker, &[block], Timestamp::from_secs(1)).unwrap();
        assert!(messages.is_empty());
        assert_eq!(tracker.len(), 0);
    }
}
