// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Concurrent holdings cache with asynchronous write-behind persistence.
//!
//! The cache exclusively owns the in-memory holdings. Readers always get a
//! deep copy, so cached state cannot be mutated except through [`HoldingsCache::save`],
//! which replaces the cached record and marks the slot modified. `save`
//! returns a [`CacheItem`] token; posting it to the [`CacheChannel`] hands
//! the slot to the writer worker. The outer mutex guards only
//! lookup/insertion; each slot serializes its own mutations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use super::{clear_expired, storage, Holding};
use crate::chain::{Hash20, RawAddress};
use crate::node::ShutdownToken;
use crate::protocol::{AssetCode, Timestamp};
use crate::storage::{Storage, StorageError};

/// Cache failures.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum CacheError {
    /// storage failure underneath the cache: {0}.
    #[from]
    Storage(StorageError),
}

struct Slot {
    holding: Holding,
    modified: bool,
}

type SlotMap = HashMap<Hash20, HashMap<AssetCode, HashMap<Hash20, Arc<Mutex<Slot>>>>>;

/// Write-behind cache over every holding this node has touched.
pub struct HoldingsCache {
    storage: Arc<dyn Storage>,
    slots: Mutex<SlotMap>,
}

/// Token identifying a modified slot, to be posted to the writer channel.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CacheItem {
    pub contract: Hash20,
    pub asset_code: AssetCode,
    pub address: Hash20,
}

impl HoldingsCache {
    pub fn new(storage: Arc<dyn Storage>) -> HoldingsCache {
        HoldingsCache {
            storage,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(
        &self,
        contract: &Hash20,
        asset_code: &AssetCode,
        address: &Hash20,
    ) -> Option<Arc<Mutex<Slot>>> {
        let slots = self.slots.lock().expect("cache mutex poisoned");
        slots
            .get(contract)?
            .get(asset_code)?
            .get(address)
            .map(Arc::clone)
    }

    fn insert_slot(
        &self,
        contract: Hash20,
        asset_code: AssetCode,
        address: Hash20,
        slot: Slot,
    ) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().expect("cache mutex poisoned");
        let entry = slots
            .entry(contract)
            .or_default()
            .entry(asset_code)
            .or_default()
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(slot)));
        Arc::clone(entry)
    }

    /// Fetches the holding of `party` for `asset_code` under `contract`,
    /// pulling it into the cache on first touch. A holding that was never
    /// persisted starts with zero balances. The returned record is a deep
    /// copy with expired enforcement statuses stripped.
    pub fn get_holding(
        &self,
        contract: &RawAddress,
        asset_code: &AssetCode,
        party: &RawAddress,
        now: Timestamp,
    ) -> Result<Holding, CacheError> {
        let contract_hash = contract.hash();
        let address_hash = party.hash();

        if let Some(slot) = self.slot(&contract_hash, asset_code, &address_hash) {
            let locked = slot.lock().expect("cache slot mutex poisoned");
            let mut copy = locked.holding.clone();
            drop(locked);
            clear_expired(&mut copy, now);
            return Ok(copy);
        }

        let holding = match storage::fetch(&*self.storage, &contract_hash, asset_code, &address_hash)?
        {
            Some(holding) => holding,
            None => Holding::new(*party, now),
        };

        let slot = self.insert_slot(contract_hash, *asset_code, address_hash, Slot {
            holding,
            modified: false,
        });
        let locked = slot.lock().expect("cache slot mutex poisoned");
        let mut copy = locked.holding.clone();
        drop(locked);
        clear_expired(&mut copy, now);
        Ok(copy)
    }

    /// Replaces the cached holding with `holding` and marks the slot
    /// modified. The returned token must be posted to the cache channel
    /// (or written synchronously through [`HoldingsCache::write_item`]).
    pub fn save(
        &self,
        contract: &RawAddress,
        asset_code: &AssetCode,
        holding: &Holding,
    ) -> CacheItem {
        let contract_hash = contract.hash();
        let address_hash = holding.address.hash();

        let slot = match self.slot(&contract_hash, asset_code, &address_hash) {
            Some(slot) => {
                let mut locked = slot.lock().expect("cache slot mutex poisoned");
                locked.holding = holding.clone();
                locked.modified = true;
                drop(locked);
                slot
            }
            None => self.insert_slot(contract_hash, *asset_code, address_hash, Slot {
                holding: holding.clone(),
                modified: true,
            }),
        };
        drop(slot);

        CacheItem {
            contract: contract_hash,
            asset_code: *asset_code,
            address: address_hash,
        }
    }

    /// Persists the slot named by `item` if it is still marked modified.
    pub fn write_item(&self, item: &CacheItem) -> Result<(), CacheError> {
        let slot = match self.slot(&item.contract, &item.asset_code, &item.address) {
            Some(slot) => slot,
            None => return Ok(()), // evicted or never cached; nothing to write
        };
        let mut locked = slot.lock().expect("cache slot mutex poisoned");
        if !locked.modified {
            return Ok(());
        }
        storage::write(
            &*self.storage,
            &item.contract,
            &item.asset_code,
            &item.address,
            &locked.holding,
        )?;
        locked.modified = false;
        Ok(())
    }

    /// Synchronously flushes every modified slot.
    pub fn write_cache(&self) -> Result<(), CacheError> {
        let slots: Vec<(CacheItem, Arc<Mutex<Slot>>)> = {
            let map = self.slots.lock().expect("cache mutex poisoned");
            map.iter()
                .flat_map(|(contract, assets)| {
                    assets.iter().flat_map(move |(asset_code, holdings)| {
                        holdings.iter().map(move |(address, slot)| {
                            (
                                CacheItem {
                                    contract: *contract,
                                    asset_code: *asset_code,
                                    address: *address,
                                },
                                Arc::clone(slot),
                            )
                        })
                    })
                })
                .collect()
        };

        for (item, slot) in slots {
            let mut locked = slot.lock().expect("cache slot mutex poisoned");
            if !locked.modified {
                continue;
            }
            storage::write(
                &*self.storage,
                &item.contract,
                &item.asset_code,
                &item.address,
                &locked.holding,
            )?;
            locked.modified = false;
        }
        Ok(())
    }
}

/// Channel feeding modified-slot tokens to the writer worker.
#[derive(Clone)]
pub struct CacheChannel {
    sender: Sender<CacheItem>,
}

impl CacheChannel {
    pub fn new() -> (CacheChannel, Receiver<CacheItem>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (CacheChannel { sender }, receiver)
    }

    /// Queues a slot for persistence. A full or closed channel means the
    /// writer worker is gone, which the daemon treats as fatal.
    pub fn add(&self, item: CacheItem) {
        if let Err(err) = self.sender.send(item) {
            error!("Cache writer channel is dead: {}", err);
        }
    }
}

/// Writer worker: takes one slot at a time off the channel and persists it.
/// Exits when the channel closes or the shutdown token fires.
pub fn cache_writer(
    cache: Arc<HoldingsCache>,
    receiver: Receiver<CacheItem>,
    shutdown: ShutdownToken,
) -> Result<(), CacheError> {
    for item in receiver.iter() {
        if shutdown.is_cancelled() {
            break;
        }
        cache.write_item(&item)?;
    }
    cache.write_cache()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::holdings::{add_debit, safe_balance};
    use crate::storage::MemStorage;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn demo_cache() -> HoldingsCache {
        HoldingsCache::new(Arc::new(MemStorage::new()))
    }

    fn demo_keys() -> (RawAddress, AssetCode, RawAddress) {
        (
            RawAddress::from_hash20([0xC0; 20]),
            AssetCode::from_array([0xA5; 32]),
            RawAddress::from_hash20([0x01; 20]),
        )
    }

    #[test]
    fn first_touch_creates_zero_holding() {
        let cache = demo_cache();
        let (contract, asset, party) = demo_keys();
        let holding = cache
            .get_holding(&contract, &asset, &party, Timestamp::from_nanos(1))
            .unwrap();
        assert_eq!(holding.finalized_balance, 0);
        assert_eq!(holding.pending_balance, 0);
    }

    #[test]
    fn reads_are_copies_until_saved() {
        let cache = demo_cache();
        let (contract, asset, party) = demo_keys();
        let now = Timestamp::from_nanos(1);

        let mut holding = cache.get_holding(&contract, &asset, &party, now).unwrap();
        holding.finalized_balance = 500;
        holding.pending_balance = 500;

        // unchanged in the cache until saved
        let fresh = cache.get_holding(&contract, &asset, &party, now).unwrap();
        assert_eq!(fresh.finalized_balance, 0);

        cache.save(&contract, &asset, &holding);
        let fresh = cache.get_holding(&contract, &asset, &party, now).unwrap();
        assert_eq!(fresh.finalized_balance, 500);
    }

    #[test]
    fn write_item_persists_and_clears_modified() {
        let storage = Arc::new(MemStorage::new());
        let cache = HoldingsCache::new(Arc::clone(&storage) as Arc<dyn Storage>);
        let (contract, asset, party) = demo_keys();
        let now = Timestamp::from_nanos(1);

        let mut holding = cache.get_holding(&contract, &asset, &party, now).unwrap();
        holding.finalized_balance = 500;
        holding.pending_balance = 500;
        add_debit(&mut holding, Txid::hash(b"t"), 100, false, now).unwrap();
        let item = cache.save(&contract, &asset, &holding);
        cache.write_item(&item).unwrap();

        // a fresh cache over the same storage sees the persisted state
        let cache2 = HoldingsCache::new(storage);
        let restored = cache2.get_holding(&contract, &asset, &party, now).unwrap();
        assert_eq!(restored.finalized_balance, 500);
        assert_eq!(safe_balance(&restored), 400);
    }

    #[test]
    fn slot_order_is_arrival_order() {
        let cache = demo_cache();
        let (contract, asset, party) = demo_keys();
        let now = Timestamp::from_nanos(1);

        let mut first = cache.get_holding(&contract, &asset, &party, now).unwrap();
        first.finalized_balance = 100;
        let mut second = first.clone();
        second.finalized_balance = 200;

        cache.save(&contract, &asset, &first);
        cache.save(&contract, &asset, &second);
        let fresh = cache.get_holding(&contract, &asset, &party, now).unwrap();
        assert_eq!(fresh.finalized_balance, 200);
    }
}
