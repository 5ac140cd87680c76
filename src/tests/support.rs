// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::sync::{Arc, Mutex};

use bitcoin::hashes::Hash;
use bitcoin::{Script, Transaction, TxIn, TxOut, Txid, Witness};
use crossbeam_channel::Receiver;

use crate::chain::{ParsedTx, RawAddress, Utxo};
use crate::config::Config;
use crate::handlers::{self, Services};
use crate::holdings::{CacheChannel, CacheItem, HoldingsCache};
use crate::node::{Dispatcher, HandlerError, Responder, ShutdownToken};
use crate::protocol::{Action, AssetCode, Timestamp, Transfer};
use crate::scheduler::Scheduler;
use crate::state::{self, Asset, Contract};
use crate::storage::{MemStorage, Storage};
use crate::wallet::ContractKey;

/// Captures every broadcast response instead of sending it anywhere.
pub struct CaptureResponder {
    txs: Arc<Mutex<Vec<Transaction>>>,
}

impl Responder for CaptureResponder {
    fn respond(&self, tx: Transaction) -> Result<(), HandlerError> {
        self.txs.lock().unwrap().push(tx);
        Ok(())
    }
}

/// One contract node under test: its own storage, cache, scheduler, key
/// and dispatcher, with broadcasts captured.
pub struct TestNode {
    pub services: Arc<Services>,
    pub dispatcher: Dispatcher,
    pub responses: Arc<Mutex<Vec<Transaction>>>,
    // keeps the writer channel alive for the lifetime of the node
    _cache_receiver: Receiver<CacheItem>,
}

impl TestNode {
    pub fn new(secret: u8) -> TestNode {
        TestNode::with_timeout(secret, 3600)
    }

    pub fn with_timeout(secret: u8, request_timeout_secs: u64) -> TestNode {
        let config = Config {
            is_test: true,
            request_timeout_secs,
            ..Config::default()
        };
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let cache = Arc::new(HoldingsCache::new(Arc::clone(&storage)));
        let (cache_channel, cache_receiver) = CacheChannel::new();
        let responses = Arc::new(Mutex::new(vec![]));
        let key = ContractKey::from_secret_bytes(&[secret; 32]).unwrap();

        let services = Arc::new(Services {
            config,
            storage,
            cache,
            cache_channel,
            scheduler: Arc::new(Scheduler::start()),
            key,
            responder: Arc::new(CaptureResponder {
                txs: Arc::clone(&responses),
            }),
            shutdown: ShutdownToken::new(),
        });
        let dispatcher = handlers::api(Arc::clone(&services));

        let node = TestNode {
            services,
            dispatcher,
            responses,
            _cache_receiver: cache_receiver,
        };
        node.setup_contract();
        node
    }

    pub fn address(&self) -> RawAddress {
        self.services.key.address
    }

    fn setup_contract(&self) {
        state::contract::save(&*self.services.storage, &Contract {
            address: self.address(),
            administration_address: administration(),
            contract_fee: 0,
            moved_to: None,
            freeze_period: Timestamp::zero(),
            expiration: Timestamp::zero(),
        })
        .unwrap();
    }

    pub fn setup_asset(&self, asset_code: &AssetCode) {
        state::asset::save(&*self.services.storage, &self.address(), asset_code, &Asset {
            transfers_permitted: true,
            freeze_period: Timestamp::zero(),
        })
        .unwrap();
    }

    /// Seeds a finalized balance for a party's holding.
    pub fn set_balance(&self, asset_code: &AssetCode, party: &RawAddress, amount: u64) {
        let mut holding = self
            .services
            .cache
            .get_holding(&self.address(), asset_code, party, Timestamp::from_nanos(1))
            .unwrap();
        holding.finalized_balance = amount;
        holding.pending_balance = amount;
        self.services
            .cache
            .save(&self.address(), asset_code, &holding);
    }

    pub fn holding(&self, asset_code: &AssetCode, party: &RawAddress) -> crate::holdings::Holding {
        self.services
            .cache
            .get_holding(&self.address(), asset_code, party, Timestamp::now())
            .unwrap()
    }

    pub fn trigger(&self, itx: &ParsedTx) -> Result<(), HandlerError> {
        self.dispatcher.trigger(itx, Timestamp::now())
    }

    /// Drains the captured broadcasts.
    pub fn take_responses(&self) -> Vec<Transaction> {
        std::mem::take(&mut *self.responses.lock().unwrap())
    }
}

pub fn party(tag: u8) -> RawAddress {
    RawAddress::from_hash20([tag; 20])
}

pub fn administration() -> RawAddress {
    party(0xAD)
}

pub fn demo_asset(tag: u8) -> AssetCode {
    AssetCode::from_array([tag; 32])
}

/// A spendable output owned by `owner`, funded out of thin air.
pub fn funding_utxo(owner: &RawAddress, salt: &[u8], value: u64) -> Utxo {
    Utxo {
        txid: Txid::hash(salt),
        index: 0,
        value,
        locking_script: owner.lock_script(),
    }
}

/// Builds and inspects a transfer request tx: the given funding inputs,
/// one output per `(address, value)` pair, and the transfer payload as the
/// final data output.
pub fn build_transfer_tx(
    inputs: Vec<Utxo>,
    outputs: Vec<(RawAddress, u64)>,
    transfer: Transfer,
) -> ParsedTx {
    let mut tx_outputs: Vec<TxOut> = outputs
        .iter()
        .map(|(address, value)| TxOut {
            value: *value,
            script_pubkey: address.lock_script(),
        })
        .collect();
    tx_outputs.push(TxOut {
        value: 0,
        script_pubkey: Action::Transfer(transfer).serialize(true),
    });

    let tx = Transaction {
        version: 1,
        lock_time: 0,
        input: inputs
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint(),
                script_sig: Script::new(),
                sequence: 0xffff_ffff,
                witness: Witness::default(),
            })
            .collect(),
        output: tx_outputs,
    };
    ParsedTx::parse(tx, inputs, true).unwrap()
}

/// Inspects a response tx by resolving its inputs against already-parsed
/// transactions.
pub fn parse_chain_tx(tx: &Transaction, prev: &[&ParsedTx]) -> ParsedTx {
    let spent_outputs = tx
        .input
        .iter()
        .map(|txin| {
            let source = prev
                .iter()
                .find(|candidate| candidate.txid == txin.previous_output.txid)
                .unwrap_or_else(|| {
                    panic!("unknown input tx {}", txin.previous_output.txid)
                });
            source.utxo(txin.previous_output.vout)
        })
        .collect();
    ParsedTx::parse(tx.clone(), spent_outputs, true).unwrap()
}

/// The protocol action carried by a transaction, if any.
pub fn payload_of(tx: &Transaction) -> Option<Action> {
    tx.output
        .iter()
        .find_map(|output| Action::deserialize(&output.script_pubkey, true).ok())
}
