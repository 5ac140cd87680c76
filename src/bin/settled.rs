// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Settlement daemon. Wires storage, the holdings cache with its writer
//! thread, the scheduler and the handler registry, then consumes inspected
//! transactions (JSON lines pairing the raw tx with the outputs it spends)
//! from standard input, as delivered by the host chain node.

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate log;

use std::io::BufRead;
use std::sync::Arc;

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::hex::{FromHex, ToHex};
use bitcoin::{Transaction, Txid};
use clap::Parser;

use settle_node::chain::{ParsedTx, Utxo};
use settle_node::config::{Config, Opts};
use settle_node::handlers::{self, Services};
use settle_node::holdings::{cache_writer, CacheChannel, HoldingsCache};
use settle_node::node::{HandlerError, Responder, ShutdownToken};
use settle_node::protocol::Timestamp;
use settle_node::scheduler::Scheduler;
use settle_node::state;
use settle_node::storage::{FileStorage, Storage};
use settle_node::wallet::ContractKey;
use settle_node::BootstrapError;

/// Writes broadcast transactions to standard output as hex, one per line,
/// for the host chain node to relay to the network.
struct StdoutResponder;

impl Responder for StdoutResponder {
    fn respond(&self, tx: Transaction) -> Result<(), HandlerError> {
        println!("{}", serialize(&tx).to_hex());
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct InspectedTx {
    raw: String,
    spent_outputs: Vec<InspectedUtxo>,
}

#[derive(serde::Deserialize)]
struct InspectedUtxo {
    txid: Txid,
    index: u32,
    value: u64,
    locking_script: String,
}

fn main() -> Result<(), BootstrapError> {
    let opts = Opts::parse();

    env_logger::Builder::new()
        .filter_level(match opts.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .init();

    let config = Config::load(&opts)?;
    let key_hex = config
        .contract_key
        .clone()
        .ok_or_else(|| BootstrapError::Config(s!("contract key is required")))?;
    let key = ContractKey::from_secret_hex(&key_hex)?;
    info!("Contract address: {}", key.address);

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(&config.data_dir)?);
    let cache = Arc::new(HoldingsCache::new(Arc::clone(&storage)));
    let (cache_channel, cache_receiver) = CacheChannel::new();
    let shutdown = ShutdownToken::new();

    info!("Starting holdings writer thread...");
    let writer_cache = Arc::clone(&cache);
    let writer_shutdown = shutdown.clone();
    let writer = std::thread::Builder::new()
        .name(s!("holdings-writer"))
        .spawn(move || cache_writer(writer_cache, cache_receiver, writer_shutdown))
        .map_err(|_| BootstrapError::Thread("holdings writer"))?;

    info!("Starting scheduler thread...");
    let scheduler = Arc::new(Scheduler::start());

    let services = Arc::new(Services {
        config: config.clone(),
        storage: Arc::clone(&storage),
        cache: Arc::clone(&cache),
        cache_channel: cache_channel.clone(),
        scheduler: Arc::clone(&scheduler),
        key,
        responder: Arc::new(StdoutResponder),
        shutdown: shutdown.clone(),
    });
    let dispatcher = handlers::api(Arc::clone(&services));

    info!("Launch completed successfully");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let inspected: InspectedTx = match serde_json::from_str(&line) {
            Ok(inspected) => inspected,
            Err(err) => {
                error!("Unparsable tx line: {}", err);
                continue;
            }
        };
        let itx = match parse_inspected(inspected, config.is_test) {
            Ok(itx) => itx,
            Err(err) => {
                error!("Invalid tx: {}", err);
                continue;
            }
        };

        // Keep every observed protocol tx reloadable for the relay.
        if itx.payload.is_some() {
            if let Err(err) = state::transactions::add_tx(&*storage, &itx) {
                error!("Failed to store tx {}: {}", itx.txid, err);
                continue;
            }
        }

        match dispatcher.trigger(&itx, Timestamp::now()) {
            Ok(()) => {}
            Err(HandlerError::Malformed(err)) => warn!("Skipping tx {}: {}", itx.txid, err),
            Err(err) => error!("Failed to process tx {}: {}", itx.txid, err),
        }
    }

    info!("Input closed; shutting down");
    shutdown.cancel();
    // Release every sender clone so the writer drains and exits.
    drop(dispatcher);
    drop(services);
    drop(cache_channel);
    match writer.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("Holdings writer failed: {}", err),
        Err(_) => error!("Holdings writer panicked"),
    }
    cache.write_cache().map_err(|err| {
        BootstrapError::Config(format!("failed to flush holdings cache: {}", err))
    })?;
    if let Ok(scheduler) = Arc::try_unwrap(scheduler) {
        scheduler.stop();
    }
    Ok(())
}

fn parse_inspected(inspected: InspectedTx, is_test: bool) -> Result<ParsedTx, String> {
    let raw = Vec::<u8>::from_hex(&inspected.raw).map_err(|err| err.to_string())?;
    let tx: Transaction = deserialize(&raw).map_err(|err| err.to_string())?;
    let spent_outputs = inspected
        .spent_outputs
        .into_iter()
        .map(|utxo| {
            Ok(Utxo {
                txid: utxo.txid,
                index: utxo.index,
                value: utxo.value,
                locking_script: Vec::<u8>::from_hex(&utxo.locking_script)
                    .map_err(|err| err.to_string())?
                    .into(),
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    ParsedTx::parse(tx, spent_outputs, is_test).map_err(|err| err.to_string())
}
