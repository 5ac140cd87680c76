// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! The transfer/settlement state machine.
//!
//! A `Transfer` request names per-asset senders and receivers plus, for
//! every asset, the output paying the contract responsible for it. The
//! first contract builds the settlement transaction, adds its own
//! settlement data with holdings debited in pending state, and either
//! signs and broadcasts (single contract) or relays a settlement request to
//! the next contract, funded by the transfer tx's boomerang output. The
//! observed settlement broadcast finalizes the pending statuses.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::{OutPoint, Txid};

use super::{ComposeError, Services};
use crate::chain::{BuilderError, Hash20, ParsedTx, RawAddress, TxBuilder};
use crate::holdings::{self, Holding, HoldingsError};
use crate::node::{
    respond_reject, respond_success, ActionHandler, HandlerError, ResponseWriter,
};
use crate::protocol::{
    Action, AssetCode, AssetSettlement, AssetTransfer, Message, MessagePayload, QuantityIndex,
    RejectCode, Settlement, SettlementRequest, TargetAddress, Timestamp, Transfer,
    NO_CONTRACT_INDEX,
};
use crate::scheduler::{Job, JobKey, SchedulerError};
use crate::state::{self, PendingTransfer};

/// Holdings touched while composing a settlement, keyed by asset and party
/// hash. Saved to the cache only once composition succeeds.
pub(super) type UpdateMap = HashMap<AssetCode, HashMap<Hash20, Holding>>;

pub(super) fn timeout_job_key(transfer_tx_id: Txid) -> JobKey {
    JobKey {
        kind: "transfer-timeout",
        txid: transfer_tx_id,
    }
}

/// Handles `Transfer` requests and observed `Settlement` broadcasts.
pub struct TransferHandler {
    services: Arc<Services>,
}

impl ActionHandler for TransferHandler {
    fn handle(
        &self,
        w: &mut ResponseWriter,
        itx: &ParsedTx,
        now: Timestamp,
    ) -> Result<(), HandlerError> {
        if self.services.shutdown.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        match &itx.payload {
            Some(Action::Transfer(transfer)) => self.transfer_request(w, itx, transfer, now),
            Some(Action::Settlement(settlement)) => {
                self.settlement_response(w, itx, settlement, now)
            }
            _ => Err(HandlerError::Malformed(s!("not a transfer action"))),
        }
    }
}

impl TransferHandler {
    pub fn new(services: Arc<Services>) -> TransferHandler {
        TransferHandler { services }
    }

    /// Handles an incoming transfer request tx.
    pub fn transfer_request(
        &self,
        w: &mut ResponseWriter,
        itx: &ParsedTx,
        transfer: &Transfer,
        now: Timestamp,
    ) -> Result<(), HandlerError> {
        let services = &self.services;
        let contract_address = services.key.address;

        let first = match first_contract_output_index(&transfer.assets, itx) {
            Some(first) => first,
            None => {
                warn!("Transfer first contract not found: {}", itx.txid);
                return Err(HandlerError::Malformed(s!("first contract not found")));
            }
        };

        if itx.outputs[first as usize].address != Some(contract_address) {
            debug!(
                "Not the first contract of transfer {}; waiting for a settlement request",
                itx.txid
            );
            state::transactions::add_tx(&*services.storage, itx)?;
            return Ok(());
        }

        if !transfer.offer_expiry.is_zero() && now > transfer.offer_expiry {
            warn!("Transfer offer expired: {}", transfer.offer_expiry);
            return respond_transfer_reject(
                services,
                w,
                itx,
                transfer,
                RejectCode::TransferExpired,
                false,
                "",
                now,
            );
        }

        if transfer.assets.is_empty() {
            warn!("Transfer has no asset transfers: {}", itx.txid);
            return respond_transfer_reject(
                services,
                w,
                itx,
                transfer,
                RejectCode::MsgMalformed,
                false,
                "No transfers",
                now,
            );
        }

        let ct = state::contract::retrieve(&*services.storage, &contract_address)?;
        if ct.moved_to.is_some() {
            warn!("Contract address changed: {}", contract_address);
            return respond_transfer_reject(
                services,
                w,
                itx,
                transfer,
                RejectCode::ContractMoved,
                false,
                "",
                now,
            );
        }
        if !ct.freeze_period.is_zero() && ct.freeze_period > now {
            warn!("Contract frozen: {}", contract_address);
            return respond_transfer_reject(
                services,
                w,
                itx,
                transfer,
                RejectCode::ContractFrozen,
                false,
                "",
                now,
            );
        }
        if !ct.expiration.is_zero() && ct.expiration < now {
            warn!("Contract expired: {}", ct.expiration);
            return respond_transfer_reject(
                services,
                w,
                itx,
                transfer,
                RejectCode::ContractExpired,
                false,
                "",
                now,
            );
        }

        // Bitcoin balance of this (first) contract, funding bitcoin
        // transfers routed through the contract output.
        let contract_balance = itx.outputs[first as usize].value;

        let mut settlement_request = SettlementRequest {
            timestamp: now,
            transfer_tx_id: itx.txid,
            contract_fees: vec![],
            settlement: vec![],
        };

        let mut settle_tx = match build_settlement_tx(
            services,
            itx,
            transfer,
            &mut settlement_request,
            contract_balance,
        ) {
            Ok(settle_tx) => settle_tx,
            Err(ComposeError::Reject(code)) => {
                warn!("Failed to build settlement tx for {}", itx.txid);
                return respond_transfer_reject(services, w, itx, transfer, code, false, "", now);
            }
            Err(ComposeError::Fatal(err)) => return Err(err),
        };

        if let Err(err) = add_bitcoin_settlements(itx, transfer, &mut settle_tx) {
            match err {
                ComposeError::Reject(code) => {
                    warn!("Failed to add bitcoin settlements for {}", itx.txid);
                    return respond_transfer_reject(
                        services, w, itx, transfer, code, false, "", now,
                    );
                }
                ComposeError::Fatal(err) => return Err(err),
            }
        }

        // Placeholder settlement payload output, updated in place as data
        // is added.
        let mut settlement = Settlement {
            timestamp: now,
            assets: vec![],
        };
        settle_tx.add_output(
            Action::Settlement(settlement.clone()).serialize(services.config.is_test),
            0,
            false,
        );

        let single_contract = transfer_is_single_contract(itx, transfer, &contract_address);
        let mut updates = UpdateMap::new();
        if let Err(err) = add_settlement_data(
            services,
            itx,
            transfer,
            &mut settle_tx,
            &mut settlement,
            &mut updates,
            single_contract,
            now,
        ) {
            match err {
                ComposeError::Reject(code) => {
                    warn!("Rejecting transfer {}: {}", itx.txid, code);
                    return respond_transfer_reject(
                        services, w, itx, transfer, code, false, "", now,
                    );
                }
                ComposeError::Fatal(err) => return Err(err),
            }
        }

        if single_contract {
            info!("Single contract settlement complete: {}", itx.txid);
            match settle_tx.sign(&[&services.key]) {
                Ok(()) => {}
                Err(BuilderError::InsufficientValue { available, needed }) => {
                    warn!(
                        "Insufficient settlement tx funding: {}/{}",
                        available, needed
                    );
                    return respond_transfer_reject(
                        services,
                        w,
                        itx,
                        transfer,
                        RejectCode::InsufficientTxFeeFunding,
                        false,
                        "",
                        now,
                    );
                }
                Err(err) => {
                    warn!("Failed to sign settlement tx: {}", err);
                    return respond_transfer_reject(
                        services,
                        w,
                        itx,
                        transfer,
                        RejectCode::MsgMalformed,
                        false,
                        "",
                        now,
                    );
                }
            }

            w.respond(settle_tx.tx)?;
            save_holdings(services, &updates);
            return Ok(());
        }

        // Multi-contract: relay to the next contract and arm the timeout.
        state::transactions::add_tx(&*services.storage, itx)?;

        send_to_next_settlement_contract(
            services,
            w,
            itx,
            itx,
            transfer,
            &settlement,
            &mut settlement_request,
            now,
        )?;

        let timeout = now.plus_secs(services.config.request_timeout_secs);
        state::transfer::save(&*services.storage, &contract_address, &PendingTransfer {
            transfer_tx_id: itx.txid,
            timeout,
        })?;

        // The pending statuses must be in the cache before the timeout can
        // fire and revert them.
        save_holdings(services, &updates);

        services.scheduler.schedule_job(
            timeout_job_key(itx.txid),
            Box::new(TransferTimeoutJob {
                services: Arc::clone(services),
                transfer_tx: itx.clone(),
                fire_at: timeout,
            }),
        );
        Ok(())
    }

    /// Handles an observed settlement broadcast: finalizes the pending
    /// statuses this contract recorded for the settled transfer.
    pub fn settlement_response(
        &self,
        _w: &mut ResponseWriter,
        itx: &ParsedTx,
        settlement: &Settlement,
        _now: Timestamp,
    ) -> Result<(), HandlerError> {
        let services = &self.services;
        let contract_address = services.key.address;

        // The settlement spends the transfer tx's contract outputs.
        let transfer_tx_id = itx.tx.input[0].previous_output.txid;

        let ct = state::contract::retrieve(&*services.storage, &contract_address)?;
        if ct.moved_to.is_some() {
            return Err(HandlerError::Malformed(s!("contract address changed")));
        }

        let timestamp = settlement.timestamp;
        let mut updates = UpdateMap::new();

        for asset_settlement in &settlement.assets {
            if asset_settlement.asset_type == crate::protocol::AssetType::BITCOIN
                && asset_settlement.asset_code.is_empty()
            {
                continue;
            }

            let asset_code = AssetCode::from_bytes(&asset_settlement.asset_code)
                .ok_or_else(|| HandlerError::Malformed(s!("bad asset code in settlement")))?;

            if asset_settlement.contract_index == NO_CONTRACT_INDEX {
                continue;
            }
            if asset_settlement.contract_index as usize >= itx.inputs.len() {
                return Err(HandlerError::Malformed(s!(
                    "settlement contract index out of range"
                )));
            }
            if itx.inputs[asset_settlement.contract_index as usize].address
                != Some(contract_address)
            {
                continue; // asset not under this contract
            }

            let holdings_updates = updates.entry(asset_code).or_default();
            for entry in &asset_settlement.settlements {
                if entry.index as usize >= itx.outputs.len() {
                    return Err(HandlerError::Malformed(s!(
                        "settlement output index out of range"
                    )));
                }
                let party = itx.outputs[entry.index as usize]
                    .address
                    .ok_or_else(|| HandlerError::Malformed(s!("settlement output not P2PKH")))?;

                let mut holding = match holdings_updates.get(&party.hash()) {
                    Some(holding) => holding.clone(),
                    None => services.cache.get_holding(
                        &contract_address,
                        &asset_code,
                        &party,
                        timestamp,
                    )?,
                };

                holdings::finalize_tx(&mut holding, transfer_tx_id, entry.quantity, timestamp)?;
                info!("Settled balance for {} {}", asset_code, party);
                holdings_updates.insert(party.hash(), holding);
            }
        }

        // Resolve the pending transfer, if this contract was tracking one.
        match state::transfer::remove(&*services.storage, &contract_address, &transfer_tx_id) {
            Ok(()) | Err(state::StateError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        match services
            .scheduler
            .cancel_job(&timeout_job_key(transfer_tx_id))
        {
            Ok(()) => {}
            Err(SchedulerError::NotFound) => {
                trace!("No transfer timeout job to cancel for {}", transfer_tx_id);
            }
        }

        save_holdings(services, &updates);
        Ok(())
    }

    /// Scheduled abort: the peer contracts never completed the settlement.
    pub fn transfer_timeout(
        &self,
        w: &mut ResponseWriter,
        itx: &ParsedTx,
        now: Timestamp,
    ) -> Result<(), HandlerError> {
        let services = &self.services;
        let transfer = match &itx.payload {
            Some(Action::Transfer(transfer)) => transfer,
            _ => return Err(HandlerError::Malformed(s!("not a transfer tx"))),
        };

        match state::transfer::remove(&*services.storage, &services.key.address, &itx.txid) {
            Ok(()) | Err(state::StateError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }

        warn!("Transfer timed out: {}", itx.txid);
        respond_transfer_reject(
            services,
            w,
            itx,
            transfer,
            RejectCode::Timeout,
            true,
            "",
            now,
        )
    }
}

/// Scheduled job aborting a multi-contract transfer whose peers never
/// responded.
pub struct TransferTimeoutJob {
    pub services: Arc<Services>,
    pub transfer_tx: ParsedTx,
    pub fire_at: Timestamp,
}

impl Job for TransferTimeoutJob {
    fn fire_at(&self) -> Timestamp {
        self.fire_at
    }

    fn execute(self: Box<Self>) {
        let handler = TransferHandler::new(Arc::clone(&self.services));
        let mut w = ResponseWriter::new(
            self.services.config.clone(),
            Arc::clone(&self.services.responder),
        );
        if let Err(err) = handler.transfer_timeout(&mut w, &self.transfer_tx, Timestamp::now()) {
            error!(
                "Transfer timeout handling failed for {}: {}",
                self.transfer_tx.txid, err
            );
        }
    }
}

/// The "first" contract of a transfer creates the initial settlement data
/// and distributes refunds. It is named by the first non-bitcoin asset
/// transfer whose contract index is in range.
pub(super) fn first_contract_output_index(
    assets: &[AssetTransfer],
    itx: &ParsedTx,
) -> Option<u32> {
    assets
        .iter()
        .find(|at| !at.is_bitcoin() && (at.contract_index as usize) < itx.outputs.len())
        .map(|at| at.contract_index)
}

/// The boomerang output pays the first contract but is not referenced by
/// any asset's contract index; it funds the off-chain relay messages.
pub(super) fn find_boomerang_index(
    transfer_tx: &ParsedTx,
    transfer: &Transfer,
    contract_address: &RawAddress,
) -> Option<u32> {
    let mut output_used = vec![false; transfer_tx.outputs.len()];
    for at in &transfer.assets {
        if at.contract_index == NO_CONTRACT_INDEX || at.is_bitcoin() {
            continue;
        }
        if at.contract_index as usize >= transfer_tx.outputs.len() {
            return None;
        }
        // Will be spent by the settlement tx.
        output_used[at.contract_index as usize] = true;
    }

    transfer_tx
        .outputs
        .iter()
        .enumerate()
        .find(|(index, output)| {
            !output_used[*index] && output.address.as_ref() == Some(contract_address)
        })
        .map(|(index, _)| index as u32)
}

/// True when this contract can settle every asset in the transfer itself.
pub(super) fn transfer_is_single_contract(
    itx: &ParsedTx,
    transfer: &Transfer,
    contract_address: &RawAddress,
) -> bool {
    for at in &transfer.assets {
        if at.is_bitcoin() {
            continue; // any contract can settle bitcoin movements
        }
        if at.contract_index as usize >= itx.outputs.len() {
            return false;
        }
        if itx.outputs[at.contract_index as usize].address.as_ref() != Some(contract_address) {
            return false;
        }
    }
    true
}

/// Builds the skeletal settlement tx: one input per involved contract, one
/// output per sender (dust) and receiver (dust, or the bitcoin amount
/// routed through the contract output), plus accumulated contract fees.
/// Deterministic: every contract in the relay rebuilds the same tx.
pub(super) fn build_settlement_tx(
    services: &Services,
    transfer_tx: &ParsedTx,
    transfer: &Transfer,
    settlement_request: &mut SettlementRequest,
    contract_balance: u64,
) -> Result<TxBuilder, ComposeError> {
    let config = &services.config;
    let mut settle_tx = TxBuilder::new(config.dust_limit, config.fee_rate);
    settle_tx.set_change_address(services.key.address);

    let mut addresses: HashMap<Hash20, usize> = HashMap::new();
    let mut output_used = vec![false; transfer_tx.outputs.len()];
    let mut remaining_balance = contract_balance;

    // One input per involved contract, so every contract must co-sign.
    for at in &transfer.assets {
        if at.contract_index == NO_CONTRACT_INDEX || at.is_bitcoin() {
            continue;
        }
        if at.contract_index as usize >= transfer_tx.outputs.len() {
            return Err(ComposeError::Reject(RejectCode::MsgMalformed));
        }
        if output_used[at.contract_index as usize] {
            continue;
        }
        let utxo = transfer_tx.utxo(at.contract_index);
        settle_tx.add_input(
            OutPoint {
                txid: transfer_tx.txid,
                vout: at.contract_index,
            },
            utxo.locking_script,
            utxo.value,
        );
        output_used[at.contract_index as usize] = true;
    }

    // One output per party: senders get dust, receivers get dust or the
    // bitcoin amount routed to them.
    for at in &transfer.assets {
        let is_bitcoin = at.is_bitcoin();

        for sender in &at.senders {
            if sender.index as usize >= transfer_tx.inputs.len() {
                return Err(ComposeError::Reject(RejectCode::MsgMalformed));
            }
            let address = transfer_tx.inputs[sender.index as usize]
                .address
                .ok_or(ComposeError::Reject(RejectCode::MsgMalformed))?;
            if !addresses.contains_key(&address.hash()) {
                addresses.insert(address.hash(), settle_tx.tx.output.len());
                settle_tx.add_dust_output(&address, false);
            }
        }

        for receiver in &at.receivers {
            if is_bitcoin {
                // Debit from the contract's bitcoin balance.
                if receiver.quantity > remaining_balance {
                    warn!("Transfer sends more bitcoin than was funded to the contract");
                    return Err(ComposeError::Reject(RejectCode::InsufficientTxFeeFunding));
                }
                remaining_balance -= receiver.quantity;
            }

            match addresses.get(&receiver.address.hash()).copied() {
                Some(index) => {
                    if is_bitcoin {
                        settle_tx
                            .add_value_to_output(index, receiver.quantity)
                            .map_err(|err| ComposeError::Fatal(err.into()))?;
                    }
                }
                None => {
                    addresses.insert(receiver.address.hash(), settle_tx.tx.output.len());
                    if is_bitcoin {
                        settle_tx.add_payment_output(&receiver.address, receiver.quantity, false);
                    } else {
                        settle_tx.add_dust_output(&receiver.address, false);
                    }
                }
            }
        }
    }

    // Fees of the contracts which already contributed.
    for fee in &settlement_request.contract_fees {
        settle_tx.add_payment_output(&fee.address, fee.quantity, false);
    }

    // This contract's own fee, accumulated for the contracts downstream.
    let ct = state::contract::retrieve(&*services.storage, &services.key.address)?;
    if ct.contract_fee > 0 {
        if let Some(fee_address) = config.fee_address {
            settle_tx.add_payment_output(&fee_address, ct.contract_fee, false);
            settlement_request.contract_fees.push(TargetAddress {
                address: fee_address,
                quantity: ct.contract_fee,
            });
        }
    }

    Ok(settle_tx)
}

/// Validates bitcoin movements: every bitcoin sender funds its quantity
/// through its own input, sums conserve, and the exchange fee output is
/// provided for.
pub(super) fn add_bitcoin_settlements(
    transfer_tx: &ParsedTx,
    transfer: &Transfer,
    settle_tx: &mut TxBuilder,
) -> Result<(), ComposeError> {
    for at in &transfer.assets {
        if !at.is_bitcoin() {
            continue;
        }

        let mut send_balance: u64 = 0;
        for sender in &at.senders {
            if sender.index as usize >= transfer_tx.inputs.len() {
                return Err(ComposeError::Reject(RejectCode::MsgMalformed));
            }
            let input = &transfer_tx.inputs[sender.index as usize];
            if sender.quantity >= input.utxo.value {
                warn!(
                    "Bitcoin sender quantity higher than input amount: {}/{}",
                    sender.quantity, input.utxo.value
                );
                return Err(ComposeError::Reject(RejectCode::MsgMalformed));
            }
            send_balance += sender.quantity;
        }

        for receiver in &at.receivers {
            let found = (0..settle_tx.tx.output.len())
                .any(|index| settle_tx.output_address(index) == Some(receiver.address));
            if !found {
                warn!("Bitcoin receiver output missing: {}", receiver.address);
                return Err(ComposeError::Reject(RejectCode::MsgMalformed));
            }
            if receiver.quantity > send_balance {
                warn!("Sending more bitcoin than received");
                return Err(ComposeError::Reject(RejectCode::MsgMalformed));
            }
            send_balance -= receiver.quantity;
        }

        if send_balance != 0 {
            warn!("Not sending all received bitcoin: {} remaining", send_balance);
            return Err(ComposeError::Reject(RejectCode::MsgMalformed));
        }
    }

    // Exchange fee rides on the settlement tx when requested.
    if transfer.exchange_fee > 0 {
        if let Some(fee_address) = transfer.exchange_fee_address {
            let existing = (0..settle_tx.tx.output.len())
                .find(|index| settle_tx.output_address(*index) == Some(fee_address));
            match existing {
                Some(index) => settle_tx
                    .add_value_to_output(index, transfer.exchange_fee)
                    .map_err(|err| ComposeError::Fatal(err.into()))?,
                None => settle_tx.add_payment_output(&fee_address, transfer.exchange_fee, false),
            }
        }
    }

    Ok(())
}

/// Appends this contract's asset settlement data to the settlement payload
/// and records the matching pending debits/deposits in `updates`.
pub(super) fn add_settlement_data(
    services: &Services,
    transfer_tx: &ParsedTx,
    transfer: &Transfer,
    settle_tx: &mut TxBuilder,
    settlement: &mut Settlement,
    updates: &mut UpdateMap,
    single_contract: bool,
    now: Timestamp,
) -> Result<(), ComposeError> {
    let contract_address = services.key.address;
    let transfer_tx_id = transfer_tx.txid;

    let ct = state::contract::retrieve(&*services.storage, &contract_address)?;
    if !ct.freeze_period.is_zero() && ct.freeze_period > now {
        return Err(ComposeError::Reject(RejectCode::ContractFrozen));
    }

    let settle_input_addresses: Vec<Option<RawAddress>> = (0..settle_tx.inputs.len())
        .map(|index| settle_tx.input_address(index))
        .collect();
    let settle_output_addresses: Vec<Option<RawAddress>> = (0..settle_tx.tx.output.len())
        .map(|index| settle_tx.output_address(index))
        .collect();

    let mut data_added = false;

    for at in &transfer.assets {
        if at.is_bitcoin() {
            trace!("Asset transfer for bitcoin");
            continue; // handled during settlement tx composition
        }

        let asset_code = AssetCode::from_bytes(&at.asset_code)
            .ok_or(ComposeError::Reject(RejectCode::MsgMalformed))?;

        if at.contract_index as usize >= transfer_tx.outputs.len() {
            return Err(ComposeError::Reject(RejectCode::MsgMalformed));
        }
        if transfer_tx.outputs[at.contract_index as usize].address != Some(contract_address) {
            continue; // this asset is not ours
        }

        let asset = state::asset::retrieve(&*services.storage, &contract_address, &asset_code)
            .map_err(|err| match err {
                state::StateError::NotFound => ComposeError::Reject(RejectCode::MsgMalformed),
                other => ComposeError::Fatal(other.into()),
            })?;
        if let Some(code) = state::asset::transfer_gate(&asset, now) {
            return Err(ComposeError::Reject(code));
        }

        // The input of the settlement tx this contract will sign.
        let contract_input_index = settle_input_addresses
            .iter()
            .position(|address| address.as_ref() == Some(&contract_address))
            .ok_or_else(|| {
                ComposeError::Fatal(HandlerError::Malformed(s!("contract input not found")))
            })?;

        debug!("Adding settlement data for asset {}", asset_code);
        let mut asset_settlement = AssetSettlement {
            contract_index: contract_input_index as u32,
            asset_type: at.asset_type,
            asset_code: at.asset_code.clone(),
            settlements: vec![],
        };

        let mut send_balance: u64 = 0;
        let mut from_administration: u64 = 0;
        let mut from_others: u64 = 0;
        let mut to_administration: u64 = 0;
        let mut to_others: u64 = 0;
        let mut holding_slots: Vec<Option<Hash20>> = vec![None; settle_tx.tx.output.len()];
        let holdings_updates = updates.entry(asset_code).or_default();

        for sender in &at.senders {
            if sender.index as usize >= transfer_tx.inputs.len() {
                return Err(ComposeError::Reject(RejectCode::MsgMalformed));
            }
            let sender_address = transfer_tx.inputs[sender.index as usize]
                .address
                .ok_or(ComposeError::Reject(RejectCode::MsgMalformed))?;

            if sender_address == ct.administration_address {
                from_administration += sender.quantity;
            } else {
                from_others += sender.quantity;
            }

            let settle_output_index = settle_output_addresses
                .iter()
                .position(|address| address.as_ref() == Some(&sender_address))
                .ok_or_else(|| {
                    ComposeError::Fatal(HandlerError::Malformed(s!(
                        "sender output not found in settlement tx"
                    )))
                })?;

            if holding_slots[settle_output_index].is_some() {
                warn!(
                    "Duplicate sender entry: asset={} party={}",
                    asset_code, sender_address
                );
                return Err(ComposeError::Reject(RejectCode::MsgMalformed));
            }

            let mut holding = match holdings_updates.get(&sender_address.hash()) {
                Some(holding) => holding.clone(),
                None => services.cache.get_holding(
                    &contract_address,
                    &asset_code,
                    &sender_address,
                    now,
                )?,
            };

            match holdings::add_debit(
                &mut holding,
                transfer_tx_id,
                sender.quantity,
                single_contract,
                now,
            ) {
                Ok(()) => {
                    info!(
                        "Debit {} {} from {}",
                        sender.quantity, asset_code, sender_address
                    );
                }
                Err(HoldingsError::Insufficient) => {
                    warn!(
                        "Insufficient funds: asset={} party={}: {}/{}",
                        asset_code,
                        sender_address,
                        sender.quantity,
                        holdings::safe_balance(&holding)
                    );
                    return Err(ComposeError::Reject(RejectCode::InsufficientQuantity));
                }
                Err(HoldingsError::Frozen) => {
                    warn!("Frozen funds: asset={} party={}", asset_code, sender_address);
                    return Err(ComposeError::Reject(RejectCode::HoldingsFrozen));
                }
                Err(HoldingsError::Locked) => {
                    warn!("Locked funds: asset={} party={}", asset_code, sender_address);
                    return Err(ComposeError::Reject(RejectCode::HoldingsLocked));
                }
                Err(err) => {
                    warn!(
                        "Debit failed: {}: asset={} party={}",
                        err, asset_code, sender_address
                    );
                    return Err(ComposeError::Reject(RejectCode::MsgMalformed));
                }
            }

            holding_slots[settle_output_index] = Some(sender_address.hash());
            holdings_updates.insert(sender_address.hash(), holding);
            send_balance += sender.quantity;
        }

        for receiver in &at.receivers {
            let receiver_address = receiver.address;

            let settle_output_index = settle_output_addresses
                .iter()
                .position(|address| address.as_ref() == Some(&receiver_address))
                .ok_or_else(|| {
                    ComposeError::Fatal(HandlerError::Malformed(s!(
                        "receiver output not found in settlement tx"
                    )))
                })?;

            if receiver_address == ct.administration_address {
                to_administration += receiver.quantity;
            } else {
                to_others += receiver.quantity;
            }

            if holding_slots[settle_output_index].is_some() {
                warn!(
                    "Duplicate receiver entry: asset={} party={}",
                    asset_code, receiver_address
                );
                return Err(ComposeError::Reject(RejectCode::MsgMalformed));
            }

            let mut holding = match holdings_updates.get(&receiver_address.hash()) {
                Some(holding) => holding.clone(),
                None => services.cache.get_holding(
                    &contract_address,
                    &asset_code,
                    &receiver_address,
                    now,
                )?,
            };

            match holdings::add_deposit(
                &mut holding,
                transfer_tx_id,
                receiver.quantity,
                single_contract,
                now,
            ) {
                Ok(()) => {
                    info!(
                        "Deposit {} {} to {}",
                        receiver.quantity, asset_code, receiver_address
                    );
                }
                Err(HoldingsError::Locked) => {
                    warn!(
                        "Locked funds: asset={} party={}",
                        asset_code, receiver_address
                    );
                    return Err(ComposeError::Reject(RejectCode::HoldingsLocked));
                }
                Err(err) => {
                    warn!(
                        "Deposit failed: {}: asset={} party={}",
                        err, asset_code, receiver_address
                    );
                    return Err(ComposeError::Reject(RejectCode::MsgMalformed));
                }
            }

            holding_slots[settle_output_index] = Some(receiver_address.hash());
            holdings_updates.insert(receiver_address.hash(), holding);

            // Balance conservation per asset.
            if receiver.quantity > send_balance {
                warn!("Receiving more tokens than sending: asset={}", asset_code);
                return Err(ComposeError::Reject(RejectCode::MsgMalformed));
            }
            send_balance -= receiver.quantity;
        }

        if send_balance != 0 {
            warn!(
                "Not sending all input tokens: asset={}: {} remaining",
                asset_code, send_balance
            );
            return Err(ComposeError::Reject(RejectCode::MsgMalformed));
        }

        if !asset.transfers_permitted {
            // Only movements strictly to or from the administration are
            // allowed while transfers are off.
            if from_others > to_administration || to_others > from_administration {
                warn!("Transfers not permitted: asset={}", asset_code);
                return Err(ComposeError::Reject(RejectCode::AssetNotPermitted));
            }
        }

        for (index, slot) in holding_slots.iter().enumerate() {
            if let Some(hash) = slot {
                let holding = &holdings_updates[hash];
                asset_settlement.settlements.push(QuantityIndex {
                    index: index as u32,
                    quantity: holding.pending_balance,
                });
            }
        }

        // Replace any earlier settlement entry for this asset.
        let existing = settlement.assets.iter().position(|entry| {
            entry.asset_type == asset_settlement.asset_type
                && entry.asset_code == asset_settlement.asset_code
        });
        match existing {
            Some(index) => settlement.assets[index] = asset_settlement,
            None => settlement.assets.push(asset_settlement),
        }
        data_added = true;
    }

    if !data_added {
        return Err(ComposeError::Fatal(HandlerError::Malformed(s!(
            "no data added to settlement"
        ))));
    }

    update_settlement_output(settle_tx, settlement, services.config.is_test)
        .map_err(ComposeError::Fatal)
}

/// Re-serializes the settlement payload into the settlement tx's data
/// output.
pub(super) fn update_settlement_output(
    settle_tx: &mut TxBuilder,
    settlement: &Settlement,
    is_test: bool,
) -> Result<(), HandlerError> {
    let script = Action::Settlement(settlement.clone()).serialize(is_test);
    for output in settle_tx.tx.output.iter_mut() {
        if let Ok(Action::Settlement(_)) = Action::deserialize(&output.script_pubkey, is_test) {
            output.script_pubkey = script;
            return Ok(());
        }
    }
    Err(HandlerError::Malformed(s!(
        "settlement data output not found in settlement tx"
    )))
}

/// Sends the settlement request on to the next contract which has not yet
/// contributed, spending the boomerang output (or, deeper in the relay,
/// the message tx output addressed to this contract).
pub(super) fn send_to_next_settlement_contract(
    services: &Services,
    w: &mut ResponseWriter,
    itx: &ParsedTx,
    transfer_tx: &ParsedTx,
    transfer: &Transfer,
    settlement: &Settlement,
    settlement_request: &mut SettlementRequest,
    now: Timestamp,
) -> Result<(), HandlerError> {
    let contract_address = services.key.address;

    let boomerang_index = if itx.txid != transfer_tx.txid {
        // Relay message: its first output funds the rest of the round trip.
        0
    } else {
        find_boomerang_index(transfer_tx, transfer, &contract_address).ok_or_else(|| {
            HandlerError::Malformed(s!("multi-contract transfer missing boomerang output"))
        })?
    };
    debug!("Boomerang output index: {}", boomerang_index);

    // The next contract: first asset entry pointing at a contract which
    // has not appeared before this one. A contract appears once in the
    // traversal even when it owns several assets.
    let mut next_contract: Option<RawAddress> = None;
    let mut current_found = false;
    let mut completed: std::collections::HashSet<Hash20> = std::collections::HashSet::new();
    for at in &transfer.assets {
        if at.contract_index == NO_CONTRACT_INDEX || at.is_bitcoin() {
            continue;
        }
        if at.contract_index as usize >= transfer_tx.outputs.len() {
            return Err(HandlerError::Malformed(s!(
                "transfer contract index out of range"
            )));
        }
        let address = transfer_tx.outputs[at.contract_index as usize]
            .address
            .ok_or_else(|| HandlerError::Malformed(s!("contract output not P2PKH")))?;

        if !current_found {
            completed.insert(address.hash());
            if address == contract_address {
                current_found = true;
            }
            continue;
        }
        if !completed.contains(&address.hash()) {
            next_contract = Some(address);
            break;
        }
    }
    let next_contract = next_contract
        .ok_or_else(|| HandlerError::Malformed(s!("next contract not found in transfer")))?;

    info!("Sending settlement request to {}", next_contract);

    w.set_utxos(vec![itx.utxo(boomerang_index)]);
    // The next contract receives everything except the relay tx fee.
    w.add_change_output(next_contract);

    settlement_request.settlement = crate::protocol::serialize_embedded_action(
        &Action::Settlement(settlement.clone()),
        services.config.is_test,
    );

    let payload = MessagePayload::SettlementRequest(settlement_request.clone());
    let message = Message {
        receiver_indexes: vec![0],
        message_code: payload.code(),
        payload: payload.serialize(),
    };

    if let Some(response) = respond_success(w, itx, &services.key, &Action::Message(message), now)?
    {
        // Keep the relay message around so a later rejection can be traced
        // back to the transfer it aborts.
        state::transactions::add_tx(&*services.storage, &response)?;
    }
    Ok(())
}

/// Saves every holding touched by a settlement composition and queues the
/// slots for persistence.
pub(super) fn save_holdings(services: &Services, updates: &UpdateMap) {
    for (asset_code, holdings_updates) in updates {
        for holding in holdings_updates.values() {
            let item = services
                .cache
                .save(&services.key.address, asset_code, holding);
            services.cache_channel.add(item);
        }
    }
}

/// Reverts the pending statuses this contract recorded for `transfer_tx`.
pub(super) fn revert_transfer_holdings(
    services: &Services,
    transfer_tx: &ParsedTx,
    transfer: &Transfer,
    now: Timestamp,
) -> Result<UpdateMap, HandlerError> {
    let contract_address = services.key.address;
    let transfer_tx_id = transfer_tx.txid;
    let mut updates = UpdateMap::new();

    for at in &transfer.assets {
        if at.is_bitcoin() {
            continue;
        }
        if at.contract_index as usize >= transfer_tx.outputs.len() {
            return Err(HandlerError::Malformed(s!("contract index out of range")));
        }
        if transfer_tx.outputs[at.contract_index as usize].address != Some(contract_address) {
            continue; // this asset is not ours
        }
        let asset_code = AssetCode::from_bytes(&at.asset_code)
            .ok_or_else(|| HandlerError::Malformed(s!("bad asset code")))?;
        let holdings_updates = updates.entry(asset_code).or_default();

        let mut parties: Vec<RawAddress> = vec![];
        for sender in &at.senders {
            if sender.index as usize >= transfer_tx.inputs.len() {
                continue;
            }
            if let Some(address) = transfer_tx.inputs[sender.index as usize].address {
                parties.push(address);
            }
        }
        for receiver in &at.receivers {
            parties.push(receiver.address);
        }

        for party in parties {
            if holdings_updates.contains_key(&party.hash()) {
                continue;
            }
            let mut holding =
                services
                    .cache
                    .get_holding(&contract_address, &asset_code, &party, now)?;
            match holdings::revert_status(&mut holding, &transfer_tx_id) {
                Ok(()) => {}
                // fast-path settlements never recorded a status
                Err(HoldingsError::StatusNotFound) => continue,
                Err(err) => return Err(err.into()),
            }
            holdings_updates.insert(party.hash(), holding);
        }
    }

    Ok(updates)
}

/// Queues the refund outputs of a rejected transfer: bitcoin senders get
/// their quantities back, every other sender a notification output.
/// Returns the total bitcoin owed.
pub(super) fn add_refund_outputs(
    w: &mut ResponseWriter,
    transfer_tx: &ParsedTx,
    transfer: &Transfer,
) -> u64 {
    let mut refund_balance: u64 = 0;
    for at in &transfer.assets {
        let refund = at.is_bitcoin();
        for sender in &at.senders {
            if sender.index as usize >= transfer_tx.inputs.len() {
                continue;
            }
            if let Some(address) = transfer_tx.inputs[sender.index as usize].address {
                if refund {
                    debug!("Bitcoin refund {} to {}", sender.quantity, address);
                    w.add_reject_value(address, sender.quantity);
                    refund_balance += sender.quantity;
                } else {
                    w.add_reject_value(address, 0);
                }
            }
        }
    }
    refund_balance
}

/// Rejects a transfer request, refunding bitcoin to its senders. Only the
/// first contract distributes refunds, because it holds the bitcoin. With
/// `started` the tentative holdings statuses are reverted and the spent
/// boomerang output is excluded from funding.
pub(super) fn respond_transfer_reject(
    services: &Services,
    w: &mut ResponseWriter,
    transfer_tx: &ParsedTx,
    transfer: &Transfer,
    code: RejectCode,
    started: bool,
    text: &str,
    now: Timestamp,
) -> Result<(), HandlerError> {
    let contract_address = services.key.address;

    let first = first_contract_output_index(&transfer.assets, transfer_tx)
        .ok_or_else(|| HandlerError::Malformed(s!("first contract output index not found")))?;
    if transfer_tx.outputs[first as usize].address != Some(contract_address) {
        return Err(HandlerError::Malformed(s!("not the first contract")));
    }

    let mut utxos = transfer_tx.utxos_for_address(&contract_address);
    if started {
        // The boomerang was spent by the settlement request already.
        if let Some(boomerang_index) =
            find_boomerang_index(transfer_tx, transfer, &contract_address)
        {
            utxos.retain(|utxo| utxo.index != boomerang_index);
        }
    }
    let balance: u64 = utxos.iter().map(|utxo| utxo.value).sum();
    w.set_reject_utxos(utxos);

    let refund_balance = add_refund_outputs(w, transfer_tx, transfer);

    if started {
        let updates = revert_transfer_holdings(services, transfer_tx, transfer, now)?;
        save_holdings(services, &updates);
    }

    if refund_balance > balance {
        // Not enough to refund everyone; send the funds to the
        // administration instead of issuing partial refunds.
        let ct = state::contract::retrieve(&*services.storage, &contract_address)?;
        w.clear_reject_output_values(ct.administration_address);
    }

    respond_reject(w, transfer_tx, &services.key, code, text, now)
}
