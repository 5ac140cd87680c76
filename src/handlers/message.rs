// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Inter-contract relay processing: settlement requests (collection
//! phase), signature requests (finalization phase) and peer rejections
//! (abort with refunds).

use std::sync::Arc;

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::Transaction;

use super::transfer::{
    add_refund_outputs, add_settlement_data, build_settlement_tx, find_boomerang_index,
    first_contract_output_index, revert_transfer_holdings, save_holdings,
    send_to_next_settlement_contract, timeout_job_key, UpdateMap,
};
use super::{ComposeError, Services};
use crate::chain::{BuilderError, InputSupplement, ParsedTx, RawAddress, TxBuilder};
use crate::holdings;
use crate::node::{
    respond_reject, respond_success, ActionHandler, HandlerError, ResponseWriter,
};
use crate::protocol::{
    self, Action, AssetCode, Message, MessagePayload, RejectCode, Rejection, Settlement,
    SettlementRequest, SignatureRequest, Timestamp, Transfer,
};
use crate::scheduler::SchedulerError;
use crate::state;

/// Handles `Message` relays and `Rejection` responses from peer contracts.
pub struct MessageHandler {
    services: Arc<Services>,
}

impl ActionHandler for MessageHandler {
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
            Some(Action::Message(message)) => self.process_message(w, itx, message, now),
            Some(Action::Rejection(rejection)) => self.process_rejection(w, itx, rejection, now),
            _ => Err(HandlerError::Malformed(s!("not a message action"))),
        }
    }
}

impl MessageHandler {
    pub fn new(services: Arc<Services>) -> MessageHandler {
        MessageHandler { services }
    }

    /// Handles an incoming relay message.
    pub fn process_message(
        &self,
        w: &mut ResponseWriter,
        itx: &ParsedTx,
        message: &Message,
        now: Timestamp,
    ) -> Result<(), HandlerError> {
        // Relay messages are kept even when addressed elsewhere: a later
        // rejection traces back through them to the transfer it aborts.
        state::transactions::add_tx(&*self.services.storage, itx)?;

        if !addressed_to(itx, &message.receiver_indexes, &self.services.key.address)? {
            return Ok(()); // message is for another contract
        }

        let payload = match protocol::parse_message_payload(message.message_code, &message.payload)
        {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Failed to parse message payload of {}: {}", itx.txid, err);
                return respond_reject(
                    w,
                    itx,
                    &self.services.key,
                    RejectCode::MsgMalformed,
                    "",
                    now,
                );
            }
        };

        match payload {
            MessagePayload::SettlementRequest(request) => {
                debug!("Processing settlement request from {}", itx.txid);
                self.process_settlement_request(w, itx, request, now)
            }
            MessagePayload::SignatureRequest(request) => {
                debug!("Processing signature request from {}", itx.txid);
                self.process_sig_request(w, itx, &request, now)
            }
        }
    }

    /// Collection phase: add this contract's settlement data and relay on,
    /// or start the signature round when the data is complete.
    fn process_settlement_request(
        &self,
        w: &mut ResponseWriter,
        itx: &ParsedTx,
        mut request: SettlementRequest,
        now: Timestamp,
    ) -> Result<(), HandlerError> {
        let services = &self.services;

        let mut settlement = match protocol::parse_embedded_action(
            &request.settlement,
            services.config.is_test,
        )? {
            Action::Settlement(settlement) => settlement,
            _ => {
                return Err(HandlerError::Malformed(s!(
                    "settlement request payload is not a settlement"
                )))
            }
        };

        let transfer_tx = state::transactions::get_tx(
            &*services.storage,
            &request.transfer_tx_id,
            services.config.is_test,
        )?;
        let transfer = match &transfer_tx.payload {
            Some(Action::Transfer(transfer)) => transfer.clone(),
            _ => return Err(HandlerError::Malformed(s!("transfer tx is not a transfer"))),
        };

        let first = first_contract_output_index(&transfer.assets, &transfer_tx)
            .ok_or_else(|| HandlerError::Malformed(s!("first contract not found")))?;
        let contract_balance = transfer_tx.outputs[first as usize].value;

        let mut settle_tx = match build_settlement_tx(
            services,
            &transfer_tx,
            &transfer,
            &mut request,
            contract_balance,
        ) {
            Ok(settle_tx) => settle_tx,
            Err(ComposeError::Reject(code)) => {
                return self.respond_transfer_message_reject(
                    w,
                    itx,
                    &transfer_tx,
                    &transfer,
                    code,
                    now,
                )
            }
            Err(ComposeError::Fatal(err)) => return Err(err),
        };

        // Placeholder carrying the settlement data accumulated so far.
        settle_tx.add_output(
            Action::Settlement(settlement.clone()).serialize(services.config.is_test),
            0,
            false,
        );

        let ct = state::contract::retrieve(&*services.storage, &services.key.address)?;
        if ct.moved_to.is_some() {
            warn!("Contract address changed: {}", services.key.address);
            return self.respond_transfer_message_reject(
                w,
                itx,
                &transfer_tx,
                &transfer,
                RejectCode::ContractMoved,
                now,
            );
        }

        let mut updates = UpdateMap::new();
        if let Err(err) = add_settlement_data(
            services,
            &transfer_tx,
            &transfer,
            &mut settle_tx,
            &mut settlement,
            &mut updates,
            false,
            now,
        ) {
            match err {
                ComposeError::Reject(code) => {
                    warn!("Rejecting transfer {}: {}", transfer_tx.txid, code);
                    return self.respond_transfer_message_reject(
                        w,
                        itx,
                        &transfer_tx,
                        &transfer,
                        code,
                        now,
                    );
                }
                ComposeError::Fatal(err) => return Err(err),
            }
        }

        if settlement_is_complete(&transfer, &settlement) {
            // Last contract: sign our input(s) and start the signature
            // round backwards (or broadcast if nothing is left to sign).
            let mut signed = false;
            for index in 0..settle_tx.tx.input.len() {
                match settle_tx.sign_input(index, &services.key) {
                    Ok(()) => {
                        debug!("Signed settlement input {}", index);
                        signed = true;
                    }
                    Err(BuilderError::WrongPrivateKey) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            if !signed {
                return Err(HandlerError::Malformed(s!("no settlement input to sign")));
            }

            if settle_tx.all_inputs_signed() {
                info!("Broadcasting settlement tx for {}", transfer_tx.txid);
                w.respond(settle_tx.tx)?;
            } else {
                send_to_previous_settlement_contract(services, w, itx, &settle_tx, now)?;
            }
            save_holdings(services, &updates);
            return Ok(());
        }

        // More contracts still have to contribute.
        state::transactions::add_tx(&*services.storage, &transfer_tx)?;
        send_to_next_settlement_contract(
            services,
            w,
            itx,
            &transfer_tx,
            &transfer,
            &settlement,
            &mut request,
            now,
        )?;
        save_holdings(services, &updates);
        Ok(())
    }

    /// Finalization phase: verify the peer-built settlement against local
    /// state, sign our input(s), then broadcast or pass further back.
    fn process_sig_request(
        &self,
        w: &mut ResponseWriter,
        itx: &ParsedTx,
        request: &SignatureRequest,
        now: Timestamp,
    ) -> Result<(), HandlerError> {
        let settle_wire_tx: Transaction = deserialize(&request.payload)
            .map_err(|err| HandlerError::Malformed(err.to_string()))?;

        for output in &settle_wire_tx.output {
            if let Ok(Action::Settlement(settlement)) =
                Action::deserialize(&output.script_pubkey, self.services.config.is_test)
            {
                return self.process_sig_request_settlement(
                    w,
                    itx,
                    settle_wire_tx,
                    &settlement,
                    now,
                );
            }
        }
        Err(HandlerError::Malformed(s!(
            "signature request tx carries no settlement payload"
        )))
    }

    fn process_sig_request_settlement(
        &self,
        w: &mut ResponseWriter,
        itx: &ParsedTx,
        settle_wire_tx: Transaction,
        settlement: &Settlement,
        now: Timestamp,
    ) -> Result<(), HandlerError> {
        let services = &self.services;

        // The settlement spends the transfer tx's contract outputs.
        let transfer_tx_id = settle_wire_tx.input[0].previous_output.txid;
        let transfer_tx = state::transactions::get_tx(
            &*services.storage,
            &transfer_tx_id,
            services.config.is_test,
        )?;
        let transfer = match &transfer_tx.payload {
            Some(Action::Transfer(transfer)) => transfer.clone(),
            _ => return Err(HandlerError::Malformed(s!("transfer tx is not a transfer"))),
        };

        let ct = state::contract::retrieve(&*services.storage, &services.key.address)?;
        if ct.moved_to.is_some() {
            warn!("Contract address changed: {}", services.key.address);
            return self.respond_transfer_message_reject(
                w,
                itx,
                &transfer_tx,
                &transfer,
                RejectCode::ContractMoved,
                now,
            );
        }

        if let Err(err) = verify_settlement(
            services,
            &transfer_tx,
            &transfer,
            &settle_wire_tx,
            settlement,
            now,
        ) {
            match err {
                ComposeError::Reject(code) => {
                    warn!("Rejecting settlement of {}: {}", transfer_tx.txid, code);
                    return self.respond_transfer_message_reject(
                        w,
                        itx,
                        &transfer_tx,
                        &transfer,
                        code,
                        now,
                    );
                }
                ComposeError::Fatal(err) => return Err(err),
            }
        }

        // Pair every input with the transfer tx output it spends so it can
        // be signed; signatures already collected stay untouched.
        let mut inputs = Vec::with_capacity(settle_wire_tx.input.len());
        for txin in &settle_wire_tx.input {
            if txin.previous_output.txid != transfer_tx.txid
                || txin.previous_output.vout as usize >= transfer_tx.outputs.len()
            {
                return Err(HandlerError::Malformed(s!(
                    "settlement input does not spend the transfer tx"
                )));
            }
            let utxo = transfer_tx.utxo(txin.previous_output.vout);
            inputs.push(InputSupplement {
                locking_script: utxo.locking_script,
                value: utxo.value,
            });
        }
        let mut settle_tx = TxBuilder::from_wire(
            settle_wire_tx,
            inputs,
            services.config.dust_limit,
            services.config.fee_rate,
        )?;

        let mut signed = false;
        for index in 0..settle_tx.tx.input.len() {
            if settle_tx.input_is_signed(index) {
                continue;
            }
            match settle_tx.sign_input(index, &services.key) {
                Ok(()) => {
                    debug!("Signed settlement input {}", index);
                    signed = true;
                }
                Err(BuilderError::WrongPrivateKey) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        if !signed {
            return Err(HandlerError::Malformed(s!("no settlement input to sign")));
        }

        if settle_tx.all_inputs_signed() {
            // Fully signed: this is the first contract; resolve the
            // pending transfer and broadcast.
            match state::transfer::remove(
                &*services.storage,
                &services.key.address,
                &transfer_tx.txid,
            ) {
                Ok(()) => {}
                Err(state::StateError::NotFound) => {
                    warn!("No pending transfer to remove for {}", transfer_tx.txid);
                }
                Err(err) => return Err(err.into()),
            }
            match services.scheduler.cancel_job(&timeout_job_key(transfer_tx.txid)) {
                Ok(()) => {}
                Err(SchedulerError::NotFound) => {
                    warn!("Transfer timeout job not found to cancel");
                }
            }

            info!("Broadcasting settlement tx for {}", transfer_tx.txid);
            return w.respond(settle_tx.tx);
        }

        send_to_previous_settlement_contract(services, w, itx, &settle_tx, now)
    }

    /// Handles a `Rejection` from a peer contract: traces back to the
    /// transfer being aborted, reverts this contract's pending statuses
    /// and, as the first contract, fans refunds out to the senders.
    pub fn process_rejection(
        &self,
        w: &mut ResponseWriter,
        itx: &ParsedTx,
        rejection: &Rejection,
        now: Timestamp,
    ) -> Result<(), HandlerError> {
        let services = &self.services;
        if !addressed_to(itx, &rejection.receiver_indexes, &services.key.address)? {
            return Ok(()); // not addressed to this contract
        }

        warn!(
            "Rejection received ({}): {}",
            rejection.code, rejection.text
        );

        // Trace back through the relay chain to the transfer being
        // aborted.
        let mut txid = itx.inputs[0].utxo.txid;
        let mut transfer_tx = None;
        for _ in 0..4 {
            let tx = match state::transactions::get_tx(
                &*services.storage,
                &txid,
                services.config.is_test,
            ) {
                Ok(tx) => tx,
                Err(state::StateError::NotFound) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            match &tx.payload {
                Some(Action::Transfer(_)) => {
                    transfer_tx = Some(tx);
                    break;
                }
                Some(Action::Message(message)) => {
                    match protocol::parse_message_payload(message.message_code, &message.payload) {
                        Ok(MessagePayload::SettlementRequest(request)) => {
                            txid = request.transfer_tx_id;
                        }
                        Ok(MessagePayload::SignatureRequest(request)) => {
                            let tx: Transaction = deserialize(&request.payload)
                                .map_err(|err| HandlerError::Malformed(err.to_string()))?;
                            txid = tx.input[0].previous_output.txid;
                        }
                        Err(_) => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
        let transfer_tx = match transfer_tx {
            Some(tx) => tx,
            None => return Ok(()),
        };
        let transfer = match &transfer_tx.payload {
            Some(Action::Transfer(transfer)) => transfer.clone(),
            _ => return Ok(()),
        };

        self.refund_transfer_from_reject(w, itx, rejection, &transfer_tx, &transfer, now)
    }

    fn refund_transfer_from_reject(
        &self,
        w: &mut ResponseWriter,
        rejection_tx: &ParsedTx,
        rejection: &Rejection,
        transfer_tx: &ParsedTx,
        transfer: &Transfer,
        now: Timestamp,
    ) -> Result<(), HandlerError> {
        let services = &self.services;
        let contract_address = services.key.address;

        match state::transfer::remove(&*services.storage, &contract_address, &transfer_tx.txid) {
            Ok(()) => {}
            Err(state::StateError::NotFound) => {
                warn!("No pending transfer to remove for {}", transfer_tx.txid);
            }
            Err(err) => return Err(err.into()),
        }
        match services.scheduler.cancel_job(&timeout_job_key(transfer_tx.txid)) {
            Ok(()) => {}
            Err(SchedulerError::NotFound) => {
                warn!("Transfer timeout job not found to cancel");
            }
        }

        let first = first_contract_output_index(&transfer.assets, transfer_tx)
            .ok_or_else(|| HandlerError::Malformed(s!("first contract output index not found")))?;
        if transfer_tx.outputs[first as usize].address != Some(contract_address) {
            return Ok(()); // the first contract issues the refunds
        }

        // Abort this contract's tentative settlement state.
        let updates = revert_transfer_holdings(services, transfer_tx, transfer, now)?;
        save_holdings(services, &updates);

        let mut utxos = transfer_tx.utxos_for_address(&contract_address);
        if let Some(boomerang_index) =
            find_boomerang_index(transfer_tx, transfer, &contract_address)
        {
            // Spent by the settlement request already.
            utxos.retain(|utxo| utxo.index != boomerang_index);
        }
        utxos.extend(rejection_tx.utxos_for_address(&contract_address));
        let balance: u64 = utxos.iter().map(|utxo| utxo.value).sum();
        w.set_reject_utxos(utxos);

        let refund_balance = add_refund_outputs(w, transfer_tx, transfer);

        if refund_balance > balance {
            let ct = state::contract::retrieve(&*services.storage, &contract_address)?;
            w.clear_reject_output_values(ct.administration_address);
        }

        // Carry the peer's rejection target through to the final response.
        if (rejection.reject_address_index as usize) < rejection_tx.outputs.len() {
            if let Some(address) =
                rejection_tx.outputs[rejection.reject_address_index as usize].address
            {
                if address != contract_address {
                    w.reject_address = Some(address);
                }
            }
        }

        let code = RejectCode::from_u8(rejection.code).unwrap_or(RejectCode::MsgMalformed);
        respond_reject(w, transfer_tx, &services.key, code, &rejection.text, now)
    }

    /// Rejects a transfer from inside the relay. A non-first contract only
    /// notifies the first contract, which alone issues the user-visible
    /// rejection and refunds.
    fn respond_transfer_message_reject(
        &self,
        w: &mut ResponseWriter,
        message_tx: &ParsedTx,
        transfer_tx: &ParsedTx,
        transfer: &Transfer,
        code: RejectCode,
        now: Timestamp,
    ) -> Result<(), HandlerError> {
        let services = &self.services;
        let contract_address = services.key.address;

        let first = first_contract_output_index(&transfer.assets, transfer_tx)
            .ok_or_else(|| HandlerError::Malformed(s!("first contract output index not found")))?;
        let first_address = transfer_tx.outputs[first as usize]
            .address
            .ok_or_else(|| HandlerError::Malformed(s!("first contract output not P2PKH")))?;

        if first_address != contract_address {
            // Forward the rejection upstream; the first contract refunds.
            w.add_reject_value(first_address, 0);
            w.reject_address = Some(first_address);
            return respond_reject(w, message_tx, &services.key, code, "", now);
        }

        // First contract: abort the transfer outright.
        match state::transfer::remove(&*services.storage, &contract_address, &transfer_tx.txid) {
            Ok(()) | Err(state::StateError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        match services.scheduler.cancel_job(&timeout_job_key(transfer_tx.txid)) {
            Ok(()) | Err(SchedulerError::NotFound) => {}
        }

        let updates = revert_transfer_holdings(services, transfer_tx, transfer, now)?;
        save_holdings(services, &updates);

        let mut utxos = transfer_tx.utxos_for_address(&contract_address);
        if let Some(boomerang_index) =
            find_boomerang_index(transfer_tx, transfer, &contract_address)
        {
            utxos.retain(|utxo| utxo.index != boomerang_index);
        }
        utxos.extend(message_tx.utxos_for_address(&contract_address));
        let balance: u64 = utxos.iter().map(|utxo| utxo.value).sum();
        w.set_reject_utxos(utxos);

        let refund_balance = add_refund_outputs(w, transfer_tx, transfer);

        if refund_balance > balance {
            let ct = state::contract::retrieve(&*services.storage, &contract_address)?;
            w.clear_reject_output_values(ct.administration_address);
        }

        respond_reject(w, transfer_tx, &services.key, code, "", now)
    }
}

/// Whether any of the payload's receiver indexes is an output addressed to
/// this contract.
fn addressed_to(
    itx: &ParsedTx,
    receiver_indexes: &[u32],
    contract_address: &RawAddress,
) -> Result<bool, HandlerError> {
    for index in receiver_indexes {
        if *index as usize >= itx.outputs.len() {
            return Err(HandlerError::Malformed(s!(
                "receiver index out of range"
            )));
        }
        if itx.outputs[*index as usize].address.as_ref() == Some(contract_address) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Every non-bitcoin asset of the transfer has its settlement entry.
fn settlement_is_complete(transfer: &Transfer, settlement: &Settlement) -> bool {
    transfer.assets.iter().all(|at| {
        at.is_bitcoin()
            || settlement
                .assets
                .iter()
                .any(|entry| entry.asset_type == at.asset_type && entry.asset_code == at.asset_code)
    })
}

/// Sends the completed settlement tx back to a contract which still has to
/// sign, funded by the relay message output addressed to this contract.
fn send_to_previous_settlement_contract(
    services: &Services,
    w: &mut ResponseWriter,
    itx: &ParsedTx,
    settle_tx: &TxBuilder,
    now: Timestamp,
) -> Result<(), HandlerError> {
    let mut unsigned = None;
    for index in 0..settle_tx.tx.input.len() {
        if !settle_tx.input_is_signed(index) {
            unsigned = Some(index);
        }
    }
    let unsigned =
        unsigned.ok_or_else(|| HandlerError::Malformed(s!("no input needs a signature")))?;

    let previous = settle_tx
        .input_address(unsigned)
        .ok_or_else(|| HandlerError::Malformed(s!("unsigned input is not P2PKH")))?;

    info!("Sending signature request to {}", previous);

    // The previous contract receives everything except the relay tx fee.
    w.add_change_output(previous);

    let payload = MessagePayload::SignatureRequest(SignatureRequest {
        timestamp: now,
        payload: serialize(&settle_tx.tx),
    });
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

/// Re-derives every balance movement of this contract's assets from local
/// state and compares it with the settlement quantities built by the peer
/// contracts. Bitcoin movements are checked against the tx outputs.
fn verify_settlement(
    services: &Services,
    transfer_tx: &ParsedTx,
    transfer: &Transfer,
    settle_wire_tx: &Transaction,
    settlement: &Settlement,
    now: Timestamp,
) -> Result<(), ComposeError> {
    let contract_address = services.key.address;

    let settle_output_addresses: Vec<Option<RawAddress>> = settle_wire_tx
        .output
        .iter()
        .map(|output| RawAddress::from_lock_script(&output.script_pubkey))
        .collect();

    let ct = state::contract::retrieve(&*services.storage, &contract_address)?;
    if !ct.freeze_period.is_zero() && ct.freeze_period > now {
        return Err(ComposeError::Reject(RejectCode::ContractFrozen));
    }

    for at in &transfer.assets {
        if at.is_bitcoin() {
            // Bitcoin amounts live directly in the outputs.
            for receiver in &at.receivers {
                let funded = settle_output_addresses
                    .iter()
                    .zip(&settle_wire_tx.output)
                    .any(|(address, output)| {
                        address.as_ref() == Some(&receiver.address)
                            && output.value >= receiver.quantity
                    });
                if !funded {
                    warn!("Bitcoin settlement output missing for {}", receiver.address);
                    return Err(ComposeError::Reject(RejectCode::MsgMalformed));
                }
            }
            continue;
        }

        if at.contract_index as usize >= transfer_tx.outputs.len() {
            return Err(ComposeError::Reject(RejectCode::MsgMalformed));
        }
        if transfer_tx.outputs[at.contract_index as usize].address != Some(contract_address) {
            continue; // not this contract's asset
        }

        let asset_code = AssetCode::from_bytes(&at.asset_code)
            .ok_or(ComposeError::Reject(RejectCode::MsgMalformed))?;
        let asset = state::asset::retrieve(&*services.storage, &contract_address, &asset_code)
            .map_err(|err| match err {
                state::StateError::NotFound => ComposeError::Reject(RejectCode::MsgMalformed),
                other => ComposeError::Fatal(other.into()),
            })?;
        if let Some(code) = state::asset::transfer_gate(&asset, now) {
            return Err(ComposeError::Reject(code));
        }

        let asset_settlement = settlement
            .assets
            .iter()
            .find(|entry| entry.asset_type == at.asset_type && entry.asset_code == at.asset_code)
            .ok_or_else(|| {
                ComposeError::Fatal(HandlerError::Malformed(s!(
                    "asset settlement not found during verify"
                )))
            })?;

        let mut quantities: Vec<Option<u64>> = vec![None; settle_wire_tx.output.len()];
        let mut send_balance: u64 = 0;
        let mut from_administration: u64 = 0;
        let mut from_others: u64 = 0;
        let mut to_administration: u64 = 0;
        let mut to_others: u64 = 0;

        for sender in &at.senders {
            if sender.index as usize >= transfer_tx.inputs.len() {
                return Err(ComposeError::Reject(RejectCode::MsgMalformed));
            }
            let sender_address = transfer_tx.inputs[sender.index as usize]
                .address
                .ok_or(ComposeError::Reject(RejectCode::MsgMalformed))?;

            let output_index = settle_output_addresses
                .iter()
                .position(|address| address.as_ref() == Some(&sender_address))
                .ok_or(ComposeError::Reject(RejectCode::MsgMalformed))?;

            let holding = services
                .cache
                .get_holding(&contract_address, &asset_code, &sender_address, now)?;
            if !holdings::check_balance_frozen(&holding, sender.quantity, now) {
                warn!(
                    "Frozen funds: asset={} party={}",
                    asset_code, sender_address
                );
                return Err(ComposeError::Reject(RejectCode::HoldingsFrozen));
            }

            let balance = quantities[output_index].unwrap_or(holding.finalized_balance);
            if balance < sender.quantity {
                warn!(
                    "Insufficient funds: asset={} party={}",
                    asset_code, sender_address
                );
                return Err(ComposeError::Reject(RejectCode::InsufficientQuantity));
            }
            quantities[output_index] = Some(balance - sender.quantity);
            send_balance += sender.quantity;

            if sender_address == ct.administration_address {
                from_administration += sender.quantity;
            } else {
                from_others += sender.quantity;
            }
        }

        for receiver in &at.receivers {
            let output_index = settle_output_addresses
                .iter()
                .position(|address| address.as_ref() == Some(&receiver.address))
                .ok_or(ComposeError::Reject(RejectCode::MsgMalformed))?;

            let balance = match quantities[output_index] {
                Some(balance) => balance,
                None => {
                    let holding = services.cache.get_holding(
                        &contract_address,
                        &asset_code,
                        &receiver.address,
                        now,
                    )?;
                    holding.finalized_balance
                }
            };
            quantities[output_index] = Some(balance + receiver.quantity);

            if receiver.quantity > send_balance {
                return Err(ComposeError::Reject(RejectCode::MsgMalformed));
            }
            send_balance -= receiver.quantity;

            if receiver.address == ct.administration_address {
                to_administration += receiver.quantity;
            } else {
                to_others += receiver.quantity;
            }
        }

        if send_balance != 0 {
            return Err(ComposeError::Reject(RejectCode::MsgMalformed));
        }

        if !asset.transfers_permitted
            && (from_others > to_administration || to_others > from_administration)
        {
            return Err(ComposeError::Reject(RejectCode::AssetNotPermitted));
        }

        // Every derived balance must match the peer-built settlement.
        for (index, quantity) in quantities.iter().enumerate() {
            let quantity = match quantity {
                Some(quantity) => *quantity,
                None => continue,
            };
            let entry = asset_settlement
                .settlements
                .iter()
                .find(|entry| entry.index as usize == index);
            match entry {
                Some(entry) if entry.quantity == quantity => {}
                Some(entry) => {
                    warn!(
                        "Incorrect settlement quantity for output {}: {} != {}: {}",
                        index, quantity, entry.quantity, asset_code
                    );
                    return Err(ComposeError::Reject(RejectCode::MsgMalformed));
                }
                None => {
                    warn!("Missing settlement for output {}: {}", index, asset_code);
                    return Err(ComposeError::Reject(RejectCode::MsgMalformed));
                }
            }
        }
    }

    // The fee owed to this contract must be provided for.
    if ct.contract_fee > 0 {
        if let Some(fee_address) = services.config.fee_address {
            let paid = settle_output_addresses
                .iter()
                .zip(&settle_wire_tx.output)
                .any(|(address, output)| {
                    address.as_ref() == Some(&fee_address) && output.value >= ct.contract_fee
                });
            if !paid {
                warn!("Contract fee missing or too low");
                return Err(ComposeError::Reject(RejectCode::MsgMalformed));
            }
        }
    }

    Ok(())
}
