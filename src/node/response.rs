// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Response composition. Handlers accumulate inputs and outputs on a
//! [`ResponseWriter`]; [`respond_success`] and [`respond_reject`] turn the
//! accumulated state into a signed transaction and hand it to the
//! responder for broadcast.

use std::sync::Arc;

use bitcoin::Transaction;

use super::HandlerError;
use crate::chain::{BuilderError, ParsedTx, RawAddress, TxBuilder, Utxo};
use crate::config::Config;
use crate::protocol::{Action, RejectCode, Rejection, Timestamp};
use crate::wallet::ContractKey;

const NAME: &str = "responder";

/// Broadcast sink for composed response transactions.
pub trait Responder: Send + Sync {
    fn respond(&self, tx: Transaction) -> Result<(), HandlerError>;
}

/// An output of a response under composition.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Output {
    pub address: RawAddress,
    pub value: u64,
    pub is_remainder: bool,
}

/// Accumulates the funding and outputs of one response transaction.
pub struct ResponseWriter {
    pub config: Config,
    pub inputs: Vec<Utxo>,
    pub outputs: Vec<Output>,
    pub reject_inputs: Vec<Utxo>,
    pub reject_outputs: Vec<Output>,
    /// Overrides the address receiving the rejection remainder.
    pub reject_address: Option<RawAddress>,
    responder: Arc<dyn Responder>,
}

impl ResponseWriter {
    pub fn new(config: Config, responder: Arc<dyn Responder>) -> ResponseWriter {
        ResponseWriter {
            config,
            inputs: vec![],
            outputs: vec![],
            reject_inputs: vec![],
            reject_outputs: vec![],
            reject_address: None,
            responder,
        }
    }

    /// Pins the UTXOs funding the next success response.
    pub fn set_utxos(&mut self, utxos: Vec<Utxo>) {
        self.inputs = utxos;
    }

    /// Adds an output which receives everything left after the fee.
    pub fn add_change_output(&mut self, address: RawAddress) {
        self.outputs.push(Output {
            address,
            value: 0,
            is_remainder: true,
        });
    }

    pub fn add_output(&mut self, address: RawAddress, value: u64) {
        self.outputs.push(Output {
            address,
            value,
            is_remainder: false,
        });
    }

    /// Pins the UTXOs funding the next rejection response.
    pub fn set_reject_utxos(&mut self, utxos: Vec<Utxo>) {
        self.reject_inputs = utxos;
    }

    /// Adds `value` to the refund owed to `address`; zero records the party
    /// for dust notification only.
    pub fn add_reject_value(&mut self, address: RawAddress, value: u64) {
        if let Some(output) = self
            .reject_outputs
            .iter_mut()
            .find(|output| output.address == address)
        {
            output.value += value;
            return;
        }
        self.reject_outputs.push(Output {
            address,
            value,
            is_remainder: false,
        });
    }

    /// Gives up on per-party refunds: zeroes every refund value and routes
    /// the whole balance to `address` (the administration) instead.
    pub fn clear_reject_output_values(&mut self, address: RawAddress) {
        for output in &mut self.reject_outputs {
            output.value = 0;
        }
        self.reject_address = Some(address);
    }

    pub fn respond(&self, tx: Transaction) -> Result<(), HandlerError> {
        self.responder.respond(tx)
    }
}

/// Builds, signs and broadcasts a success response carrying `action`.
/// Funding comes from the writer's pinned UTXOs, falling back to the
/// request tx outputs addressed to the contract. Returns the broadcast
/// response, inspected, so callers can persist it for later tracing;
/// `None` when no response could be funded.
pub fn respond_success(
    w: &ResponseWriter,
    itx: &ParsedTx,
    key: &ContractKey,
    action: &Action,
    now: Timestamp,
) -> Result<Option<ParsedTx>, HandlerError> {
    let mut builder = TxBuilder::new(w.config.dust_limit, w.config.fee_rate);
    builder.set_change_address(key.address);

    let utxos = if w.inputs.is_empty() {
        itx.utxos_for_address(&key.address)
    } else {
        w.inputs.clone()
    };
    if utxos.is_empty() {
        log::warn!(target: NAME, "No funding for response to {}", itx.txid);
        return Ok(None);
    }
    for utxo in &utxos {
        builder.add_input(utxo.outpoint(), utxo.locking_script.clone(), utxo.value);
    }

    for output in &w.outputs {
        builder.add_payment_output(&output.address, output.value, output.is_remainder);
    }

    builder.add_output(action.serialize(w.config.is_test), 0, false);

    match builder.sign(&[key]) {
        Ok(()) => {}
        Err(BuilderError::InsufficientValue { available, needed }) => {
            log::warn!(
                target: NAME,
                "Insufficient response funding for {}: {}/{}",
                itx.txid,
                available,
                needed
            );
            respond_reject(w, itx, key, RejectCode::InsufficientTxFeeFunding, "", now)?;
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    }

    let response = ParsedTx::parse(builder.tx, utxos, w.config.is_test)
        .map_err(HandlerError::Inspect)?;
    w.respond(response.tx.clone())?;
    Ok(Some(response))
}

/// Builds, signs and broadcasts a `Rejection` response. Refund outputs come
/// from the writer's accumulated reject values; the remainder goes to the
/// writer's reject address, falling back to the sender of the rejected tx.
pub fn respond_reject(
    w: &ResponseWriter,
    itx: &ParsedTx,
    key: &ContractKey,
    code: RejectCode,
    text: &str,
    now: Timestamp,
) -> Result<(), HandlerError> {
    let utxos = if w.reject_inputs.is_empty() {
        itx.utxos_for_address(&key.address)
    } else {
        w.reject_inputs.clone()
    };
    if utxos.is_empty() {
        log::warn!(target: NAME, "No funding to reject {}", itx.txid);
        return Ok(());
    }

    let remainder_address = match w.reject_address {
        Some(address) => address,
        // The sender of the rejected request receives the change.
        None => match itx.inputs.first().and_then(|input| input.address) {
            Some(address) => address,
            None => {
                log::warn!(target: NAME, "Rejected tx {} has no refundable sender", itx.txid);
                return Ok(());
            }
        },
    };

    let mut builder = TxBuilder::new(w.config.dust_limit, w.config.fee_rate);
    for utxo in &utxos {
        builder.add_input(utxo.outpoint(), utxo.locking_script.clone(), utxo.value);
    }

    let mut remainder_index = None;
    for output in &w.reject_outputs {
        if output.address == remainder_address {
            // the remainder output absorbs this party's refund value
            remainder_index = Some(builder.tx.output.len() as u32);
            builder.add_dust_output(&output.address, true);
            continue;
        }
        builder.add_payment_output(
            &output.address,
            output.value.max(w.config.dust_limit),
            false,
        );
    }
    if remainder_index.is_none() {
        remainder_index = Some(builder.tx.output.len() as u32);
        builder.add_dust_output(&remainder_address, true);
    }

    let receiver_indexes: Vec<u32> = (0..builder.tx.output.len() as u32).collect();
    let rejection = Rejection {
        receiver_indexes,
        reject_address_index: remainder_index.unwrap_or(0),
        code: code as u8,
        text: if text.is_empty() {
            code.text().to_owned()
        } else {
            text.to_owned()
        },
        timestamp: now,
    };
    builder.add_output(Action::Rejection(rejection).serialize(w.config.is_test), 0, false);

    match builder.sign(&[key]) {
        Ok(()) => {}
        Err(BuilderError::InsufficientValue { available, needed }) => {
            log::warn!(
                target: NAME,
                "Insufficient funding to reject {}: {}/{}",
                itx.txid,
                available,
                needed
            );
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    }

    log::warn!(target: NAME, "Rejecting {} with {}", itx.txid, code);
    w.respond(builder.tx)
}
