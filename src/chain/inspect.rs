// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Transaction inspection: pairs a wire transaction with the outputs it
//! spends and the protocol payload it carries, which is what every handler
//! works against.

use bitcoin::{OutPoint, Transaction, Txid};

use super::address::RawAddress;
use crate::protocol::Action;

/// An unspent output reference together with the data needed to spend it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Utxo {
    pub txid: Txid,
    pub index: u32,
    pub value: u64,
    pub locking_script: bitcoin::Script,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.index,
        }
    }

    pub fn address(&self) -> Option<RawAddress> {
        RawAddress::from_lock_script(&self.locking_script)
    }
}

/// An input of an inspected transaction, resolved to the output it spends.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxInput {
    pub utxo: Utxo,
    pub address: Option<RawAddress>,
}

/// An output of an inspected transaction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxOutput {
    pub address: Option<RawAddress>,
    pub value: u64,
}

/// Inspection failures.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum InspectError {
    /// transaction has no inputs.
    MissingInputs,

    /// transaction has no outputs.
    MissingOutputs,

    /// {0} spent outputs supplied for {1} transaction inputs.
    InputCountMismatch(usize, usize),
}

/// A transaction resolved against the outputs it spends, with its protocol
/// payload parsed out of the first matching data output.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ParsedTx {
    pub txid: Txid,
    pub tx: Transaction,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub payload: Option<Action>,
    pub payload_vout: u32,
}

impl ParsedTx {
    /// Inspects `tx`. `spent_outputs` must carry one entry per input, in
    /// input order, describing the output that input spends.
    pub fn parse(
        tx: Transaction,
        spent_outputs: Vec<Utxo>,
        is_test: bool,
    ) -> Result<ParsedTx, InspectError> {
        if tx.input.is_empty() {
            return Err(InspectError::MissingInputs);
        }
        if tx.output.is_empty() {
            return Err(InspectError::MissingOutputs);
        }
        if spent_outputs.len() != tx.input.len() {
            return Err(InspectError::InputCountMismatch(
                spent_outputs.len(),
                tx.input.len(),
            ));
        }

        let inputs = spent_outputs
            .into_iter()
            .map(|utxo| TxInput {
                address: utxo.address(),
                utxo,
            })
            .collect();

        let outputs = tx
            .output
            .iter()
            .map(|txout| TxOutput {
                address: RawAddress::from_lock_script(&txout.script_pubkey),
                value: txout.value,
            })
            .collect();

        let mut payload = None;
        let mut payload_vout = 0;
        for (vout, txout) in tx.output.iter().enumerate() {
            if let Ok(action) = Action::deserialize(&txout.script_pubkey, is_test) {
                payload = Some(action);
                payload_vout = vout as u32;
                break;
            }
        }

        Ok(ParsedTx {
            txid: tx.txid(),
            tx,
            inputs,
            outputs,
            payload,
            payload_vout,
        })
    }

    /// The output `index` of this transaction as a spendable UTXO.
    pub fn utxo(&self, index: u32) -> Utxo {
        let txout = &self.tx.output[index as usize];
        Utxo {
            txid: self.txid,
            index,
            value: txout.value,
            locking_script: txout.script_pubkey.clone(),
        }
    }

    /// All outputs of this transaction locked to `address`.
    pub fn utxos_for_address(&self, address: &RawAddress) -> Vec<Utxo> {
        self.outputs
            .iter()
            .enumerate()
            .filter(|(_, output)| output.address.as_ref() == Some(address))
            .map(|(index, _)| self.utxo(index as u32))
            .collect()
    }
}
