// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Response transaction builder: accumulates inputs (with the supplements
//! needed to sign them later) and outputs, distributes the remainder to a
//! change output, and signs P2PKH inputs with legacy sighashes.

use bitcoin::blockdata::script::{Builder, Script};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::{EcdsaSighashType, OutPoint, Transaction, TxIn, TxOut, Witness};

use super::address::RawAddress;
use crate::constants::{ESTIMATED_INPUT_SIZE, P2PKH_OUTPUT_SIZE};
use crate::wallet::ContractKey;

/// Data required to sign an input that is not part of the wire tx itself.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InputSupplement {
    pub locking_script: Script,
    pub value: u64,
}

/// Per-output metadata kept alongside the wire tx.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct OutputSupplement {
    /// Remainder outputs receive everything left after the fee.
    is_remainder: bool,
}

/// Builder errors.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum BuilderError {
    /// insufficient value: {available} available, {needed} needed.
    InsufficientValue { available: u64, needed: u64 },

    /// the key does not control the locking script of this input.
    WrongPrivateKey,

    /// input index {0} out of range.
    InputOutOfRange(usize),

    /// output index {0} out of range.
    OutputOutOfRange(usize),

    /// a change address is required to receive the remainder.
    ChangeAddressNeeded,

    /// no input matched any of the supplied keys.
    MissingKey,

    /// sighash computation failed: {0}.
    Sighash(String),
}

/// Accumulates a transaction and the data needed to fee it and sign it.
#[derive(Clone, Debug)]
pub struct TxBuilder {
    pub tx: Transaction,
    pub inputs: Vec<InputSupplement>,
    outputs: Vec<OutputSupplement>,
    pub dust_limit: u64,
    pub fee_rate: f32,
    change_address: Option<RawAddress>,
}

impl TxBuilder {
    pub fn new(dust_limit: u64, fee_rate: f32) -> TxBuilder {
        TxBuilder {
            tx: Transaction {
                version: 1,
                lock_time: 0,
                input: vec![],
                output: vec![],
            },
            inputs: vec![],
            outputs: vec![],
            dust_limit,
            fee_rate,
            change_address: None,
        }
    }

    /// Rebuilds a builder around a wire transaction received from a peer
    /// contract, pairing each input with the supplement needed to sign it.
    /// Existing signatures are preserved.
    pub fn from_wire(
        tx: Transaction,
        inputs: Vec<InputSupplement>,
        dust_limit: u64,
        fee_rate: f32,
    ) -> Result<TxBuilder, BuilderError> {
        if inputs.len() != tx.input.len() {
            return Err(BuilderError::InputOutOfRange(inputs.len()));
        }
        let outputs = tx
            .output
            .iter()
            .map(|_| OutputSupplement {
                is_remainder: false,
            })
            .collect();
        Ok(TxBuilder {
            tx,
            inputs,
            outputs,
            dust_limit,
            fee_rate,
            change_address: None,
        })
    }

    /// Address receiving the remainder when no remainder output was added
    /// explicitly.
    pub fn set_change_address(&mut self, address: RawAddress) {
        self.change_address = Some(address);
    }

    /// Adds an input spending `outpoint`, keeping the locking script and
    /// value around for fee computation and signing.
    pub fn add_input(&mut self, outpoint: OutPoint, locking_script: Script, value: u64) {
        self.inputs.push(InputSupplement {
            locking_script,
            value,
        });
        self.tx.input.push(TxIn {
            previous_output: outpoint,
            script_sig: Script::new(),
            sequence: 0xffff_ffff,
            witness: Witness::default(),
        });
    }

    /// Adds an arbitrary output. Data-only outputs go through here with a
    /// zero value.
    pub fn add_output(&mut self, locking_script: Script, value: u64, is_remainder: bool) {
        self.outputs.push(OutputSupplement { is_remainder });
        self.tx.output.push(TxOut {
            value,
            script_pubkey: locking_script,
        });
    }

    pub fn add_dust_output(&mut self, address: &RawAddress, is_remainder: bool) {
        self.add_output(address.lock_script(), self.dust_limit, is_remainder);
    }

    pub fn add_payment_output(&mut self, address: &RawAddress, value: u64, is_remainder: bool) {
        self.add_output(address.lock_script(), value, is_remainder);
    }

    pub fn add_value_to_output(&mut self, index: usize, value: u64) -> Result<(), BuilderError> {
        let output = self
            .tx
            .output
            .get_mut(index)
            .ok_or(BuilderError::OutputOutOfRange(index))?;
        output.value += value;
        Ok(())
    }

    pub fn output_address(&self, index: usize) -> Option<RawAddress> {
        self.tx
            .output
            .get(index)
            .and_then(|output| RawAddress::from_lock_script(&output.script_pubkey))
    }

    pub fn input_address(&self, index: usize) -> Option<RawAddress> {
        self.inputs
            .get(index)
            .and_then(|input| RawAddress::from_lock_script(&input.locking_script))
    }

    pub fn input_value(&self) -> u64 {
        self.inputs.iter().map(|input| input.value).sum()
    }

    pub fn output_value(&self) -> u64 {
        self.tx.output.iter().map(|output| output.value).sum()
    }

    /// Estimated miner fee for the transaction once every input is signed.
    pub fn estimated_fee(&self) -> u64 {
        let unsigned: usize = self
            .tx
            .input
            .iter()
            .filter(|input| input.script_sig.is_empty())
            .map(|_| ESTIMATED_INPUT_SIZE - (32 + 4 + 1 + 4))
            .sum();
        let size = self.tx.size() + unsigned;
        (size as f32 * self.fee_rate) as u64
    }

    pub fn input_is_signed(&self, index: usize) -> bool {
        self.tx
            .input
            .get(index)
            .map(|input| !input.script_sig.is_empty())
            .unwrap_or(false)
    }

    pub fn all_inputs_signed(&self) -> bool {
        self.tx
            .input
            .iter()
            .all(|input| !input.script_sig.is_empty())
    }

    /// Assigns the remainder to the change output. Adds one paying the
    /// change address when none is marked and the remainder exceeds dust;
    /// a sub-dust remainder is left to the miner.
    pub fn calculate_fee(&mut self) -> Result<(), BuilderError> {
        let input_value = self.input_value();
        let remainder_index = self.outputs.iter().position(|output| output.is_remainder);

        let fixed_value: u64 = self
            .tx
            .output
            .iter()
            .zip(&self.outputs)
            .filter(|(_, supplement)| !supplement.is_remainder)
            .map(|(output, _)| output.value)
            .sum();

        let mut fee = self.estimated_fee();
        if remainder_index.is_none() {
            fee += (P2PKH_OUTPUT_SIZE as f32 * self.fee_rate) as u64;
        }

        let needed = fixed_value + fee;
        if input_value < needed {
            return Err(BuilderError::InsufficientValue {
                available: input_value,
                needed,
            });
        }
        let remainder = input_value - needed;

        match remainder_index {
            Some(index) => {
                if remainder < self.dust_limit {
                    return Err(BuilderError::InsufficientValue {
                        available: input_value,
                        needed: fixed_value + fee + self.dust_limit,
                    });
                }
                self.tx.output[index].value = remainder;
            }
            None if remainder > self.dust_limit => {
                let change = self
                    .change_address
                    .ok_or(BuilderError::ChangeAddressNeeded)?;
                self.add_payment_output(&change, remainder, false);
            }
            None => {} // sub-dust remainder becomes extra fee
        }
        Ok(())
    }

    /// Signs the single input `index` with `key`. Fails with
    /// [`BuilderError::WrongPrivateKey`] when the key does not control the
    /// input, so callers can probe every input with their own key.
    pub fn sign_input(&mut self, index: usize, key: &ContractKey) -> Result<(), BuilderError> {
        let supplement = self
            .inputs
            .get(index)
            .ok_or(BuilderError::InputOutOfRange(index))?;
        if RawAddress::from_lock_script(&supplement.locking_script) != Some(key.address) {
            return Err(BuilderError::WrongPrivateKey);
        }

        let sighash = self.tx.signature_hash(
            index,
            &supplement.locking_script,
            EcdsaSighashType::All.to_u32(),
        );
        let message =
            Message::from_slice(&sighash[..]).map_err(|err| BuilderError::Sighash(err.to_string()))?;

        let secp = Secp256k1::signing_only();
        let signature = secp.sign_ecdsa(&message, &key.secret);
        let mut sig_bytes = signature.serialize_der().to_vec();
        sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);

        self.tx.input[index].script_sig = Builder::new()
            .push_slice(&sig_bytes)
            .push_key(&key.public)
            .into_script();
        Ok(())
    }

    /// Distributes the remainder, then signs every input controlled by one
    /// of `keys`. Fails when an input matches none of them.
    pub fn sign(&mut self, keys: &[&ContractKey]) -> Result<(), BuilderError> {
        self.calculate_fee()?;
        for index in 0..self.tx.input.len() {
            let address = self.input_address(index);
            let key = keys
                .iter()
                .find(|key| Some(key.address) == address)
                .ok_or(BuilderError::MissingKey)?;
            self.sign_input(index, key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn create_demo_key() -> ContractKey {
        ContractKey::from_secret_bytes(&[0x41; 32]).unwrap()
    }

    fn funded_builder(key: &ContractKey, value: u64) -> TxBuilder {
        let mut builder = TxBuilder::new(546, 1.0);
        builder.add_input(
            OutPoint {
                txid: Txid::hash(b"funding"),
                vout: 0,
            },
            key.address.lock_script(),
            value,
        );
        builder
    }

    #[test]
    fn sign_produces_valid_shaped_scripts() {
        let key = create_demo_key();
        let mut builder = funded_builder(&key, 10_000);
        builder.add_dust_output(&RawAddress::from_hash20([0x55; 20]), false);
        builder.set_change_address(key.address);

        builder.sign(&[&key]).unwrap();
        assert!(builder.all_inputs_signed());
        // change output got added for the remainder
        assert_eq!(builder.tx.output.len(), 2);
        assert_eq!(builder.output_address(1), Some(key.address));
    }

    #[test]
    fn wrong_key_is_reported() {
        let key = create_demo_key();
        let other = ContractKey::from_secret_bytes(&[0x42; 32]).unwrap();
        let mut builder = funded_builder(&key, 10_000);
        builder.add_dust_output(&key.address, true);
        assert_eq!(
            builder.sign_input(0, &other),
            Err(BuilderError::WrongPrivateKey)
        );
    }

    #[test]
    fn underfunded_tx_is_rejected() {
        let key = create_demo_key();
        let mut builder = funded_builder(&key, 600);
        builder.add_payment_output(&RawAddress::from_hash20([0x55; 20]), 5_000, false);
        match builder.sign(&[&key]) {
            Err(BuilderError::InsufficientValue { .. }) => {}
            other => panic!("expected insufficient value, got {:?}", other),
        }
    }
}
