// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! On-chain protocol actions: transfer requests, settlements, relay
//! messages and rejections.

use super::encode::{write_bytes, write_u16, write_u32, write_u64, write_u8, ReadCursor};
use super::{AssetType, PayloadError, Timestamp};
use crate::chain::RawAddress;

/// A quantity attached to an input or output index of the carrying tx.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct QuantityIndex {
    pub index: u32,
    pub quantity: u64,
}

/// A receiving party of an asset transfer, identified by address.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AssetReceiver {
    pub address: RawAddress,
    pub quantity: u64,
}

/// Per-asset movement description inside a `Transfer`.
///
/// `contract_index` points at the output of the transfer tx whose locking
/// script addresses the contract responsible for this asset;
/// [`super::NO_CONTRACT_INDEX`] when no contract is involved (bitcoin-only
/// entries). Senders reference transfer tx inputs by index; receivers are
/// named by address.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AssetTransfer {
    pub asset_type: AssetType,
    pub asset_code: Vec<u8>,
    pub contract_index: u32,
    pub senders: Vec<QuantityIndex>,
    pub receivers: Vec<AssetReceiver>,
}

impl AssetTransfer {
    /// True for entries moving the host chain currency itself.
    pub fn is_bitcoin(&self) -> bool {
        self.asset_type == AssetType::BITCOIN && self.asset_code.is_empty()
    }
}

/// Transfer request action.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transfer {
    pub assets: Vec<AssetTransfer>,
    pub offer_expiry: Timestamp,
    pub exchange_fee: u64,
    pub exchange_fee_address: Option<RawAddress>,
}

/// Per-asset resulting balances inside a `Settlement`.
///
/// `contract_index` is the index of the responsible contract's *input* in
/// the settlement tx. Each settlement entry pairs a settlement tx output
/// index with the party's resulting asset balance.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AssetSettlement {
    pub contract_index: u32,
    pub asset_type: AssetType,
    pub asset_code: Vec<u8>,
    pub settlements: Vec<QuantityIndex>,
}

/// Settlement action, co-signed by all involved contracts.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Settlement {
    pub timestamp: Timestamp,
    pub assets: Vec<AssetSettlement>,
}

/// Administrative relay message between contracts. The payload is an opaque
/// blob identified by `message_code`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Message {
    pub receiver_indexes: Vec<u32>,
    pub message_code: u16,
    pub payload: Vec<u8>,
}

/// Rejection action refusing a request, optionally carrying refunds in the
/// outputs of the carrying tx.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Rejection {
    pub receiver_indexes: Vec<u32>,
    pub reject_address_index: u32,
    pub code: u8,
    pub text: String,
    pub timestamp: Timestamp,
}

fn write_address(buf: &mut Vec<u8>, address: &RawAddress) {
    buf.extend_from_slice(&address.to_bytes());
}

fn read_address(cursor: &mut ReadCursor) -> Result<RawAddress, PayloadError> {
    let bytes = cursor.read_array::<21>()?;
    RawAddress::from_bytes(&bytes).ok_or(PayloadError::BadAddress)
}

impl QuantityIndex {
    fn serialize(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.index);
        write_u64(buf, self.quantity);
    }

    fn deserialize(cursor: &mut ReadCursor) -> Result<Self, PayloadError> {
        Ok(QuantityIndex {
            index: cursor.read_u32()?,
            quantity: cursor.read_u64()?,
        })
    }
}

impl AssetReceiver {
    fn serialize(&self, buf: &mut Vec<u8>) {
        write_address(buf, &self.address);
        write_u64(buf, self.quantity);
    }

    fn deserialize(cursor: &mut ReadCursor) -> Result<Self, PayloadError> {
        Ok(AssetReceiver {
            address: read_address(cursor)?,
            quantity: cursor.read_u64()?,
        })
    }
}

impl AssetTransfer {
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.asset_type.0);
        write_bytes(buf, &self.asset_code);
        write_u32(buf, self.contract_index);
        write_u32(buf, self.senders.len() as u32);
        for sender in &self.senders {
            sender.serialize(buf);
        }
        write_u32(buf, self.receivers.len() as u32);
        for receiver in &self.receivers {
            receiver.serialize(buf);
        }
    }

    fn deserialize(cursor: &mut ReadCursor) -> Result<Self, PayloadError> {
        let asset_type = AssetType(cursor.read_array::<3>()?);
        let asset_code = cursor.read_bytes()?;
        let contract_index = cursor.read_u32()?;
        let sender_count = cursor.read_u32()?;
        let mut senders = Vec::with_capacity(sender_count as usize);
        for _ in 0..sender_count {
            senders.push(QuantityIndex::deserialize(cursor)?);
        }
        let receiver_count = cursor.read_u32()?;
        let mut receivers = Vec::with_capacity(receiver_count as usize);
        for _ in 0..receiver_count {
            receivers.push(AssetReceiver::deserialize(cursor)?);
        }
        Ok(AssetTransfer {
            asset_type,
            asset_code,
            contract_index,
            senders,
            receivers,
        })
    }
}

impl Transfer {
    pub(super) fn serialize(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.assets.len() as u32);
        for asset in &self.assets {
            asset.serialize(buf);
        }
        write_u64(buf, self.offer_expiry.nanos());
        write_u64(buf, self.exchange_fee);
        match &self.exchange_fee_address {
            Some(address) => {
                write_u8(buf, 1);
                write_address(buf, address);
            }
            None => write_u8(buf, 0),
        }
    }

    pub(super) fn deserialize(cursor: &mut ReadCursor) -> Result<Self, PayloadError> {
        let asset_count = cursor.read_u32()?;
        let mut assets = Vec::with_capacity(asset_count as usize);
        for _ in 0..asset_count {
            assets.push(AssetTransfer::deserialize(cursor)?);
        }
        let offer_expiry = Timestamp::from_nanos(cursor.read_u64()?);
        let exchange_fee = cursor.read_u64()?;
        let exchange_fee_address = match cursor.read_u8()? {
            0 => None,
            _ => Some(read_address(cursor)?),
        };
        Ok(Transfer {
            assets,
            offer_expiry,
            exchange_fee,
            exchange_fee_address,
        })
    }
}

impl AssetSettlement {
    fn serialize(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.contract_index);
        buf.extend_from_slice(&self.asset_type.0);
        write_bytes(buf, &self.asset_code);
        write_u32(buf, self.settlements.len() as u32);
        for entry in &self.settlements {
            entry.serialize(buf);
        }
    }

    fn deserialize(cursor: &mut ReadCursor) -> Result<Self, PayloadError> {
        let contract_index = cursor.read_u32()?;
        let asset_type = AssetType(cursor.read_array::<3>()?);
        let asset_code = cursor.read_bytes()?;
        let count = cursor.read_u32()?;
        let mut settlements = Vec::with_capacity(count as usize);
        for _ in 0..count {
            settlements.push(QuantityIndex::deserialize(cursor)?);
        }
        Ok(AssetSettlement {
            contract_index,
            asset_type,
            asset_code,
            settlements,
        })
    }
}

impl Settlement {
    pub(super) fn serialize(&self, buf: &mut Vec<u8>) {
        write_u64(buf, self.timestamp.nanos());
        write_u32(buf, self.assets.len() as u32);
        for asset in &self.assets {
            asset.serialize(buf);
        }
    }

    pub(super) fn deserialize(cursor: &mut ReadCursor) -> Result<Self, PayloadError> {
        let timestamp = Timestamp::from_nanos(cursor.read_u64()?);
        let asset_count = cursor.read_u32()?;
        let mut assets = Vec::with_capacity(asset_count as usize);
        for _ in 0..asset_count {
            assets.push(AssetSettlement::deserialize(cursor)?);
        }
        Ok(Settlement { timestamp, assets })
    }
}

impl Message {
    pub(super) fn serialize(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.receiver_indexes.len() as u32);
        for index in &self.receiver_indexes {
            write_u32(buf, *index);
        }
        write_u16(buf, self.message_code);
        write_bytes(buf, &self.payload);
    }

    pub(super) fn deserialize(cursor: &mut ReadCursor) -> Result<Self, PayloadError> {
        let count = cursor.read_u32()?;
        let mut receiver_indexes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            receiver_indexes.push(cursor.read_u32()?);
        }
        Ok(Message {
            receiver_indexes,
            message_code: cursor.read_u16()?,
            payload: cursor.read_bytes()?,
        })
    }
}

impl Rejection {
    pub(super) fn serialize(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.receiver_indexes.len() as u32);
        for index in &self.receiver_indexes {
            write_u32(buf, *index);
        }
        write_u32(buf, self.reject_address_index);
        write_u8(buf, self.code);
        write_bytes(buf, self.text.as_bytes());
        write_u64(buf, self.timestamp.nanos());
    }

    pub(super) fn deserialize(cursor: &mut ReadCursor) -> Result<Self, PayloadError> {
        let count = cursor.read_u32()?;
        let mut receiver_indexes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            receiver_indexes.push(cursor.read_u32()?);
        }
        let reject_address_index = cursor.read_u32()?;
        let code = cursor.read_u8()?;
        let text_bytes = cursor.read_bytes()?;
        let text = String::from_utf8_lossy(&text_bytes).into_owned();
        let timestamp = Timestamp::from_nanos(cursor.read_u64()?);
        Ok(Rejection {
            receiver_indexes,
            reject_address_index,
            code,
            text,
            timestamp,
        })
    }
}
