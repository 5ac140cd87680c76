// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Message payloads relayed between contracts inside `Message` actions
//! during multi-contract settlement.

use bitcoin::hashes::Hash;
use bitcoin::Txid;

use super::encode::{write_bytes, write_u32, write_u64, ReadCursor};
use super::{PayloadError, Timestamp};
use crate::chain::RawAddress;

/// Discriminator for [`SettlementRequest`].
pub const CODE_SETTLEMENT_REQUEST: u16 = 1001;
/// Discriminator for [`SignatureRequest`].
pub const CODE_SIGNATURE_REQUEST: u16 = 1002;

/// A fee requirement accumulated while the settlement request travels the
/// contract chain.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TargetAddress {
    pub address: RawAddress,
    pub quantity: u64,
}

/// First relay round: asks the next contract to contribute its settlement
/// data. Carries the incomplete settlement payload and the partially built
/// settlement tx context.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SettlementRequest {
    pub timestamp: Timestamp,
    pub transfer_tx_id: Txid,
    pub contract_fees: Vec<TargetAddress>,
    /// Serialized `Settlement` action payload (without script envelope).
    pub settlement: Vec<u8>,
}

/// Second relay round: asks the previous contract to sign its input of the
/// completed settlement tx. The payload is the consensus-serialized tx.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SignatureRequest {
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

/// A parsed message payload.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MessagePayload {
    SettlementRequest(SettlementRequest),
    SignatureRequest(SignatureRequest),
}

impl MessagePayload {
    pub fn code(&self) -> u16 {
        match self {
            MessagePayload::SettlementRequest(_) => CODE_SETTLEMENT_REQUEST,
            MessagePayload::SignatureRequest(_) => CODE_SIGNATURE_REQUEST,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match self {
            MessagePayload::SettlementRequest(msg) => msg.serialize(&mut buf),
            MessagePayload::SignatureRequest(msg) => msg.serialize(&mut buf),
        }
        buf
    }
}

impl SettlementRequest {
    pub(super) fn serialize(&self, buf: &mut Vec<u8>) {
        write_u64(buf, self.timestamp.nanos());
        buf.extend_from_slice(&self.transfer_tx_id[..]);
        write_u32(buf, self.contract_fees.len() as u32);
        for fee in &self.contract_fees {
            buf.extend_from_slice(&fee.address.to_bytes());
            write_u64(buf, fee.quantity);
        }
        write_bytes(buf, &self.settlement);
    }

    pub(super) fn deserialize(cursor: &mut ReadCursor) -> Result<Self, PayloadError> {
        let timestamp = Timestamp::from_nanos(cursor.read_u64()?);
        let txid_bytes = cursor.read_array::<32>()?;
        let transfer_tx_id =
            Txid::from_slice(&txid_bytes).map_err(|_| PayloadError::UnexpectedEnd)?;
        let fee_count = cursor.read_u32()?;
        let mut contract_fees = Vec::with_capacity(fee_count as usize);
        for _ in 0..fee_count {
            let address_bytes = cursor.read_array::<21>()?;
            let address =
                RawAddress::from_bytes(&address_bytes).ok_or(PayloadError::BadAddress)?;
            let quantity = cursor.read_u64()?;
            contract_fees.push(TargetAddress { address, quantity });
        }
        let settlement = cursor.read_bytes()?;
        Ok(SettlementRequest {
            timestamp,
            transfer_tx_id,
            contract_fees,
            settlement,
        })
    }
}

impl SignatureRequest {
    pub(super) fn serialize(&self, buf: &mut Vec<u8>) {
        write_u64(buf, self.timestamp.nanos());
        write_bytes(buf, &self.payload);
    }

    pub(super) fn deserialize(cursor: &mut ReadCursor) -> Result<Self, PayloadError> {
        Ok(SignatureRequest {
            timestamp: Timestamp::from_nanos(cursor.read_u64()?),
            payload: cursor.read_bytes()?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::parse_message_payload;

    #[test]
    fn settlement_request_roundtrip() {
        let request = MessagePayload::SettlementRequest(SettlementRequest {
            timestamp: Timestamp::from_nanos(1_000_000),
            transfer_tx_id: Txid::hash(b"transfer"),
            contract_fees: vec![TargetAddress {
                address: RawAddress::from_hash20([0x22; 20]),
                quantity: 2_000,
            }],
            settlement: vec![1, 2, 3],
        });
        let data = request.serialize();
        let parsed = parse_message_payload(CODE_SETTLEMENT_REQUEST, &data).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.serialize(), data);
    }

    #[test]
    fn unknown_message_code_fails() {
        assert!(parse_message_payload(4242, &[]).is_err());
    }
}
