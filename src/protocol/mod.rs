// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Protocol payloads carried in data-only outputs of on-chain transactions.
//!
//! Payloads are typed actions behind a stable two-byte discriminator,
//! length-delimited, and re-serialize byte-identically after an unmodified
//! round-trip. The engine only ever queries the action code, the rejection
//! code, and the raw bytes.

mod actions;
mod encode;
mod messages;

use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Builder, Instruction, Script};

pub use actions::{
    AssetReceiver, AssetSettlement, AssetTransfer, Message, QuantityIndex, Rejection, Settlement,
    Transfer,
};
pub use messages::{MessagePayload, SettlementRequest, SignatureRequest, TargetAddress};

use crate::protocol::encode::ReadCursor;

/// Payload magic for production transactions.
pub const MAGIC: &[u8; 3] = b"TSP";
/// Payload magic for test networks.
pub const MAGIC_TEST: &[u8; 3] = b"TST";

/// Sentinel for an asset transfer that references no contract output.
pub const NO_CONTRACT_INDEX: u32 = 0x0000_ffff;

/// Asset type designator, three ASCII bytes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct AssetType(pub [u8; 3]);

impl AssetType {
    /// The host chain currency. Bitcoin entries carry an empty asset code
    /// and reference no asset state.
    pub const BITCOIN: AssetType = AssetType(*b"BTC");
    /// Issued tokens governed by a contract.
    pub const TOKEN: AssetType = AssetType(*b"TOK");
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Identity of a tokenized asset within a contract.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct AssetCode([u8; 32]);

impl AssetCode {
    pub fn from_bytes(bytes: &[u8]) -> Option<AssetCode> {
        if bytes.len() != 32 {
            return None;
        }
        let mut code = [0u8; 32];
        code.copy_from_slice(bytes);
        Some(AssetCode(code))
    }

    pub fn from_array(bytes: [u8; 32]) -> AssetCode {
        AssetCode(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl std::fmt::Display for AssetCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use bitcoin::hashes::hex::ToHex;
        f.write_str(&self.0.to_hex())
    }
}

/// Nanoseconds since the Unix epoch.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Timestamp {
        Timestamp(chrono::Utc::now().timestamp_nanos() as u64)
    }

    pub fn zero() -> Timestamp {
        Timestamp(0)
    }

    pub fn from_nanos(nanos: u64) -> Timestamp {
        Timestamp(nanos)
    }

    pub fn from_secs(secs: u64) -> Timestamp {
        Timestamp(secs * 1_000_000_000)
    }

    pub fn nanos(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Absolute timestamp `secs` seconds later.
    pub fn plus_secs(self, secs: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(secs * 1_000_000_000))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rejection reason carried in a `Rejection` action.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
#[display(Debug)]
#[repr(u8)]
pub enum RejectCode {
    MsgMalformed = 1,
    InsufficientTxFeeFunding = 2,
    InsufficientQuantity = 3,
    HoldingsFrozen = 4,
    HoldingsLocked = 5,
    ContractMoved = 6,
    ContractFrozen = 7,
    ContractExpired = 8,
    AssetNotPermitted = 9,
    TransferExpired = 10,
    Timeout = 11,
}

impl RejectCode {
    pub fn from_u8(code: u8) -> Option<RejectCode> {
        Some(match code {
            1 => RejectCode::MsgMalformed,
            2 => RejectCode::InsufficientTxFeeFunding,
            3 => RejectCode::InsufficientQuantity,
            4 => RejectCode::HoldingsFrozen,
            5 => RejectCode::HoldingsLocked,
            6 => RejectCode::ContractMoved,
            7 => RejectCode::ContractFrozen,
            8 => RejectCode::ContractExpired,
            9 => RejectCode::AssetNotPermitted,
            10 => RejectCode::TransferExpired,
            11 => RejectCode::Timeout,
            _ => return None,
        })
    }

    /// Default human-readable text included with the rejection.
    pub fn text(self) -> &'static str {
        match self {
            RejectCode::MsgMalformed => "Message malformed",
            RejectCode::InsufficientTxFeeFunding => "Insufficient tx fee funding",
            RejectCode::InsufficientQuantity => "Insufficient quantity",
            RejectCode::HoldingsFrozen => "Holdings frozen",
            RejectCode::HoldingsLocked => "Holdings locked",
            RejectCode::ContractMoved => "Contract moved",
            RejectCode::ContractFrozen => "Contract frozen",
            RejectCode::ContractExpired => "Contract expired",
            RejectCode::AssetNotPermitted => "Asset transfers not permitted",
            RejectCode::TransferExpired => "Transfer offer expired",
            RejectCode::Timeout => "Settlement timed out",
        }
    }
}

/// Two-byte action discriminator.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
#[display(Debug)]
pub enum ActionCode {
    Transfer,
    Settlement,
    Message,
    Rejection,
}

impl ActionCode {
    pub fn as_bytes(self) -> [u8; 2] {
        match self {
            ActionCode::Transfer => *b"T1",
            ActionCode::Settlement => *b"T2",
            ActionCode::Message => *b"M1",
            ActionCode::Rejection => *b"M2",
        }
    }

    pub fn from_bytes(code: [u8; 2]) -> Option<ActionCode> {
        Some(match &code {
            b"T1" => ActionCode::Transfer,
            b"T2" => ActionCode::Settlement,
            b"M1" => ActionCode::Message,
            b"M2" => ActionCode::Rejection,
            _ => return None,
        })
    }
}

/// A parsed protocol action.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Action {
    Transfer(Transfer),
    Settlement(Settlement),
    Message(Message),
    Rejection(Rejection),
}

impl Action {
    pub fn code(&self) -> ActionCode {
        match self {
            Action::Transfer(_) => ActionCode::Transfer,
            Action::Settlement(_) => ActionCode::Settlement,
            Action::Message(_) => ActionCode::Message,
            Action::Rejection(_) => ActionCode::Rejection,
        }
    }

    /// Serializes the action into a data-only locking script.
    pub fn serialize(&self, is_test: bool) -> Script {
        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(if is_test { MAGIC_TEST } else { MAGIC });
        payload.extend_from_slice(&self.code().as_bytes());
        match self {
            Action::Transfer(msg) => msg.serialize(&mut payload),
            Action::Settlement(msg) => msg.serialize(&mut payload),
            Action::Message(msg) => msg.serialize(&mut payload),
            Action::Rejection(msg) => msg.serialize(&mut payload),
        }
        Builder::new()
            .push_opcode(opcodes::OP_FALSE)
            .push_opcode(opcodes::all::OP_RETURN)
            .push_slice(&payload)
            .into_script()
    }

    /// Parses an action out of a locking script. Fails on anything that is
    /// not a data-only output carrying the protocol magic.
    pub fn deserialize(script: &Script, is_test: bool) -> Result<Action, PayloadError> {
        let payload = envelope_payload(script)?;
        let magic: &[u8; 3] = if is_test { MAGIC_TEST } else { MAGIC };
        if payload.len() < 5 || &payload[..3] != magic {
            return Err(PayloadError::NotProtocol);
        }
        let code = ActionCode::from_bytes([payload[3], payload[4]])
            .ok_or(PayloadError::UnknownAction([payload[3], payload[4]]))?;
        let mut cursor = ReadCursor::new(&payload[5..]);
        let action = match code {
            ActionCode::Transfer => Action::Transfer(Transfer::deserialize(&mut cursor)?),
            ActionCode::Settlement => Action::Settlement(Settlement::deserialize(&mut cursor)?),
            ActionCode::Message => Action::Message(Message::deserialize(&mut cursor)?),
            ActionCode::Rejection => Action::Rejection(Rejection::deserialize(&mut cursor)?),
        };
        cursor.finish()?;
        Ok(action)
    }
}

/// Extracts the single data push of an `OP_FALSE OP_RETURN` output.
fn envelope_payload(script: &Script) -> Result<Vec<u8>, PayloadError> {
    let mut instructions = script.instructions();
    match instructions.next() {
        Some(Ok(Instruction::PushBytes(data))) if data.is_empty() => {}
        _ => return Err(PayloadError::NotProtocol),
    }
    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == opcodes::all::OP_RETURN => {}
        _ => return Err(PayloadError::NotProtocol),
    }
    let payload = match instructions.next() {
        Some(Ok(Instruction::PushBytes(data))) => data.to_vec(),
        _ => return Err(PayloadError::NotProtocol),
    };
    if instructions.next().is_some() {
        return Err(PayloadError::NotProtocol);
    }
    Ok(payload)
}

/// Parses a message payload by its discriminator code.
pub fn parse_message_payload(code: u16, payload: &[u8]) -> Result<MessagePayload, PayloadError> {
    let mut cursor = ReadCursor::new(payload);
    let parsed = match code {
        messages::CODE_SETTLEMENT_REQUEST => {
            MessagePayload::SettlementRequest(SettlementRequest::deserialize(&mut cursor)?)
        }
        messages::CODE_SIGNATURE_REQUEST => {
            MessagePayload::SignatureRequest(SignatureRequest::deserialize(&mut cursor)?)
        }
        _ => return Err(PayloadError::UnknownMessageCode(code)),
    };
    cursor.finish()?;
    Ok(parsed)
}

/// Deserializes a raw payload blob (without the script envelope), as carried
/// inside a settlement request.
pub fn parse_embedded_action(data: &[u8], is_test: bool) -> Result<Action, PayloadError> {
    let magic: &[u8; 3] = if is_test { MAGIC_TEST } else { MAGIC };
    if data.len() < 5 || &data[..3] != magic {
        return Err(PayloadError::NotProtocol);
    }
    let code = ActionCode::from_bytes([data[3], data[4]])
        .ok_or(PayloadError::UnknownAction([data[3], data[4]]))?;
    let mut cursor = ReadCursor::new(&data[5..]);
    let action = match code {
        ActionCode::Transfer => Action::Transfer(Transfer::deserialize(&mut cursor)?),
        ActionCode::Settlement => Action::Settlement(Settlement::deserialize(&mut cursor)?),
        ActionCode::Message => Action::Message(Message::deserialize(&mut cursor)?),
        ActionCode::Rejection => Action::Rejection(Rejection::deserialize(&mut cursor)?),
    };
    cursor.finish()?;
    Ok(action)
}

/// Serializes an action into a raw payload blob (without the script
/// envelope), for embedding inside relay messages.
pub fn serialize_embedded_action(action: &Action, is_test: bool) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(if is_test { MAGIC_TEST } else { MAGIC });
    payload.extend_from_slice(&action.code().as_bytes());
    match action {
        Action::Transfer(msg) => msg.serialize(&mut payload),
        Action::Settlement(msg) => msg.serialize(&mut payload),
        Action::Message(msg) => msg.serialize(&mut payload),
        Action::Rejection(msg) => msg.serialize(&mut payload),
    }
    payload
}

/// Payload parsing errors.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum PayloadError {
    /// script is not a protocol data output.
    NotProtocol,

    /// unknown action code {0:?}.
    UnknownAction([u8; 2]),

    /// unknown message payload code {0}.
    UnknownMessageCode(u16),

    /// payload ends before the structure is complete.
    UnexpectedEnd,

    /// payload carries {0} bytes past the end of the structure.
    TrailingBytes(usize),

    /// malformed address encoding inside payload.
    BadAddress,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::RawAddress;

    fn create_demo_transfer() -> Transfer {
        Transfer {
            assets: vec![AssetTransfer {
                asset_type: AssetType::TOKEN,
                asset_code: vec![7u8; 32],
                contract_index: 0,
                senders: vec![QuantityIndex {
                    index: 0,
                    quantity: 100,
                }],
                receivers: vec![AssetReceiver {
                    address: RawAddress::from_hash20([0x11; 20]),
                    quantity: 100,
                }],
            }],
            offer_expiry: Timestamp::zero(),
            exchange_fee: 0,
            exchange_fee_address: None,
        }
    }

    #[test]
    fn transfer_roundtrip_is_lossless() {
        let action = Action::Transfer(create_demo_transfer());
        let script = action.serialize(true);
        let parsed = Action::deserialize(&script, true).unwrap();
        assert_eq!(parsed, action);
        assert_eq!(parsed.serialize(true), script);
    }

    #[test]
    fn wrong_magic_is_not_protocol() {
        let action = Action::Transfer(create_demo_transfer());
        let script = action.serialize(false);
        assert_eq!(
            Action::deserialize(&script, true),
            Err(PayloadError::NotProtocol)
        );
    }

    #[test]
    fn rejection_code_survives_roundtrip() {
        let action = Action::Rejection(Rejection {
            receiver_indexes: vec![0, 2],
            reject_address_index: 1,
            code: RejectCode::Timeout as u8,
            text: s!("Settlement timed out"),
            timestamp: Timestamp::from_nanos(42),
        });
        let script = action.serialize(true);
        match Action::deserialize(&script, true).unwrap() {
            Action::Rejection(rejection) => {
                assert_eq!(RejectCode::from_u8(rejection.code), Some(RejectCode::Timeout));
            }
            _ => panic!("wrong action code"),
        }
    }

    #[test]
    fn non_protocol_scripts_are_skipped() {
        use bitcoin::hashes::Hash;
        let script = Script::new_p2pkh(&bitcoin::PubkeyHash::hash(b"demo"));
        assert_eq!(
            Action::deserialize(&script, true),
            Err(PayloadError::NotProtocol)
        );
    }
}
