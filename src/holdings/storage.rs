// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Deterministic binary persistence of holdings. The format opens with a
//! version byte (currently 0); readers seeing a newer version fail cleanly.

use bitcoin::hashes::Hash;
use bitcoin::Txid;

use super::{Holding, HoldingStatus, StatusCode};
use crate::chain::{Hash20, RawAddress};
use crate::protocol::{AssetCode, Timestamp};
use crate::storage::{Storage, StorageError};

const STORAGE_KEY: &str = "contracts";
const STORAGE_SUB_KEY: &str = "holdings";

const VERSION: u8 = 0;

/// Serialization failures.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum SerializeError {
    /// holding record ends before the structure is complete.
    UnexpectedEnd,

    /// unknown holding record version {0}.
    UnknownVersion(u8),

    /// malformed address inside holding record.
    BadAddress,

    /// unknown holding status code {0:#04x}.
    BadStatusCode(u8),
}

/// Storage path of one holding record.
pub fn holding_path(contract: &Hash20, asset_code: &AssetCode, address: &Hash20) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        STORAGE_KEY, contract, STORAGE_SUB_KEY, asset_code, address
    )
}

/// Lists the storage paths of every holding of an asset.
pub fn list(
    storage: &dyn Storage,
    contract: &Hash20,
    asset_code: &AssetCode,
) -> Result<Vec<String>, StorageError> {
    storage.list(&format!(
        "{}/{}/{}/{}",
        STORAGE_KEY, contract, STORAGE_SUB_KEY, asset_code
    ))
}

pub(super) fn fetch(
    storage: &dyn Storage,
    contract: &Hash20,
    asset_code: &AssetCode,
    address: &Hash20,
) -> Result<Option<Holding>, StorageError> {
    match storage.fetch(&holding_path(contract, asset_code, address)) {
        Ok(data) => {
            let holding = deserialize_holding(&data)
                .map_err(|err| StorageError::Io(err.to_string()))?;
            Ok(Some(holding))
        }
        Err(StorageError::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

pub(super) fn write(
    storage: &dyn Storage,
    contract: &Hash20,
    asset_code: &AssetCode,
    address: &Hash20,
    holding: &Holding,
) -> Result<(), StorageError> {
    storage.put(
        &holding_path(contract, asset_code, address),
        &serialize_holding(holding),
    )
}

pub fn serialize_holding(holding: &Holding) -> Vec<u8> {
    let mut buf = Vec::with_capacity(80 + holding.statuses.len() * 62);
    buf.push(VERSION);
    buf.extend_from_slice(&holding.address.to_bytes());
    buf.extend_from_slice(&holding.pending_balance.to_le_bytes());
    buf.extend_from_slice(&holding.finalized_balance.to_le_bytes());
    buf.extend_from_slice(&holding.created_at.nanos().to_le_bytes());
    buf.extend_from_slice(&holding.updated_at.nanos().to_le_bytes());
    buf.extend_from_slice(&(holding.statuses.len() as u32).to_le_bytes());
    for status in holding.statuses.values() {
        serialize_status(&mut buf, status);
    }
    buf
}

fn serialize_status(buf: &mut Vec<u8>, status: &HoldingStatus) {
    buf.push(status.code as u8);
    buf.extend_from_slice(&status.expires.nanos().to_le_bytes());
    buf.extend_from_slice(&status.amount.to_le_bytes());
    buf.extend_from_slice(&status.tx_id[..]);
    buf.extend_from_slice(&status.settle_quantity.to_le_bytes());
    buf.push(status.posted as u8);
}

pub fn deserialize_holding(data: &[u8]) -> Result<Holding, SerializeError> {
    let mut reader = Reader { data, offset: 0 };

    let version = reader.u8()?;
    if version != VERSION {
        return Err(SerializeError::UnknownVersion(version));
    }

    let address_bytes: [u8; 21] = reader.array()?;
    let address =
        RawAddress::from_bytes(&address_bytes).ok_or(SerializeError::BadAddress)?;
    let pending_balance = reader.u64()?;
    let finalized_balance = reader.u64()?;
    let created_at = Timestamp::from_nanos(reader.u64()?);
    let updated_at = Timestamp::from_nanos(reader.u64()?);

    let count = reader.u32()?;
    let mut statuses = std::collections::BTreeMap::new();
    for _ in 0..count {
        let status = deserialize_status(&mut reader)?;
        statuses.insert(status.tx_id, status);
    }

    Ok(Holding {
        address,
        pending_balance,
        finalized_balance,
        statuses,
        created_at,
        updated_at,
    })
}

fn deserialize_status(reader: &mut Reader) -> Result<HoldingStatus, SerializeError> {
    let raw_code = reader.u8()?;
    let code = StatusCode::from_u8(raw_code).ok_or(SerializeError::BadStatusCode(raw_code))?;
    let expires = Timestamp::from_nanos(reader.u64()?);
    let amount = reader.u64()?;
    let txid_bytes: [u8; 32] = reader.array()?;
    let tx_id = Txid::from_slice(&txid_bytes).map_err(|_| SerializeError::UnexpectedEnd)?;
    let settle_quantity = reader.u64()?;
    let posted = reader.u8()? != 0;
    Ok(HoldingStatus {
        code,
        tx_id,
        amount,
        settle_quantity,
        expires,
        posted,
    })
}

struct Reader<'data> {
    data: &'data [u8],
    offset: usize,
}

impl<'data> Reader<'data> {
    fn take(&mut self, len: usize) -> Result<&'data [u8], SerializeError> {
        if self.offset + len > self.data.len() {
            return Err(SerializeError::UnexpectedEnd);
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, SerializeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, SerializeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, SerializeError> {
        let bytes = self.take(8)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(le))
    }

    fn array<const LEN: usize>(&mut self) -> Result<[u8; LEN], SerializeError> {
        let bytes = self.take(LEN)?;
        let mut array = [0u8; LEN];
        array.copy_from_slice(bytes);
        Ok(array)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::holdings::{add_debit, add_freeze};

    fn create_demo_holding() -> Holding {
        let now = Timestamp::from_nanos(5_000);
        let mut holding = Holding::new(RawAddress::from_hash20([0x33; 20]), now);
        holding.finalized_balance = 1_000;
        holding.pending_balance = 1_000;
        add_debit(&mut holding, Txid::hash(b"debit"), 250, false, now).unwrap();
        add_freeze(
            &mut holding,
            Txid::hash(b"freeze"),
            100,
            Timestamp::from_nanos(9_000),
        )
        .unwrap();
        holding
    }

    #[test]
    fn serialized_holding_roundtrips_byte_identically() {
        let holding = create_demo_holding();
        let data = serialize_holding(&holding);
        assert_eq!(data[0], 0, "version byte");
        let restored = deserialize_holding(&data).unwrap();
        assert_eq!(restored, holding);
        assert_eq!(serialize_holding(&restored), data);
    }

    #[test]
    fn newer_version_fails_cleanly() {
        let mut data = serialize_holding(&create_demo_holding());
        data[0] = 1;
        assert_eq!(
            deserialize_holding(&data),
            Err(SerializeError::UnknownVersion(1))
        );
    }

    #[test]
    fn truncated_record_fails() {
        let data = serialize_holding(&create_demo_holding());
        assert_eq!(
            deserialize_holding(&data[..data.len() - 4]),
            Err(SerializeError::UnexpectedEnd)
        );
    }
}
