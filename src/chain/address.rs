// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::fmt;
use std::str::FromStr;

use bitcoin::blockdata::script::Script;
use bitcoin::hashes::hex::{FromHex, ToHex};
use bitcoin::hashes::{hash160, Hash};
use bitcoin::PubkeyHash;

/// Address type byte for pay-to-public-key-hash addresses. Kept on the wire
/// for format evolution even though it is the only type in use.
pub const ADDRESS_TYPE_P2PKH: u8 = 0x20;

/// A 160-bit hash identifying a party or contract. Used as the key of
/// holdings and as the final path element in storage.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Hash20([u8; 20]);

impl Hash20 {
    pub fn from_bytes(bytes: [u8; 20]) -> Hash20 {
        Hash20(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Hash20 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

/// Script-level address of a party or contract: the hash160 of a public
/// key, lockable as P2PKH. Carries an explicit type byte in its serialized
/// form.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RawAddress {
    hash: Hash20,
}

impl RawAddress {
    pub fn from_pubkey(pubkey: &bitcoin::PublicKey) -> RawAddress {
        let digest = hash160::Hash::hash(&pubkey.to_bytes());
        RawAddress {
            hash: Hash20(digest.into_inner()),
        }
    }

    pub fn from_hash20(bytes: [u8; 20]) -> RawAddress {
        RawAddress {
            hash: Hash20(bytes),
        }
    }

    /// Recovers the address from a P2PKH locking script; `None` for any
    /// other script shape (including data-only outputs).
    pub fn from_lock_script(script: &Script) -> Option<RawAddress> {
        if !script.is_p2pkh() {
            return None;
        }
        let bytes = script.as_bytes();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[3..23]);
        Some(RawAddress {
            hash: Hash20(hash),
        })
    }

    /// The P2PKH locking script paying to this address.
    pub fn lock_script(&self) -> Script {
        let pubkey_hash =
            PubkeyHash::from_slice(&self.hash.0).expect("20 bytes is a valid hash160");
        Script::new_p2pkh(&pubkey_hash)
    }

    pub fn hash(&self) -> Hash20 {
        self.hash
    }

    /// Serialized form: type byte followed by the 20-byte hash.
    pub fn to_bytes(&self) -> [u8; 21] {
        let mut bytes = [0u8; 21];
        bytes[0] = ADDRESS_TYPE_P2PKH;
        bytes[1..].copy_from_slice(&self.hash.0);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 21]) -> Option<RawAddress> {
        if bytes[0] != ADDRESS_TYPE_P2PKH {
            return None;
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[1..]);
        Some(RawAddress {
            hash: Hash20(hash),
        })
    }
}

impl fmt::Display for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_bytes().to_hex())
    }
}

/// Address parsing errors.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum AddressParseError {
    /// address is not valid hex.
    Hex,

    /// address must be 21 bytes (type byte plus hash160).
    Length,

    /// unsupported address type byte {0:#04x}.
    UnknownType(u8),
}

impl FromStr for RawAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = Vec::<u8>::from_hex(s).map_err(|_| AddressParseError::Hex)?;
        if bytes.len() != 21 {
            return Err(AddressParseError::Length);
        }
        let mut array = [0u8; 21];
        array.copy_from_slice(&bytes);
        if array[0] != ADDRESS_TYPE_P2PKH {
            return Err(AddressParseError::UnknownType(array[0]));
        }
        Ok(RawAddress::from_bytes(&array).expect("type byte checked above"))
    }
}

impl serde::Serialize for RawAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for RawAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_script_roundtrip() {
        let address = RawAddress::from_hash20([0x42; 20]);
        let script = address.lock_script();
        assert!(script.is_p2pkh());
        assert_eq!(RawAddress::from_lock_script(&script), Some(address));
    }

    #[test]
    fn serialized_form_roundtrip() {
        let address = RawAddress::from_hash20([0x42; 20]);
        let bytes = address.to_bytes();
        assert_eq!(bytes[0], ADDRESS_TYPE_P2PKH);
        assert_eq!(RawAddress::from_bytes(&bytes), Some(address));
        assert_eq!(address.to_string().parse::<RawAddress>(), Ok(address));
    }

    #[test]
    fn data_output_has_no_address() {
        use bitcoin::blockdata::opcodes;
        use bitcoin::blockdata::script::Builder;
        let script = Builder::new()
            .push_opcode(opcodes::all::OP_RETURN)
            .push_slice(b"data")
            .into_script();
        assert_eq!(RawAddress::from_lock_script(&script), None);
    }
}
