// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! The contract's signing key. Address and key encoding beyond what the
//! engine needs to sign its own inputs stays with the host wallet.

use bitcoin::hashes::hex::FromHex;
use bitcoin::secp256k1::{Secp256k1, SecretKey};

use crate::chain::RawAddress;

/// Key errors.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum KeyError {
    /// invalid secret key material.
    InvalidSecret,

    /// key is not valid hex.
    Hex,
}

/// The key controlling a contract address.
#[derive(Clone, Debug)]
pub struct ContractKey {
    pub secret: SecretKey,
    pub public: bitcoin::PublicKey,
    pub address: RawAddress,
}

impl ContractKey {
    pub fn new(secret: SecretKey) -> ContractKey {
        let secp = Secp256k1::signing_only();
        let public = bitcoin::PublicKey::new(bitcoin::secp256k1::PublicKey::from_secret_key(
            &secp, &secret,
        ));
        ContractKey {
            secret,
            public,
            address: RawAddress::from_pubkey(&public),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<ContractKey, KeyError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| KeyError::InvalidSecret)?;
        Ok(ContractKey::new(secret))
    }

    pub fn from_secret_hex(hex: &str) -> Result<ContractKey, KeyError> {
        let bytes = Vec::<u8>::from_hex(hex).map_err(|_| KeyError::Hex)?;
        if bytes.len() != 32 {
            return Err(KeyError::InvalidSecret);
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        ContractKey::from_secret_bytes(&array)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_controls_its_own_lock_script() {
        let key = ContractKey::from_secret_bytes(&[7u8; 32]).unwrap();
        let script = key.address.lock_script();
        assert_eq!(
            RawAddress::from_lock_script(&script),
            Some(key.address)
        );
    }
}
