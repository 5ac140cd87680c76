// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{Storage, StorageError};

/// In-memory blob storage. Backs ephemeral deployments and the test suite.
#[derive(Debug, Default)]
pub struct MemStorage {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> MemStorage {
        MemStorage::default()
    }
}

impl Storage for MemStorage {
    fn put(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock().expect("storage mutex poisoned");
        blobs.insert(path.to_owned(), data.to_vec());
        Ok(())
    }

    fn fetch(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let blobs = self.blobs.lock().expect("storage mutex poisoned");
        blobs.get(path).cloned().ok_or(StorageError::NotFound)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let blobs = self.blobs.lock().expect("storage mutex poisoned");
        Ok(blobs
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock().expect("storage mutex poisoned");
        blobs.remove(path).map(|_| ()).ok_or(StorageError::NotFound)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_fetch_remove() {
        let storage = MemStorage::new();
        storage.put("contracts/ab/holdings/cd/ef", b"blob").unwrap();
        assert_eq!(
            storage.fetch("contracts/ab/holdings/cd/ef").unwrap(),
            b"blob"
        );
        assert_eq!(
            storage.list("contracts/ab/holdings").unwrap(),
            vec![s!("contracts/ab/holdings/cd/ef")]
        );
        storage.remove("contracts/ab/holdings/cd/ef").unwrap();
        assert_eq!(
            storage.remove("contracts/ab/holdings/cd/ef"),
            Err(StorageError::NotFound)
        );
    }
}
