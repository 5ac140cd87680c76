// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Blob storage interface consumed by every persistent component. Paths use
//! `/` separators; the layout is
//! `contracts/<contract-hash>/holdings/<asset-code>/<address-hash>`,
//! `contracts/<contract-hash>/transfers/<tx-id>`,
//! `contracts/<contract-hash>/votes/<tx-id>` and `txs/<tx-id>`.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemStorage;

/// Storage failures.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum StorageError {
    /// path not found in storage.
    NotFound,

    /// storage I/O failure: {0}.
    Io(String),
}

/// Blob storage. Implementations must be safe to call from multiple worker
/// threads at once.
pub trait Storage: Send + Sync {
    fn put(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;
    fn fetch(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    fn remove(&self, path: &str) -> Result<(), StorageError>;
}
