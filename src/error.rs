// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use amplify::IoError;

use crate::storage::StorageError;
use crate::wallet::KeyError;

/// Errors which can happen during daemon start-up.
#[derive(Clone, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum BootstrapError {
    /// I/O failure: {0}.
    #[from]
    Io(IoError),

    /// storage backend failure: {0}.
    #[from]
    Storage(StorageError),

    /// invalid contract key: {0}.
    #[from]
    Key(KeyError),

    /// invalid configuration: {0}.
    Config(String),

    /// unable to create a thread for {0}.
    Thread(&'static str),
}

impl From<std::io::Error> for BootstrapError {
    fn from(err: std::io::Error) -> Self {
        BootstrapError::Io(err.into())
    }
}
