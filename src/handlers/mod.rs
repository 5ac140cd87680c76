// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Action handlers: the transfer/settlement state machine and the
//! inter-contract relay message processing.

mod message;
mod transfer;

use std::sync::Arc;

pub use message::MessageHandler;
pub use transfer::{TransferHandler, TransferTimeoutJob};

use crate::config::Config;
use crate::holdings::{CacheChannel, CacheError, HoldingsCache};
use crate::node::{ActionHandler, Dispatcher, HandlerError, Responder, ShutdownToken};
use crate::protocol::{ActionCode, RejectCode};
use crate::scheduler::Scheduler;
use crate::state::StateError;
use crate::storage::{Storage, StorageError};
use crate::wallet::ContractKey;

/// Everything a handler needs to process a request: configuration, the
/// storage backend, the holdings cache with its writer channel, the
/// scheduler, the contract key and the broadcast sink.
pub struct Services {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<HoldingsCache>,
    pub cache_channel: CacheChannel,
    pub scheduler: Arc<Scheduler>,
    pub key: ContractKey,
    pub responder: Arc<dyn Responder>,
    pub shutdown: ShutdownToken,
}

/// Outcome of composing settlement data: either a protocol-level rejection
/// the caller turns into a `Rejection` response, or an infrastructure
/// failure that bubbles to the dispatcher for retry.
#[derive(Debug)]
pub(crate) enum ComposeError {
    Reject(RejectCode),
    Fatal(HandlerError),
}

impl From<HandlerError> for ComposeError {
    fn from(err: HandlerError) -> Self {
        ComposeError::Fatal(err)
    }
}

impl From<CacheError> for ComposeError {
    fn from(err: CacheError) -> Self {
        ComposeError::Fatal(err.into())
    }
}

impl From<StateError> for ComposeError {
    fn from(err: StateError) -> Self {
        ComposeError::Fatal(err.into())
    }
}

impl From<StorageError> for ComposeError {
    fn from(err: StorageError) -> Self {
        ComposeError::Fatal(err.into())
    }
}

/// Wires the full handler registry onto a dispatcher.
pub fn api(services: Arc<Services>) -> Dispatcher {
    let transfer = Arc::new(TransferHandler::new(Arc::clone(&services)));
    let message = Arc::new(MessageHandler::new(Arc::clone(&services)));

    let mut dispatcher = Dispatcher::new(
        services.config.clone(),
        Arc::clone(&services.responder),
    );
    dispatcher.handle(ActionCode::Transfer, Arc::clone(&transfer) as Arc<dyn ActionHandler>);
    dispatcher.handle(ActionCode::Settlement, transfer as Arc<dyn ActionHandler>);
    dispatcher.handle(ActionCode::Message, Arc::clone(&message) as Arc<dyn ActionHandler>);
    dispatcher.handle(ActionCode::Rejection, message as Arc<dyn ActionHandler>);
    dispatcher
}
