// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Node plumbing: the payload dispatcher, the response writer through which
//! handlers emit transactions, and the shared cancellation token.

mod dispatcher;
mod response;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use dispatcher::{ActionHandler, Dispatcher};
pub use response::{respond_reject, respond_success, Output, Responder, ResponseWriter};

use crate::chain::{BuilderError, InspectError};
use crate::holdings::{CacheError, HoldingsError};
use crate::protocol::PayloadError;
use crate::scheduler::SchedulerError;
use crate::state::StateError;
use crate::storage::StorageError;

/// Cancellation token threaded through handlers and workers.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> ShutdownToken {
        ShutdownToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Infrastructure failures inside a handler. The incoming transaction is
/// not acknowledged and will be re-delivered; input-derived problems never
/// surface here, they turn into `Rejection` responses instead.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum HandlerError {
    /// storage failure: {0}.
    #[from]
    Storage(StorageError),

    /// holdings cache failure: {0}.
    #[from]
    Cache(CacheError),

    /// holdings state failure: {0}.
    #[from]
    Holdings(HoldingsError),

    /// response building failure: {0}.
    #[from]
    Builder(BuilderError),

    /// payload failure: {0}.
    #[from]
    Payload(PayloadError),

    /// transaction inspection failure: {0}.
    #[from]
    Inspect(InspectError),

    /// persistent state failure: {0}.
    #[from]
    State(StateError),

    /// scheduler failure: {0}.
    #[from]
    Scheduler(SchedulerError),

    /// malformed request: {0}.
    Malformed(String),

    /// broadcast failure: {0}.
    Broadcast(String),

    /// node is shutting down.
    Cancelled,
}
