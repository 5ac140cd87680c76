// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Routes observed protocol transactions to action handlers by their
//! payload discriminator. The registry is explicit: one handler list per
//! action code, no runtime type inspection beyond the code itself.

use std::collections::HashMap;
use std::sync::Arc;

use super::response::{Responder, ResponseWriter};
use super::HandlerError;
use crate::chain::ParsedTx;
use crate::config::Config;
use crate::protocol::{ActionCode, Timestamp};

const NAME: &str = "dispatcher";

/// A handler for one or more action codes. Handlers inspect the parsed
/// payload themselves; the dispatcher guarantees it is present and carries
/// a code the handler registered for.
pub trait ActionHandler: Send + Sync {
    fn handle(
        &self,
        w: &mut ResponseWriter,
        itx: &ParsedTx,
        now: Timestamp,
    ) -> Result<(), HandlerError>;
}

/// The payload-code-to-handler registry.
pub struct Dispatcher {
    config: Config,
    responder: Arc<dyn Responder>,
    handlers: HashMap<ActionCode, Vec<Arc<dyn ActionHandler>>>,
}

impl Dispatcher {
    pub fn new(config: Config, responder: Arc<dyn Responder>) -> Dispatcher {
        Dispatcher {
            config,
            responder,
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `code`.
    pub fn handle(&mut self, code: ActionCode, handler: Arc<dyn ActionHandler>) {
        self.handlers.entry(code).or_default().push(handler);
    }

    /// Routes an observed transaction to every handler registered for its
    /// action code. Transactions without a protocol payload are not
    /// dispatchable.
    pub fn trigger(&self, itx: &ParsedTx, now: Timestamp) -> Result<(), HandlerError> {
        let payload = itx
            .payload
            .as_ref()
            .ok_or_else(|| HandlerError::Malformed(s!("not a protocol tx")))?;
        let code = payload.code();

        let handlers = match self.handlers.get(&code) {
            Some(handlers) => handlers,
            None => {
                log::trace!(target: NAME, "No handler for {} tx {}", code, itx.txid);
                return Ok(());
            }
        };

        log::debug!(target: NAME, "Dispatching {} tx {}", code, itx.txid);
        for handler in handlers {
            let mut w = ResponseWriter::new(self.config.clone(), Arc::clone(&self.responder));
            handler.handle(&mut w, itx, now)?;
        }
        Ok(())
    }
}
