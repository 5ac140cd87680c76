// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Per-party asset balances with a two-phase pending/finalized model.
//!
//! Every movement is first recorded as a pending status against the
//! requesting tx; observing the broadcast settlement finalizes it. Statuses
//! also carry enforcement state (freezes and locks) which block debits.
//! All mutation goes through the operations here; the cache hands out deep
//! copies and takes modified holdings back through [`cache::HoldingsCache::save`].

mod cache;
mod storage;

use std::collections::BTreeMap;

use bitcoin::Txid;

pub use cache::{cache_writer, CacheChannel, CacheError, CacheItem, HoldingsCache};
pub use storage::{
    deserialize_holding, holding_path, list as list_holdings, serialize_holding, SerializeError,
};

use crate::chain::RawAddress;
use crate::protocol::Timestamp;

/// Status code of a holding status record.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
#[display(Debug)]
#[repr(u8)]
pub enum StatusCode {
    PendingDebit = b'D',
    PendingDeposit = b'C',
    Frozen = b'F',
    Locked = b'L',
}

impl StatusCode {
    pub fn from_u8(code: u8) -> Option<StatusCode> {
        Some(match code {
            b'D' => StatusCode::PendingDebit,
            b'C' => StatusCode::PendingDeposit,
            b'F' => StatusCode::Frozen,
            b'L' => StatusCode::Locked,
            _ => return None,
        })
    }
}

/// One active status of a holding, keyed by the tx which created it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HoldingStatus {
    pub code: StatusCode,
    pub tx_id: Txid,
    /// Quantity moved (debits/deposits) or blocked (freezes/locks).
    pub amount: u64,
    /// Resulting balance once the originating tx settles.
    pub settle_quantity: u64,
    /// Enforcement statuses expire; zero means indefinite.
    pub expires: Timestamp,
    pub posted: bool,
}

/// The balance record of one party for one asset under one contract.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Holding {
    pub address: RawAddress,
    pub pending_balance: u64,
    pub finalized_balance: u64,
    pub statuses: BTreeMap<Txid, HoldingStatus>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Holding {
    /// A fresh zero-balance holding, created on first touch.
    pub fn new(address: RawAddress, now: Timestamp) -> Holding {
        Holding {
            address,
            pending_balance: 0,
            finalized_balance: 0,
            statuses: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Holdings operation failures. The input-derived ones map 1:1 to
/// rejection codes in the handlers.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum HoldingsError {
    /// holding already carries a status for this tx.
    DuplicateEntry,

    /// insufficient holdings.
    Insufficient,

    /// holdings are frozen.
    Frozen,

    /// holdings are locked.
    Locked,

    /// no status recorded for this tx.
    StatusNotFound,

    /// the status for this tx is not a pending settlement entry.
    NotPending,
}

fn status_active(status: &HoldingStatus, now: Timestamp) -> bool {
    status.expires.is_zero() || status.expires > now
}

fn frozen_total(holding: &Holding) -> u64 {
    holding
        .statuses
        .values()
        .filter(|status| status.code == StatusCode::Frozen)
        .map(|status| status.amount)
        .sum()
}

fn pending_debit_total(holding: &Holding) -> u64 {
    holding
        .statuses
        .values()
        .filter(|status| status.code == StatusCode::PendingDebit)
        .map(|status| status.amount)
        .sum()
}

fn is_locked(holding: &Holding, now: Timestamp) -> bool {
    holding
        .statuses
        .values()
        .any(|status| status.code == StatusCode::Locked && status_active(status, now))
}

/// Balance available to spend: finalized minus active debits and freezes.
/// Expired enforcement statuses are stripped when the holding is fetched.
pub fn safe_balance(holding: &Holding) -> u64 {
    holding
        .finalized_balance
        .saturating_sub(pending_debit_total(holding))
        .saturating_sub(frozen_total(holding))
}

/// Whether `quantity` can be spent without dipping into frozen funds.
pub fn check_balance_frozen(holding: &Holding, quantity: u64, now: Timestamp) -> bool {
    let frozen: u64 = holding
        .statuses
        .values()
        .filter(|status| status.code == StatusCode::Frozen && status_active(status, now))
        .map(|status| status.amount)
        .sum();
    quantity
        <= holding
            .finalized_balance
            .saturating_sub(pending_debit_total(holding))
            .saturating_sub(frozen)
}

/// Reserves a debit of `quantity` against `tx_id`. With `single_contract`
/// the settlement is known to complete immediately, so the debit finalizes
/// without a pending intermediate.
pub fn add_debit(
    holding: &mut Holding,
    tx_id: Txid,
    quantity: u64,
    single_contract: bool,
    now: Timestamp,
) -> Result<(), HoldingsError> {
    if holding.statuses.contains_key(&tx_id) {
        return Err(HoldingsError::DuplicateEntry);
    }
    if is_locked(holding, now) {
        return Err(HoldingsError::Locked);
    }
    if quantity > safe_balance(holding) {
        // Classify: a debit that would fit absent freezes is frozen funds.
        let unfrozen_limit = holding
            .finalized_balance
            .saturating_sub(pending_debit_total(holding));
        if quantity <= unfrozen_limit {
            return Err(HoldingsError::Frozen);
        }
        return Err(HoldingsError::Insufficient);
    }

    holding.pending_balance -= quantity;
    if single_contract {
        holding.finalized_balance -= quantity;
    } else {
        holding.statuses.insert(tx_id, HoldingStatus {
            code: StatusCode::PendingDebit,
            tx_id,
            amount: quantity,
            settle_quantity: holding.pending_balance,
            expires: Timestamp::zero(),
            posted: false,
        });
    }
    Ok(())
}

/// Reserves a deposit of `quantity` against `tx_id`. Mirrors [`add_debit`].
pub fn add_deposit(
    holding: &mut Holding,
    tx_id: Txid,
    quantity: u64,
    single_contract: bool,
    now: Timestamp,
) -> Result<(), HoldingsError> {
    if holding.statuses.contains_key(&tx_id) {
        return Err(HoldingsError::DuplicateEntry);
    }
    if is_locked(holding, now) {
        return Err(HoldingsError::Locked);
    }

    holding.pending_balance += quantity;
    if single_contract {
        holding.finalized_balance += quantity;
    } else {
        holding.statuses.insert(tx_id, HoldingStatus {
            code: StatusCode::PendingDeposit,
            tx_id,
            amount: quantity,
            settle_quantity: holding.pending_balance,
            expires: Timestamp::zero(),
            posted: false,
        });
    }
    Ok(())
}

/// Applies an observed settlement: assigns the settled balance and drops
/// the pending status. Finalizing a tx that already finalized (fast path,
/// replayed settlement) is a no-op as long as the balance agrees.
pub fn finalize_tx(
    holding: &mut Holding,
    tx_id: Txid,
    settle_quantity: u64,
    now: Timestamp,
) -> Result<(), HoldingsError> {
    match holding.statuses.get(&tx_id) {
        Some(status)
            if status.code == StatusCode::PendingDebit
                || status.code == StatusCode::PendingDeposit =>
        {
            holding.statuses.remove(&tx_id);
            holding.finalized_balance = settle_quantity;
            holding.updated_at = now;
            Ok(())
        }
        Some(_) => Err(HoldingsError::NotPending),
        None if holding.finalized_balance == settle_quantity => Ok(()),
        None => Err(HoldingsError::StatusNotFound),
    }
}

/// Drops the status recorded for `tx_id`, restoring the holding to its
/// exact prior state. Aborted settlements and thaws come through here.
pub fn revert_status(holding: &mut Holding, tx_id: &Txid) -> Result<(), HoldingsError> {
    let status = holding
        .statuses
        .remove(tx_id)
        .ok_or(HoldingsError::StatusNotFound)?;
    match status.code {
        StatusCode::PendingDebit => holding.pending_balance += status.amount,
        StatusCode::PendingDeposit => holding.pending_balance -= status.amount,
        StatusCode::Frozen | StatusCode::Locked => {}
    }
    Ok(())
}

/// Records an enforcement freeze of `amount` against the freeze order tx.
pub fn add_freeze(
    holding: &mut Holding,
    tx_id: Txid,
    amount: u64,
    expires: Timestamp,
) -> Result<(), HoldingsError> {
    if holding.statuses.contains_key(&tx_id) {
        return Err(HoldingsError::DuplicateEntry);
    }
    holding.statuses.insert(tx_id, HoldingStatus {
        code: StatusCode::Frozen,
        tx_id,
        amount,
        settle_quantity: 0,
        expires,
        posted: false,
    });
    Ok(())
}

/// Records an enforcement lock blocking all movement.
pub fn add_lock(
    holding: &mut Holding,
    tx_id: Txid,
    expires: Timestamp,
) -> Result<(), HoldingsError> {
    if holding.statuses.contains_key(&tx_id) {
        return Err(HoldingsError::DuplicateEntry);
    }
    holding.statuses.insert(tx_id, HoldingStatus {
        code: StatusCode::Locked,
        tx_id,
        amount: 0,
        settle_quantity: 0,
        expires,
        posted: false,
    });
    Ok(())
}

/// Strips enforcement statuses whose expiry has passed.
pub(crate) fn clear_expired(holding: &mut Holding, now: Timestamp) {
    holding.statuses.retain(|_, status| match status.code {
        StatusCode::Frozen | StatusCode::Locked => status_active(status, now),
        _ => true,
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;

    fn create_demo_holding(finalized: u64) -> Holding {
        let mut holding = Holding::new(
            RawAddress::from_hash20([0x11; 20]),
            Timestamp::from_nanos(1_000),
        );
        holding.finalized_balance = finalized;
        holding.pending_balance = finalized;
        holding
    }

    #[test]
    fn debit_then_finalize() {
        let now = Timestamp::from_nanos(2_000);
        let mut holding = create_demo_holding(500);
        let txid = Txid::hash(b"transfer");

        add_debit(&mut holding, txid, 100, false, now).unwrap();
        assert_eq!(holding.pending_balance, 400);
        assert_eq!(holding.finalized_balance, 500);
        assert_eq!(safe_balance(&holding), 400);

        finalize_tx(&mut holding, txid, 400, now).unwrap();
        assert_eq!(holding.finalized_balance, 400);
        assert!(holding.statuses.is_empty());
    }

    #[test]
    fn finalize_is_idempotent() {
        let now = Timestamp::from_nanos(2_000);
        let mut holding = create_demo_holding(500);
        let txid = Txid::hash(b"transfer");

        add_debit(&mut holding, txid, 100, false, now).unwrap();
        finalize_tx(&mut holding, txid, 400, now).unwrap();
        finalize_tx(&mut holding, txid, 400, now).unwrap();
        assert_eq!(holding.finalized_balance, 400);
    }

    #[test]
    fn single_contract_fast_path_skips_pending() {
        let now = Timestamp::from_nanos(2_000);
        let mut holding = create_demo_holding(500);
        let txid = Txid::hash(b"transfer");

        add_debit(&mut holding, txid, 100, true, now).unwrap();
        assert_eq!(holding.finalized_balance, 400);
        assert!(holding.statuses.is_empty());
        // settlement response replays with the recorded balance
        finalize_tx(&mut holding, txid, 400, now).unwrap();
        assert_eq!(holding.finalized_balance, 400);
    }

    #[test]
    fn debit_revert_restores_prior_state() {
        let now = Timestamp::from_nanos(2_000);
        let mut holding = create_demo_holding(500);
        let before = serialize_holding(&holding);
        let txid = Txid::hash(b"transfer");

        add_debit(&mut holding, txid, 100, false, now).unwrap();
        revert_status(&mut holding, &txid).unwrap();
        assert_eq!(serialize_holding(&holding), before);
    }

    #[test]
    fn duplicate_debit_is_rejected() {
        let now = Timestamp::from_nanos(2_000);
        let mut holding = create_demo_holding(500);
        let txid = Txid::hash(b"transfer");

        add_debit(&mut holding, txid, 100, false, now).unwrap();
        assert_eq!(
            add_debit(&mut holding, txid, 50, false, now),
            Err(HoldingsError::DuplicateEntry)
        );
    }

    #[test]
    fn overdraft_is_insufficient() {
        let now = Timestamp::from_nanos(2_000);
        let mut holding = create_demo_holding(10);
        assert_eq!(
            add_debit(&mut holding, Txid::hash(b"t"), 20, false, now),
            Err(HoldingsError::Insufficient)
        );
    }

    #[test]
    fn frozen_funds_block_debits() {
        let now = Timestamp::from_nanos(2_000);
        let mut holding = create_demo_holding(500);
        add_freeze(&mut holding, Txid::hash(b"freeze"), 450, Timestamp::zero()).unwrap();

        assert_eq!(safe_balance(&holding), 50);
        assert!(!check_balance_frozen(&holding, 100, now));
        assert!(check_balance_frozen(&holding, 50, now));
        assert_eq!(
            add_debit(&mut holding, Txid::hash(b"t"), 100, false, now),
            Err(HoldingsError::Frozen)
        );
        // more than the full balance is plain insufficiency
        assert_eq!(
            add_debit(&mut holding, Txid::hash(b"t"), 600, false, now),
            Err(HoldingsError::Insufficient)
        );
    }

    #[test]
    fn locked_holding_blocks_everything() {
        let now = Timestamp::from_nanos(2_000);
        let mut holding = create_demo_holding(500);
        add_lock(&mut holding, Txid::hash(b"lock"), Timestamp::zero()).unwrap();

        assert_eq!(
            add_debit(&mut holding, Txid::hash(b"t"), 10, false, now),
            Err(HoldingsError::Locked)
        );
        assert_eq!(
            add_deposit(&mut holding, Txid::hash(b"t"), 10, false, now),
            Err(HoldingsError::Locked)
        );
    }

    #[test]
    fn expired_enforcement_is_cleared() {
        let mut holding = create_demo_holding(500);
        add_freeze(
            &mut holding,
            Txid::hash(b"freeze"),
            450,
            Timestamp::from_nanos(1_500),
        )
        .unwrap();
        clear_expired(&mut holding, Timestamp::from_nanos(2_000));
        assert!(holding.statuses.is_empty());
        assert_eq!(safe_balance(&holding), 500);
    }

    #[test]
    fn pending_balance_invariant_holds() {
        let now = Timestamp::from_nanos(2_000);
        let mut holding = create_demo_holding(500);
        add_debit(&mut holding, Txid::hash(b"a"), 100, false, now).unwrap();
        add_deposit(&mut holding, Txid::hash(b"b"), 30, false, now).unwrap();

        let deposits: u64 = holding
            .statuses
            .values()
            .filter(|s| s.code == StatusCode::PendingDeposit)
            .map(|s| s.amount)
            .sum();
        let debits: u64 = holding
            .statuses
            .values()
            .filter(|s| s.code == StatusCode::PendingDebit)
            .map(|s| s.amount)
            .sum();
        assert_eq!(
            holding.pending_balance,
            holding.finalized_balance + deposits - debits
        );
    }
}
