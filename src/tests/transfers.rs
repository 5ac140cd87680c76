// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::time::Duration;

use super::support::*;
use crate::holdings::{self, serialize_holding};
use crate::protocol::{
    Action, AssetReceiver, AssetTransfer, AssetType, QuantityIndex, RejectCode, Timestamp,
    Transfer,
};
use crate::scheduler::{JobKey, SchedulerError};
use crate::state;
use bitcoin::hashes::Hash;
use bitcoin::Txid;

fn token_transfer(entries: Vec<AssetTransfer>) -> Transfer {
    Transfer {
        assets: entries,
        offer_expiry: Timestamp::zero(),
        exchange_fee: 0,
        exchange_fee_address: None,
    }
}

fn token_entry(
    asset_code: &crate::protocol::AssetCode,
    contract_index: u32,
    senders: Vec<QuantityIndex>,
    receivers: Vec<AssetReceiver>,
) -> AssetTransfer {
    AssetTransfer {
        asset_type: AssetType::TOKEN,
        asset_code: asset_code.to_vec(),
        contract_index,
        senders,
        receivers,
    }
}

fn timeout_key(txid: Txid) -> JobKey {
    JobKey {
        kind: "transfer-timeout",
        txid,
    }
}

#[test]
fn single_contract_transfer_settles() {
    let node = TestNode::new(1);
    let asset = demo_asset(0x58);
    node.setup_asset(&asset);
    let a = party(0x0A);
    let b = party(0x0B);
    node.set_balance(&asset, &a, 500);

    let transfer_tx = build_transfer_tx(
        vec![funding_utxo(&a, b"a-funding", 10_000)],
        vec![(node.address(), 3_000)],
        token_transfer(vec![token_entry(
            &asset,
            0,
            vec![QuantityIndex {
                index: 0,
                quantity: 100,
            }],
            vec![AssetReceiver {
                address: b,
                quantity: 100,
            }],
        )]),
    );

    node.trigger(&transfer_tx).unwrap();

    let responses = node.take_responses();
    assert_eq!(responses.len(), 1, "exactly one settlement tx is emitted");
    let settlement = match payload_of(&responses[0]) {
        Some(Action::Settlement(settlement)) => settlement,
        other => panic!("expected settlement, got {:?}", other),
    };
    assert_eq!(settlement.assets.len(), 1);
    let quantities: Vec<u64> = settlement.assets[0]
        .settlements
        .iter()
        .map(|entry| entry.quantity)
        .collect();
    assert_eq!(quantities, vec![400, 100]);

    // the broadcast is observed and finalizes holdings
    let settle_itx = parse_chain_tx(&responses[0], &[&transfer_tx]);
    node.trigger(&settle_itx).unwrap();

    let holding_a = node.holding(&asset, &a);
    assert_eq!(holding_a.finalized_balance, 400);
    assert!(holding_a.statuses.is_empty());
    let holding_b = node.holding(&asset, &b);
    assert_eq!(holding_b.finalized_balance, 100);
    assert!(holding_b.statuses.is_empty());

    // replaying the settlement is a no-op
    node.trigger(&settle_itx).unwrap();
    assert_eq!(node.holding(&asset, &a).finalized_balance, 400);
}

#[test]
fn overdraft_rejects_and_leaves_holding_untouched() {
    let node = TestNode::new(1);
    let asset = demo_asset(0x58);
    node.setup_asset(&asset);
    let a = party(0x0A);
    node.set_balance(&asset, &a, 10);
    let before = serialize_holding(&node.holding(&asset, &a));

    let transfer_tx = build_transfer_tx(
        vec![funding_utxo(&a, b"a-funding", 10_000)],
        vec![(node.address(), 3_000)],
        token_transfer(vec![token_entry(
            &asset,
            0,
            vec![QuantityIndex {
                index: 0,
                quantity: 20,
            }],
            vec![AssetReceiver {
                address: party(0x0B),
                quantity: 20,
            }],
        )]),
    );

    node.trigger(&transfer_tx).unwrap();

    let responses = node.take_responses();
    assert_eq!(responses.len(), 1);
    match payload_of(&responses[0]) {
        Some(Action::Rejection(rejection)) => {
            assert_eq!(
                RejectCode::from_u8(rejection.code),
                Some(RejectCode::InsufficientQuantity)
            );
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    assert_eq!(serialize_holding(&node.holding(&asset, &a)), before);
}

/// Two contracts, asset X on C1 from A to B and asset Y on C2 from B to A:
/// settlement request to C2, signature request back, C1 broadcasts, both
/// finalize.
#[test]
fn two_contract_transfer_settles_via_relay() {
    let c1 = TestNode::new(1);
    let c2 = TestNode::new(2);
    let x = demo_asset(0x58);
    let y = demo_asset(0x59);
    c1.setup_asset(&x);
    c2.setup_asset(&y);
    let a = party(0x0A);
    let b = party(0x0B);
    c1.set_balance(&x, &a, 500);
    c2.set_balance(&y, &b, 50);

    let transfer_tx = build_transfer_tx(
        vec![
            funding_utxo(&a, b"a-funding", 10_000),
            funding_utxo(&b, b"b-funding", 10_000),
        ],
        vec![
            (c1.address(), 3_000), // first contract
            (c2.address(), 2_000),
            (c1.address(), 4_000), // boomerang
        ],
        token_transfer(vec![
            token_entry(
                &x,
                0,
                vec![QuantityIndex {
                    index: 0,
                    quantity: 100,
                }],
                vec![AssetReceiver {
                    address: b,
                    quantity: 100,
                }],
            ),
            token_entry(
                &y,
                1,
                vec![QuantityIndex {
                    index: 1,
                    quantity: 50,
                }],
                vec![AssetReceiver {
                    address: a,
                    quantity: 50,
                }],
            ),
        ]),
    );

    c1.trigger(&transfer_tx).unwrap();
    c2.trigger(&transfer_tx).unwrap();

    // C1 relays a settlement request spending the boomerang output.
    let c1_messages = c1.take_responses();
    assert_eq!(c1_messages.len(), 1);
    assert!(matches!(
        payload_of(&c1_messages[0]),
        Some(Action::Message(_))
    ));
    let settlement_request_tx = parse_chain_tx(&c1_messages[0], &[&transfer_tx]);
    assert_eq!(
        settlement_request_tx.tx.input[0].previous_output.vout, 2,
        "relay is funded by the boomerang output"
    );
    assert!(state::transfer::fetch(&*c1.services.storage, &c1.address(), &transfer_tx.txid).is_ok());

    // pending debit is recorded while the relay is in flight
    let pending_a = c1.holding(&x, &a);
    assert_eq!(pending_a.finalized_balance, 500);
    assert_eq!(holdings::safe_balance(&pending_a), 400);

    c2.trigger(&settlement_request_tx).unwrap();
    c1.trigger(&settlement_request_tx).unwrap();

    // C2 contributed its data and asks C1 for its signature.
    let c2_messages = c2.take_responses();
    assert_eq!(c2_messages.len(), 1);
    assert!(matches!(
        payload_of(&c2_messages[0]),
        Some(Action::Message(_))
    ));
    let signature_request_tx = parse_chain_tx(&c2_messages[0], &[&settlement_request_tx]);

    c1.trigger(&signature_request_tx).unwrap();
    c2.trigger(&signature_request_tx).unwrap();

    // C1 signed the last input and broadcast the settlement.
    let broadcasts = c1.take_responses();
    assert_eq!(broadcasts.len(), 1);
    let settlement = match payload_of(&broadcasts[0]) {
        Some(Action::Settlement(settlement)) => settlement,
        other => panic!("expected settlement, got {:?}", other),
    };
    assert_eq!(settlement.assets.len(), 2);
    assert!(broadcasts[0]
        .input
        .iter()
        .all(|input| !input.script_sig.is_empty()));

    // the pending transfer is resolved and its timeout cancelled
    assert!(matches!(
        state::transfer::fetch(&*c1.services.storage, &c1.address(), &transfer_tx.txid),
        Err(state::StateError::NotFound)
    ));
    assert_eq!(
        c1.services.scheduler.cancel_job(&timeout_key(transfer_tx.txid)),
        Err(SchedulerError::NotFound)
    );

    let settle_itx = parse_chain_tx(&broadcasts[0], &[&transfer_tx]);
    c1.trigger(&settle_itx).unwrap();
    c2.trigger(&settle_itx).unwrap();

    assert_eq!(c1.holding(&x, &a).finalized_balance, 400);
    assert_eq!(c1.holding(&x, &b).finalized_balance, 100);
    assert_eq!(c2.holding(&y, &b).finalized_balance, 0);
    assert_eq!(c2.holding(&y, &a).finalized_balance, 50);
    assert!(c1.holding(&x, &a).statuses.is_empty());
    assert!(c2.holding(&y, &b).statuses.is_empty());
}

/// C2 rejects because its holding is frozen; C1 reverts and issues the
/// user-visible rejection.
#[test]
fn peer_reject_reverts_and_refunds() {
    let c1 = TestNode::new(1);
    let c2 = TestNode::new(2);
    let x = demo_asset(0x58);
    let y = demo_asset(0x59);
    c1.setup_asset(&x);
    c2.setup_asset(&y);
    let a = party(0x0A);
    let b = party(0x0B);
    c1.set_balance(&x, &a, 500);
    c2.set_balance(&y, &b, 50);

    // freeze B's holding of Y on C2
    let mut frozen = c2.holding(&y, &b);
    holdings::add_freeze(&mut frozen, Txid::hash(b"freeze-order"), 50, Timestamp::zero())
        .unwrap();
    c2.services.cache.save(&c2.address(), &y, &frozen);

    let transfer_tx = build_transfer_tx(
        vec![
            funding_utxo(&a, b"a-funding", 10_000),
            funding_utxo(&b, b"b-funding", 10_000),
        ],
        vec![
            (c1.address(), 3_000),
            (c2.address(), 2_000),
            (c1.address(), 4_000),
        ],
        token_transfer(vec![
            token_entry(
                &x,
                0,
                vec![QuantityIndex {
                    index: 0,
                    quantity: 100,
                }],
                vec![AssetReceiver {
                    address: b,
                    quantity: 100,
                }],
            ),
            token_entry(
                &y,
                1,
                vec![QuantityIndex {
                    index: 1,
                    quantity: 50,
                }],
                vec![AssetReceiver {
                    address: a,
                    quantity: 50,
                }],
            ),
        ]),
    );

    c1.trigger(&transfer_tx).unwrap();
    c2.trigger(&transfer_tx).unwrap();

    let c1_messages = c1.take_responses();
    let settlement_request_tx = parse_chain_tx(&c1_messages[0], &[&transfer_tx]);
    c2.trigger(&settlement_request_tx).unwrap();
    c1.trigger(&settlement_request_tx).unwrap();

    // C2 refuses: frozen holdings
    let c2_messages = c2.take_responses();
    assert_eq!(c2_messages.len(), 1);
    match payload_of(&c2_messages[0]) {
        Some(Action::Rejection(rejection)) => {
            assert_eq!(
                RejectCode::from_u8(rejection.code),
                Some(RejectCode::HoldingsFrozen)
            );
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    let reject_tx = parse_chain_tx(&c2_messages[0], &[&settlement_request_tx]);
    c1.trigger(&reject_tx).unwrap();

    // C1 fans out the user-visible rejection
    let c1_rejects = c1.take_responses();
    assert_eq!(c1_rejects.len(), 1);
    match payload_of(&c1_rejects[0]) {
        Some(Action::Rejection(rejection)) => {
            assert_eq!(
                RejectCode::from_u8(rejection.code),
                Some(RejectCode::HoldingsFrozen)
            );
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    // pending statuses reverted, pending transfer resolved, timeout gone
    let holding_a = c1.holding(&x, &a);
    assert_eq!(holding_a.finalized_balance, 500);
    assert_eq!(holdings::safe_balance(&holding_a), 500);
    assert!(holding_a.statuses.is_empty());
    assert!(matches!(
        state::transfer::fetch(&*c1.services.storage, &c1.address(), &transfer_tx.txid),
        Err(state::StateError::NotFound)
    ));
    assert_eq!(
        c1.services.scheduler.cancel_job(&timeout_key(transfer_tx.txid)),
        Err(SchedulerError::NotFound)
    );
}

/// C2 never replies; the scheduled timeout aborts and refunds.
#[test]
fn unanswered_transfer_times_out() {
    let c1 = TestNode::with_timeout(1, 0);
    let c2 = TestNode::new(2);
    let x = demo_asset(0x58);
    let y = demo_asset(0x59);
    c1.setup_asset(&x);
    let a = party(0x0A);
    let b = party(0x0B);
    c1.set_balance(&x, &a, 500);

    let transfer_tx = build_transfer_tx(
        vec![
            funding_utxo(&a, b"a-funding", 10_000),
            funding_utxo(&b, b"b-funding", 10_000),
        ],
        vec![
            (c1.address(), 3_000),
            (c2.address(), 2_000),
            (c1.address(), 4_000),
        ],
        token_transfer(vec![
            token_entry(
                &x,
                0,
                vec![QuantityIndex {
                    index: 0,
                    quantity: 100,
                }],
                vec![AssetReceiver {
                    address: b,
                    quantity: 100,
                }],
            ),
            token_entry(
                &y,
                1,
                vec![QuantityIndex {
                    index: 1,
                    quantity: 50,
                }],
                vec![AssetReceiver {
                    address: a,
                    quantity: 50,
                }],
            ),
        ]),
    );

    c1.trigger(&transfer_tx).unwrap();

    // settlement request first, then the timeout-driven rejection
    let mut responses = vec![];
    for _ in 0..100 {
        responses = c1.responses.lock().unwrap().clone();
        if responses.len() >= 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(responses.len(), 2, "timeout rejection was emitted");
    match payload_of(&responses[1]) {
        Some(Action::Rejection(rejection)) => {
            assert_eq!(RejectCode::from_u8(rejection.code), Some(RejectCode::Timeout));
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    let holding_a = c1.holding(&x, &a);
    assert_eq!(holding_a.finalized_balance, 500);
    assert!(holding_a.statuses.is_empty());
    assert!(matches!(
        state::transfer::fetch(&*c1.services.storage, &c1.address(), &transfer_tx.txid),
        Err(state::StateError::NotFound)
    ));
}
