//! Ticket Consolidation Integration Tests
//!
//! Exercises the ticket pool through its public API: packing, the ticket
//! bound, reference counting, and the rendered wire messages.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;

use serde_json::{Value, json};

use market_data_gateway::domain::subscription::SubscriptionLimits;
use market_data_gateway::{
    DataType, SubscriptionError, SubscriptionManager, SubscriptionParams, Timeframe,
};

fn syms(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

fn wire_entries(manager: &SubscriptionManager) -> BTreeSet<(String, Vec<String>)> {
    manager
        .all_replay_messages()
        .iter()
        .flat_map(|message| {
            let value: Value = serde_json::from_str(message.as_str()).unwrap();
            value
                .as_array()
                .unwrap()
                .iter()
                .filter(|item| item.get("type").is_some())
                .map(|item| {
                    let codes = item["codes"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|c| c.as_str().unwrap().to_string())
                        .collect();
                    (item["type"].as_str().unwrap().to_string(), codes)
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

#[test]
fn ticker_and_orderbook_share_one_ticket() {
    let manager = SubscriptionManager::new(SubscriptionLimits {
        max_tickets: 5,
        ..SubscriptionLimits::default()
    });

    let first = manager
        .subscribe(DataType::Ticker, &syms(&["SYM-A", "SYM-B"]), SubscriptionParams::new())
        .unwrap();
    let second = manager
        .subscribe(DataType::Orderbook, &syms(&["SYM-A"]), SubscriptionParams::new())
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(manager.ticket_count(), 1);
    let stats = manager.stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.symbols, 3);
}

#[test]
fn ticket_count_never_exceeds_limit() {
    let manager = SubscriptionManager::new(SubscriptionLimits {
        max_tickets: 5,
        max_entries_per_ticket: 1,
    });
    let data_types = [
        DataType::Ticker,
        DataType::Trade,
        DataType::Orderbook,
        DataType::Candle(Timeframe::Minute1),
        DataType::Candle(Timeframe::Minute5),
        DataType::Candle(Timeframe::Minute60),
        DataType::Candle(Timeframe::Day1),
    ];

    let mut rejected = 0;
    for round in 0..4 {
        for data_type in data_types {
            let symbol = format!("SYM-{round}");
            match manager.subscribe(data_type, &[symbol], SubscriptionParams::new()) {
                Ok(_) => {}
                Err(SubscriptionError::LimitExceeded { max_tickets }) => {
                    assert_eq!(max_tickets, 5);
                    rejected += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
            assert!(manager.ticket_count() <= 5);
        }
    }

    assert_eq!(manager.ticket_count(), 5);
    assert!(rejected > 0);
}

#[test]
fn refcounted_symbols_survive_partial_release() {
    let manager = SubscriptionManager::default();
    manager
        .subscribe(DataType::Trade, &syms(&["SYM-A"]), SubscriptionParams::new())
        .unwrap();
    manager
        .subscribe(DataType::Trade, &syms(&["SYM-A", "SYM-B"]), SubscriptionParams::new())
        .unwrap();

    let outcome = manager.unsubscribe(DataType::Trade, &syms(&["SYM-A", "SYM-B"]));
    assert_eq!(outcome.updated.len(), 1);
    assert!(outcome.retired.is_empty());
    assert!(manager.is_subscribed(DataType::Trade, "SYM-A"));
    assert!(!manager.is_subscribed(DataType::Trade, "SYM-B"));

    let outcome = manager.unsubscribe(DataType::Trade, &syms(&["SYM-A"]));
    assert_eq!(outcome.retired.len(), 1);
    assert_eq!(manager.ticket_count(), 0);
    assert!(manager.all_replay_messages().is_empty());
}

#[test]
fn replay_messages_describe_the_whole_pool() {
    let manager = SubscriptionManager::default();
    manager
        .subscribe(DataType::Ticker, &syms(&["SYM-A", "SYM-B"]), SubscriptionParams::new())
        .unwrap();
    manager
        .subscribe(
            DataType::Candle(Timeframe::Minute1),
            &syms(&["SYM-A"]),
            SubscriptionParams::new(),
        )
        .unwrap();

    let before = wire_entries(&manager);
    assert_eq!(
        before,
        BTreeSet::from([
            ("ticker".to_string(), syms(&["SYM-A", "SYM-B"])),
            ("candle.1m".to_string(), syms(&["SYM-A"])),
        ])
    );

    // Rendering is a pure read of the pool.
    assert_eq!(wire_entries(&manager), before);

    let message = manager.all_replay_messages().remove(0);
    let value: Value = serde_json::from_str(message.as_str()).unwrap();
    assert_eq!(value.as_array().unwrap().last().unwrap(), &json!({ "format": "DEFAULT" }));
}

#[test]
fn empty_symbol_list_is_rejected() {
    let manager = SubscriptionManager::default();
    let err = manager
        .subscribe(DataType::Ticker, &[], SubscriptionParams::new())
        .unwrap_err();
    assert_eq!(err, SubscriptionError::NoSymbols(DataType::Ticker));
    assert_eq!(manager.ticket_count(), 0);
}
