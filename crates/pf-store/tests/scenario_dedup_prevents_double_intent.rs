//! Scenario: event dedup prevents double intents and cursor rewind.
//!
//! # Invariants under test
//!
//! 1. Replaying a fill group that was already processed (same dedup key)
//!    returns `Duplicate` and leaves BOTH the cursor and the intent table
//!    exactly as the first processing left them.
//! 2. Replaying out of permutation order within the same key is equally
//!    inert — the composite key, not arrival order, decides.
//! 3. The intents committed by the first processing survive unchanged even
//!    when the replayed payload differs.

use pf_schemas::{
    correlation_id, Cursor, DedupKey, DedupRecord, EventKey, OrderIntent, OrderType, Side,
    TimeInForce,
};
use pf_store::{RecordOutcome, Store};

fn event_key(ts: i64, idx: u64, tx: &str, symbol: &str) -> EventKey {
    EventKey {
        timestamp_ms: ts,
        event_index: idx,
        tx_hash: tx.to_string(),
        symbol: symbol.to_string(),
    }
}

fn dedup_for(key: &EventKey, is_replay: bool) -> DedupRecord {
    DedupRecord {
        key: DedupKey {
            tx_hash: key.tx_hash.clone(),
            event_index: key.event_index,
            symbol: key.symbol.clone(),
        },
        timestamp_ms: key.timestamp_ms,
        is_replay,
        created_at_ms: key.timestamp_ms + 5,
    }
}

fn buy_intent(key: &EventKey, qty: f64) -> OrderIntent {
    OrderIntent {
        correlation_id: correlation_id(&key.tx_hash, key.event_index, &key.symbol, None),
        symbol: key.symbol.clone(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        qty,
        price: Some(50_000.0),
        reduce_only: false,
        tif: TimeInForce::Gtc,
        is_replay: false,
        strategy_version: "copy-1".to_string(),
        risk_notes: vec![],
    }
}

#[tokio::test]
async fn duplicate_replay_is_fully_inert() {
    let (store, _) = Store::open("sqlite::memory:").await.unwrap();

    let key = event_key(1_000, 0, "0xabc", "BTCUSDT");
    let cursor = Cursor::empty().advanced_to(&key, 1_005);
    let out = store
        .record_event(&dedup_for(&key, false), &cursor, &[buy_intent(&key, 0.0129)])
        .await
        .unwrap();
    assert_eq!(out, RecordOutcome::Inserted);

    // Backfill re-delivers the same group with a different payload and a
    // would-be cursor further ahead.
    let ahead = Cursor::empty().advanced_to(&event_key(9_999, 7, "0xzz", "BTCUSDT"), 9_999);
    let mut replay_intent = buy_intent(&key, 42.0);
    replay_intent.is_replay = true;
    let out = store
        .record_event(&dedup_for(&key, true), &ahead, &[replay_intent])
        .await
        .unwrap();
    assert_eq!(out, RecordOutcome::Duplicate);

    let cursor = store.load_cursor().await.unwrap();
    assert_eq!(
        cursor.last_processed_timestamp_ms, 1_000,
        "duplicate must not advance the cursor"
    );

    let cid = correlation_id("0xabc", 0, "BTCUSDT", None);
    let stored = store.load_intent(&cid).await.unwrap().unwrap();
    assert_eq!(stored.qty, 0.0129, "original intent payload must survive");
    assert!(!stored.is_replay);
}

#[tokio::test]
async fn distinct_symbols_under_one_tx_are_distinct_events() {
    let (store, _) = Store::open("sqlite::memory:").await.unwrap();

    // One leader transaction touching two coins produces two events with
    // the same tx_hash but different symbols; both must persist.
    let k1 = event_key(1_000, 0, "0xabc", "BTCUSDT");
    let k2 = event_key(1_000, 0, "0xabc", "ETHUSDT");

    let c1 = Cursor::empty().advanced_to(&k1, 1_005);
    assert_eq!(
        store
            .record_event(&dedup_for(&k1, false), &c1, &[])
            .await
            .unwrap(),
        RecordOutcome::Inserted
    );
    let c2 = c1.advanced_to(&k2, 1_006);
    assert_eq!(
        store
            .record_event(&dedup_for(&k2, false), &c2, &[])
            .await
            .unwrap(),
        RecordOutcome::Inserted
    );

    assert_eq!(store.dedup_len().await.unwrap(), 2);
}
