//! Tests for the event log

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use story_manager::{
    EventExtractor, EventLog, GameEvent, HistoryStore, MemoryStateStore, Scope, StateStore,
};

fn event(id: &str) -> GameEvent {
    GameEvent::new("tick", json!({}), None, id)
}

fn block(events: serde_json::Value) -> String {
    format!(
        "Narration.\n<statusbar>\n```json\n{}\n```\n</statusbar>",
        json!({ "events": events })
    )
}

async fn setup() -> (Arc<MemoryStateStore>, Arc<HistoryStore>, EventLog) {
    let store = Arc::new(MemoryStateStore::new());
    let history = Arc::new(HistoryStore::new(store.clone()));
    let log = EventLog::new(
        history.clone(),
        EventExtractor::new("statusbar", "events").unwrap(),
    );
    (store, history, log)
}

#[tokio::test]
async fn test_add_events_is_idempotent_by_id() {
    let (_, _, log) = setup().await;

    assert_eq!(log.add_events(vec![event("a"), event("b")]).await.unwrap(), 2);
    assert_eq!(
        log.add_events(vec![event("b"), event("c"), event("a")])
            .await
            .unwrap(),
        1
    );
    assert_eq!(log.add_events(vec![event("c")]).await.unwrap(), 0);

    let mut counts: HashMap<String, usize> = HashMap::new();
    for e in log.reload().await.unwrap() {
        *counts.entry(e.event_id).or_default() += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|c| *c == 1));
}

#[tokio::test]
async fn test_add_events_reads_persisted_log() {
    let (store, history, log) = setup().await;
    log.add_events(vec![event("a")]).await.unwrap();

    // A second log over the same store has a stale (empty) cache
    let other = EventLog::new(history, EventExtractor::new("statusbar", "events").unwrap());
    assert!(other.events().await.is_empty());
    other.add_events(vec![event("b")]).await.unwrap();

    let stored = store.read(&Scope::Variables).await.unwrap().unwrap();
    let ids: Vec<&str> = stored["ledger"]["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);

    // The first log picks the new event up on reload
    assert_eq!(log.events().await.len(), 1);
    assert_eq!(log.reload().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_set_events_replaces_log_and_watermark() {
    let (store, _, log) = setup().await;
    log.add_events(vec![event("a"), event("b")]).await.unwrap();

    log.set_events(vec![event("z")]).await.unwrap();

    assert_eq!(log.events().await, vec![event("z")]);
    let stored = store.read(&Scope::Variables).await.unwrap().unwrap();
    assert_eq!(stored["ledger"]["processed_count"], 1);
}

#[tokio::test]
async fn test_events_until_follow_timeline_order() {
    let (_, history, log) = setup().await;

    history.add_user_turn("start").await.unwrap();
    let first = history
        .add_assistant_message_page(&block(json!([{"type": "a"}, {"type": "b"}])))
        .await
        .unwrap();
    history.add_user_turn("continue").await.unwrap();
    let swipe_one = history
        .add_assistant_message_page(&block(json!([{"type": "c"}])))
        .await
        .unwrap();
    let swipe_two = history
        .add_assistant_message_page(&block(json!([{"type": "d"}])))
        .await
        .unwrap();

    let types = |events: Vec<GameEvent>| -> Vec<String> {
        events.into_iter().map(|e| e.event_type).collect()
    };

    assert_eq!(
        types(log.get_events_until(&swipe_two, None).await.unwrap()),
        vec!["a", "b", "d"]
    );
    // A swipe that is not selected can still be targeted
    assert_eq!(
        types(log.get_events_until(&swipe_one, None).await.unwrap()),
        vec!["a", "b", "c"]
    );
    assert_eq!(
        types(log.get_events_until(&swipe_two, Some(&first)).await.unwrap()),
        vec!["d"]
    );
}

#[tokio::test]
async fn test_malformed_block_yields_no_events() {
    let (_, history, log) = setup().await;
    history.add_user_turn("start").await.unwrap();
    let broken = history
        .add_assistant_message_page("<statusbar>{\"events\": [ {\"type\": </statusbar>")
        .await
        .unwrap();
    let fine = history
        .add_assistant_message_page(&block(json!([{"eventType": "ok", "data": {"n": 1}}])))
        .await
        .unwrap();

    assert!(log.get_events_until(&broken, None).await.unwrap().is_empty());

    let events = log.get_events_until(&fine, None).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "ok");
    assert_eq!(events[0].payload, json!({"n": 1}));
    assert_eq!(events[0].source_message_id.as_deref(), Some(fine.as_str()));
}

#[tokio::test]
async fn test_ingesting_a_page_twice_adds_events_once() {
    let (_, history, log) = setup().await;
    history.add_user_turn("start").await.unwrap();
    let page = history
        .add_assistant_message_page(&block(json!([{"type": "a"}, {"type": "b", "eventId": "fixed"}])))
        .await
        .unwrap();

    assert_eq!(log.ingest_message(&page).await.unwrap(), 2);
    assert_eq!(log.ingest_message(&page).await.unwrap(), 0);

    let ids: Vec<String> = log.events().await.into_iter().map(|e| e.event_id).collect();
    assert_eq!(ids, vec![format!("{}#0", page), format!("{}#fixed", page)]);
}

#[tokio::test]
async fn test_pages_sharing_a_payload_id_keep_both_events() {
    let (_, history, log) = setup().await;
    history.add_user_turn("start").await.unwrap();
    let first = history
        .add_assistant_message_page(&block(json!([
            {"type": "character_update", "id": "mira", "updates": {"hp": 5}}
        ])))
        .await
        .unwrap();
    history.add_user_turn("next").await.unwrap();
    let second = history
        .add_assistant_message_page(&block(json!([
            {"type": "character_update", "id": "mira", "updates": {"hp": 2}}
        ])))
        .await
        .unwrap();

    assert_eq!(log.ingest_message(&first).await.unwrap(), 1);
    assert_eq!(log.ingest_message(&second).await.unwrap(), 1);

    let events = log.events().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_id, format!("{}#0", first));
    assert_eq!(events[1].event_id, format!("{}#0", second));
    assert_eq!(events[1].payload["id"], "mira");
    assert_eq!(events[1].payload["updates"]["hp"], 2);
}
