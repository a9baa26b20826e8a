//! Two buses sharing one storage area, as two tabs of the same origin.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use wayfare_core::{
    now_millis, LocalModificationMap, OperationKind, OperationLog, PlanItem, PlanState, Reconciler,
    StateSnapshot,
};
use wayfare_sync::{types, EmitOptions, Event, EventBus, StorageArea, SyncConfig};

async fn tab(storage: &StorageArea) -> EventBus {
    let bus = EventBus::from_config(&SyncConfig::default(), storage.clone()).unwrap();
    assert!(bus.connect().await);
    bus
}

fn inbox(bus: &EventBus, event_type: &str) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = bus.subscribe(event_type, move |event| {
        tx.send(event.clone())?;
        Ok(())
    });
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event within timeout")
        .expect("channel open")
}

#[tokio::test]
async fn test_add_item_reaches_other_tab_once() {
    let storage = StorageArea::new();
    let tab_a = tab(&storage).await;
    let tab_b = tab(&storage).await;
    let mut ops_b = inbox(&tab_b, types::PLAN_OPERATION);

    let mut log_a = OperationLog::new(tab_a.session_id());
    let op = log_a.record(OperationKind::AddItem { item: PlanItem::new("i1") });
    tab_a.emit_operation(&op).unwrap();

    let event = next(&mut ops_b).await;
    assert_eq!(event.session_id, tab_a.session_id());
    assert_eq!(event.operation().unwrap().item_id(), Some("i1"));
    assert!(timeout(Duration::from_millis(100), ops_b.recv()).await.is_err());

    // Tab B replays it into its own copy of the plan
    let mut log_b = OperationLog::new(tab_b.session_id());
    let plan = PlanState::new("p1");
    let next_state = log_b.apply(Some(&plan), &event.operation().unwrap()).unwrap().unwrap();
    assert!(next_state.has_item("i1"));
    assert!(log_b.apply(Some(&next_state), &op).is_none());
}

#[tokio::test]
async fn test_sender_does_not_hear_itself() {
    let storage = StorageArea::new();
    let tab_a = tab(&storage).await;
    let _tab_b = tab(&storage).await;
    let mut inbox_a = inbox(&tab_a, types::PLAN_UPDATED);

    tab_a.emit(types::PLAN_UPDATED, json!({ "id": "p1" }), EmitOptions::default());

    // Local dispatch happens exactly once; nothing comes back over storage
    assert_eq!(next(&mut inbox_a).await.session_id, tab_a.session_id());
    assert!(timeout(Duration::from_millis(100), inbox_a.recv()).await.is_err());
    assert_eq!(tab_a.stats().received, 0);
}

#[tokio::test]
async fn test_local_only_stays_in_tab() {
    let storage = StorageArea::new();
    let tab_a = tab(&storage).await;
    let tab_b = tab(&storage).await;
    let mut inbox_b = inbox(&tab_b, types::PHOTO_CREATED);

    tab_a.emit(types::PHOTO_CREATED, json!({ "id": "ph1" }), EmitOptions::local_only());
    tab_a.emit(types::PHOTO_CREATED, json!({ "id": "ph2" }), EmitOptions::default());

    assert_eq!(next(&mut inbox_b).await.payload["id"], json!("ph2"));
    assert!(timeout(Duration::from_millis(100), inbox_b.recv()).await.is_err());
}

#[tokio::test]
async fn test_burst_arrives_complete_and_in_order() {
    let storage = StorageArea::new();
    let tab_a = tab(&storage).await;
    let tab_b = tab(&storage).await;
    let mut inbox_b = inbox(&tab_b, types::ITEM_UPDATED);

    for n in 0..25 {
        tab_a.emit(types::ITEM_UPDATED, json!({ "n": n }), EmitOptions::default());
    }
    for n in 0..25 {
        assert_eq!(next(&mut inbox_b).await.payload["n"], json!(n));
    }

    // Tab B's clock has caught up with every emission from tab A
    assert_eq!(tab_b.vector_clock().get(tab_a.session_id()), 25);
}

#[tokio::test]
async fn test_replayed_storage_value_deduplicated() {
    let storage = StorageArea::new();
    let tab_a = tab(&storage).await;
    let tab_b = tab(&storage).await;
    let mut inbox_b = inbox(&tab_b, types::PLAN_UPDATED);

    let event = tab_a.emit(types::PLAN_UPDATED, json!({}), EmitOptions::default());
    next(&mut inbox_b).await;

    // Some other context rewrites the same event under the key
    storage
        .set_item(uuid::Uuid::new_v4(), "wayfare:sync-event", &event.encode().unwrap())
        .unwrap();
    assert!(timeout(Duration::from_millis(100), inbox_b.recv()).await.is_err());
    assert_eq!(tab_b.stats().duplicates, 1);
}

#[tokio::test]
async fn test_remote_update_respects_protected_field() {
    let storage = StorageArea::new();
    let tab_a = tab(&storage).await;
    let tab_b = tab(&storage).await;

    // Tab B is mid-edit on the title
    let mut data = serde_json::Map::new();
    data.insert("id".to_string(), json!("p1"));
    data.insert("title".to_string(), json!("Kyoto (typing…)"));
    data.insert("notes".to_string(), json!("old"));
    let current = Arc::new(Mutex::new(StateSnapshot::new(data, 1)));
    let mut mods = LocalModificationMap::new();
    mods.mark_at("title", now_millis());
    let mods = Arc::new(mods);
    let reconciler = Arc::new(Reconciler::new().with_protected_fields(["title"]));

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let state = current.clone();
    let _sub = tab_b.subscribe(types::PLAN_UPDATED, move |event| {
        let update = event.incoming_update().ok_or("payload is not an object")?;
        let merged = reconciler.reconcile(Some(&state.lock().clone()), &update, &mods);
        if let Some(merged) = merged {
            *state.lock() = merged;
        }
        done_tx.send(())?;
        Ok(())
    });

    tab_a.emit(
        types::PLAN_UPDATED,
        json!({ "data": { "id": "p1", "title": "Kyoto", "notes": "new" } }),
        EmitOptions::default(),
    );
    timeout(Duration::from_secs(2), done_rx.recv()).await.unwrap();

    let merged = current.lock().clone();
    assert_eq!(merged.data["title"], json!("Kyoto (typing…)"));
    assert_eq!(merged.data["notes"], json!("new"));
}
