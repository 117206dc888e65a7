//! Cross-component tests: feed → bridge → bus → saga → scheduler → command
//! handler, and bus-maintained read models against replayed ones.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value as JsonValue, json};

use relay_core::{AggregateId, RecordingFailurePolicy};
use relay_events::{
    DomainEvent, InMemoryMessageBus, MessageBus, MessageKind, RoutingMessageBus, SagaCommand, handler_fn,
};

use crate::bridge::{BridgeConfig, CrossContextBridge, PollOutcome};
use crate::checkpoint::{CheckpointStore, FeedKey, InMemoryCheckpointStore};
use crate::dispatcher::{DispatchHandlers, MessageDispatcher};
use crate::event_store::{EventStore, InMemoryEventStore, PageLimit};
use crate::projections::{AccountsProjection, ProjectionHandler, ReplayConfig, StreamReplayer};
use crate::read_model::InMemoryAccountStore;
use crate::saga::{InMemorySagaRepository, SagaRecord, SagaTimeoutScheduler, SchedulerConfig};

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

fn event(name: &str, id: &str, revision: u64, payload: JsonValue) -> DomainEvent {
    DomainEvent::new(name, AggregateId::new(id).unwrap(), revision, payload).unwrap()
}

#[tokio::test]
async fn external_orders_time_out_into_local_commands() {
    let local = Arc::new(InMemoryMessageBus::new("example-app.routemanagement"));
    let sale = Arc::new(InMemoryMessageBus::new("example-app.sale"));
    let router: Arc<dyn MessageBus> = Arc::new(
        RoutingMessageBus::new("routemanagement", local.clone()).with_route("sale", sale.clone()),
    );

    // Process manager: every external order opens a saga that is already due.
    let sagas = InMemorySagaRepository::new(router.clone());
    let opener = sagas.clone();
    sale.register(
        "delivery-saga",
        MessageKind::Event,
        handler_fn(move |message| {
            let order = message.payload["aggregate"]["id"].clone();
            opener
                .insert(SagaRecord::new("delivery", json!({ "order": order })).with_timeout(
                    Utc::now() - chrono::Duration::seconds(1),
                    Some(vec![SagaCommand::new(json!({ "name": "cancelDelivery", "order": order }))]),
                ))
                .map_err(|e| relay_events::HandlerError::Failed(e.to_string()))?;
            Ok(None)
        }),
    )
    .unwrap();

    let cancelled = Arc::new(Mutex::new(Vec::new()));
    let seen = cancelled.clone();
    local
        .register(
            "cancel-delivery",
            MessageKind::Command,
            handler_fn(move |message| {
                seen.lock().unwrap().push(message.payload["order"].clone());
                Ok(Some(json!({ "ok": true })))
            }),
        )
        .unwrap();

    let feed = Arc::new(InMemoryEventStore::new());
    feed.append(vec![
        event("orderPlaced", "order-1", 0, json!({})),
        event("orderPlaced", "order-2", 0, json!({})),
    ])
    .await
    .unwrap();

    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let key = FeedKey::new("example-app", "routemanagement", "sale");
    let mut bridge = CrossContextBridge::connect(
        feed,
        checkpoints.clone(),
        router.clone(),
        BridgeConfig::new(key.clone()),
        Arc::new(RecordingFailurePolicy::new()),
    )
    .await
    .unwrap();
    while bridge.poll_once().await.unwrap() != PollOutcome::Idle {}
    assert_eq!(checkpoints.get(&key).await.unwrap(), Some(2));

    eventually(|| sagas.len() == 2).await;

    let scheduler = SagaTimeoutScheduler::new(sagas.clone(), SchedulerConfig::default());
    let report = scheduler.tick(Utc::now()).await;
    assert_eq!((report.due, report.updated, report.failed), (2, 2, 0));

    eventually(|| cancelled.lock().unwrap().len() == 2).await;
    let mut orders: Vec<String> = cancelled
        .lock()
        .unwrap()
        .iter()
        .map(|o| o.as_str().unwrap().to_string())
        .collect();
    orders.sort();
    assert_eq!(orders, vec!["order-1", "order-2"]);
}

#[tokio::test]
async fn replay_rebuilds_what_the_bus_maintained() {
    let events = vec![
        event("accountOpened", "acc-1", 0, json!({ "owner": "ada", "initialBalance": 100 })),
        event("accountOpened", "acc-2", 0, json!({ "owner": "bob", "initialBalance": 10 })),
        event("moneyWithdrawn", "acc-1", 1, json!({ "amount": 30 })),
        event("moneyDeposited", "acc-2", 1, json!({ "amount": 5 })),
        event("accountTagged", "acc-2", 2, json!({ "tag": "vip" })),
    ];
    let store = Arc::new(InMemoryEventStore::new());
    store.append(events.clone()).await.unwrap();

    // Live path: events dispatched on the bus, projected by a handler.
    let live = Arc::new(InMemoryAccountStore::new());
    let bus = Arc::new(InMemoryMessageBus::new("example-app.routemanagement"));
    bus.register(
        "accounts",
        MessageKind::Event,
        Arc::new(ProjectionHandler::new(Arc::new(AccountsProjection::new(live.clone())))),
    )
    .unwrap();
    let dispatcher = MessageDispatcher::new(bus).with_debounce(Duration::from_millis(20));

    for e in &events {
        let (tx, rx) = tokio::sync::oneshot::channel();
        dispatcher
            .dispatch(
                MessageKind::Event,
                serde_json::to_value(e).unwrap(),
                DispatchHandlers::aggregating(|err| panic!("unexpected error: {err}"), move |r| {
                    let _ = tx.send(r);
                }),
            )
            .await
            .unwrap();
        let acks = rx.await.unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].payload["event"], e.name.as_str());
    }

    // Rebuild path: replay the stored stream into an empty store.
    let rebuilt = Arc::new(InMemoryAccountStore::new());
    let report = StreamReplayer::new(store, ReplayConfig::default().with_limit(PageLimit::Bounded(2)))
        .run(&AccountsProjection::new(rebuilt.clone()))
        .await
        .unwrap();

    assert_eq!(report.processed, 5);
    assert_eq!(report.pages, 3);
    assert_eq!(live.list(), rebuilt.list());

    let acc1 = rebuilt.list().into_iter().find(|r| r.id.as_str() == "acc-1").unwrap();
    assert_eq!((acc1.balance, acc1.revision), (70, 1));
}
