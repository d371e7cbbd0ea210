use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tempfile::tempdir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::events::{BrokerEvent, BrokerEventsManager, DefaultBrokerEventsManager};
use super::locator::BrokerServiceLocator;
use super::message::MessageWrapper;
use super::reference::{ActorId, ReferenceWrapper, RoutingKey};
use super::state::BrokerServiceState;
use super::subscription::{Subscription, SubscriptionDetails, SubscriptionFactory};
use super::{BROKER_STATE_DICTIONARY, BrokerService, EngineState};
use crate::config::BrokerSettings;
use crate::persistence::{QueueKind, StateManager, StoreError};
use crate::tests::support::{
    HangingSubscriber, RecordingSubscriber, broker_with, fast_settings, memory_state,
};
use crate::transport::{BrokerAddress, LocalCluster, LocalEndpoints, NamingService, PartitionKey};
use crate::utils::error::{BrokerError, DeliveryError};
use crate::utils::hashing::partition_index;

const ORDER_PLACED: &str = "Contoso.Orders.OrderPlaced";

fn service_ref(partition: i64) -> ReferenceWrapper {
    ReferenceWrapper::service("fabric:/app/subscriber", PartitionKey::Int64(partition))
}

fn customer_message(name: &str) -> MessageWrapper {
    MessageWrapper::new(
        "Contoso.Customers.CustomerChanged",
        json!({ "Customer": { "Name": name, "Age": 42 } }).to_string(),
    )
}

struct Fixture {
    broker: BrokerService,
    endpoints: Arc<LocalEndpoints>,
    events: broadcast::Receiver<BrokerEvent>,
}

fn fixture_with(state: StateManager, settings: BrokerSettings) -> Fixture {
    let endpoints = Arc::new(LocalEndpoints::new());
    let events = Arc::new(DefaultBrokerEventsManager::new());
    let receiver = events.subscribe_events();
    let broker = broker_with(state, endpoints.clone(), settings).with_events_manager(events);
    Fixture {
        broker,
        endpoints,
        events: receiver,
    }
}

fn fixture() -> Fixture {
    fixture_with(memory_state(), fast_settings())
}

fn drain(events: &mut broadcast::Receiver<BrokerEvent>) -> Vec<BrokerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn count_queued(events: &[BrokerEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, BrokerEvent::MessageQueued { .. }))
        .count()
}

fn directory(broker: &BrokerService, message_type: &str) -> Option<BrokerServiceState> {
    broker
        .state_manager()
        .begin()
        .get::<BrokerServiceState>(BROKER_STATE_DICTIONARY, message_type)
        .unwrap()
}

// ---------------------------------------------------------------------------
// ReferenceWrapper

#[test]
fn test_reference_identity_ignores_mutable_fields() {
    let plain = service_ref(1);
    let filtered = service_ref(1)
        .with_routing_key("Customer.Name", "Customer1")
        .with_listener("listener-a");
    filtered.set_skip_count(5);

    assert_eq!(plain, filtered);
    assert_ne!(plain, service_ref(2));
    assert_ne!(
        ReferenceWrapper::actor("fabric:/app/actors", ActorId::Long(1)),
        ReferenceWrapper::actor("fabric:/app/actors", ActorId::Str("1".into()))
    );

    let mut set = HashSet::new();
    set.insert(plain.clone());
    assert!(set.contains(&filtered));
}

#[test]
fn test_reference_identity_survives_round_trip() {
    let reference = ReferenceWrapper::actor("fabric:/app/actors", ActorId::Guid(uuid::Uuid::new_v4()))
        .with_routing_key("Customer.Name", "Cust*");
    reference.set_skip_count(3);

    let json = serde_json::to_string(&reference).unwrap();
    let restored: ReferenceWrapper = serde_json::from_str(&json).unwrap();

    assert_eq!(restored, reference);
    assert_eq!(restored.identity_key(), reference.identity_key());
    assert_eq!(restored.routing_key(), reference.routing_key());
    assert_eq!(restored.skip_count(), 0);
}

#[test]
fn test_should_deliver_without_routing_key() {
    let reference = service_ref(1);
    assert!(reference.should_deliver_message(&MessageWrapper::new("T", "not json")));
}

#[test]
fn test_routing_key_filters_on_payload() {
    let reference = service_ref(1).with_routing_key("Customer.Name", "Customer1");

    assert!(reference.should_deliver_message(&customer_message("Customer1")));
    assert!(!reference.should_deliver_message(&customer_message("Customer2")));
    assert!(!reference.should_deliver_message(&MessageWrapper::new(
        "Contoso.Customers.CustomerChanged",
        json!({ "Customer": { "Id": 1 } }).to_string()
    )));
    assert!(!reference.should_deliver_message(&MessageWrapper::new("T", "Customer1")));
}

#[test]
fn test_routing_key_wildcards_and_scalars() {
    let prefix = service_ref(1).with_routing_key("$.Customer.Name", "Cust*");
    assert!(prefix.should_deliver_message(&customer_message("Customer9")));
    assert!(!prefix.should_deliver_message(&customer_message("Vendor1")));

    let anywhere = service_ref(1).with_routing_key("Customer.Name", "*mer*");
    assert!(anywhere.should_deliver_message(&customer_message("Customer1")));

    // Regex metacharacters in the pattern are literal
    let literal = service_ref(1).with_routing_key("Customer.Name", "a.c");
    assert!(literal.should_deliver_message(&customer_message("a.c")));
    assert!(!literal.should_deliver_message(&customer_message("abc")));

    let numeric = service_ref(1).with_routing_key("Customer.Age", "4*");
    assert!(numeric.should_deliver_message(&customer_message("x")));
}

#[test]
fn test_should_process_messages_counts_down_skips() {
    let reference = service_ref(1);
    assert!(reference.should_process_messages());

    reference.set_skip_count(3);
    assert!(!reference.should_process_messages());
    assert!(!reference.should_process_messages());
    assert!(!reference.should_process_messages());
    assert!(reference.should_process_messages());
    assert_eq!(reference.skip_count(), 0);
}

#[tokio::test]
async fn test_publish_filtered_message_is_not_transmitted() {
    let endpoints = LocalEndpoints::new();
    let reference = service_ref(1).with_routing_key("Customer.Name", "Customer1");

    // No endpoint registered: a filtered message must not even resolve one
    reference
        .publish(&customer_message("Customer2"), &endpoints)
        .await
        .unwrap();

    let result = reference.publish(&customer_message("Customer1"), &endpoints).await;
    assert!(matches!(result, Err(DeliveryError::EndpointNotFound { .. })));
}

// ---------------------------------------------------------------------------
// Directory and subscriptions

#[test]
fn test_directory_is_copy_on_write() {
    let empty = BrokerServiceState::new(ORDER_PLACED);
    let one = empty.add_subscriber(SubscriptionDetails::new(service_ref(1), ORDER_PLACED, true));
    let again = one.add_subscriber(SubscriptionDetails::new(service_ref(1), ORDER_PLACED, false));
    let two = again.add_subscriber(SubscriptionDetails::new(service_ref(2), ORDER_PLACED, true));

    assert!(empty.is_empty());
    assert_eq!(one.len(), 1);
    assert_eq!(again.len(), 1);
    assert!(again.subscribers()[0].is_ordered);
    assert_eq!(two.len(), 2);

    let removed = two.remove_subscriber(&service_ref(1));
    assert_eq!(removed.len(), 1);
    assert_eq!(removed.subscribers()[0].reference, service_ref(2));
    assert_eq!(two.len(), 2);
}

#[test]
fn test_queue_name_is_deterministic() {
    let first = SubscriptionDetails::new(service_ref(1), ORDER_PLACED, true);
    let filtered = SubscriptionDetails::new(
        service_ref(1).with_routing_key("Customer.Name", "x"),
        ORDER_PLACED,
        false,
    );
    assert_eq!(first.queue_name, filtered.queue_name);
    assert_eq!(first, filtered);

    let other_type = SubscriptionDetails::new(service_ref(1), "Contoso.Orders.OrderShipped", true);
    let other_ref = SubscriptionDetails::new(service_ref(2), ORDER_PLACED, true);
    assert_ne!(first.queue_name, other_type.queue_name);
    assert_ne!(first.queue_name, other_ref.queue_name);
}

#[test]
fn test_factory_picks_queue_kind() {
    let state = memory_state();
    let ordered = SubscriptionFactory::create(
        &state,
        SubscriptionDetails::new(service_ref(1), ORDER_PLACED, true),
    )
    .unwrap();
    let unordered = SubscriptionFactory::create(
        &state,
        SubscriptionDetails::new(service_ref(2), ORDER_PLACED, false),
    )
    .unwrap();

    assert_eq!(state.queue_kind(ordered.queue_name()), Some(QueueKind::Fifo));
    assert_eq!(state.queue_kind(unordered.queue_name()), Some(QueueKind::Concurrent));
    assert_eq!(ordered.queue_count().unwrap(), 0);
}

#[test]
fn test_routing_key_pattern_survives_round_trip() {
    let key = RoutingKey::new("Customer.Name", "Cust*");
    assert!(key.matches("Customer1"));

    let restored: RoutingKey =
        serde_json::from_str(&serde_json::to_string(&key).unwrap()).unwrap();
    assert_eq!(restored, key);
    assert!(restored.matches("Customer2"));
    assert!(!restored.matches("customer"));
    assert!(key.clone().matches("Cust"));
    assert!(!RoutingKey::new("Customer.Name", "Cust*").matches("Acme"));
}

// ---------------------------------------------------------------------------
// Engine

#[tokio::test]
async fn test_first_call_initializes_engine() {
    let fixture = fixture();
    assert_eq!(fixture.broker.engine_state(), EngineState::Uninitialized);

    fixture.broker.get_broker_stats().await.unwrap();
    assert_eq!(fixture.broker.engine_state(), EngineState::Ready);
    fixture.broker.wait_until_ready().await;
}

#[tokio::test]
async fn test_subscribe_twice_keeps_one_subscription() {
    let mut fixture = fixture();
    let broker = &fixture.broker;

    broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();
    broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();

    let directory = directory(broker, ORDER_PLACED).unwrap();
    assert_eq!(directory.len(), 1);
    assert_eq!(broker.subscription_count(), 1);

    let events = drain(&mut fixture.events);
    let subscribed = events
        .iter()
        .filter(|event| matches!(event, BrokerEvent::Subscribed { .. }))
        .count();
    assert_eq!(subscribed, 1);
}

#[tokio::test]
async fn test_publish_without_subscribers_queues_nothing() {
    let mut fixture = fixture();
    fixture.broker.ensure_initialized().await.unwrap();
    drain(&mut fixture.events);

    fixture
        .broker
        .publish_message(MessageWrapper::new(ORDER_PLACED, "{}"))
        .await
        .unwrap();

    let events = drain(&mut fixture.events);
    assert_eq!(
        events,
        vec![BrokerEvent::MessagePublished {
            message_type: ORDER_PLACED.to_string()
        }]
    );
    assert!(fixture.broker.state_manager().queue_names().is_empty());
}

#[tokio::test]
async fn test_publish_fans_out_to_every_subscriber() {
    let mut fixture = fixture();
    let broker = &fixture.broker;
    for partition in 1..=3 {
        broker
            .subscribe(service_ref(partition), ORDER_PLACED, partition % 2 == 0)
            .await
            .unwrap();
    }
    broker
        .subscribe(service_ref(9), "Contoso.Orders.OrderShipped", true)
        .await
        .unwrap();
    drain(&mut fixture.events);

    broker
        .publish_message(MessageWrapper::new(ORDER_PLACED, "{}"))
        .await
        .unwrap();

    let events = drain(&mut fixture.events);
    assert_eq!(count_queued(&events), 3);
    assert!(matches!(events[0], BrokerEvent::MessagePublished { .. }));

    for partition in 1..=3 {
        let queue = SubscriptionDetails::queue_name_for(&service_ref(partition), ORDER_PLACED);
        assert_eq!(broker.subscription(&queue).unwrap().queue_count().unwrap(), 1);
    }
    let shipped = SubscriptionDetails::queue_name_for(&service_ref(9), "Contoso.Orders.OrderShipped");
    assert_eq!(broker.subscription(&shipped).unwrap().queue_count().unwrap(), 0);
}

#[tokio::test]
async fn test_ordered_subscription_delivers_in_order() {
    let fixture = fixture();
    let subscriber = RecordingSubscriber::new();
    fixture.endpoints.register(&service_ref(1), subscriber.clone());
    fixture.broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();

    for payload in ["m1", "m2", "m3"] {
        fixture
            .broker
            .publish_message(MessageWrapper::new(ORDER_PLACED, payload))
            .await
            .unwrap();
    }

    let pass = fixture
        .broker
        .run_delivery_pass(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(pass.delivered, 3);
    assert_eq!(subscriber.payloads(), vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn test_unordered_broker_delivers_same_messages() {
    let mut settings = fast_settings();
    settings.force_unordered = true;
    let fixture = fixture_with(memory_state(), settings);
    let subscriber = RecordingSubscriber::new();
    fixture.endpoints.register(&service_ref(1), subscriber.clone());
    fixture.broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();

    let queue = SubscriptionDetails::queue_name_for(&service_ref(1), ORDER_PLACED);
    assert_eq!(
        fixture.broker.state_manager().queue_kind(&queue),
        Some(QueueKind::Concurrent)
    );

    for payload in ["m1", "m2", "m3"] {
        fixture
            .broker
            .publish_message(MessageWrapper::new(ORDER_PLACED, payload))
            .await
            .unwrap();
    }
    fixture
        .broker
        .run_delivery_pass(&CancellationToken::new())
        .await
        .unwrap();

    let mut payloads = subscriber.payloads();
    payloads.sort();
    assert_eq!(payloads, vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn test_unordered_constructor_forces_unordered_queues() {
    let endpoints = Arc::new(LocalEndpoints::new());
    let broker = BrokerService::unordered(memory_state(), endpoints, fast_settings());
    broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();

    let queue = SubscriptionDetails::queue_name_for(&service_ref(1), ORDER_PLACED);
    assert_eq!(broker.state_manager().queue_kind(&queue), Some(QueueKind::Concurrent));
    assert!(!directory(&broker, ORDER_PLACED).unwrap().subscribers()[0].is_ordered);
}

#[tokio::test]
async fn test_delivery_failure_throttles_subscriber() {
    let mut fixture = fixture();
    let subscriber = RecordingSubscriber::failing();
    fixture.endpoints.register(&service_ref(1), subscriber.clone());
    fixture.broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();
    fixture
        .broker
        .publish_message(MessageWrapper::new(ORDER_PLACED, "m1"))
        .await
        .unwrap();
    drain(&mut fixture.events);

    let token = CancellationToken::new();
    let queue = SubscriptionDetails::queue_name_for(&service_ref(1), ORDER_PLACED);
    let subscription = fixture.broker.subscription(&queue).unwrap();

    let first = fixture.broker.run_delivery_pass(&token).await.unwrap();
    assert_eq!((first.processed, first.failed, first.delivered), (1, 1, 0));
    assert_eq!(subscription.reference().skip_count(), 2);
    assert_eq!(subscription.queue_count().unwrap(), 1);

    let events = drain(&mut fixture.events);
    assert!(events.iter().any(|event| matches!(
        event,
        BrokerEvent::MessageDeliveryFailed { throttle: 2, .. }
    )));

    // Throttled for exactly `throttle_factor` passes
    for _ in 0..2 {
        let pass = fixture.broker.run_delivery_pass(&token).await.unwrap();
        assert_eq!((pass.processed, pass.throttled), (0, 1));
    }

    subscriber.set_failing(false);
    let recovered = fixture.broker.run_delivery_pass(&token).await.unwrap();
    assert_eq!(recovered.delivered, 1);
    assert_eq!(subscriber.payloads(), vec!["m1"]);
    assert_eq!(subscription.queue_count().unwrap(), 0);
}

#[tokio::test]
async fn test_failed_ordered_message_stays_at_head() {
    let fixture = fixture();
    let subscriber = RecordingSubscriber::failing();
    fixture.endpoints.register(&service_ref(1), subscriber.clone());
    fixture.broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();
    for payload in ["m1", "m2"] {
        fixture
            .broker
            .publish_message(MessageWrapper::new(ORDER_PLACED, payload))
            .await
            .unwrap();
    }

    let token = CancellationToken::new();
    fixture.broker.run_delivery_pass(&token).await.unwrap();

    let queue = SubscriptionDetails::queue_name_for(&service_ref(1), ORDER_PLACED);
    let subscription = fixture.broker.subscription(&queue).unwrap();
    assert_eq!(subscription.queue_count().unwrap(), 2);

    subscription.reference().set_skip_count(0);
    subscriber.set_failing(false);
    fixture.broker.run_delivery_pass(&token).await.unwrap();
    assert_eq!(subscriber.payloads(), vec!["m1", "m2"]);
}

#[tokio::test]
async fn test_max_dequeues_caps_one_pass() {
    let mut settings = fast_settings();
    settings.max_dequeues_in_one_iteration = 2;
    let fixture = fixture_with(memory_state(), settings);
    let subscriber = RecordingSubscriber::new();
    fixture.endpoints.register(&service_ref(1), subscriber.clone());
    fixture.broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();
    for payload in ["m1", "m2", "m3"] {
        fixture
            .broker
            .publish_message(MessageWrapper::new(ORDER_PLACED, payload))
            .await
            .unwrap();
    }

    let token = CancellationToken::new();
    let first = fixture.broker.run_delivery_pass(&token).await.unwrap();
    assert_eq!(first.delivered, 2);
    let second = fixture.broker.run_delivery_pass(&token).await.unwrap();
    assert_eq!(second.delivered, 1);
    assert_eq!(subscriber.payloads(), vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn test_cancelled_pass_delivers_nothing() {
    let fixture = fixture();
    let subscriber = RecordingSubscriber::new();
    fixture.endpoints.register(&service_ref(1), subscriber.clone());
    fixture.broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();
    fixture
        .broker
        .publish_message(MessageWrapper::new(ORDER_PLACED, "m1"))
        .await
        .unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let pass = fixture.broker.run_delivery_pass(&token).await.unwrap();
    assert_eq!(pass.delivered, 0);
    assert!(subscriber.received().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_removes_directory_entry_and_queue() {
    let mut fixture = fixture();
    let broker = &fixture.broker;
    broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();
    broker.subscribe(service_ref(2), ORDER_PLACED, false).await.unwrap();
    broker
        .publish_message(MessageWrapper::new(ORDER_PLACED, "m1"))
        .await
        .unwrap();
    drain(&mut fixture.events);

    let queue = SubscriptionDetails::queue_name_for(&service_ref(1), ORDER_PLACED);
    broker.unsubscribe(&service_ref(1), ORDER_PLACED).await.unwrap();

    assert!(!broker.state_manager().queue_exists(&queue));
    assert!(broker.subscription(&queue).is_none());
    let remaining = directory(broker, ORDER_PLACED).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining.subscribers()[0].reference, service_ref(2));

    broker
        .publish_message(MessageWrapper::new(ORDER_PLACED, "m2"))
        .await
        .unwrap();
    let events = drain(&mut fixture.events);
    assert!(matches!(events[0], BrokerEvent::Unsubscribed { .. }));
    let queued: Vec<&BrokerEvent> = events
        .iter()
        .filter(|event| matches!(event, BrokerEvent::MessageQueued { .. }))
        .collect();
    assert_eq!(queued.len(), 1);
    assert!(matches!(
        queued[0],
        BrokerEvent::MessageQueued { queue_name, .. } if *queue_name != queue
    ));

    // Last subscriber gone: the directory entry goes too
    broker.unsubscribe(&service_ref(2), ORDER_PLACED).await.unwrap();
    assert!(directory(broker, ORDER_PLACED).is_none());
}

#[tokio::test]
async fn test_unsubscribe_unknown_is_silent() {
    let mut fixture = fixture();
    fixture.broker.ensure_initialized().await.unwrap();
    drain(&mut fixture.events);
    fixture
        .broker
        .unsubscribe(&service_ref(1), ORDER_PLACED)
        .await
        .unwrap();
    assert!(drain(&mut fixture.events).is_empty());
}

#[tokio::test]
async fn test_concurrent_first_calls_initialize_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broker");
    let lock_timeout = Duration::from_millis(250);

    {
        let state = StateManager::open(&path, lock_timeout).unwrap();
        let fixture = fixture_with(state, fast_settings());
        for partition in 1..=3 {
            fixture
                .broker
                .subscribe(service_ref(partition), ORDER_PLACED, partition != 2)
                .await
                .unwrap();
        }
    }

    let state = StateManager::open(&path, lock_timeout).unwrap();
    let mut fixture = fixture_with(state, fast_settings());
    let broker = &fixture.broker;
    assert_eq!(broker.engine_state(), EngineState::Uninitialized);

    let seen = join_all((0..8).map(|call| async move {
        if call % 2 == 0 {
            broker.get_broker_stats().await.map(|stats| stats.queues.len())
        } else {
            broker
                .subscribe(service_ref(1), ORDER_PLACED, true)
                .await
                .map(|_| broker.subscription_count())
        }
    }))
    .await;

    for indexed in seen {
        assert_eq!(indexed.unwrap(), 3);
    }
    assert_eq!(broker.engine_state(), EngineState::Ready);

    let initialized: Vec<BrokerEvent> = drain(&mut fixture.events)
        .into_iter()
        .filter(|event| matches!(event, BrokerEvent::Initialized { .. }))
        .collect();
    assert_eq!(initialized, vec![BrokerEvent::Initialized { subscriptions: 3 }]);
}

#[tokio::test]
async fn test_publish_is_all_or_nothing() {
    let mut fixture = fixture();
    let broker = &fixture.broker;
    for partition in 1..=3 {
        broker
            .subscribe(service_ref(partition), ORDER_PLACED, true)
            .await
            .unwrap();
    }
    drain(&mut fixture.events);

    // Remove the middle subscriber's queue behind the engine's back.
    let broken = SubscriptionDetails::queue_name_for(&service_ref(2), ORDER_PLACED);
    let tx = broker.state_manager().begin();
    tx.drop_queue(&broken).await.unwrap();
    tx.commit().await.unwrap();

    let err = broker
        .publish_message(MessageWrapper::new(ORDER_PLACED, "m1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Store(StoreError::QueueNotFound { .. })
    ));

    for partition in [1, 3] {
        let queue = SubscriptionDetails::queue_name_for(&service_ref(partition), ORDER_PLACED);
        assert_eq!(broker.subscription(&queue).unwrap().queue_count().unwrap(), 0);
    }
    assert_eq!(count_queued(&drain(&mut fixture.events)), 0);
}

#[tokio::test]
async fn test_publish_racing_unsubscribe_keeps_queue_removed() {
    let broker = Arc::new(fixture().broker);
    broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();
    broker.subscribe(service_ref(2), ORDER_PLACED, false).await.unwrap();
    let ordered = SubscriptionDetails::queue_name_for(&service_ref(1), ORDER_PLACED);
    let removed = SubscriptionDetails::queue_name_for(&service_ref(2), ORDER_PLACED);

    // Hold the ordered queue so the publish stalls halfway through its fan-out.
    let holder = broker.state_manager().begin();
    let head = broker
        .subscription(&ordered)
        .unwrap()
        .dequeue_message(&holder, &CancellationToken::new())
        .await
        .unwrap();
    assert!(head.is_none());

    let publisher = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move {
            broker
                .publish_message(MessageWrapper::new(ORDER_PLACED, "m1"))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let unsubscriber = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.unsubscribe(&service_ref(2), ORDER_PLACED).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    holder.abort();

    publisher.await.unwrap().unwrap();
    unsubscriber.await.unwrap().unwrap();

    assert!(!broker.state_manager().queue_exists(&removed));
    assert!(broker.subscription(&removed).is_none());
    let remaining = directory(&broker, ORDER_PLACED).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining.subscribers()[0].reference, service_ref(1));
    assert_eq!(broker.subscription(&ordered).unwrap().queue_count().unwrap(), 1);
}

#[tokio::test]
async fn test_broker_stats_report_queues_and_counters() {
    let fixture = fixture();
    let ok = RecordingSubscriber::new();
    fixture.endpoints.register(&service_ref(1), ok.clone());
    fixture.broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();
    fixture.broker.subscribe(service_ref(2), ORDER_PLACED, true).await.unwrap();
    fixture
        .broker
        .publish_message(MessageWrapper::new(ORDER_PLACED, "m1"))
        .await
        .unwrap();
    fixture
        .broker
        .run_delivery_pass(&CancellationToken::new())
        .await
        .unwrap();

    let stats = fixture.broker.get_broker_stats().await.unwrap();
    assert_eq!(stats.queues.len(), 2);

    let delivered_queue = SubscriptionDetails::queue_name_for(&service_ref(1), ORDER_PLACED);
    let failed_queue = SubscriptionDetails::queue_name_for(&service_ref(2), ORDER_PLACED);
    assert_eq!(stats.queues[&delivered_queue], service_ref(1));

    let delivered = stats.stats.iter().find(|s| s.queue_name == delivered_queue).unwrap();
    assert_eq!((delivered.total_received, delivered.total_delivered), (1, 1));
    let failed = stats.stats.iter().find(|s| s.queue_name == failed_queue).unwrap();
    assert_eq!((failed.total_received, failed.total_delivery_failures), (1, 1));
}

#[tokio::test]
async fn test_subscriptions_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broker");
    let lock_timeout = std::time::Duration::from_millis(250);

    {
        let state = StateManager::open(&path, lock_timeout).unwrap();
        let fixture = fixture_with(state, fast_settings());
        fixture.broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();
        fixture
            .broker
            .publish_message(MessageWrapper::new(ORDER_PLACED, "m1"))
            .await
            .unwrap();
    }

    let state = StateManager::open(&path, lock_timeout).unwrap();
    let fixture = fixture_with(state, fast_settings());
    let subscriber = RecordingSubscriber::new();
    fixture.endpoints.register(&service_ref(1), subscriber.clone());

    let stats = fixture.broker.get_broker_stats().await.unwrap();
    assert_eq!(stats.queues.len(), 1);

    fixture
        .broker
        .run_delivery_pass(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(subscriber.payloads(), vec!["m1"]);
}

#[tokio::test]
async fn test_delivery_loop_delivers_until_stopped() {
    let fixture = fixture();
    let subscriber = RecordingSubscriber::new();
    fixture.endpoints.register(&service_ref(1), subscriber.clone());
    let broker = Arc::new(fixture.broker);
    broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();

    let delivery = broker.start();
    assert!(delivery.is_running());

    broker
        .publish_message(MessageWrapper::new(ORDER_PLACED, "m1"))
        .await
        .unwrap();

    let delivered = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while subscriber.received().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(delivered.is_ok());

    delivery.stop().await;
}

#[tokio::test]
async fn test_delivery_loop_survives_hung_subscriber() {
    let settings = BrokerSettings {
        max_processing_period_ms: 100,
        ..fast_settings()
    };
    let fixture = fixture_with(memory_state(), settings);
    let healthy = RecordingSubscriber::new();
    fixture.endpoints.register(&service_ref(1), Arc::new(HangingSubscriber));
    fixture.endpoints.register(&service_ref(2), healthy.clone());
    let endpoints = fixture.endpoints.clone();
    let broker = Arc::new(fixture.broker);
    broker.subscribe(service_ref(1), ORDER_PLACED, true).await.unwrap();
    broker.subscribe(service_ref(2), ORDER_PLACED, true).await.unwrap();

    let delivery = broker.start();
    for (sent, payload) in ["m1", "m2"].into_iter().enumerate() {
        broker
            .publish_message(MessageWrapper::new(ORDER_PLACED, payload))
            .await
            .unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(5), async {
            while healthy.received().len() <= sent {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(delivered.is_ok());
        // Let at least one processing window expire.
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    assert!(delivery.is_running());
    delivery.stop().await;

    assert_eq!(healthy.payloads(), vec!["m1", "m2"]);
    let hung = SubscriptionDetails::queue_name_for(&service_ref(1), ORDER_PLACED);
    assert_eq!(broker.subscription(&hung).unwrap().queue_count().unwrap(), 2);

    // Aborted passes rolled back, so the first message is still at the head.
    let recovered = RecordingSubscriber::new();
    endpoints.register(&service_ref(1), recovered.clone());
    broker
        .run_delivery_pass(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(recovered.payloads(), vec!["m1", "m2"]);
}

// ---------------------------------------------------------------------------
// Events manager

#[tokio::test]
async fn test_default_events_manager_counts_per_queue() {
    let events = DefaultBrokerEventsManager::new();
    let reference = service_ref(1);
    let message = MessageWrapper::new(ORDER_PLACED, "{}");

    events.on_subscribed("q1", &reference, ORDER_PLACED).await;
    events.on_message_queued_to_subscriber("q1", &reference, &message).await;
    events.on_message_queued_to_subscriber("q1", &reference, &message).await;
    events.on_message_delivered("q1", &reference, &message).await;
    events
        .on_message_delivery_failed("q1", &reference, &message, &DeliveryError::rejected("down"), 10)
        .await;

    let stats = events.get_stats().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].service_name, reference.name());
    assert_eq!(
        (
            stats[0].total_received,
            stats[0].total_delivered,
            stats[0].total_delivery_failures
        ),
        (2, 1, 1)
    );

    events.on_unsubscribed("q1", &reference, ORDER_PLACED).await;
    assert!(events.get_stats().await.is_empty());
}

// ---------------------------------------------------------------------------
// Locator

#[tokio::test]
async fn test_locate_unregistered_broker_fails() {
    let cluster = Arc::new(LocalCluster::new());
    let locator = BrokerServiceLocator::new(cluster, "missing");

    let err = locator.locate().await.unwrap_err();
    assert!(err.is_broker_not_found());
    assert!(locator.get_partition_for_message(ORDER_PLACED).await.is_err());
}

#[tokio::test]
async fn test_partition_for_message_is_stable() {
    let cluster = Arc::new(LocalCluster::new());
    let address = BrokerAddress::new("local://broker");
    let endpoints = Arc::new(LocalEndpoints::new());
    for key in 0..4 {
        let broker = broker_with(memory_state(), endpoints.clone(), fast_settings());
        cluster.add_partition(&address, PartitionKey::Int64(key), Arc::new(broker));
    }

    let locator = BrokerServiceLocator::new(cluster.clone(), "broker");
    locator.register(address.clone()).await.unwrap();
    assert_eq!(locator.locate().await.unwrap(), address);

    let first = locator.get_partition_for_message(ORDER_PLACED).await.unwrap();
    let second = locator.get_partition_for_message(ORDER_PLACED).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first,
        PartitionKey::Int64(partition_index(ORDER_PLACED, 4) as i64)
    );
}

#[tokio::test]
async fn test_locator_caches_until_invalidated() {
    let cluster = Arc::new(LocalCluster::new());
    let first = BrokerAddress::new("local://first");
    let second = BrokerAddress::new("local://second");
    cluster.register("broker", first.clone()).await.unwrap();

    let locator = BrokerServiceLocator::new(cluster.clone(), "broker");
    assert_eq!(locator.locate().await.unwrap(), first);

    cluster.register("broker", second.clone()).await.unwrap();
    assert_eq!(locator.locate().await.unwrap(), first);

    locator.invalidate().await;
    assert_eq!(locator.locate().await.unwrap(), second);
}

#[tokio::test]
async fn test_broker_without_partitions() {
    let cluster = Arc::new(LocalCluster::new());
    cluster
        .register("broker", BrokerAddress::new("local://empty"))
        .await
        .unwrap();
    let locator = BrokerServiceLocator::new(cluster, "broker");

    let err = locator.get_partition_for_message(ORDER_PLACED).await.unwrap_err();
    assert!(matches!(err, BrokerError::NoPartitions { .. }));
}
