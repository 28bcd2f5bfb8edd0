use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use parking_lot::Mutex;
use simple_logger::SimpleLogger;

use rjms_utils::{timestamp_millis, TimestampMillis};

use super::*;
use crate::cache::DestinationCache;
use crate::conf::{Broker as BrokerConf, Inner};
use crate::condition::Never;
use crate::consumer::ConsumerListener;
use crate::lease::DefaultLeaseManager;
use crate::message::MessageCache;
use crate::store::{DefaultMessageStore, MessageHandleRecord};
use crate::types::SubscriptionName;
use crate::xa::{TransactionLog, Xid};

fn init_log() {
    let _ = SimpleLogger::new().with_level(log::LevelFilter::Warn).init();
}

fn queue_message(name: &str, id: &str) -> Message {
    Message::new(Destination::queue(name), "payload").with_id(id)
}

fn topic_message(name: &str, id: &str) -> Message {
    Message::new(Destination::topic(name), "payload").with_id(id)
}

fn receive_ids(c: &ConsumerEndpoint) -> Vec<String> {
    let mut ids = Vec::new();
    while let Some(h) = c.receive(&Never).unwrap() {
        ids.push(h.id().to_string());
        h.destroy().unwrap();
    }
    ids
}

struct Counting(Mutex<usize>);

impl ConsumerListener for Counting {
    fn message_available(&self, _consumer: &ConsumerEndpoint) {
        *self.0.lock() += 1;
    }
}

/// Store that fails handle writes on demand.
struct FaultyStore {
    inner: DefaultMessageStore,
    fail_handles: AtomicBool,
    fail_removes: AtomicBool,
}

impl FaultyStore {
    fn new() -> Self {
        Self {
            inner: DefaultMessageStore::new(),
            fail_handles: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
        }
    }

    fn fail(&self) -> Result<()> {
        Self::fail_if(&self.fail_handles)
    }

    fn fail_if(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(BrokerError::Persistence("disk full".into()))
        } else {
            Ok(())
        }
    }
}

impl MessageStore for FaultyStore {
    fn begin(&self) -> Result<()> {
        self.inner.begin()
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.inner.rollback()
    }

    fn add_message(&self, message: &Message) -> Result<()> {
        self.inner.add_message(message)
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        self.inner.get_message(id)
    }

    fn remove_message(&self, id: &MessageId) -> Result<()> {
        self.inner.remove_message(id)
    }

    fn add_message_handle(&self, handle: &MessageHandleRecord) -> Result<()> {
        self.fail()?;
        self.inner.add_message_handle(handle)
    }

    fn update_message_handle(&self, handle: &MessageHandleRecord) -> Result<()> {
        self.fail()?;
        self.inner.update_message_handle(handle)
    }

    fn remove_message_handle(&self, handle: &MessageHandleRecord) -> Result<()> {
        Self::fail_if(&self.fail_removes)?;
        self.inner.remove_message_handle(handle)
    }

    fn get_message_handles(&self, destination: &Destination, name: &str) -> Result<Vec<MessageHandleRecord>> {
        self.inner.get_message_handles(destination, name)
    }

    fn remove_expired_message_handles(&self, destination: &Destination, now: TimestampMillis) -> Result<usize> {
        self.inner.remove_expired_message_handles(destination, now)
    }

    fn add_destination(&self, destination: &Destination) -> Result<()> {
        self.inner.add_destination(destination)
    }

    fn remove_destination(&self, destination: &Destination) -> Result<()> {
        self.inner.remove_destination(destination)
    }

    fn get_all_destinations(&self) -> Result<Vec<Destination>> {
        self.inner.get_all_destinations()
    }

    fn add_durable_consumer(&self, topic: &Destination, name: &str) -> Result<()> {
        self.inner.add_durable_consumer(topic, name)
    }

    fn remove_durable_consumer(&self, name: &str) -> Result<()> {
        self.inner.remove_durable_consumer(name)
    }

    fn get_all_durable_consumers(&self) -> Result<Vec<(SubscriptionName, Destination)>> {
        self.inner.get_all_durable_consumers()
    }
}

#[test]
fn test_priority_then_arrival_order() {
    let broker = Broker::default();
    broker.publish(queue_message("q", "B").with_priority(4)).unwrap();
    broker.publish(queue_message("q", "A").with_priority(9)).unwrap();
    broker.publish(queue_message("q", "C").with_priority(4)).unwrap();

    let c = broker.create_consumer(&Destination::queue("q"), None, false, None).unwrap();
    assert_eq!(receive_ids(&c), vec!["A", "B", "C"]);
    assert_eq!(broker.stats().messages_destroyed.count(), 3);
}

#[test]
fn test_queue_round_robin_between_listeners() {
    let broker = Broker::default();
    let q = Destination::queue("q");
    let counters = (0..2)
        .map(|_| {
            let c = broker.create_consumer(&q, None, false, None).unwrap();
            let counting = Arc::new(Counting(Mutex::new(0)));
            c.set_listener(Some(counting.clone())).unwrap();
            counting
        })
        .collect::<Vec<_>>();

    for i in 0..4 {
        broker.publish(queue_message("q", &format!("m{}", i))).unwrap();
    }
    assert_eq!(*counters[0].0.lock(), 2);
    assert_eq!(*counters[1].0.lock(), 2);
}

#[test]
fn test_topic_fan_out_and_acknowledge() {
    let broker = Broker::default();
    let t = Destination::topic("news");
    let consumers =
        (0..3).map(|_| broker.create_consumer(&t, None, false, None).unwrap()).collect::<Vec<_>>();
    broker.publish(topic_message("news", "m")).unwrap();

    let cache = broker.destinations.get_topic_cache(&t).unwrap();
    let msg_ref = cache.message_cache().get_message_ref(&"m".into()).unwrap();
    assert_eq!(msg_ref.count(), 3);

    let mut handles = consumers.iter().map(|c| c.receive(&Never).unwrap().unwrap()).collect::<Vec<_>>();
    handles[0].set_delivered(true);
    assert!(!handles[1].is_delivered());

    let last = handles.pop().unwrap();
    for h in handles {
        broker.acknowledge(h).unwrap();
    }
    assert_eq!(msg_ref.count(), 1);
    broker.acknowledge(last).unwrap();
    assert!(cache.message_cache().get_message_ref(&"m".into()).is_none());
    assert_eq!(broker.stats().messages_destroyed.count(), 1);
}

#[test]
fn test_unsubscribed_topic_message_is_not_retained() {
    let lease_mgr = Arc::new(DefaultLeaseManager::new(Duration::from_secs(1)));
    let broker = Broker::builder(Settings::default()).lease_manager(lease_mgr.clone()).build();
    let expiration = timestamp_millis() + 60_000;
    broker.publish(topic_message("news", "m").with_expiration(expiration)).unwrap();

    let cache = broker.destinations.get_topic_cache(&Destination::topic("news")).unwrap();
    assert!(cache.message_cache().is_empty());
    assert_eq!(cache.lease_count(), 0);
    assert!(lease_mgr.is_empty());
    assert_eq!(broker.stats().messages_dropped.count(), 1);
}

#[test]
fn test_past_expiry_fires_on_next_sweep() {
    let lease_mgr = Arc::new(DefaultLeaseManager::new(Duration::from_secs(1)));
    let broker = Broker::builder(Settings::default()).lease_manager(lease_mgr.clone()).build();
    let q = Destination::queue("q");
    let now = timestamp_millis();
    broker.publish(queue_message("q", "old").with_expiration(now - 1_000)).unwrap();
    broker.publish(queue_message("q", "new")).unwrap();

    let cache = broker.destinations.get_queue_cache(&q).unwrap();
    assert_eq!(cache.lease_count(), 1);
    assert_eq!(lease_mgr.len(), 1);

    assert_eq!(lease_mgr.expire(timestamp_millis() + 10), 1);
    assert_eq!(cache.lease_count(), 0);
    assert_eq!(cache.len(), 1);
    assert!(cache.message_cache().get_message_ref(&"old".into()).is_none());
    assert_eq!(broker.stats().messages_expired.count(), 1);
    assert_eq!(broker.stats().leases.count(), 0);

    let c = broker.create_consumer(&q, None, false, None).unwrap();
    assert_eq!(receive_ids(&c), vec!["new"]);
}

#[test]
fn test_wildcard_consumer() {
    let broker = Broker::default();
    broker.publish(topic_message("a.b", "early")).unwrap();
    let c = broker.create_consumer(&Destination::topic("a.*"), None, false, None).unwrap();
    broker.publish(topic_message("a.b", "ab")).unwrap();
    broker.publish(topic_message("a.c", "ac")).unwrap();
    broker.publish(topic_message("x.y", "xy")).unwrap();
    broker.publish(topic_message("a.b.c", "abc")).unwrap();

    let mut ids = receive_ids(&c);
    ids.sort();
    assert_eq!(ids, vec!["ab", "ac"]);
    assert!(broker.publish(topic_message("a.*", "bad")).is_err());
}

#[test]
fn test_durable_reactivation_keeps_order() {
    let broker = Broker::default();
    let t = Destination::topic("orders");
    let c = broker.create_durable_consumer("sub", &t, None, false, None).unwrap();
    broker.close_consumer(c.id()).unwrap();
    assert!(!c.is_active());
    assert!(broker.create_durable_consumer("sub", &t, None, false, None).is_ok());
    broker.close_consumer(c.id()).unwrap();

    broker.publish(topic_message("orders", "low").with_priority(1).with_persistent(true)).unwrap();
    broker.publish(topic_message("orders", "high").with_priority(8).with_persistent(true)).unwrap();
    broker.publish(topic_message("orders", "mid").with_priority(4).with_persistent(true)).unwrap();
    assert!(c.receive(&Never).unwrap().is_none());
    assert_eq!(c.len(), 3);

    let again = broker.create_durable_consumer("sub", &t, None, false, None).unwrap();
    assert!(Arc::ptr_eq(&c, &again));
    assert!(matches!(
        broker.create_durable_consumer("sub", &t, None, false, None),
        Err(BrokerError::DurableSubscriptionActive(_))
    ));
    assert_eq!(receive_ids(&again), vec!["high", "mid", "low"]);

    assert!(matches!(broker.unsubscribe("sub"), Err(BrokerError::DurableSubscriptionActive(_))));
    broker.close_consumer(again.id()).unwrap();
    broker.unsubscribe("sub").unwrap();
    assert!(broker.consumers.get_durable("sub").is_none());
}

#[test]
fn test_durable_backlog_survives_restart() {
    let store = Arc::new(DefaultMessageStore::new());
    let t = Destination::topic("orders");
    {
        let broker = Broker::builder(Settings::default()).store(store.clone()).build();
        broker.init().unwrap();
        broker.subscribe("sub", &t).unwrap();
        broker.publish(topic_message("orders", "m1").with_persistent(true)).unwrap();
        broker.publish(topic_message("orders", "m2").with_persistent(true)).unwrap();
        broker.shutdown();
    }
    assert_eq!(store.handle_count(), 2);

    let broker = Broker::builder(Settings::default()).store(store.clone()).build();
    broker.init().unwrap();
    let c = broker.create_durable_consumer("sub", &t, None, false, None).unwrap();
    assert_eq!(c.len(), 2);
    while let Some(h) = c.receive(&Never).unwrap() {
        broker.acknowledge(h).unwrap();
    }
    assert_eq!(store.handle_count(), 0);
    assert_eq!(store.message_count(), 0);
    assert_eq!(store.active_transactions(), 0);
}

#[test]
fn test_persistence_failure_rolls_back() {
    init_log();
    let store = Arc::new(FaultyStore::new());
    let broker = Broker::builder(Settings::default()).store(store.clone()).build();
    let q = Destination::queue("q");
    broker.publish(queue_message("q", "ok").with_persistent(true)).unwrap();

    store.fail_handles.store(true, Ordering::SeqCst);
    let err = broker.publish(queue_message("q", "bad").with_persistent(true)).unwrap_err();
    assert!(err.is_persistence());
    assert!(!err.is_usage());

    let cache = broker.destinations.get_queue_cache(&q).unwrap();
    assert_eq!(cache.len(), 1);
    assert!(cache.message_cache().get_message_ref(&"bad".into()).is_none());
    assert_eq!(store.inner.active_transactions(), 0);
    let (begins, commits, rollbacks) = store.inner.transactions();
    assert_eq!(begins, commits + rollbacks);
    assert!(rollbacks >= 1);

    let c = broker.create_consumer(&q, None, false, None).unwrap();
    let h = c.receive(&Never).unwrap().unwrap();
    assert!(broker.recover(h).is_err());
    assert_eq!(store.inner.active_transactions(), 0);
}

#[test]
fn test_durable_persistence_failure_rolls_back_publish() {
    init_log();
    let store = Arc::new(FaultyStore::new());
    let broker = Broker::builder(Settings::default()).store(store.clone()).build();
    let t = Destination::topic("t");
    let other = broker.create_consumer(&t, None, false, None).unwrap();
    let sub = broker.subscribe("sub", &t).unwrap();

    store.fail_handles.store(true, Ordering::SeqCst);
    let err = broker.publish(topic_message("t", "m").with_persistent(true)).unwrap_err();
    assert!(err.is_persistence());
    assert_eq!(store.inner.handle_count(), 0);
    assert_eq!(store.inner.message_count(), 0);
    assert_eq!(store.inner.active_transactions(), 0);
    let (begins, commits, rollbacks) = store.inner.transactions();
    assert_eq!(begins, commits + rollbacks);
    assert!(rollbacks >= 1);
    assert_eq!(other.len(), 0);
    assert_eq!(sub.len(), 0);
    let cache = broker.destinations.get_topic_cache(&t).unwrap();
    assert!(cache.message_cache().get_message_ref(&"m".into()).is_none());

    store.fail_handles.store(false, Ordering::SeqCst);
    broker.publish(topic_message("t", "m").with_persistent(true)).unwrap();
    assert_eq!(store.inner.handle_count(), 1);
    assert_eq!(other.len(), 1);
    assert_eq!(sub.len(), 1);
}

#[test]
fn test_failed_acknowledge_still_releases_message() {
    init_log();
    let store = Arc::new(FaultyStore::new());
    let broker = Broker::builder(Settings::default()).store(store.clone()).build();
    let q = Destination::queue("q");
    broker.publish(queue_message("q", "m").with_persistent(true)).unwrap();
    let c = broker.create_consumer(&q, None, false, None).unwrap();
    let h = c.receive(&Never).unwrap().unwrap();
    let msg_ref = h.message_ref().clone();
    assert_eq!(msg_ref.count(), 1);

    store.fail_removes.store(true, Ordering::SeqCst);
    assert!(broker.acknowledge(h).unwrap_err().is_persistence());
    assert!(msg_ref.is_destroyed());
    let cache = broker.destinations.get_queue_cache(&q).unwrap();
    assert!(cache.message_cache().get_message_ref(&"m".into()).is_none());
    assert_eq!(broker.stats().messages_destroyed.count(), 1);
    assert_eq!(store.inner.active_transactions(), 0);
}

#[test]
fn test_recover_redelivers() {
    let broker = Broker::default();
    let q = Destination::queue("q");
    broker.publish(queue_message("q", "m")).unwrap();
    let c = broker.create_consumer(&q, None, false, None).unwrap();
    let h = c.receive(&Never).unwrap().unwrap();
    assert!(!h.is_delivered());
    broker.recover(h).unwrap();

    let h = c.receive(&Never).unwrap().unwrap();
    assert!(h.is_delivered());
    assert_eq!(h.consumer_id(), Some(c.id()));
    broker.acknowledge(h).unwrap();
    assert!(c.receive(&Never).unwrap().is_none());
}

#[test]
fn test_xa_commit_and_rollback() {
    let broker = Broker::default();
    let q = Destination::queue("q");
    let c = broker.create_consumer(&q, None, false, None).unwrap();
    let xid: Xid = "tx".into();

    broker.xa.log_published_message(&xid, queue_message("q", "m")).unwrap();
    assert!(c.receive(&Never).unwrap().is_none());
    broker.xa.commit(&xid).unwrap();

    let h = c.receive(&Never).unwrap().unwrap();
    broker.xa.log_received_message(&xid, c.id(), h).unwrap();
    broker.xa.rollback(&xid).unwrap();
    let h = c.receive(&Never).unwrap().unwrap();
    assert!(h.is_delivered());
    broker.xa.log_received_message(&xid, c.id(), h).unwrap();
    broker.xa.commit(&xid).unwrap();
    assert!(c.receive(&Never).unwrap().is_none());
    assert_eq!(broker.stats().messages_destroyed.count(), 1);
}

#[test]
fn test_connection_close_drops_temporary_destinations() {
    let broker = Broker::default();
    let conn = broker.open_connection(Some("client".into()));
    let temp = broker.create_temporary_destination(DestinationKind::Queue, conn.id).unwrap();
    assert!(temp.is_temporary());
    let c = broker.create_consumer(&temp, None, false, Some(conn.id)).unwrap();
    broker.publish(Message::new(temp.clone(), "reply")).unwrap();

    assert!(broker.close_connection(conn.id).is_empty());
    assert!(c.is_closed());
    assert!(!broker.destinations.exists(&temp));
    assert!(broker.create_temporary_destination(DestinationKind::Queue, conn.id).is_err());
}

#[test]
fn test_browser_does_not_consume() {
    let broker = Broker::default();
    let q = Destination::queue("q");
    broker.publish(queue_message("q", "a").with_property("color", "red")).unwrap();
    broker.publish(queue_message("q", "b").with_property("color", "blue")).unwrap();

    let b = broker.create_browser(&q, Some("color = 'red'"), None).unwrap();
    assert_eq!(receive_ids(&b), vec!["a"]);
    assert!(broker.create_browser(&Destination::topic("t"), None, None).is_err());
    assert!(broker.create_browser(&q, Some("color ="), None).is_err());

    let c = broker.create_consumer(&q, None, false, None).unwrap();
    assert_eq!(receive_ids(&c), vec!["a", "b"]);
}

#[test]
fn test_concurrent_receivers_take_each_message_once() {
    init_log();
    let broker = Broker::default();
    let q = Destination::queue("q");
    let total = 400;
    for i in 0..total {
        broker.publish(queue_message("q", &format!("m{}", i))).unwrap();
    }
    let consumers = (0..4).map(|_| broker.create_consumer(&q, None, false, None).unwrap()).collect::<Vec<_>>();
    let received = std::thread::scope(|s| {
        let workers = consumers.iter().map(|c| s.spawn(move || receive_ids(c))).collect::<Vec<_>>();
        workers.into_iter().flat_map(|w| w.join().unwrap()).collect::<Vec<_>>()
    });

    assert_eq!(received.len(), total);
    assert_eq!(received.iter().unique().count(), total);
    assert_eq!(broker.stats().messages_destroyed.count(), total as isize);
    assert_eq!(broker.stats().handles.count(), 0);
}

#[test]
fn test_publish_while_consumers_come_and_go() {
    init_log();
    let broker = Broker::default();
    let q = Destination::queue("q");
    let total = 500;
    let done = AtomicBool::new(false);
    let mut received = std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..total {
                broker.publish(queue_message("q", &format!("m{}", i))).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        });
        let churn = s.spawn(|| {
            let mut ids = Vec::new();
            while !done.load(Ordering::SeqCst) {
                let c = broker.create_consumer(&q, None, false, None).unwrap();
                for _ in 0..10 {
                    match c.receive(&Never).unwrap() {
                        Some(h) => {
                            ids.push(h.id().to_string());
                            broker.acknowledge(h).unwrap();
                        }
                        None => break,
                    }
                }
                broker.close_consumer(c.id()).unwrap();
                broker.collect_garbage(false);
            }
            ids
        });
        churn.join().unwrap()
    });

    let last = broker.create_consumer(&q, None, false, None).unwrap();
    received.extend(receive_ids(&last));
    assert_eq!(received.len(), total);
    assert_eq!(received.iter().unique().count(), total);
    assert_eq!(broker.stats().handles.count(), 0);
}

#[tokio::test]
async fn test_start_runs_lease_timer_and_gc() {
    let settings = Settings::from_inner(Inner {
        broker: BrokerConf {
            gc_interval: Duration::from_millis(20),
            lease_check_interval: Duration::from_millis(10),
            ..Default::default()
        },
        ..Default::default()
    });
    let broker = Broker::new(settings);
    broker.start().unwrap();
    broker.start().unwrap();

    let q = Destination::queue("q");
    broker.publish(queue_message("q", "m").with_expiration(timestamp_millis() + 30)).unwrap();
    assert!(broker.destinations.get_cache(&q).is_some());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.stats().messages_expired.count(), 1);
    assert!(broker.destinations.get_cache(&q).is_none());
    assert!(!broker.destinations.exists(&q));
    broker.shutdown();
}
