//! Integration tests for the full reservation pipeline.
//!
//! Tests: Engine → Lock → VersionedStore → ReservationStore → EventBus → StockView
//!
//! Verifies:
//! - Concurrent reserves never oversell, with or without the lock
//! - Versions and event sequences advance by exactly one per mutation
//! - Terminal transitions are idempotent under concurrency
//! - Publish failures leave a recorded gap and never undo the write

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};

    use stockguard_core::{AggregateRoot, ManualClock, OrderId, ProductId, StoreId};
    use stockguard_events::{
        EventBus, EventEnvelope, InMemoryBusError, InMemoryEventBus, StartFrom, Subscription,
    };
    use stockguard_inventory::{InventoryEvent, InventoryEventType, ReservationStatus, StockKey};
    use stockguard_observability::{LogFormat, TracingConfig};

    use crate::config::{EngineConfig, LockPolicy};
    use crate::engine::{ReservationEngine, ReserveRequest, StockAdjustment};
    use crate::lock::{InMemoryLockManager, LockManager, UnavailableLockManager};
    use crate::projections::{spawn_stock_view_worker, StockView};
    use crate::publisher::{EventPublisher, InMemoryGapRecorder};
    use crate::reaper::ExpiryReaper;
    use crate::store::{InMemoryInventoryStore, InMemoryReservationStore};

    type Envelope = EventEnvelope<InventoryEvent>;
    type MemoryBus = Arc<InMemoryEventBus<Envelope>>;
    type Engine<L, B> = ReservationEngine<InMemoryInventoryStore, InMemoryReservationStore, L, B>;

    /// In-memory bus that can be switched off to simulate a broker outage.
    #[derive(Default)]
    struct FlakyBus {
        inner: InMemoryEventBus<Envelope>,
        down: AtomicBool,
    }

    impl EventBus<Envelope> for FlakyBus {
        type Error = String;

        fn publish(&self, topic: &str, message: Envelope) -> Result<(), String> {
            if self.down.load(Ordering::SeqCst) {
                return Err("broker unreachable".to_string());
            }
            self.inner
                .publish(topic, message)
                .map_err(|e: InMemoryBusError| e.to_string())
        }

        fn subscribe(&self, topic: &str, start: StartFrom<StockKey>) -> Subscription<Envelope> {
            self.inner.subscribe(topic, start)
        }

        fn supports_replay(&self) -> bool {
            self.inner.supports_replay()
        }
    }

    struct Harness<L, B> {
        engine: Arc<Engine<L, B>>,
        clock: Arc<ManualClock>,
        gaps: Arc<InMemoryGapRecorder>,
        key: StockKey,
    }

    fn harness<L, B>(locks: L, bus: B, config: EngineConfig, on_hand: u64) -> Harness<L, B>
    where
        L: LockManager,
        B: EventBus<Envelope>,
    {
        stockguard_observability::init_with(&TracingConfig {
            format: LogFormat::Pretty,
            default_filter: "warn".to_string(),
            with_target: true,
        });

        let gaps = Arc::new(InMemoryGapRecorder::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let publisher = EventPublisher::new(bus, config.topic.clone(), gaps.clone());
        let engine: Engine<L, B> = ReservationEngine::new(
            InMemoryInventoryStore::new(),
            InMemoryReservationStore::new(),
            locks,
            publisher,
            config,
        )
        .with_clock(clock.clone());

        let key = StockKey::new(StoreId::new(), ProductId::new());
        engine.register_inventory(key, on_hand).unwrap();

        Harness {
            engine: Arc::new(engine),
            clock,
            gaps,
            key,
        }
    }

    fn locked_config() -> EngineConfig {
        EngineConfig {
            lock_wait: Duration::from_secs(5),
            lock_backoff_base: Duration::from_millis(1),
            lock_backoff_cap: Duration::from_millis(10),
            ..EngineConfig::default()
        }
    }

    fn lockless_config() -> EngineConfig {
        EngineConfig {
            lock_wait: Duration::ZERO,
            lock_policy: LockPolicy::BestEffort,
            max_conflict_retries: 50,
            ..EngineConfig::default()
        }
    }

    fn order(id: impl Into<String>) -> OrderId {
        OrderId::parse(id).unwrap()
    }

    fn drain(sub: &Subscription<Envelope>) -> Vec<InventoryEvent> {
        std::iter::from_fn(|| sub.try_recv().ok())
            .map(EventEnvelope::into_payload)
            .collect()
    }

    /// Run `quantities.len()` reserves at once; return (quantity, result code) pairs.
    fn race_reserves<L, B>(h: &Harness<L, B>, quantities: &[u64]) -> Vec<(u64, Result<(), &'static str>)>
    where
        L: LockManager + 'static,
        B: EventBus<Envelope> + 'static,
    {
        let barrier = Arc::new(Barrier::new(quantities.len()));
        let handles: Vec<_> = quantities
            .iter()
            .enumerate()
            .map(|(i, &qty)| {
                let engine = h.engine.clone();
                let barrier = barrier.clone();
                let key = h.key;
                thread::spawn(move || {
                    barrier.wait();
                    let result = engine
                        .reserve(ReserveRequest::new(key, order(format!("race-{i}")), qty))
                        .map(|_| ())
                        .map_err(|e| e.code());
                    (qty, result)
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn concurrent_reserves_never_oversell() {
        let h = harness(InMemoryLockManager::new(), MemoryBus::default(), locked_config(), 25);
        let quantities: Vec<u64> = (0..24).map(|i| 1 + (i % 3)).collect();

        let results = race_reserves(&h, &quantities);
        let granted: u64 = results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(q, _)| q)
            .sum();

        for (_, r) in &results {
            if let Err(code) = r {
                assert_eq!(*code, "INSUFFICIENT_STOCK");
            }
        }

        let level = h.engine.get_stock_level(&h.key).unwrap();
        assert!(granted <= 25);
        assert_eq!(level.reserved(), granted);
        let successes = results.iter().filter(|(_, r)| r.is_ok()).count() as u64;
        assert_eq!(level.version(), successes);
    }

    #[test]
    fn two_racing_reserves_of_six_from_ten() {
        let h = harness(InMemoryLockManager::new(), MemoryBus::default(), locked_config(), 10);

        let results = race_reserves(&h, &[6, 6]);
        let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|(_, r)| *r == Err("INSUFFICIENT_STOCK"))
            .count();
        assert_eq!((ok, insufficient), (1, 1));

        let level = h.engine.get_stock_level(&h.key).unwrap();
        assert_eq!((level.reserved(), level.version()), (6, 1));

        h.engine
            .reserve(ReserveRequest::new(h.key, order("then-4"), 4))
            .unwrap();
        let level = h.engine.get_stock_level(&h.key).unwrap();
        assert_eq!((level.reserved(), level.version()), (10, 2));

        let err = h
            .engine
            .reserve(ReserveRequest::new(h.key, order("then-1"), 1))
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_STOCK");
    }

    #[test]
    fn version_check_alone_prevents_oversell_when_lock_is_down() {
        let h = harness(UnavailableLockManager, MemoryBus::default(), lockless_config(), 10);
        let quantities = vec![1u64; 32];

        let results = race_reserves(&h, &quantities);
        let successes = results.iter().filter(|(_, r)| r.is_ok()).count() as u64;

        for (_, r) in &results {
            if let Err(code) = r {
                assert!(
                    *code == "INSUFFICIENT_STOCK" || *code == "CONCURRENT_MODIFICATION",
                    "unexpected failure {code}"
                );
            }
        }

        let level = h.engine.get_stock_level(&h.key).unwrap();
        assert!(successes <= 10);
        assert_eq!(level.reserved(), successes);
        assert_eq!(level.version(), successes);
    }

    #[test]
    fn sequences_are_gapless_and_unique_per_key() {
        let bus = MemoryBus::default();
        let sub = bus.subscribe("inventory_events", StartFrom::Now);
        let h = harness(InMemoryLockManager::new(), bus, locked_config(), 100);

        let results = race_reserves(&h, &[1; 16]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        let mut sequences: Vec<u64> = drain(&sub)
            .into_iter()
            .filter(|e| e.event_type == InventoryEventType::StockReserved)
            .map(|e| e.sequence)
            .collect();
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=16).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_confirms_emit_one_event() {
        let bus = MemoryBus::default();
        let sub = bus.subscribe("inventory_events", StartFrom::Now);
        let h = harness(InMemoryLockManager::new(), bus, locked_config(), 10);
        h.engine
            .reserve(ReserveRequest::new(h.key, order("o-1"), 6))
            .unwrap();

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = h.engine.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    // A caller that reads the reservation mid-finalize is told to retry.
                    loop {
                        match engine.confirm(&order("o-1")) {
                            Err(e) if e.code() == "CONCURRENT_MODIFICATION" => thread::yield_now(),
                            other => return other,
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            let r = handle.join().unwrap().unwrap();
            assert_eq!(r.status, ReservationStatus::Confirmed);
        }

        let level = h.engine.get_stock_level(&h.key).unwrap();
        assert_eq!((level.on_hand(), level.reserved()), (4, 0));

        let confirmed = drain(&sub)
            .iter()
            .filter(|e| e.event_type == InventoryEventType::ReservationConfirmed)
            .count();
        assert_eq!(confirmed, 1);
    }

    #[test]
    fn cancel_racing_the_reaper_releases_stock_once() {
        let bus = MemoryBus::default();
        let sub = bus.subscribe("inventory_events", StartFrom::Now);
        let h = harness(InMemoryLockManager::new(), bus, locked_config(), 1_000);

        for i in 0..20 {
            h.engine
                .reserve(
                    ReserveRequest::new(h.key, order(format!("o-{i}")), 5)
                        .with_ttl(Duration::from_secs(1)),
                )
                .unwrap();
        }
        h.clock.advance(ChronoDuration::seconds(5));

        let barrier = Arc::new(Barrier::new(2));
        let reaper = {
            let engine = h.engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                ExpiryReaper::new(engine).sweep_all()
            })
        };
        let canceller = {
            let engine = h.engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..20 {
                    let _ = engine.cancel(&order(format!("o-{i}")));
                }
            })
        };
        reaper.join().unwrap();
        canceller.join().unwrap();

        let level = h.engine.get_stock_level(&h.key).unwrap();
        assert_eq!((level.on_hand(), level.reserved()), (1_000, 0));

        let mut terminal_events: HashMap<OrderId, usize> = HashMap::new();
        for e in drain(&sub) {
            if matches!(
                e.event_type,
                InventoryEventType::ReservationCancelled | InventoryEventType::ReservationExpired
            ) {
                *terminal_events.entry(e.order_id.unwrap()).or_default() += 1;
            }
        }
        assert_eq!(terminal_events.len(), 20);
        assert!(terminal_events.values().all(|&n| n == 1));

        for i in 0..20 {
            let status = h.engine.get_status(&order(format!("o-{i}"))).unwrap().status;
            assert!(matches!(
                status,
                ReservationStatus::Cancelled | ReservationStatus::Expired
            ));
        }
    }

    #[test]
    fn publish_failure_keeps_the_write_and_records_a_gap() {
        let bus = Arc::new(FlakyBus::default());
        let h = harness(InMemoryLockManager::new(), bus.clone(), locked_config(), 10);
        let view = Arc::new(StockView::new());
        let worker = spawn_stock_view_worker(&bus, "inventory_events", view.clone()).unwrap();

        bus.down.store(true, Ordering::SeqCst);
        let r = h
            .engine
            .reserve(ReserveRequest::new(h.key, order("o-1"), 3))
            .unwrap();
        assert_eq!(r.status, ReservationStatus::Pending);
        assert_eq!(h.engine.get_stock_level(&h.key).unwrap().reserved(), 3);

        let gaps = h.gaps.drain();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].event.sequence, 1);

        bus.down.store(false, Ordering::SeqCst);
        h.engine
            .adjust_stock(StockAdjustment::new(h.key, 2))
            .unwrap();

        wait_until(|| view.get(&h.key).is_some_and(|s| s.sequence == 2));
        assert_eq!(view.gaps().len(), 1);
        assert_eq!(view.get(&h.key).unwrap().reserved, 3);

        // Late redelivery of the lost event is a duplicate for the view.
        h.engine.redeliver(&gaps[0]).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(view.get(&h.key).unwrap().sequence, 2);

        worker.shutdown();
    }

    #[test]
    fn stock_view_converges_with_the_store() {
        let bus = MemoryBus::default();
        let view = Arc::new(StockView::new());
        let worker = spawn_stock_view_worker(&bus, "inventory_events", view.clone()).unwrap();
        let h = harness(InMemoryLockManager::new(), bus, locked_config(), 50);

        let results = race_reserves(&h, &[3; 10]);
        for (i, (_, r)) in results.iter().enumerate() {
            if r.is_ok() && i % 2 == 0 {
                h.engine.cancel(&order(format!("race-{i}"))).unwrap();
            }
        }
        h.engine
            .adjust_stock(StockAdjustment::new(h.key, -5).with_reason("damaged"))
            .unwrap();

        let record = h.engine.get_stock_level(&h.key).unwrap();
        wait_until(|| view.get(&h.key).is_some_and(|s| s.sequence == record.version()));

        let snap = view.get(&h.key).unwrap();
        assert_eq!(snap.on_hand, record.on_hand());
        assert_eq!(snap.reserved, record.reserved());
        worker.shutdown();
    }

    #[test]
    fn replaying_subscriber_resumes_after_its_cursor() {
        let bus = MemoryBus::default();
        let h = harness(InMemoryLockManager::new(), bus.clone(), locked_config(), 10);
        h.engine
            .reserve(ReserveRequest::new(h.key, order("o-1"), 2))
            .unwrap();

        let view = Arc::new(StockView::new());
        view.rebuild(&h.engine.list_inventory().unwrap());
        h.engine
            .reserve(ReserveRequest::new(h.key, order("o-2"), 2))
            .unwrap();

        let worker = spawn_stock_view_worker(&bus, "inventory_events", view.clone()).unwrap();
        wait_until(|| view.get(&h.key).is_some_and(|s| s.sequence == 2));
        assert_eq!(view.get(&h.key).unwrap().reserved, 4);
        assert!(view.gaps().is_empty());
        worker.shutdown();
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Reserve(usize, u64),
            Confirm(usize),
            Cancel(usize),
            Lapse(usize),
            Adjust(i64),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0usize..6, 1u64..8).prop_map(|(o, q)| Op::Reserve(o, q)),
                (0usize..6).prop_map(Op::Confirm),
                (0usize..6).prop_map(Op::Cancel),
                (0usize..6).prop_map(Op::Lapse),
                (-10i64..10).prop_map(Op::Adjust),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64,
                ..ProptestConfig::default()
            })]

            /// Property: reserved always equals the sum of PENDING quantities,
            /// never exceeds on_hand, and the version counts published events.
            #[test]
            fn engine_never_oversells(
                initial in 0u64..30,
                ops in prop::collection::vec(op(), 1..40)
            ) {
                let bus = MemoryBus::default();
                let sub = bus.subscribe("inventory_events", StartFrom::Now);
                let h = harness(InMemoryLockManager::new(), bus, locked_config(), initial);
                // Registration is sequence 0 and does not bump the version.
                prop_assert_eq!(drain(&sub).len(), 1);
                let mut published = 0u64;

                for op in ops {
                    let _ = match op {
                        Op::Reserve(o, q) => h
                            .engine
                            .reserve(
                                ReserveRequest::new(h.key, order(format!("p-{o}")), q)
                                    .with_ttl(Duration::from_secs(60)),
                            )
                            .map(|_| ()),
                        Op::Confirm(o) => h.engine.confirm(&order(format!("p-{o}"))).map(|_| ()),
                        Op::Cancel(o) => h.engine.cancel(&order(format!("p-{o}"))).map(|_| ()),
                        Op::Lapse(o) => {
                            h.clock.advance(ChronoDuration::seconds(30));
                            h.engine.expire(&order(format!("p-{o}"))).map(|_| ())
                        }
                        Op::Adjust(d) => h
                            .engine
                            .adjust_stock(StockAdjustment::new(h.key, d))
                            .map(|_| ()),
                    };
                    published += drain(&sub).len() as u64;

                    let level = h.engine.get_stock_level(&h.key).unwrap();
                    let pending: u64 = (0..6)
                        .filter_map(|o| h.engine.get_status(&order(format!("p-{o}"))).ok())
                        .filter(|r| r.status == ReservationStatus::Pending)
                        .map(|r| r.quantity)
                        .sum();

                    prop_assert!(level.reserved() <= level.on_hand());
                    prop_assert_eq!(level.reserved(), pending);
                    prop_assert_eq!(level.version(), published);
                }
            }
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not met in time");
    }
}
