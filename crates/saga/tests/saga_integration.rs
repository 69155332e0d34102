//! Integration tests for saga orchestration.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use resilience::{ClassifiedError, ResilienceRegistry, RetryPolicy};
use saga::order_fulfillment::{
    self, FulfillmentOptions, OrderRequest, OrderServices, STEP_CREATE_SHIPMENT,
    STEP_PROCESS_PAYMENT, STEP_RESERVE_INVENTORY,
};
use saga::services::{
    InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
    InMemoryShippingService, ReservationItem,
};
use saga::{
    FailureMode, InMemoryDeadLetterSink, InMemoryEventBus, RouteOutcome, SagaContext, SagaData,
    SagaDefinition, SagaError, SagaEventRouter, SagaId, SagaOrchestrator, SagaStatus,
    StepDefinition, StepStatus, action_fn, handler_fn,
};
use saga_store::{
    InMemoryIdempotencyStore, InMemorySagaRepository, SagaRepository, StoreError, Version,
};

/// Repository that fails one specific save, simulating a process crash there.
struct CrashingRepository {
    inner: InMemorySagaRepository,
    saves: AtomicUsize,
    crash_on: usize,
}

impl CrashingRepository {
    fn new(inner: InMemorySagaRepository, crash_on: usize) -> Self {
        Self {
            inner,
            saves: AtomicUsize::new(0),
            crash_on,
        }
    }
}

#[async_trait]
impl SagaRepository for CrashingRepository {
    async fn get(&self, saga_id: SagaId) -> saga_store::Result<Option<SagaContext>> {
        self.inner.get(saga_id).await
    }

    async fn save(&self, context: &SagaContext) -> saga_store::Result<Version> {
        let n = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.crash_on {
            return Err(StoreError::Unavailable("simulated crash".into()));
        }
        self.inner.save(context).await
    }

    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> saga_store::Result<Option<SagaContext>> {
        self.inner.find_by_correlation(correlation_id).await
    }

    async fn find_incomplete(&self) -> saga_store::Result<Vec<SagaContext>> {
        self.inner.find_incomplete().await
    }
}

struct TestHarness {
    repository: InMemorySagaRepository,
    idempotency: InMemoryIdempotencyStore,
    inventory: InMemoryInventoryService,
    payment: InMemoryPaymentService,
    shipping: InMemoryShippingService,
    notification: InMemoryNotificationService,
}

impl TestHarness {
    fn new() -> Self {
        Self {
            repository: InMemorySagaRepository::new(),
            idempotency: InMemoryIdempotencyStore::new(),
            inventory: InMemoryInventoryService::new(),
            payment: InMemoryPaymentService::new(),
            shipping: InMemoryShippingService::new(),
            notification: InMemoryNotificationService::new(),
        }
    }

    fn options(saga_timeout: Duration) -> FulfillmentOptions {
        FulfillmentOptions {
            saga_timeout,
            step_timeout: Duration::from_secs(5),
            retry_policy: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10)),
        }
    }

    /// A fresh orchestrator over the shared stores and services, as after a restart.
    fn orchestrator(&self, repository: Arc<dyn SagaRepository>) -> SagaOrchestrator {
        self.orchestrator_with_timeout(repository, Duration::from_secs(60))
    }

    fn orchestrator_with_timeout(
        &self,
        repository: Arc<dyn SagaRepository>,
        saga_timeout: Duration,
    ) -> SagaOrchestrator {
        let orchestrator = SagaOrchestrator::new(
            repository,
            Arc::new(self.idempotency.clone()),
            Arc::new(ResilienceRegistry::new()),
        );
        let services = OrderServices {
            inventory: Arc::new(self.inventory.clone()),
            payment: Arc::new(self.payment.clone()),
            shipping: Arc::new(self.shipping.clone()),
            notification: Some(Arc::new(self.notification.clone())),
        };
        orchestrator.register(
            order_fulfillment::definition(services, &Self::options(saga_timeout)).unwrap(),
        );
        orchestrator
    }

    fn default_orchestrator(&self) -> SagaOrchestrator {
        self.orchestrator(Arc::new(self.repository.clone()))
    }

    fn order(order_id: &str) -> SagaData {
        OrderRequest {
            order_id: order_id.to_string(),
            customer_id: "cust-1".to_string(),
            items: vec![
                ReservationItem {
                    sku: "SKU-001".to_string(),
                    quantity: 2,
                },
                ReservationItem {
                    sku: "SKU-002".to_string(),
                    quantity: 1,
                },
            ],
            amount_cents: 4500,
            shipping_address: "1 Main St".to_string(),
        }
        .to_saga_data()
    }
}

#[tokio::test]
async fn test_happy_path_full_order_fulfillment() {
    let h = TestHarness::new();
    let orchestrator = h.default_orchestrator();

    let ctx = orchestrator
        .execute(
            order_fulfillment::SAGA_TYPE,
            TestHarness::order("order-1"),
            Some("order-1".into()),
        )
        .await
        .unwrap();

    assert_eq!(ctx.status, SagaStatus::Completed);
    assert_eq!(ctx.current_step_index, 4);
    assert!(ctx.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!(ctx.data.contains_key("reservation_id"));
    assert!(ctx.data.contains_key("payment_id"));
    assert!(ctx.data.contains_key("tracking_number"));
    assert!(ctx.data.contains_key("confirmation_id"));

    assert_eq!(h.inventory.reservation_count(), 1);
    assert_eq!(h.payment.payment_count(), 1);
    assert_eq!(h.shipping.shipment_count(), 1);
    assert_eq!(h.notification.sent_count(), 1);

    let stored = h.repository.get(ctx.saga_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SagaStatus::Completed);
}

#[tokio::test]
async fn test_inventory_failure_no_compensation_needed() {
    let h = TestHarness::new();
    h.inventory.set_reserve_failure(FailureMode::FailPermanent);

    let ctx = h
        .default_orchestrator()
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-1"), None)
        .await
        .unwrap();

    assert_eq!(ctx.status, SagaStatus::Compensated);
    assert_eq!(ctx.steps[0].status, StepStatus::Failed);
    assert_eq!(h.inventory.release_calls(), 0);
    assert_eq!(h.payment.charge_calls(), 0);
}

/// Scenario A: pay fails permanently, reserve is compensated, ship never runs.
#[tokio::test]
async fn test_payment_failure_releases_inventory() {
    let h = TestHarness::new();
    h.payment.set_charge_failure(FailureMode::FailPermanent);

    let ctx = h
        .default_orchestrator()
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-1"), None)
        .await
        .unwrap();

    assert_eq!(ctx.status, SagaStatus::Compensated);
    assert_eq!(ctx.steps[0].status, StepStatus::Compensated);
    assert!(ctx.steps[0].compensated_at.is_some());
    assert_eq!(ctx.steps[1].status, StepStatus::Failed);
    assert_eq!(ctx.steps[1].attempts, 1);
    assert!(
        ctx.steps[1]
            .error
            .as_deref()
            .unwrap()
            .contains("Payment declined")
    );
    assert_eq!(ctx.steps[2].status, StepStatus::Pending);

    assert_eq!(h.payment.charge_calls(), 1);
    assert_eq!(h.shipping.create_calls(), 0);
    assert_eq!(h.inventory.reservation_count(), 0);
    assert_eq!(h.inventory.release_calls(), 1);
}

#[tokio::test]
async fn test_shipping_failure_refunds_payment_releases_inventory() {
    let h = TestHarness::new();
    h.shipping.set_create_failure(FailureMode::FailPermanent);

    let ctx = h
        .default_orchestrator()
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-1"), None)
        .await
        .unwrap();

    assert_eq!(ctx.status, SagaStatus::Compensated);
    assert_eq!(h.inventory.reservation_count(), 0);
    assert_eq!(h.payment.payment_count(), 0);
    assert_eq!(h.payment.refund_calls(), 1);
    assert_eq!(h.notification.sent_count(), 0);

    let payment = ctx.step(STEP_PROCESS_PAYMENT).unwrap();
    let reserve = ctx.step(STEP_RESERVE_INVENTORY).unwrap();
    assert!(payment.compensated_at.unwrap() <= reserve.compensated_at.unwrap());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = TestHarness::new();
    h.payment.set_charge_failure(FailureMode::FailTransient(2));

    let ctx = h
        .default_orchestrator()
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-1"), None)
        .await
        .unwrap();

    assert_eq!(ctx.status, SagaStatus::Completed);
    assert_eq!(ctx.step(STEP_PROCESS_PAYMENT).unwrap().attempts, 3);
    assert_eq!(h.payment.charge_calls(), 3);
    assert_eq!(h.payment.payment_count(), 1);
}

#[tokio::test]
async fn test_compensations_run_in_reverse_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let step = |name: &'static str, fail: bool| {
        let log = log.clone();
        let compensation = action_fn(move |_, _| {
            let log = log.clone();
            async move {
                log.lock().push(name);
                Ok(SagaData::new())
            }
        });
        let action = action_fn(move |_, _| async move {
            if fail {
                Err(ClassifiedError::permanent("boom"))
            } else {
                Ok(SagaData::new())
            }
        });
        StepDefinition::new(name, action).with_compensation(compensation)
    };

    let orchestrator = SagaOrchestrator::new(
        Arc::new(InMemorySagaRepository::new()),
        Arc::new(InMemoryIdempotencyStore::new()),
        Arc::new(ResilienceRegistry::new()),
    );
    orchestrator.register(
        SagaDefinition::builder("Chain")
            .step(step("s0", false))
            .step(step("s1", false))
            .step(step("s2", false))
            .step(step("s3", true))
            .step(step("s4", false))
            .build()
            .unwrap(),
    );

    let ctx = orchestrator.execute("Chain", SagaData::new(), None).await.unwrap();

    assert_eq!(ctx.status, SagaStatus::Compensated);
    assert_eq!(*log.lock(), vec!["s2", "s1", "s0"]);
    assert_eq!(ctx.steps[3].status, StepStatus::Failed);
    assert_eq!(ctx.steps[4].status, StepStatus::Pending);
}

/// Scenario B: crash after step 1's side effect, before its completion is saved.
#[tokio::test]
async fn test_resume_after_crash_does_not_repeat_reservation() {
    let h = TestHarness::new();
    // Saves: 1 saga start, 2 step 1 running, 3 step 1 completed
    let crashing = Arc::new(CrashingRepository::new(h.repository.clone(), 3));
    let result = h
        .orchestrator(crashing)
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-1"), None)
        .await;
    assert!(matches!(result, Err(SagaError::Store(StoreError::Unavailable(_)))));
    assert_eq!(h.inventory.reserve_calls(), 1);

    let stuck = h.repository.find_incomplete().await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].current_step_index, 0);
    assert_eq!(stuck[0].steps[0].status, StepStatus::Running);

    let ctx = h
        .default_orchestrator()
        .resume(stuck[0].saga_id, None)
        .await
        .unwrap();

    assert_eq!(ctx.status, SagaStatus::Completed);
    assert_eq!(h.inventory.reserve_calls(), 1);
    assert_eq!(h.inventory.reservation_count(), 1);
    let reservation_id = ctx.data["reservation_id"].as_str().unwrap();
    assert!(h.inventory.has_reservation(reservation_id));
}

#[tokio::test]
async fn test_resume_after_crash_before_next_step_start() {
    let h = TestHarness::new();
    // Save 4 is step 2 running
    let crashing = Arc::new(CrashingRepository::new(h.repository.clone(), 4));
    let result = h
        .orchestrator(crashing)
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-1"), None)
        .await;
    assert!(result.is_err());

    let stuck = h.repository.find_incomplete().await.unwrap().remove(0);
    assert_eq!(stuck.current_step_index, 1);

    let ctx = h.default_orchestrator().resume(stuck.saga_id, None).await.unwrap();
    assert_eq!(ctx.status, SagaStatus::Completed);
    assert_eq!(h.inventory.reserve_calls(), 1);
    assert_eq!(h.payment.charge_calls(), 1);
}

#[tokio::test]
async fn test_resume_from_earlier_step_hits_cache() {
    let h = TestHarness::new();
    let crashing = Arc::new(CrashingRepository::new(h.repository.clone(), 4));
    let _ = h
        .orchestrator(crashing)
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-1"), None)
        .await;
    let saga_id = h.repository.find_incomplete().await.unwrap()[0].saga_id;

    let orchestrator = h.default_orchestrator();
    let too_far = orchestrator.resume(saga_id, Some(3)).await;
    assert!(matches!(too_far, Err(SagaError::InvalidResumeIndex { index: 3, .. })));

    let ctx = orchestrator.resume(saga_id, Some(0)).await.unwrap();
    assert_eq!(ctx.status, SagaStatus::Completed);
    assert_eq!(h.inventory.reserve_calls(), 1);
    assert_eq!(h.inventory.reservation_count(), 1);
}

#[tokio::test]
async fn test_recover_incomplete_sagas() {
    let h = TestHarness::new();
    for order_id in ["order-1", "order-2"] {
        let crashing = Arc::new(CrashingRepository::new(h.repository.clone(), 4));
        let _ = h
            .orchestrator(crashing)
            .execute(order_fulfillment::SAGA_TYPE, TestHarness::order(order_id), None)
            .await;
    }
    assert_eq!(h.repository.find_incomplete().await.unwrap().len(), 2);

    let recovered = h.default_orchestrator().recover_incomplete().await.unwrap();

    assert_eq!(recovered.len(), 2);
    assert!(recovered.iter().all(|c| c.status == SagaStatus::Completed));
    assert!(h.repository.find_incomplete().await.unwrap().is_empty());
    assert_eq!(h.inventory.reserve_calls(), 2);
}

#[tokio::test]
async fn test_deadline_exceeded_before_step_times_out_saga() {
    let h = TestHarness::new();
    let crashing = Arc::new(CrashingRepository::new(h.repository.clone(), 4));
    let _ = h
        .orchestrator(crashing)
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-1"), None)
        .await;

    // Move the deadline into the past while the saga is stalled
    let mut stuck = h.repository.find_incomplete().await.unwrap().remove(0);
    stuck.timeout_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
    h.repository.save(&stuck).await.unwrap();

    let ctx = h.default_orchestrator().resume(stuck.saga_id, None).await.unwrap();

    assert_eq!(ctx.status, SagaStatus::Compensated);
    assert!(ctx.timed_out);
    assert_eq!(ctx.steps[0].status, StepStatus::Compensated);
    assert_eq!(h.payment.charge_calls(), 0);
    assert_eq!(h.inventory.reservation_count(), 0);
}

#[tokio::test]
async fn test_saga_deadline_bounds_step_timeout() {
    let h = TestHarness::new();
    h.inventory.set_reserve_latency(Duration::from_millis(500));
    let orchestrator = h.orchestrator_with_timeout(
        Arc::new(h.repository.clone()),
        Duration::from_millis(50),
    );

    let ctx = orchestrator
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-1"), None)
        .await
        .unwrap();

    assert_eq!(ctx.status, SagaStatus::Compensated);
    assert_eq!(ctx.steps[0].status, StepStatus::Failed);
    assert!(ctx.steps[0].error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_compensation_failure_needs_remediation() {
    let h = TestHarness::new();
    h.shipping.set_create_failure(FailureMode::FailPermanent);
    h.payment.set_refund_failure(FailureMode::FailPermanent);
    let orchestrator = h.default_orchestrator();

    let ctx = orchestrator
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-1"), None)
        .await
        .unwrap();

    assert_eq!(ctx.status, SagaStatus::Failed);
    assert!(ctx.needs_remediation);
    assert_eq!(
        ctx.step(STEP_PROCESS_PAYMENT).unwrap().status,
        StepStatus::CompensationFailed
    );
    // The sweep carried on past the failed refund
    assert_eq!(
        ctx.step(STEP_RESERVE_INVENTORY).unwrap().status,
        StepStatus::Compensated
    );
    assert_eq!(h.inventory.reservation_count(), 0);
    assert_eq!(h.payment.payment_count(), 1);

    h.payment.set_refund_failure(FailureMode::Healthy);
    let remediated = orchestrator.retry_compensations(ctx.saga_id).await.unwrap();

    assert_eq!(remediated.status, SagaStatus::Compensated);
    assert!(!remediated.needs_remediation);
    assert_eq!(h.payment.payment_count(), 0);
    // Already-compensated steps are not compensated again
    assert_eq!(h.inventory.release_calls(), 1);
}

#[tokio::test]
async fn test_failure_after_pivot_is_not_rolled_back() {
    let compensated = Arc::new(Mutex::new(Vec::new()));
    let step = |name: &'static str, fail: bool| {
        let compensated = compensated.clone();
        StepDefinition::new(
            name,
            action_fn(move |_, _| async move {
                if fail {
                    Err(ClassifiedError::permanent("carrier refused"))
                } else {
                    Ok(SagaData::new())
                }
            }),
        )
        .with_compensation(action_fn(move |_, _| {
            let compensated = compensated.clone();
            async move {
                compensated.lock().push(name);
                Ok(SagaData::new())
            }
        }))
    };

    let orchestrator = SagaOrchestrator::new(
        Arc::new(InMemorySagaRepository::new()),
        Arc::new(InMemoryIdempotencyStore::new()),
        Arc::new(ResilienceRegistry::new()),
    );
    orchestrator.register(
        SagaDefinition::builder("Trip")
            .step(step("book_flight", false))
            .step(step("charge_card", false))
            .step(step("book_hotel", false))
            .step(step("book_car", true))
            .pivot("charge_card")
            .build()
            .unwrap(),
    );

    let ctx = orchestrator.execute("Trip", SagaData::new(), None).await.unwrap();

    assert_eq!(ctx.status, SagaStatus::Failed);
    assert!(ctx.needs_remediation);
    assert_eq!(*compensated.lock(), vec!["book_hotel"]);
    assert_eq!(ctx.steps[0].status, StepStatus::Completed);
    assert_eq!(ctx.steps[1].status, StepStatus::Completed);
    assert_eq!(ctx.steps[2].status, StepStatus::Compensated);

    // Nothing failed to compensate, so there is nothing to retry
    let err = orchestrator.retry_compensations(ctx.saga_id).await.unwrap_err();
    assert!(matches!(
        err,
        SagaError::InvalidState { actual: SagaStatus::Failed, .. }
    ));
    assert_eq!(*compensated.lock(), vec!["book_hotel"]);
}

#[tokio::test]
async fn test_multiple_independent_sagas() {
    let h = TestHarness::new();
    let orchestrator = Arc::new(h.default_orchestrator());

    let mut handles = Vec::new();
    for i in 0..10 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .execute(
                    order_fulfillment::SAGA_TYPE,
                    TestHarness::order(&format!("order-{i}")),
                    None,
                )
                .await
                .unwrap()
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().status, SagaStatus::Completed);
    }
    assert_eq!(h.inventory.reservation_count(), 10);
    assert_eq!(h.payment.payment_count(), 10);
    assert_eq!(h.shipping.shipment_count(), 10);
}

#[tokio::test]
async fn test_one_saga_fails_other_succeeds() {
    let h = TestHarness::new();
    let orchestrator = h.default_orchestrator();

    let ok = orchestrator
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-1"), None)
        .await
        .unwrap();
    h.shipping.set_create_failure(FailureMode::FailPermanent);
    let failed = orchestrator
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-2"), None)
        .await
        .unwrap();

    assert_eq!(ok.status, SagaStatus::Completed);
    assert_eq!(failed.status, SagaStatus::Compensated);
    assert_eq!(h.inventory.reservation_count(), 1);
    assert_eq!(h.payment.payment_count(), 1);
    assert_eq!(h.shipping.shipment_count(), 1);
}

#[tokio::test]
async fn test_lifecycle_events_are_published() {
    let h = TestHarness::new();
    h.shipping.set_create_failure(FailureMode::FailPermanent);
    let (bus, _receiver) = InMemoryEventBus::channel();
    let orchestrator = h.default_orchestrator().with_publisher(Arc::new(bus.clone()));

    let ctx = orchestrator
        .execute(
            order_fulfillment::SAGA_TYPE,
            TestHarness::order("order-1"),
            Some("order-1".into()),
        )
        .await
        .unwrap();

    assert_eq!(
        bus.published_types(),
        vec![
            "saga.started",
            "saga.step_completed",
            "saga.step_completed",
            "saga.step_failed",
            "saga.compensated",
        ]
    );
    let published = bus.published();
    let (_, failed) = &published[3];
    assert_eq!(failed.saga_id, Some(ctx.saga_id));
    assert_eq!(failed.correlation_id.as_deref(), Some("order-1"));
    assert_eq!(failed.payload["step"], STEP_CREATE_SHIPMENT);
}

#[tokio::test]
async fn test_events_reach_router_through_bus() {
    let h = TestHarness::new();
    let sink = InMemoryDeadLetterSink::new();
    let router = Arc::new(
        SagaEventRouter::new(Arc::new(InMemoryIdempotencyStore::new()), Arc::new(sink.clone()))
            .with_repository(Arc::new(h.repository.clone())),
    );
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();
    router.register(
        "saga.completed",
        handler_fn("audit", move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );

    let (bus, delivery) = InMemoryEventBus::with_router(router.clone());
    let orchestrator = h.default_orchestrator().with_publisher(Arc::new(bus.clone()));
    let ctx = orchestrator
        .execute(order_fulfillment::SAGA_TYPE, TestHarness::order("order-1"), None)
        .await
        .unwrap();

    let (_, event) = bus
        .published()
        .into_iter()
        .find(|(_, e)| e.event_type == "saga.completed")
        .unwrap();
    assert_eq!(event.saga_id, Some(ctx.saga_id));

    // Closing every sender lets delivery drain and finish
    drop(orchestrator);
    drop(bus);
    tokio::time::timeout(Duration::from_secs(5), delivery)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 1);

    // Redelivery of the same event is a duplicate
    assert_eq!(router.route(event).await.unwrap(), RouteOutcome::Duplicate);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert!(sink.is_empty());
}
