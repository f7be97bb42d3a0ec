//! The postulation saga: reserve a stall, open an order, register externally.

use std::sync::Arc;

use common::{Clock, RequestId};
use domain::DomainError;
use store::{
    ExternalPayment, IntegratedPayment, ManualPayment, NewOrder, OrderPatch, OrderState, Request,
    RequestPatch, RequestState, ReservationOrder, ReservationStore, Stall, StoreError,
};

use crate::config::SagaConfig;
use crate::error::{Result, SagaError};
use crate::services::{
    Notification, NotificationService, RegistrationApplication, RegistrationService,
};

/// Step name: conditionally reserve the stall.
pub const STEP_RESERVE_STALL: &str = "reserve_stall";

/// Step name: allocate a reference and insert the order.
pub const STEP_CREATE_ORDER: &str = "create_order";

/// Step name: call the external registration service.
pub const STEP_REGISTER: &str = "register";

/// Actor recorded on manual payments when no operator is known.
pub const SYSTEM_ACTOR: &str = "sistema";

/// Note recorded on manual payments.
pub const MANUAL_PAYMENT_NOTE: &str = "Pago/registro manual sin integración externa";

/// Orchestrates a postulation across the three stores and the external
/// collaborators.
///
/// The conditional reservation in the first step is the only mutual
/// exclusion point; every guard before it is advisory. If the external
/// registration fails, or its result cannot be recorded on the order, the
/// stall is freed, the order rejected and the request returned to
/// `Requested` without its order link.
pub struct PostulationSaga<S, R, N>
where
    S: ReservationStore,
    R: RegistrationService,
    N: NotificationService,
{
    store: S,
    registration: Arc<R>,
    notifier: Arc<N>,
    clock: Arc<dyn Clock>,
    config: SagaConfig,
}

impl<S, R, N> Clone for PostulationSaga<S, R, N>
where
    S: ReservationStore,
    R: RegistrationService,
    N: NotificationService,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registration: Arc::clone(&self.registration),
            notifier: Arc::clone(&self.notifier),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
        }
    }
}

impl<S, R, N> PostulationSaga<S, R, N>
where
    S: ReservationStore,
    R: RegistrationService,
    N: NotificationService,
{
    pub fn new(
        store: S,
        registration: R,
        notifier: N,
        clock: Arc<dyn Clock>,
        config: SagaConfig,
    ) -> Self {
        Self {
            store,
            registration: Arc::new(registration),
            notifier: Arc::new(notifier),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Postulates a request. `caller_ip` is recorded on manual payments.
    ///
    /// Returns the order with its payment envelope.
    #[tracing::instrument(skip(self), fields(saga_type = "Postulation"))]
    pub async fn postulate(
        &self,
        request_id: RequestId,
        caller_ip: &str,
    ) -> Result<ReservationOrder> {
        metrics::counter!("postulations_total").increment(1);
        let started = std::time::Instant::now();

        let result = self.run(request_id, caller_ip).await;

        metrics::histogram!("postulation_duration_seconds").record(started.elapsed().as_secs_f64());
        match &result {
            Ok(order) => {
                tracing::info!(order_id = %order.id, reference = %order.reference, "postulation completed")
            }
            Err(e) => {
                metrics::counter!("postulations_failed").increment(1);
                tracing::warn!(error = %e, kind = %e.kind(), "postulation failed");
            }
        }
        result
    }

    async fn run(&self, request_id: RequestId, caller_ip: &str) -> Result<ReservationOrder> {
        let request = self
            .store
            .request(request_id)
            .await?
            .ok_or_else(|| DomainError::not_found("Request", request_id))?;
        if request.state != RequestState::Requested {
            return Err(DomainError::InvalidState {
                entity: "Request",
                id: request_id.to_string(),
                expected: RequestState::Requested.to_string(),
                actual: request.state.to_string(),
            }
            .into());
        }
        self.check_guards(&request).await?;

        let stall = self
            .store
            .stall(request.stall_id)
            .await?
            .ok_or_else(|| DomainError::not_found("Stall", request.stall_id))?;

        // 1. Reserve
        tracing::info!(step = STEP_RESERVE_STALL, stall_id = %stall.id, "saga step started");
        let now = self.clock.now();
        match self
            .store
            .try_reserve(stall.id, now + self.config.approval_grace)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_state_conflict() => {
                tracing::warn!(stall_id = %stall.id, "stall claimed by another postulation");
                return Err(DomainError::StallClaimed(stall.id).into());
            }
            Err(e) => return Err(e.into()),
        }

        // 2. Create order and link the request
        tracing::info!(step = STEP_CREATE_ORDER, "saga step started");
        let payment = request.manual.then(|| {
            ExternalPayment::Manual(ManualPayment {
                created_by: request
                    .operator
                    .clone()
                    .unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
                ip: caller_ip.to_string(),
                at: now,
                note: MANUAL_PAYMENT_NOTE.to_string(),
            })
        });
        let order = match self.create_order(&request, &stall, payment, now).await {
            Ok(order) => order,
            Err(e) => {
                self.release_stall(&stall).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .store
            .transition_request(
                request.id,
                Some(&[RequestState::Requested]),
                RequestState::Postulated,
                RequestPatch::new().link_order(order.id),
            )
            .await
        {
            tracing::warn!(request_id = %request.id, error = %e, "request changed during postulation");
            self.release_stall(&stall).await;
            self.reject_order(&order, "Solicitud modificada durante la postulación")
                .await;
            return Err(e.into());
        }
        tracing::info!(order_id = %order.id, reference = %order.reference, manual = request.manual, "order created");

        // 3. Branch: manual orders already carry their payment envelope
        if request.manual {
            return Ok(order);
        }

        tracing::info!(step = STEP_REGISTER, "saga step started");
        let application = RegistrationApplication::new(&order.occupant, &stall);
        match self.registration.register(&application).await {
            Ok(receipt) => {
                let session_id = receipt.session_id.clone().unwrap_or_default();
                let payment = ExternalPayment::Integrated(IntegratedPayment {
                    session_id: receipt.session_id,
                    response: receipt.response,
                });
                match self.store.set_payment(order.id, payment).await {
                    Ok(order) => {
                        self.spawn_notification(&order, &stall);
                        Ok(order)
                    }
                    Err(e) => {
                        // The external side holds a registration we no longer
                        // point to; an operator has to cancel it there.
                        tracing::error!(
                            order_id = %order.id,
                            %session_id,
                            error = %e,
                            "registration result not recorded, external registration needs manual reconciliation"
                        );
                        let observation = format!("Pago no registrado: {e}");
                        self.compensate(&request, &order, &stall, &observation).await;
                        Err(e.into())
                    }
                }
            }
            Err(e) => {
                tracing::error!(order_id = %order.id, error = %e, "external registration failed");
                let observation = format!("Registro externo fallido: {e}");
                self.compensate(&request, &order, &stall, &observation).await;
                Err(e)
            }
        }
    }

    /// Advisory checks that the citizen holds no other claim.
    async fn check_guards(&self, request: &Request) -> Result<()> {
        let national_id = request.citizen.national_id.as_str();

        if self.store.has_claim_for_citizen(national_id).await? {
            tracing::warn!(national_id, "citizen already holds a reserved or occupied stall");
            return Err(DomainError::DuplicateClaim(format!(
                "citizen {national_id} already holds a reserved or occupied stall"
            ))
            .into());
        }
        if self.store.has_active_order_for_citizen(national_id).await? {
            tracing::warn!(national_id, "citizen already has an active order");
            return Err(DomainError::DuplicateClaim(format!(
                "citizen {national_id} already has an active order"
            ))
            .into());
        }
        if self
            .store
            .has_blocking_request_for_citizen(national_id, Some(request.id))
            .await?
        {
            tracing::warn!(national_id, "citizen has another open request");
            return Err(DomainError::DuplicateClaim(format!(
                "citizen {national_id} has another open request"
            ))
            .into());
        }
        Ok(())
    }

    /// Inserts the order, re-reading the sequence whenever the derived
    /// reference is already taken.
    async fn create_order(
        &self,
        request: &Request,
        stall: &Stall,
        payment: Option<ExternalPayment>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<ReservationOrder> {
        let attempts = self.config.reference_attempts.max(1);
        for attempt in 1..=attempts {
            let sequence = self.store.next_sequence().await?;
            let order = ReservationOrder::new(
                NewOrder {
                    sequence,
                    stall_id: stall.id,
                    request_id: request.id,
                    market_id: request.market_id,
                    section: request.section.clone().or_else(|| stall.section.clone()),
                    start_date: request.start_date,
                    end_date: request.end_date,
                    occupant: request.citizen.clone(),
                    external_payment: payment.clone(),
                    manual: request.manual,
                    operator: request.operator.clone(),
                },
                now,
                self.config.approval_grace,
            );
            match self.store.insert_order(order.clone()).await {
                Ok(()) => return Ok(order),
                Err(StoreError::DuplicateReference(reference)) => {
                    tracing::warn!(%reference, attempt, "order reference taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SagaError::ReferenceExhausted { attempts })
    }

    fn spawn_notification(&self, order: &ReservationOrder, stall: &Stall) {
        let notifier = Arc::clone(&self.notifier);
        let notification = Notification {
            recipient: order.occupant.phone.clone(),
            stall_name: stall.name.clone(),
            location: stall.location().to_string(),
        };
        let order_id = order.id;
        tokio::spawn(async move {
            if let Err(e) = notifier.notify_assignment(notification).await {
                tracing::warn!(%order_id, error = %e, "assignment notification failed");
            }
        });
    }

    /// Undoes a postulation that failed after its order was linked. Each step
    /// is conditional and logged; a failing step does not stop the others.
    #[tracing::instrument(skip_all, fields(order_id = %order.id))]
    async fn compensate(
        &self,
        request: &Request,
        order: &ReservationOrder,
        stall: &Stall,
        observation: &str,
    ) {
        metrics::counter!("postulation_compensations_total").increment(1);

        self.release_stall(stall).await;
        self.reject_order(order, observation).await;

        match self
            .store
            .transition_request(
                request.id,
                Some(&[RequestState::Postulated]),
                RequestState::Requested,
                RequestPatch::new().clear_order(),
            )
            .await
        {
            Ok(_) => tracing::warn!(request_id = %request.id, "compensation: request returned to Requested"),
            Err(e) => tracing::error!(request_id = %request.id, error = %e, "compensation: request not reverted, needs manual reconciliation"),
        }
    }

    async fn release_stall(&self, stall: &Stall) {
        match self.store.release(stall.id).await {
            Ok(_) => tracing::warn!(stall_id = %stall.id, "compensation: stall released"),
            Err(e) => tracing::error!(stall_id = %stall.id, error = %e, "compensation: stall not released, needs manual reconciliation"),
        }
    }

    async fn reject_order(&self, order: &ReservationOrder, observation: &str) {
        match self
            .store
            .transition_order(
                order.id,
                &[OrderState::Pending],
                OrderState::Rejected,
                self.clock.now(),
                OrderPatch::new().observation(observation),
            )
            .await
        {
            Ok(_) => tracing::warn!(order_id = %order.id, "compensation: order rejected"),
            Err(e) => tracing::error!(order_id = %order.id, error = %e, "compensation: order not rejected, needs manual reconciliation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use common::{ManualClock, MarketId, StallId};
    use domain::ErrorKind;
    use store::{
        Citizen, FailPoint, InMemoryStore, NewRequest, NewStall, OrderStore, RequestStore,
        StallRegistry, StallState,
    };

    use crate::services::{InMemoryNotificationService, InMemoryRegistrationService};

    type TestSaga =
        PostulationSaga<InMemoryStore, InMemoryRegistrationService, InMemoryNotificationService>;

    struct Harness {
        store: InMemoryStore,
        registration: InMemoryRegistrationService,
        saga: TestSaga,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 9, 12, 0, 0).unwrap());
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
        let registration = InMemoryRegistrationService::new();
        let saga = PostulationSaga::new(
            store.clone(),
            registration.clone(),
            InMemoryNotificationService::new(),
            Arc::new(clock.clone()),
            SagaConfig::default(),
        );
        Harness {
            store,
            registration,
            saga,
            clock,
        }
    }

    async fn request(h: &Harness, national_id: &str, manual: bool) -> (StallId, RequestId) {
        let stall = NewStall::new(format!("MC-T-{national_id}"), "Puesto", MarketId::new())
            .into_stall(h.clock.now());
        h.store.insert_stall(stall.clone()).await.unwrap();
        let request = Request::new(
            NewRequest {
                stall_id: stall.id,
                citizen: Citizen::new("Ana", national_id),
                start_date: Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap(),
                end_date: Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap(),
                manual,
                operator: None,
            },
            &stall,
            h.clock.now(),
        );
        h.store.insert_request(request.clone()).await.unwrap();
        (stall.id, request.id)
    }

    #[tokio::test]
    async fn manual_postulation_synthesizes_payment() {
        let h = harness();
        let (stall_id, request_id) = request(&h, "1712345678", true).await;

        let order = h.saga.postulate(request_id, "10.0.0.1").await.unwrap();

        assert_eq!(order.state, OrderState::Pending);
        assert_eq!(order.approve_before, h.clock.now() + Duration::hours(24));
        match order.external_payment {
            Some(ExternalPayment::Manual(ref payment)) => {
                assert_eq!(payment.created_by, SYSTEM_ACTOR);
                assert_eq!(payment.ip, "10.0.0.1");
                assert_eq!(payment.note, MANUAL_PAYMENT_NOTE);
            }
            ref other => panic!("unexpected payment {other:?}"),
        }
        assert_eq!(h.registration.registration_count(), 0);

        let stall = h.store.stall(stall_id).await.unwrap().unwrap();
        assert_eq!(stall.state, StallState::Reserved);
        let request = h.store.request(request_id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Postulated);
        assert_eq!(request.order_id, Some(order.id));
    }

    #[tokio::test]
    async fn postulation_requires_requested_state() {
        let h = harness();
        let (_, request_id) = request(&h, "1712345678", true).await;
        h.saga.postulate(request_id, "ip").await.unwrap();

        let err = h.saga.postulate(request_id, "ip").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn unknown_request_is_not_found() {
        let h = harness();
        let err = h.saga.postulate(RequestId::new(), "ip").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn lost_reservation_is_a_retryable_conflict() {
        let h = harness();
        let (stall_id, request_id) = request(&h, "1712345678", false).await;
        h.store.try_reserve(stall_id, h.clock.now()).await.unwrap();

        let err = h.saga.postulate(request_id, "ip").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.store.order_count().await, 0);
        let request = h.store.request(request_id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Requested);
    }

    #[tokio::test]
    async fn unrecorded_registration_is_compensated() {
        let h = harness();
        let (stall_id, request_id) = request(&h, "1712345678", false).await;
        h.store.fail_next(FailPoint::SetPayment);

        let err = h.saga.postulate(request_id, "ip").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert_eq!(h.registration.registration_count(), 1);

        let stall = h.store.stall(stall_id).await.unwrap().unwrap();
        assert_eq!(stall.state, StallState::Free);
        let orders = h.store.all_orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].state, OrderState::Rejected);
        assert!(orders[0].external_payment.is_none());
        assert!(
            orders[0]
                .observation
                .as_deref()
                .is_some_and(|o| o.starts_with("Pago no registrado"))
        );
        let request = h.store.request(request_id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Requested);
        assert!(request.order_id.is_none());
    }

    #[tokio::test]
    async fn references_follow_the_sequence() {
        let h = harness();
        let (_, first) = request(&h, "1712345678", true).await;
        let first_order = h.saga.postulate(first, "ip").await.unwrap();
        assert_eq!(first_order.reference.as_str(), "0001");

        let (_, second) = request(&h, "0102030405", true).await;
        let second_order = h.saga.postulate(second, "ip").await.unwrap();
        assert_eq!(second_order.reference.as_str(), "0002");
    }

    #[tokio::test]
    async fn exhausted_references_release_the_stall() {
        let store = InMemoryStore::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 9, 12, 0, 0).unwrap());
        let saga = PostulationSaga::new(
            store.clone(),
            InMemoryRegistrationService::new(),
            InMemoryNotificationService::new(),
            Arc::new(clock.clone()),
            SagaConfig {
                reference_attempts: 0,
                ..SagaConfig::default()
            },
        );
        let h = Harness {
            store,
            registration: InMemoryRegistrationService::new(),
            saga,
            clock,
        };
        let (stall_id, request_id) = request(&h, "1712345678", true).await;

        // Occupy reference 0001 with an order the sequence does not see.
        let mut blocker = ReservationOrder::new(
            NewOrder {
                sequence: 0,
                stall_id,
                request_id: RequestId::new(),
                market_id: MarketId::new(),
                section: None,
                start_date: h.clock.now(),
                end_date: h.clock.now(),
                occupant: Citizen::new("Otro", "0000000001"),
                external_payment: None,
                manual: false,
                operator: None,
            },
            h.clock.now(),
            Duration::hours(24),
        );
        blocker.reference = store::OrderReference::from_sequence(1);
        blocker.state = OrderState::Rejected;
        h.store.insert_order(blocker).await.unwrap();

        let err = h.saga.postulate(request_id, "ip").await.unwrap_err();
        assert!(matches!(err, SagaError::ReferenceExhausted { attempts: 1 }));

        let stall = h.store.stall(stall_id).await.unwrap().unwrap();
        assert_eq!(stall.state, StallState::Free);
        let request = h.store.request(request_id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Requested);
    }
}
