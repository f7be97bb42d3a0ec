//! Operator (and feed-driven) approval and rejection of pending orders.

use std::sync::Arc;

use common::{Clock, StallId};
use store::{
    OrderPatch, OrderState, RequestPatch, RequestState, ReservationOrder, ReservationStore,
};

use crate::error::{DomainError, Result};
use crate::locator::OrderLocator;

/// Approves and rejects orders waiting in `EN_SOLICITUD`.
///
/// Approval runs three conditional updates in a fixed order:
///
/// 1. order `EN_SOLICITUD -> ASIGNADA`, the gate against double approval and
///    against a concurrent sweep or rejection;
/// 2. stall occupation together with the occupant write (`assign`); on
///    failure the order is put back to `EN_SOLICITUD`;
/// 3. request `POSTULADA -> APROBADA`, logged for reconciliation if it fails.
#[derive(Clone)]
pub struct ApprovalService<S: ReservationStore> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: ReservationStore> ApprovalService<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Finds an order by id or reference.
    pub async fn find_order(&self, locator: &OrderLocator) -> Result<ReservationOrder> {
        locator.find(&self.store).await
    }

    /// Most recently created pending order on a stall.
    pub async fn latest_pending_for_stall(&self, stall_id: StallId) -> Result<ReservationOrder> {
        self.store
            .latest_pending_order_for_stall(stall_id)
            .await?
            .ok_or_else(|| DomainError::not_found("Pending order for stall", stall_id))
    }

    #[tracing::instrument(skip(self), fields(order = %locator))]
    pub async fn approve(&self, locator: &OrderLocator) -> Result<ReservationOrder> {
        self.approve_as(locator, None).await
    }

    /// Approves and tags the order and its request with the approving operator.
    #[tracing::instrument(skip(self), fields(order = %locator))]
    pub async fn approve_manual(
        &self,
        locator: &OrderLocator,
        operator: &str,
    ) -> Result<ReservationOrder> {
        let operator = operator.trim();
        if operator.is_empty() {
            return Err(DomainError::Validation("operator is required".to_string()));
        }
        self.approve_as(locator, Some(operator)).await
    }

    async fn approve_as(
        &self,
        locator: &OrderLocator,
        operator: Option<&str>,
    ) -> Result<ReservationOrder> {
        let order = self.find_order(locator).await?;
        let now = self.clock.now();

        let mut patch = OrderPatch::new().release_at(order.end_date);
        if let Some(operator) = operator {
            patch = patch.by_operator(operator);
        }
        let assigned = self
            .store
            .transition_order(order.id, &[OrderState::Pending], OrderState::Assigned, now, patch)
            .await?;

        let occupant = order.occupant.occupant(order.start_date, order.end_date);
        if let Err(e) = self.store.assign(order.stall_id, occupant).await {
            tracing::warn!(order_id = %order.id, stall_id = %order.stall_id, error = %e, "stall could not be occupied, reverting approval");
            if let Err(revert) = self
                .store
                .transition_order(
                    order.id,
                    &[OrderState::Assigned],
                    OrderState::Pending,
                    now,
                    OrderPatch::new(),
                )
                .await
            {
                tracing::error!(order_id = %order.id, error = %revert, "approval revert failed, needs manual reconciliation");
            }
            return Err(e.into());
        }

        let mut request_patch = RequestPatch::new();
        if let Some(operator) = operator {
            request_patch = request_patch.by_operator(operator);
        }
        if let Err(e) = self
            .store
            .transition_request(
                order.request_id,
                Some(&[RequestState::Postulated]),
                RequestState::Approved,
                request_patch,
            )
            .await
        {
            tracing::error!(order_id = %order.id, request_id = %order.request_id, error = %e, "request not marked approved, needs manual reconciliation");
        }

        metrics::counter!("orders_approved_total").increment(1);
        tracing::info!(order_id = %assigned.id, reference = %assigned.reference, manual = operator.is_some(), "order approved");
        Ok(assigned)
    }

    /// Rejects a pending order, frees its reservation and rejects its request.
    #[tracing::instrument(skip(self), fields(order = %locator))]
    pub async fn reject(&self, locator: &OrderLocator) -> Result<ReservationOrder> {
        let order = self.find_order(locator).await?;
        let now = self.clock.now();

        let rejected = self
            .store
            .transition_order(
                order.id,
                &[OrderState::Pending],
                OrderState::Rejected,
                now,
                OrderPatch::new(),
            )
            .await?;

        match self.store.release_reservation(order.stall_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(stall_id = %order.stall_id, "stall was no longer reserved")
            }
            Err(e) => {
                tracing::error!(stall_id = %order.stall_id, error = %e, "stall not released after rejection, needs manual reconciliation")
            }
        }

        if let Err(e) = self
            .store
            .transition_request(
                order.request_id,
                Some(&[RequestState::Postulated]),
                RequestState::Rejected,
                RequestPatch::new(),
            )
            .await
        {
            tracing::error!(request_id = %order.request_id, error = %e, "request not marked rejected, needs manual reconciliation");
        }

        metrics::counter!("orders_rejected_total").increment(1);
        tracing::info!(order_id = %rejected.id, reference = %rejected.reference, "order rejected");
        Ok(rejected)
    }
}
