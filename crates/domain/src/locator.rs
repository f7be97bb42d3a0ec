//! Order lookup by internal id or human-readable reference.

use common::OrderId;
use store::{OrderReference, OrderStore, ReservationOrder};

use crate::error::{DomainError, Result};

/// How a caller names an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderLocator {
    Id(OrderId),
    Reference(OrderReference),
}

impl OrderLocator {
    /// A UUID is an id; anything else is a reference, zero-padded to
    /// [`OrderReference::WIDTH`].
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(DomainError::Validation(
                "order id or reference is required".to_string(),
            ));
        }
        match input.parse::<OrderId>() {
            Ok(id) => Ok(OrderLocator::Id(id)),
            Err(_) => Ok(OrderLocator::Reference(OrderReference::parse(input))),
        }
    }

    /// Fetches the order, failing with `NotFound` if it does not exist.
    pub async fn find<S: OrderStore + ?Sized>(&self, store: &S) -> Result<ReservationOrder> {
        let order = match self {
            OrderLocator::Id(id) => store.order(*id).await?,
            OrderLocator::Reference(reference) => store.order_by_reference(reference).await?,
        };
        order.ok_or_else(|| DomainError::not_found("Order", self))
    }
}

impl std::str::FromStr for OrderLocator {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for OrderLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderLocator::Id(id) => write!(f, "{id}"),
            OrderLocator::Reference(reference) => write!(f, "{reference}"),
        }
    }
}

impl From<OrderId> for OrderLocator {
    fn from(id: OrderId) -> Self {
        OrderLocator::Id(id)
    }
}

impl From<OrderReference> for OrderLocator {
    fn from(reference: OrderReference) -> Self {
        OrderLocator::Reference(reference)
    }
}
