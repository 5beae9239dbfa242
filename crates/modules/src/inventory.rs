//! Inventory module: stock levels and reservations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fault::{FaultOutcome, FaultPlan, apply_delay};
use crate::lock::{read, write};

/// Errors returned by the inventory module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    #[error("Insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        sku: String,
        requested: u32,
        available: u32,
    },

    #[error("Reservation request has no items")]
    EmptyReservation,

    #[error("Reservation refused: {0}")]
    Refused(String),

    #[error("Reservation {0} belongs to another reference")]
    ForeignReservation(String),

    #[error("Inventory service unavailable: {0}")]
    Unavailable(String),
}

impl InventoryError {
    /// Returns true if the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, InventoryError::Unavailable(_))
    }
}

/// An item to reserve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationItem {
    pub sku: String,
    pub quantity: u32,
}

impl ReservationItem {
    pub fn new(sku: impl Into<String>, quantity: u32) -> Self {
        Self {
            sku: sku.into(),
            quantity,
        }
    }
}

/// A successful reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// The reservation ID assigned by the inventory service.
    pub reservation_id: String,
    /// Caller reference the reservation is deduplicated on.
    pub reference: String,
    pub items: Vec<ReservationItem>,
}

/// Trait for inventory operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for `items`.
    ///
    /// A second call with the same `reference` returns the existing
    /// reservation without touching stock.
    async fn reserve(
        &self,
        reference: &str,
        items: Vec<ReservationItem>,
    ) -> Result<Reservation, InventoryError>;

    /// Releases a reservation made under `reference` and returns its stock.
    /// Releasing an unknown or already released reservation succeeds; a
    /// reservation made under another reference is refused.
    async fn release(&self, reference: &str, reservation_id: &str) -> Result<(), InventoryError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    /// Tracked stock per SKU. SKUs without an entry are unlimited.
    stock: HashMap<String, u32>,
    reservations: HashMap<String, Reservation>,
    by_reference: HashMap<String, String>,
    next_id: u32,
    reserve_calls: usize,
    release_calls: usize,
    reserve_faults: FaultPlan,
    release_faults: FaultPlan,
}

/// In-memory inventory service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service with unlimited stock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the available stock of a SKU.
    pub fn set_stock(&self, sku: impl Into<String>, quantity: u32) {
        write(&self.state).stock.insert(sku.into(), quantity);
    }

    /// Returns the available stock of a tracked SKU.
    pub fn stock(&self, sku: &str) -> Option<u32> {
        read(&self.state).stock.get(sku).copied()
    }

    /// Configures the service to refuse reserve calls.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        write(&self.state).reserve_faults.set_reject(fail);
    }

    /// Makes the next `times` reserve calls fail with a transient error.
    pub fn set_unavailable_on_reserve(&self, times: u32) {
        write(&self.state).reserve_faults.set_unavailable(times);
    }

    /// Delays every reserve call.
    pub fn set_reserve_delay(&self, delay: Option<Duration>) {
        write(&self.state).reserve_faults.set_delay(delay);
    }

    /// Configures the service to fail release calls.
    pub fn set_fail_on_release(&self, fail: bool) {
        write(&self.state).release_faults.set_reject(fail);
    }

    /// Returns the number of active reservations.
    pub fn reservation_count(&self) -> usize {
        read(&self.state).reservations.len()
    }

    /// Returns true if a reservation exists with the given ID.
    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        read(&self.state).reservations.contains_key(reservation_id)
    }

    /// Number of reserve calls received, including failed ones.
    pub fn reserve_calls(&self) -> usize {
        read(&self.state).reserve_calls
    }

    /// Number of release calls received, including failed ones.
    pub fn release_calls(&self) -> usize {
        read(&self.state).release_calls
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(
        &self,
        reference: &str,
        items: Vec<ReservationItem>,
    ) -> Result<Reservation, InventoryError> {
        let (outcome, delay) = {
            let mut state = write(&self.state);
            state.reserve_calls += 1;
            (
                state.reserve_faults.next_outcome(),
                state.reserve_faults.delay(),
            )
        };
        apply_delay(delay).await;

        match outcome {
            FaultOutcome::Reject => {
                return Err(InventoryError::Refused("reservations suspended".to_string()));
            }
            FaultOutcome::Unavailable => {
                return Err(InventoryError::Unavailable(
                    "inventory backend timed out".to_string(),
                ));
            }
            FaultOutcome::Proceed => {}
        }

        if items.is_empty() {
            return Err(InventoryError::EmptyReservation);
        }

        let mut state = write(&self.state);

        if let Some(existing) = state
            .by_reference
            .get(reference)
            .and_then(|id| state.reservations.get(id))
        {
            tracing::debug!(reference, reservation_id = %existing.reservation_id, "Reservation already exists");
            return Ok(existing.clone());
        }

        for item in &items {
            if let Some(&available) = state.stock.get(&item.sku)
                && available < item.quantity
            {
                return Err(InventoryError::InsufficientStock {
                    sku: item.sku.clone(),
                    requested: item.quantity,
                    available,
                });
            }
        }
        for item in &items {
            if let Some(available) = state.stock.get_mut(&item.sku) {
                *available -= item.quantity;
            }
        }

        state.next_id += 1;
        let reservation = Reservation {
            reservation_id: format!("RES-{:04}", state.next_id),
            reference: reference.to_string(),
            items,
        };
        state
            .by_reference
            .insert(reference.to_string(), reservation.reservation_id.clone());
        state
            .reservations
            .insert(reservation.reservation_id.clone(), reservation.clone());

        Ok(reservation)
    }

    async fn release(&self, reference: &str, reservation_id: &str) -> Result<(), InventoryError> {
        let (outcome, delay) = {
            let mut state = write(&self.state);
            state.release_calls += 1;
            (
                state.release_faults.next_outcome(),
                state.release_faults.delay(),
            )
        };
        apply_delay(delay).await;

        match outcome {
            FaultOutcome::Reject => {
                return Err(InventoryError::Refused(format!(
                    "cannot release {reservation_id}"
                )));
            }
            FaultOutcome::Unavailable => {
                return Err(InventoryError::Unavailable(
                    "inventory backend timed out".to_string(),
                ));
            }
            FaultOutcome::Proceed => {}
        }

        let mut state = write(&self.state);
        if let Some(existing) = state.reservations.get(reservation_id)
            && existing.reference != reference
        {
            return Err(InventoryError::ForeignReservation(reservation_id.to_string()));
        }
        if let Some(reservation) = state.reservations.remove(reservation_id) {
            for item in &reservation.items {
                if let Some(available) = state.stock.get_mut(&item.sku) {
                    *available += item.quantity;
                }
            }
            state.by_reference.remove(&reservation.reference);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widgets(quantity: u32) -> Vec<ReservationItem> {
        vec![ReservationItem::new("SKU-001", quantity)]
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let service = InMemoryInventoryService::new();

        let result = service.reserve("order-1", widgets(2)).await.unwrap();
        assert!(result.reservation_id.starts_with("RES-"));
        assert_eq!(service.reservation_count(), 1);
        assert!(service.has_reservation(&result.reservation_id));

        service.release("order-1", &result.reservation_id).await.unwrap();
        assert_eq!(service.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_reserve_is_idempotent_per_reference() {
        let service = InMemoryInventoryService::new();
        service.set_stock("SKU-001", 5);

        let first = service.reserve("order-1", widgets(2)).await.unwrap();
        let second = service.reserve("order-1", widgets(2)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(service.reservation_count(), 1);
        assert_eq!(service.stock("SKU-001"), Some(3));
        assert_eq!(service.reserve_calls(), 2);
    }

    #[tokio::test]
    async fn test_release_twice_returns_stock_once() {
        let service = InMemoryInventoryService::new();
        service.set_stock("SKU-001", 5);

        let reservation = service.reserve("order-1", widgets(4)).await.unwrap();
        service.release("order-1", &reservation.reservation_id).await.unwrap();
        service.release("order-1", &reservation.reservation_id).await.unwrap();

        assert_eq!(service.stock("SKU-001"), Some(5));
        assert_eq!(service.release_calls(), 2);
    }

    #[tokio::test]
    async fn test_release_under_other_reference_is_refused() {
        let service = InMemoryInventoryService::new();
        service.set_stock("SKU-001", 5);

        let reservation = service.reserve("order-1", widgets(2)).await.unwrap();
        let result = service.release("order-2", &reservation.reservation_id).await;

        assert_eq!(
            result,
            Err(InventoryError::ForeignReservation(reservation.reservation_id.clone()))
        );
        assert!(service.has_reservation(&reservation.reservation_id));
        assert_eq!(service.stock("SKU-001"), Some(3));
    }

    #[tokio::test]
    async fn test_insufficient_stock() {
        let service = InMemoryInventoryService::new();
        service.set_stock("SKU-001", 1);

        let result = service.reserve("order-1", widgets(2)).await;
        assert_eq!(
            result,
            Err(InventoryError::InsufficientStock {
                sku: "SKU-001".to_string(),
                requested: 2,
                available: 1,
            })
        );
        assert_eq!(service.stock("SKU-001"), Some(1));
    }

    #[tokio::test]
    async fn test_fail_on_reserve() {
        let service = InMemoryInventoryService::new();
        service.set_fail_on_reserve(true);

        let result = service.reserve("order-1", widgets(2)).await;
        assert!(matches!(result, Err(InventoryError::Refused(_))));
        assert!(!result.unwrap_err().is_transient());
        assert_eq!(service.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let service = InMemoryInventoryService::new();
        service.set_unavailable_on_reserve(1);

        let first = service.reserve("order-1", widgets(1)).await;
        assert!(first.unwrap_err().is_transient());

        let second = service.reserve("order-1", widgets(1)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_empty_reservation_rejected() {
        let service = InMemoryInventoryService::new();
        let result = service.reserve("order-1", vec![]).await;
        assert_eq!(result, Err(InventoryError::EmptyReservation));
    }

    #[tokio::test]
    async fn test_sequential_reservation_ids() {
        let service = InMemoryInventoryService::new();

        let r1 = service.reserve("order-1", widgets(1)).await.unwrap();
        let r2 = service.reserve("order-2", widgets(1)).await.unwrap();

        assert_eq!(r1.reservation_id, "RES-0001");
        assert_eq!(r2.reservation_id, "RES-0002");
    }
}
