//! Fulfillment module: fulfillments and their shipments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fault::{FaultOutcome, FaultPlan, apply_delay};
use crate::lock::{read, write};

/// Errors returned by the fulfillment module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FulfillmentError {
    #[error("Fulfillment not found: {0}")]
    NotFound(String),

    #[error("Fulfillment {0} is already shipped")]
    AlreadyShipped(String),

    #[error("Fulfillment {0} is canceled")]
    Canceled(String),

    #[error("Shipment requires at least one label")]
    MissingLabels,

    #[error("Shipment {0} belongs to another reference")]
    ForeignShipment(String),

    #[error("Carrier refused the shipment: {0}")]
    CarrierRefused(String),

    #[error("Fulfillment service unavailable: {0}")]
    Unavailable(String),
}

impl FulfillmentError {
    /// Returns true if the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, FulfillmentError::Unavailable(_))
    }
}

/// The state of a fulfillment.
///
/// State transitions:
/// ```text
/// Open ──┬──► Shipped ──► Open (shipment canceled)
///        └──► Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    /// Items are packed and waiting for a shipment.
    #[default]
    Open,

    /// A shipment with carrier labels exists.
    Shipped,

    /// The fulfillment was canceled (terminal state).
    Canceled,
}

impl FulfillmentStatus {
    /// Returns true if a shipment can be created in this state.
    pub fn can_ship(&self) -> bool {
        matches!(self, FulfillmentStatus::Open)
    }

    /// Returns true if the fulfillment can be canceled in this state.
    pub fn can_cancel(&self) -> bool {
        matches!(self, FulfillmentStatus::Open)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FulfillmentStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentStatus::Open => "open",
            FulfillmentStatus::Shipped => "shipped",
            FulfillmentStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for FulfillmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A carrier label attached to a shipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentLabel {
    pub tracking_number: String,
    pub tracking_url: String,
    pub label_url: String,
}

impl ShipmentLabel {
    pub fn new(
        tracking_number: impl Into<String>,
        tracking_url: impl Into<String>,
        label_url: impl Into<String>,
    ) -> Self {
        Self {
            tracking_number: tracking_number.into(),
            tracking_url: tracking_url.into(),
            label_url: label_url.into(),
        }
    }
}

/// A shipment created for a fulfillment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    pub shipment_id: String,
    /// Caller reference the shipment is deduplicated on.
    pub reference: String,
    pub fulfillment_id: String,
    pub labels: Vec<ShipmentLabel>,
    pub shipped_at: DateTime<Utc>,
}

/// A fulfillment as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub fulfillment_id: String,
    pub status: FulfillmentStatus,
    /// The active shipment, if shipped.
    pub shipment: Option<Shipment>,
}

/// Trait for fulfillment operations.
#[async_trait]
pub trait FulfillmentService: Send + Sync {
    /// Returns a fulfillment by ID.
    async fn get_fulfillment(
        &self,
        fulfillment_id: &str,
    ) -> Result<Option<Fulfillment>, FulfillmentError>;

    /// Creates the shipment of an open fulfillment under `reference`.
    ///
    /// Repeating the request with the same reference and labels returns the
    /// existing shipment. A fulfillment shipped under another reference or
    /// with different labels, or a canceled one, is refused.
    async fn create_shipment(
        &self,
        reference: &str,
        fulfillment_id: &str,
        labels: Vec<ShipmentLabel>,
    ) -> Result<Shipment, FulfillmentError>;

    /// Cancels a shipment created under `reference` and reopens its
    /// fulfillment. Canceling an unknown or already canceled shipment
    /// succeeds; a shipment created under another reference is refused.
    async fn cancel_shipment(
        &self,
        reference: &str,
        shipment_id: &str,
    ) -> Result<(), FulfillmentError>;

    /// Cancels an open fulfillment.
    async fn cancel_fulfillment(&self, fulfillment_id: &str) -> Result<(), FulfillmentError>;
}

#[derive(Debug, Default)]
struct InMemoryFulfillmentState {
    fulfillments: HashMap<String, Fulfillment>,
    /// shipment_id -> fulfillment_id of active shipments.
    shipments: HashMap<String, String>,
    next_id: u32,
    create_shipment_calls: usize,
    cancel_shipment_calls: usize,
    create_faults: FaultPlan,
    cancel_faults: FaultPlan,
}

/// In-memory fulfillment service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFulfillmentService {
    state: Arc<RwLock<InMemoryFulfillmentState>>,
}

impl InMemoryFulfillmentService {
    /// Creates a new in-memory fulfillment service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an open fulfillment.
    pub fn add_fulfillment(&self, fulfillment_id: impl Into<String>) {
        let fulfillment_id = fulfillment_id.into();
        write(&self.state).fulfillments.insert(
            fulfillment_id.clone(),
            Fulfillment {
                fulfillment_id,
                status: FulfillmentStatus::Open,
                shipment: None,
            },
        );
    }

    /// Returns the status of a fulfillment.
    pub fn status(&self, fulfillment_id: &str) -> Option<FulfillmentStatus> {
        read(&self.state)
            .fulfillments
            .get(fulfillment_id)
            .map(|f| f.status)
    }

    /// Configures the carrier to refuse shipments.
    pub fn set_fail_on_create_shipment(&self, fail: bool) {
        write(&self.state).create_faults.set_reject(fail);
    }

    /// Makes the next `times` create_shipment calls fail with a transient error.
    pub fn set_unavailable_on_create_shipment(&self, times: u32) {
        write(&self.state).create_faults.set_unavailable(times);
    }

    /// Delays every create_shipment call.
    pub fn set_create_shipment_delay(&self, delay: Option<Duration>) {
        write(&self.state).create_faults.set_delay(delay);
    }

    /// Configures the service to fail cancel_shipment calls.
    pub fn set_fail_on_cancel_shipment(&self, fail: bool) {
        write(&self.state).cancel_faults.set_reject(fail);
    }

    /// Returns the number of active shipments.
    pub fn shipment_count(&self) -> usize {
        read(&self.state).shipments.len()
    }

    /// Returns true if an active shipment exists with the given ID.
    pub fn has_shipment(&self, shipment_id: &str) -> bool {
        read(&self.state).shipments.contains_key(shipment_id)
    }

    /// Number of create_shipment calls received, including failed ones.
    pub fn create_shipment_calls(&self) -> usize {
        read(&self.state).create_shipment_calls
    }

    /// Number of cancel_shipment calls received, including failed ones.
    pub fn cancel_shipment_calls(&self) -> usize {
        read(&self.state).cancel_shipment_calls
    }
}

#[async_trait]
impl FulfillmentService for InMemoryFulfillmentService {
    async fn get_fulfillment(
        &self,
        fulfillment_id: &str,
    ) -> Result<Option<Fulfillment>, FulfillmentError> {
        Ok(read(&self.state).fulfillments.get(fulfillment_id).cloned())
    }

    async fn create_shipment(
        &self,
        reference: &str,
        fulfillment_id: &str,
        labels: Vec<ShipmentLabel>,
    ) -> Result<Shipment, FulfillmentError> {
        let (outcome, delay) = {
            let mut state = write(&self.state);
            state.create_shipment_calls += 1;
            (
                state.create_faults.next_outcome(),
                state.create_faults.delay(),
            )
        };
        apply_delay(delay).await;

        match outcome {
            FaultOutcome::Reject => {
                return Err(FulfillmentError::CarrierRefused(
                    "no carrier service for destination".to_string(),
                ));
            }
            FaultOutcome::Unavailable => {
                return Err(FulfillmentError::Unavailable(
                    "carrier API timed out".to_string(),
                ));
            }
            FaultOutcome::Proceed => {}
        }

        if labels.is_empty() {
            return Err(FulfillmentError::MissingLabels);
        }

        let mut guard = write(&self.state);
        let state = &mut *guard;

        let fulfillment = state
            .fulfillments
            .get_mut(fulfillment_id)
            .ok_or_else(|| FulfillmentError::NotFound(fulfillment_id.to_string()))?;

        match fulfillment.status {
            FulfillmentStatus::Canceled => {
                return Err(FulfillmentError::Canceled(fulfillment_id.to_string()));
            }
            FulfillmentStatus::Shipped => {
                return match &fulfillment.shipment {
                    Some(shipment)
                        if shipment.reference == reference && shipment.labels == labels =>
                    {
                        tracing::debug!(fulfillment_id, shipment_id = %shipment.shipment_id, "Shipment already exists");
                        Ok(shipment.clone())
                    }
                    _ => Err(FulfillmentError::AlreadyShipped(fulfillment_id.to_string())),
                };
            }
            FulfillmentStatus::Open => {}
        }

        state.next_id += 1;
        let shipment = Shipment {
            shipment_id: format!("SHIP-{:04}", state.next_id),
            reference: reference.to_string(),
            fulfillment_id: fulfillment_id.to_string(),
            labels,
            shipped_at: Utc::now(),
        };
        fulfillment.status = FulfillmentStatus::Shipped;
        fulfillment.shipment = Some(shipment.clone());
        state
            .shipments
            .insert(shipment.shipment_id.clone(), fulfillment_id.to_string());

        Ok(shipment)
    }

    async fn cancel_shipment(
        &self,
        reference: &str,
        shipment_id: &str,
    ) -> Result<(), FulfillmentError> {
        let (outcome, delay) = {
            let mut state = write(&self.state);
            state.cancel_shipment_calls += 1;
            (
                state.cancel_faults.next_outcome(),
                state.cancel_faults.delay(),
            )
        };
        apply_delay(delay).await;

        match outcome {
            FaultOutcome::Reject => {
                return Err(FulfillmentError::CarrierRefused(format!(
                    "carrier will not void {shipment_id}"
                )));
            }
            FaultOutcome::Unavailable => {
                return Err(FulfillmentError::Unavailable(
                    "carrier API timed out".to_string(),
                ));
            }
            FaultOutcome::Proceed => {}
        }

        let mut guard = write(&self.state);
        let state = &mut *guard;
        let owner = state
            .shipments
            .get(shipment_id)
            .and_then(|fulfillment_id| state.fulfillments.get(fulfillment_id))
            .and_then(|f| f.shipment.as_ref())
            .map(|shipment| shipment.reference.as_str());
        if owner.is_some_and(|owner| owner != reference) {
            return Err(FulfillmentError::ForeignShipment(shipment_id.to_string()));
        }
        if let Some(fulfillment_id) = state.shipments.remove(shipment_id)
            && let Some(fulfillment) = state.fulfillments.get_mut(&fulfillment_id)
        {
            fulfillment.status = FulfillmentStatus::Open;
            fulfillment.shipment = None;
        }
        Ok(())
    }

    async fn cancel_fulfillment(&self, fulfillment_id: &str) -> Result<(), FulfillmentError> {
        let mut state = write(&self.state);
        let fulfillment = state
            .fulfillments
            .get_mut(fulfillment_id)
            .ok_or_else(|| FulfillmentError::NotFound(fulfillment_id.to_string()))?;

        match fulfillment.status {
            FulfillmentStatus::Canceled => Ok(()),
            FulfillmentStatus::Shipped => {
                Err(FulfillmentError::AlreadyShipped(fulfillment_id.to_string()))
            }
            FulfillmentStatus::Open => {
                fulfillment.status = FulfillmentStatus::Canceled;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(n: u32) -> ShipmentLabel {
        ShipmentLabel::new(
            format!("1Z{n:04}"),
            format!("https://track.example.com/1Z{n:04}"),
            format!("https://labels.example.com/1Z{n:04}.pdf"),
        )
    }

    #[test]
    fn test_status_rules() {
        assert!(FulfillmentStatus::Open.can_ship());
        assert!(!FulfillmentStatus::Shipped.can_ship());
        assert!(!FulfillmentStatus::Canceled.can_ship());
        assert!(FulfillmentStatus::Canceled.is_terminal());
        assert!(!FulfillmentStatus::Shipped.can_cancel());
        assert_eq!(FulfillmentStatus::Shipped.to_string(), "shipped");
    }

    #[tokio::test]
    async fn test_create_and_cancel_shipment() {
        let service = InMemoryFulfillmentService::new();
        service.add_fulfillment("ful_01");

        let shipment = service
            .create_shipment("req-1", "ful_01", vec![label(1)])
            .await
            .unwrap();
        assert_eq!(shipment.shipment_id, "SHIP-0001");
        assert_eq!(service.status("ful_01"), Some(FulfillmentStatus::Shipped));
        assert!(service.has_shipment(&shipment.shipment_id));

        service.cancel_shipment("req-1", &shipment.shipment_id).await.unwrap();
        assert_eq!(service.status("ful_01"), Some(FulfillmentStatus::Open));
        assert_eq!(service.shipment_count(), 0);

        let fulfillment = service.get_fulfillment("ful_01").await.unwrap().unwrap();
        assert!(fulfillment.shipment.is_none());
    }

    #[tokio::test]
    async fn test_identical_request_is_idempotent() {
        let service = InMemoryFulfillmentService::new();
        service.add_fulfillment("ful_01");

        let first = service
            .create_shipment("req-1", "ful_01", vec![label(1)])
            .await
            .unwrap();
        let second = service
            .create_shipment("req-1", "ful_01", vec![label(1)])
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(service.shipment_count(), 1);
    }

    #[tokio::test]
    async fn test_shipped_fulfillment_refuses_new_labels() {
        let service = InMemoryFulfillmentService::new();
        service.add_fulfillment("ful_01");
        service
            .create_shipment("req-1", "ful_01", vec![label(1)])
            .await
            .unwrap();

        let result = service.create_shipment("req-1", "ful_01", vec![label(2)]).await;
        assert_eq!(
            result,
            Err(FulfillmentError::AlreadyShipped("ful_01".to_string()))
        );
    }

    #[tokio::test]
    async fn test_shipment_is_owned_by_its_reference() {
        let service = InMemoryFulfillmentService::new();
        service.add_fulfillment("ful_01");
        let shipment = service
            .create_shipment("req-1", "ful_01", vec![label(1)])
            .await
            .unwrap();
        assert_eq!(shipment.reference, "req-1");

        let duplicate = service.create_shipment("req-2", "ful_01", vec![label(1)]).await;
        assert_eq!(
            duplicate,
            Err(FulfillmentError::AlreadyShipped("ful_01".to_string()))
        );

        let cancel = service.cancel_shipment("req-2", &shipment.shipment_id).await;
        assert_eq!(
            cancel,
            Err(FulfillmentError::ForeignShipment(shipment.shipment_id.clone()))
        );
        assert_eq!(service.status("ful_01"), Some(FulfillmentStatus::Shipped));
        assert!(service.has_shipment(&shipment.shipment_id));
    }

    #[tokio::test]
    async fn test_canceled_fulfillment_cannot_ship() {
        let service = InMemoryFulfillmentService::new();
        service.add_fulfillment("ful_01");
        service.cancel_fulfillment("ful_01").await.unwrap();

        let result = service.create_shipment("req-1", "ful_01", vec![label(1)]).await;
        assert_eq!(result, Err(FulfillmentError::Canceled("ful_01".to_string())));
        assert_eq!(service.shipment_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_fulfillment_and_missing_labels() {
        let service = InMemoryFulfillmentService::new();
        service.add_fulfillment("ful_01");

        let unknown = service.create_shipment("req-1", "ful_99", vec![label(1)]).await;
        assert_eq!(unknown, Err(FulfillmentError::NotFound("ful_99".to_string())));

        let empty = service.create_shipment("req-1", "ful_01", vec![]).await;
        assert_eq!(empty, Err(FulfillmentError::MissingLabels));
    }

    #[tokio::test]
    async fn test_carrier_failure_leaves_fulfillment_open() {
        let service = InMemoryFulfillmentService::new();
        service.add_fulfillment("ful_01");
        service.set_fail_on_create_shipment(true);

        let result = service.create_shipment("req-1", "ful_01", vec![label(1)]).await;
        assert!(matches!(result, Err(FulfillmentError::CarrierRefused(_))));
        assert_eq!(service.status("ful_01"), Some(FulfillmentStatus::Open));
        assert_eq!(service.create_shipment_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_shipment_succeeds() {
        let service = InMemoryFulfillmentService::new();
        service.cancel_shipment("req-1", "SHIP-9999").await.unwrap();
        assert_eq!(service.cancel_shipment_calls(), 1);
    }
}
