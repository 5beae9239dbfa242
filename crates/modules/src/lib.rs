//! Reference commerce modules: fulfillment, inventory, notification and payment.
//!
//! Each module owns its state and guards its side effects against double
//! application. Nothing here knows about workflows; the workflow crate wraps
//! these services in adapters.

pub mod fault;
mod lock;
pub mod fulfillment;
pub mod inventory;
pub mod notification;
pub mod payment;

pub use fault::FaultPlan;
pub use fulfillment::{
    Fulfillment, FulfillmentError, FulfillmentService, FulfillmentStatus,
    InMemoryFulfillmentService, Shipment, ShipmentLabel,
};
pub use inventory::{
    InMemoryInventoryService, InventoryError, InventoryService, Reservation, ReservationItem,
};
pub use notification::{
    InMemoryNotificationService, Notification, NotificationError, NotificationRequest,
    NotificationService,
};
pub use payment::{InMemoryPaymentService, Payment, PaymentError, PaymentService};
