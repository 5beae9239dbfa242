//! Commerce workflow definitions.

use serde_json::json;

use crate::definition::StepSpec;
use crate::mapping::InputMapping;

pub const CREATE_SHIPMENT_WORKFLOW: &str = "createShipmentWorkflow";
pub const FULFILL_ORDER_WORKFLOW: &str = "fulfillOrderWorkflow";

pub const RESERVE_INVENTORY: &str = "reserveInventory";
pub const CREATE_CARRIER_LABEL: &str = "createCarrierLabel";
pub const NOTIFY_CUSTOMER: &str = "notifyCustomer";
pub const CAPTURE_PAYMENT: &str = "capturePayment";

fn reserve_inventory() -> StepSpec {
    StepSpec::new(RESERVE_INVENTORY)
        .input(InputMapping::object([("items", InputMapping::path("input.items"))]))
        .bind("reservation")
}

fn create_carrier_label() -> StepSpec {
    StepSpec::new(CREATE_CARRIER_LABEL)
        .input(InputMapping::object([
            ("fulfillment_id", InputMapping::path("input.fulfillment_id")),
            ("labels", InputMapping::path("input.labels")),
        ]))
        .bind("shipment")
}

fn notify_customer() -> StepSpec {
    StepSpec::new(NOTIFY_CUSTOMER)
        .input(InputMapping::object([
            ("recipient", InputMapping::path("input.customer.email")),
            ("template", InputMapping::literal(json!("shipment_created"))),
            (
                "data",
                InputMapping::object([
                    ("fulfillment_id", InputMapping::path("input.fulfillment_id")),
                    ("shipment_id", InputMapping::path("shipment.shipment_id")),
                    ("labels", InputMapping::path("shipment.labels")),
                    ("reservation_id", InputMapping::path("reservation.reservation_id")),
                ]),
            ),
        ]))
        .bind("notification")
}

fn capture_payment() -> StepSpec {
    StepSpec::new(CAPTURE_PAYMENT)
        .input(InputMapping::object([
            ("amount", InputMapping::path("input.payment.amount")),
            ("currency", InputMapping::path("input.payment.currency")),
        ]))
        .bind("payment")
}

/// Ships a fulfillment with carrier labels.
///
/// Input:
/// ```json
/// {
///   "fulfillment_id": "ful_01",
///   "items": [{"sku": "SKU-001", "quantity": 2}],
///   "labels": [{"tracking_number": "1Z..", "tracking_url": "https://..", "label_url": "https://.."}],
///   "customer": {"email": "buyer@example.com"}
/// }
/// ```
///
/// Output bindings: `reservation`, `shipment`, `notification`.
pub fn create_shipment_steps() -> Vec<StepSpec> {
    vec![reserve_inventory(), create_carrier_label(), notify_customer()]
}

/// Reserves stock, captures payment, ships and notifies.
///
/// Same input as [`create_shipment_steps`] plus
/// `"payment": {"amount": 4999, "currency": "USD"}`.
pub fn fulfill_order_steps() -> Vec<StepSpec> {
    vec![
        reserve_inventory(),
        capture_payment(),
        create_carrier_label(),
        notify_customer(),
    ]
}
