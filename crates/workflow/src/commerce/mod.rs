//! Commerce wiring: the reference modules, their adapters and the
//! workflows that orchestrate them.

pub mod adapters;
pub mod workflows;

use std::sync::Arc;

use modules::{FulfillmentService, InventoryService, NotificationService, PaymentService};
use transaction_log::TransactionLog;

pub use adapters::{
    CapturePayment, CapturePaymentInput, CreateCarrierLabel, CreateCarrierLabelInput,
    NotifyCustomer, ReserveInventory, ReserveInventoryInput,
};
pub use workflows::{
    CAPTURE_PAYMENT, CREATE_CARRIER_LABEL, CREATE_SHIPMENT_WORKFLOW, FULFILL_ORDER_WORKFLOW,
    NOTIFY_CUSTOMER, RESERVE_INVENTORY, create_shipment_steps, fulfill_order_steps,
};

use crate::config::EngineConfig;
use crate::definition::WorkflowCatalog;
use crate::engine::ExecutionEngine;
use crate::error::Result;
use crate::registry::StepRegistry;

/// The module services the commerce steps call.
#[derive(Debug, Clone)]
pub struct CommerceModules<I, F, N, P> {
    pub inventory: I,
    pub fulfillment: F,
    pub notification: N,
    pub payment: P,
}

/// Registers `reserveInventory`, `createCarrierLabel`, `notifyCustomer` and
/// `capturePayment`.
pub fn register_commerce_steps<I, F, N, P>(
    registry: &StepRegistry,
    modules: CommerceModules<I, F, N, P>,
) -> Result<()>
where
    I: InventoryService + 'static,
    F: FulfillmentService + 'static,
    N: NotificationService + 'static,
    P: PaymentService + 'static,
{
    registry.register_adapter(RESERVE_INVENTORY, ReserveInventory::new(modules.inventory))?;
    registry.register_adapter(
        CREATE_CARRIER_LABEL,
        CreateCarrierLabel::new(modules.fulfillment),
    )?;
    registry.register_invoke_only(NOTIFY_CUSTOMER, NotifyCustomer::new(modules.notification))?;
    registry.register_adapter(CAPTURE_PAYMENT, CapturePayment::new(modules.payment))?;
    Ok(())
}

/// Defines `createShipmentWorkflow` and `fulfillOrderWorkflow`.
pub fn define_commerce_workflows(catalog: &WorkflowCatalog) -> Result<()> {
    catalog.define(CREATE_SHIPMENT_WORKFLOW, create_shipment_steps())?;
    catalog.define(FULFILL_ORDER_WORKFLOW, fulfill_order_steps())?;
    Ok(())
}

/// Builds an engine with the commerce steps registered (registry sealed)
/// and the commerce workflows defined.
pub fn commerce_engine<L, I, F, N, P>(
    log: Arc<L>,
    modules: CommerceModules<I, F, N, P>,
    config: EngineConfig,
) -> Result<ExecutionEngine<L>>
where
    L: TransactionLog + ?Sized + 'static,
    I: InventoryService + 'static,
    F: FulfillmentService + 'static,
    N: NotificationService + 'static,
    P: PaymentService + 'static,
{
    let registry = Arc::new(StepRegistry::new());
    register_commerce_steps(&registry, modules)?;
    registry.seal();

    let catalog = Arc::new(WorkflowCatalog::new(registry));
    define_commerce_workflows(&catalog)?;

    Ok(ExecutionEngine::new(log, catalog, config))
}
