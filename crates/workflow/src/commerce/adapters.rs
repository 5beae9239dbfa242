//! Adapters wiring the reference commerce modules into the engine.
//!
//! Each adapter passes [`StepContext::module_reference`] to its module as the
//! deduplication reference, so repeated calls of one instance have no extra
//! effect and a compensation only undoes what its own instance created.

use async_trait::async_trait;
use modules::{
    FulfillmentError, FulfillmentService, InventoryError, InventoryService, Notification,
    NotificationError, NotificationRequest, NotificationService, Payment, PaymentError,
    PaymentService, Reservation, ReservationItem, Shipment, ShipmentLabel,
};
use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterError, CompensatingAdapter, ModuleAdapter, StepContext};

impl From<InventoryError> for AdapterError {
    fn from(e: InventoryError) -> Self {
        if e.is_transient() {
            AdapterError::unavailable(e)
        } else {
            AdapterError::rejected(e)
        }
    }
}

impl From<FulfillmentError> for AdapterError {
    fn from(e: FulfillmentError) -> Self {
        if e.is_transient() {
            AdapterError::unavailable(e)
        } else {
            AdapterError::rejected(e)
        }
    }
}

impl From<NotificationError> for AdapterError {
    fn from(e: NotificationError) -> Self {
        if e.is_transient() {
            AdapterError::unavailable(e)
        } else {
            AdapterError::rejected(e)
        }
    }
}

impl From<PaymentError> for AdapterError {
    fn from(e: PaymentError) -> Self {
        if e.is_transient() {
            AdapterError::unavailable(e)
        } else {
            AdapterError::rejected(e)
        }
    }
}

/// Input of the reserve-inventory step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveInventoryInput {
    pub items: Vec<ReservationItem>,
}

/// Reserves stock; compensated by releasing the reservation.
pub struct ReserveInventory<I> {
    inventory: I,
}

impl<I> ReserveInventory<I> {
    pub fn new(inventory: I) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl<I> ModuleAdapter for ReserveInventory<I>
where
    I: InventoryService + 'static,
{
    type Input = ReserveInventoryInput;
    type Output = Reservation;

    async fn invoke(
        &self,
        ctx: &StepContext,
        input: ReserveInventoryInput,
    ) -> Result<Reservation, AdapterError> {
        Ok(self
            .inventory
            .reserve(&ctx.module_reference(), input.items)
            .await?)
    }
}

#[async_trait]
impl<I> CompensatingAdapter for ReserveInventory<I>
where
    I: InventoryService + 'static,
{
    async fn compensate(&self, ctx: &StepContext, output: Reservation) -> Result<(), AdapterError> {
        Ok(self
            .inventory
            .release(&ctx.module_reference(), &output.reservation_id)
            .await?)
    }
}

/// Input of the create-carrier-label step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCarrierLabelInput {
    pub fulfillment_id: String,
    pub labels: Vec<ShipmentLabel>,
}

/// Ships a fulfillment with carrier labels; compensated by canceling the shipment.
pub struct CreateCarrierLabel<F> {
    fulfillment: F,
}

impl<F> CreateCarrierLabel<F> {
    pub fn new(fulfillment: F) -> Self {
        Self { fulfillment }
    }
}

#[async_trait]
impl<F> ModuleAdapter for CreateCarrierLabel<F>
where
    F: FulfillmentService + 'static,
{
    type Input = CreateCarrierLabelInput;
    type Output = Shipment;

    async fn invoke(
        &self,
        ctx: &StepContext,
        input: CreateCarrierLabelInput,
    ) -> Result<Shipment, AdapterError> {
        Ok(self
            .fulfillment
            .create_shipment(&ctx.module_reference(), &input.fulfillment_id, input.labels)
            .await?)
    }
}

#[async_trait]
impl<F> CompensatingAdapter for CreateCarrierLabel<F>
where
    F: FulfillmentService + 'static,
{
    async fn compensate(&self, ctx: &StepContext, output: Shipment) -> Result<(), AdapterError> {
        Ok(self
            .fulfillment
            .cancel_shipment(&ctx.module_reference(), &output.shipment_id)
            .await?)
    }
}

/// Sends a customer notification. Has no compensation.
pub struct NotifyCustomer<N> {
    notification: N,
}

impl<N> NotifyCustomer<N> {
    pub fn new(notification: N) -> Self {
        Self { notification }
    }
}

#[async_trait]
impl<N> ModuleAdapter for NotifyCustomer<N>
where
    N: NotificationService + 'static,
{
    type Input = NotificationRequest;
    type Output = Notification;

    async fn invoke(
        &self,
        ctx: &StepContext,
        input: NotificationRequest,
    ) -> Result<Notification, AdapterError> {
        Ok(self
            .notification
            .send(&ctx.module_reference(), input)
            .await?)
    }
}

/// Input of the capture-payment step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturePaymentInput {
    /// Amount in minor units.
    pub amount: i64,
    pub currency: String,
}

/// Captures a payment; compensated by a refund.
pub struct CapturePayment<P> {
    payment: P,
}

impl<P> CapturePayment<P> {
    pub fn new(payment: P) -> Self {
        Self { payment }
    }
}

#[async_trait]
impl<P> ModuleAdapter for CapturePayment<P>
where
    P: PaymentService + 'static,
{
    type Input = CapturePaymentInput;
    type Output = Payment;

    async fn invoke(
        &self,
        ctx: &StepContext,
        input: CapturePaymentInput,
    ) -> Result<Payment, AdapterError> {
        Ok(self
            .payment
            .capture(&ctx.module_reference(), input.amount, &input.currency)
            .await?)
    }
}

#[async_trait]
impl<P> CompensatingAdapter for CapturePayment<P>
where
    P: PaymentService + 'static,
{
    async fn compensate(&self, ctx: &StepContext, output: Payment) -> Result<(), AdapterError> {
        Ok(self
            .payment
            .refund(&ctx.module_reference(), &output.payment_id)
            .await?)
    }
}
