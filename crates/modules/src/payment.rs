//! Payment module: captures and refunds.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fault::{FaultOutcome, FaultPlan, apply_delay};
use crate::lock::{read, write};

/// Errors returned by the payment module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Payment declined: {0}")]
    Declined(String),

    #[error("Payment {0} belongs to another reference")]
    ForeignPayment(String),

    #[error("Payment provider unavailable: {0}")]
    Unavailable(String),
}

impl PaymentError {
    /// Returns true if the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, PaymentError::Unavailable(_))
    }
}

/// A captured payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: String,
    pub reference: String,
    /// Amount in minor units (cents).
    pub amount: i64,
    pub currency: String,
    pub refunded: bool,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Captures `amount` once per `reference`.
    async fn capture(
        &self,
        reference: &str,
        amount: i64,
        currency: &str,
    ) -> Result<Payment, PaymentError>;

    /// Refunds a payment captured under `reference`. Refunding twice is a
    /// no-op; a payment captured under another reference is refused.
    async fn refund(&self, reference: &str, payment_id: &str) -> Result<(), PaymentError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, Payment>,
    by_reference: HashMap<String, String>,
    next_id: u32,
    capture_calls: usize,
    refund_calls: usize,
    capture_faults: FaultPlan,
    refund_faults: FaultPlan,
}

/// In-memory payment service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the provider to decline captures.
    pub fn set_fail_on_capture(&self, fail: bool) {
        write(&self.state).capture_faults.set_reject(fail);
    }

    /// Makes the next `times` capture calls fail with a transient error.
    pub fn set_unavailable_on_capture(&self, times: u32) {
        write(&self.state).capture_faults.set_unavailable(times);
    }

    /// Configures the provider to fail refunds.
    pub fn set_fail_on_refund(&self, fail: bool) {
        write(&self.state).refund_faults.set_reject(fail);
    }

    /// Returns the number of captured payments that were not refunded.
    pub fn captured_count(&self) -> usize {
        read(&self.state)
            .payments
            .values()
            .filter(|p| !p.refunded)
            .count()
    }

    /// Returns a payment by ID.
    pub fn payment(&self, payment_id: &str) -> Option<Payment> {
        read(&self.state).payments.get(payment_id).cloned()
    }

    pub fn capture_calls(&self) -> usize {
        read(&self.state).capture_calls
    }

    pub fn refund_calls(&self) -> usize {
        read(&self.state).refund_calls
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn capture(
        &self,
        reference: &str,
        amount: i64,
        currency: &str,
    ) -> Result<Payment, PaymentError> {
        let (outcome, delay) = {
            let mut state = write(&self.state);
            state.capture_calls += 1;
            (
                state.capture_faults.next_outcome(),
                state.capture_faults.delay(),
            )
        };
        apply_delay(delay).await;

        match outcome {
            FaultOutcome::Reject => {
                return Err(PaymentError::Declined("card declined".to_string()));
            }
            FaultOutcome::Unavailable => {
                return Err(PaymentError::Unavailable("gateway timeout".to_string()));
            }
            FaultOutcome::Proceed => {}
        }

        if amount <= 0 {
            return Err(PaymentError::InvalidAmount(amount));
        }

        let mut state = write(&self.state);
        if let Some(existing) = state
            .by_reference
            .get(reference)
            .and_then(|id| state.payments.get(id))
        {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let payment = Payment {
            payment_id: format!("PAY-{:04}", state.next_id),
            reference: reference.to_string(),
            amount,
            currency: currency.to_string(),
            refunded: false,
        };
        state
            .by_reference
            .insert(reference.to_string(), payment.payment_id.clone());
        state
            .payments
            .insert(payment.payment_id.clone(), payment.clone());

        Ok(payment)
    }

    async fn refund(&self, reference: &str, payment_id: &str) -> Result<(), PaymentError> {
        let (outcome, delay) = {
            let mut state = write(&self.state);
            state.refund_calls += 1;
            (
                state.refund_faults.next_outcome(),
                state.refund_faults.delay(),
            )
        };
        apply_delay(delay).await;

        match outcome {
            FaultOutcome::Reject => {
                return Err(PaymentError::Declined(format!(
                    "refund of {payment_id} refused"
                )));
            }
            FaultOutcome::Unavailable => {
                return Err(PaymentError::Unavailable("gateway timeout".to_string()));
            }
            FaultOutcome::Proceed => {}
        }

        match write(&self.state).payments.get_mut(payment_id) {
            Some(payment) if payment.reference != reference => {
                Err(PaymentError::ForeignPayment(payment_id.to_string()))
            }
            Some(payment) => {
                payment.refunded = true;
                Ok(())
            }
            None => Ok(()),
        }
    }
}
