//! Gateway callback handling.
//!
//! Payment gateways deliver outcomes at least once and in any order. A callback is
//! resolved to a payment, checked against its amount, then handed to the binder's
//! confirm or fail path, both of which are safe to replay.

use crate::binder::{ConfirmReceipt, PaymentBinder, PaymentReceipt};
use crate::error::BinderError;
use seatkeeper_core::types::{Money, Payment, PaymentId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How a callback identifies its payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentRef {
    /// Our own payment id
    Id(PaymentId),
    /// The gateway's order id, recorded with [`PaymentBinder::attach_external_order`]
    ExternalOrder(String),
}

/// What the gateway says happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayOutcome {
    /// Funds captured
    Success,
    /// Declined, cancelled or timed out at the gateway
    Failure,
}

/// A payment outcome reported by a gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCallback {
    /// Which payment
    pub payment: PaymentRef,
    /// What happened
    pub outcome: GatewayOutcome,
    /// Amount the gateway reports
    pub amount: Money,
    /// Gateway receipt reference, if any
    pub external_receipt_id: Option<String>,
}

/// What a callback did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackResult {
    /// The payment was confirmed (or the confirmation replayed)
    Confirmed(ConfirmReceipt),
    /// The payment was failed (or the failure replayed)
    Failed(PaymentReceipt),
}

impl PaymentBinder {
    /// Apply a gateway callback.
    ///
    /// A success whose amount differs from the payment's changes nothing.
    ///
    /// # Errors
    ///
    /// - `PaymentNotFound` / `ExternalOrderNotFound` if the payment can't be resolved
    /// - `AmountMismatch` on a success with the wrong amount
    /// - `ConflictingOutcome` if the payment already reached the other outcome
    /// - `ConsistencyViolation` if a captured payment has tickets whose inventory was
    ///   gone; the payment stays Completed and every other ticket is confirmed
    pub async fn handle_gateway_callback(
        &self,
        callback: GatewayCallback,
    ) -> Result<CallbackResult, BinderError> {
        let payment = self.resolve(&callback.payment).await?;

        match callback.outcome {
            GatewayOutcome::Success => {
                if callback.amount != payment.amount {
                    warn!(
                        payment_id = %payment.id,
                        expected = %payment.amount,
                        received = %callback.amount,
                        "Gateway amount does not match payment"
                    );
                    return Err(BinderError::AmountMismatch {
                        payment_id: payment.id,
                        expected: payment.amount,
                        received: callback.amount,
                    });
                }
                info!(payment_id = %payment.id, "Gateway reported success");
                let receipt = self
                    .confirm_with_receipt(payment.id, callback.external_receipt_id)
                    .await?
                    .into_result()?;
                Ok(CallbackResult::Confirmed(receipt))
            }
            GatewayOutcome::Failure => {
                info!(payment_id = %payment.id, "Gateway reported failure");
                let receipt = self
                    .fail_with_receipt(payment.id, callback.external_receipt_id)
                    .await?;
                Ok(CallbackResult::Failed(receipt))
            }
        }
    }

    async fn resolve(&self, reference: &PaymentRef) -> Result<Payment, BinderError> {
        match reference {
            PaymentRef::Id(id) => self
                .store()
                .load_payment(*id)
                .await?
                .ok_or(BinderError::PaymentNotFound(*id)),
            PaymentRef::ExternalOrder(order) => self
                .store()
                .find_payment_by_external_order(order)
                .await?
                .ok_or_else(|| BinderError::ExternalOrderNotFound(order.clone())),
        }
    }
}
