//! Ticket delivery contract.
//!
//! When a ticket is confirmed the binder emits a [`TicketConfirmed`] record. Rendering
//! the QR code and emailing it happen outside this workspace; this module only defines
//! the payload and the hand-off trait.

use crate::types::{PaymentId, Ticket, TicketId, TicketNumber};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Emitted once per ticket, by the call that moved it to Confirmed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketConfirmed {
    /// Confirmed ticket
    pub ticket_id: TicketId,
    /// Printed ticket number
    pub ticket_number: TicketNumber,
    /// JSON document encoded into the QR code
    pub qr_payload: String,
}

#[derive(Serialize)]
struct QrPayload<'a> {
    ticket_id: TicketId,
    ticket_number: &'a str,
    payment_id: PaymentId,
}

impl TicketConfirmed {
    /// Build the delivery record for a ticket.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the QR payload can't be encoded.
    pub fn for_ticket(ticket: &Ticket) -> Result<Self, serde_json::Error> {
        let qr_payload = serde_json::to_string(&QrPayload {
            ticket_id: ticket.id,
            ticket_number: ticket.ticket_number.as_str(),
            payment_id: ticket.payment_id,
        })?;
        Ok(Self {
            ticket_id: ticket.id,
            ticket_number: ticket.ticket_number.clone(),
            qr_payload,
        })
    }
}

/// Delivery failed. Confirmation is never undone because of it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Ticket delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Hands confirmed tickets to the notification side (email, QR rendering).
pub trait TicketDelivery: Send + Sync {
    /// Deliver one confirmation record.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the record couldn't be handed off.
    fn deliver(
        &self,
        confirmed: TicketConfirmed,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>>;
}

/// Delivery that only logs. Used when no notifier is wired.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogDelivery;

impl TicketDelivery for LogDelivery {
    fn deliver(
        &self,
        confirmed: TicketConfirmed,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(
                ticket_id = %confirmed.ticket_id,
                ticket_number = %confirmed.ticket_number,
                "Ticket confirmed"
            );
            Ok(())
        })
    }
}
