//! Error types for the reservation engine and the payment binder.

use seatkeeper_core::store::{SlotRefusal, StoreError};
use seatkeeper_core::transition::Refusal;
use seatkeeper_core::types::{
    HoldId, Money, PaymentId, PaymentStatus, TicketId, TicketStatus, TicketTypeId, UnitId,
};
use std::fmt;
use thiserror::Error;

/// Errors from [`crate::engine::ReservationEngine`].
///
/// Per-unit conflicts are not errors; they come back inside
/// [`crate::engine::ReserveOutcome`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Hold duration must be positive.
    #[error("Invalid hold duration: {0:?}")]
    InvalidHoldDuration(std::time::Duration),

    /// Slot reservations need a positive quantity.
    #[error("Requested quantity must be greater than zero")]
    ZeroQuantity,

    /// No such ticket type.
    #[error("Ticket type not found: {0}")]
    TicketTypeNotFound(TicketTypeId),

    /// The pool had nothing left to grant.
    #[error("Insufficient inventory: requested {requested}, available {available}")]
    InsufficientInventory {
        /// Slots requested
        requested: u32,
        /// Slots available at the time of the request
        available: u32,
    },

    /// No such slot hold, or it belongs to someone else.
    #[error("Slot hold not found: {0}")]
    HoldNotFound(HoldId),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What went wrong when consuming the inventory bound to one ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    /// The seat wasn't Reserved by the attendee with a live hold.
    Seat {
        /// The seat
        unit_id: UnitId,
        /// Why the state machine refused
        refusal: Refusal,
    },
    /// The slot hold couldn't be committed.
    Slot {
        /// The slot hold
        hold_id: HoldId,
        /// Why the store refused
        refusal: SlotRefusal,
    },
}

/// A ticket whose inventory couldn't be consumed at confirm time.
///
/// Needs manual reconciliation: the payment was captured but the hold is gone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsistencyViolation {
    /// Affected ticket
    pub ticket_id: TicketId,
    /// Payment the ticket belongs to
    pub payment_id: PaymentId,
    /// What was found
    pub kind: ViolationKind,
}

impl fmt::Display for ConsistencyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::Seat { unit_id, refusal } => write!(
                f,
                "ticket {} (payment {}): seat {unit_id} {refusal}",
                self.ticket_id, self.payment_id
            ),
            ViolationKind::Slot { hold_id, refusal } => write!(
                f,
                "ticket {} (payment {}): slot hold {hold_id}: {refusal}",
                self.ticket_id, self.payment_id
            ),
        }
    }
}

/// Errors from [`crate::binder::PaymentBinder`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BinderError {
    /// No such payment.
    #[error("Payment not found: {0}")]
    PaymentNotFound(PaymentId),

    /// No such ticket.
    #[error("Ticket not found: {0}")]
    TicketNotFound(TicketId),

    /// No payment carries this gateway order id.
    #[error("No payment for external order: {0}")]
    ExternalOrderNotFound(String),

    /// The payment already reached a different outcome.
    #[error("Payment {payment_id} is {current}, cannot mark it {requested}")]
    ConflictingOutcome {
        /// Payment
        payment_id: PaymentId,
        /// Status the payment is in
        current: PaymentStatus,
        /// Status that was requested
        requested: PaymentStatus,
    },

    /// The gateway reported a different amount than the payment's.
    #[error("Amount mismatch for payment {payment_id}: expected {expected}, got {received}")]
    AmountMismatch {
        /// Payment
        payment_id: PaymentId,
        /// Amount on the payment
        expected: Money,
        /// Amount the gateway reported
        received: Money,
    },

    /// Checkout item isn't held by the payer.
    #[error("Not held by payer: {0}")]
    HoldNotHeld(String),

    /// Checkout item is already bound to another Pending payment.
    #[error("Already in a pending checkout: {0}")]
    HoldInCheckout(String),

    /// Checkout with nothing in it.
    #[error("Checkout must contain at least one item")]
    EmptyCheckout,

    /// Checkout total doesn't fit.
    #[error("Checkout amount overflow")]
    AmountOverflow,

    /// The requester doesn't own the ticket.
    #[error("Ticket {0} does not belong to the requester")]
    NotTicketHolder(TicketId),

    /// The ticket isn't in a status that allows the operation.
    #[error("Ticket {ticket_id} is {status}")]
    InvalidTicketState {
        /// Ticket
        ticket_id: TicketId,
        /// Its current status
        status: TicketStatus,
    },

    /// One or more tickets couldn't consume their inventory.
    #[error("Consistency violation on {} ticket(s): {}", .0.len(), summarize(.0))]
    ConsistencyViolation(Vec<ConsistencyViolation>),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn summarize(violations: &[ConsistencyViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
