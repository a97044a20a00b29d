//! Payment/Ticket Binder.
//!
//! Bridges payment outcomes to inventory finality:
//!
//! - **Checkout** turns live holds into a Pending payment with Pending tickets
//! - **Confirm** consumes each ticket's seat or slot, then moves the ticket to Confirmed
//! - **Fail** cancels Pending tickets and gives their holds back immediately
//! - **Refund** marks Confirmed tickets Refunded and returns pool slots; seats stay Sold.
//!   Tickets a confirmation left Pending are cancelled and anything they consumed is given back
//!
//! Every step is a compare-and-set in the store, so replaying an outcome (duplicate
//! gateway delivery) re-runs the same steps and changes nothing that already changed.
//! Tickets are fault-isolated: a ticket whose hold is gone is reported as a
//! [`ConsistencyViolation`] and left Pending while the others confirm.

use crate::error::{BinderError, ConsistencyViolation, ViolationKind};
use crate::metrics::{BinderMetrics, ReservationMetrics};
use chrono::{DateTime, Utc};
use seatkeeper_core::delivery::{TicketConfirmed, TicketDelivery};
use seatkeeper_core::environment::Clock;
use seatkeeper_core::numbering;
use seatkeeper_core::store::{InventoryStore, SlotCommit, StatusChange, StoreError, UnitTransition};
use seatkeeper_core::transition::{TransitionOutcome, UnitCommand};
use seatkeeper_core::types::{
    CustomerId, HoldId, Money, Payment, PaymentId, PaymentMethod, PaymentStatus, Ticket,
    TicketBinding, TicketId, TicketStatus, UnitId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Attempts at inserting a checkout before a ticket-number collision is given up on
const CHECKOUT_ATTEMPTS: usize = 3;

/// One thing being paid for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckoutItem {
    /// A seat the payer holds
    Seat(UnitId),
    /// Every remaining slot of a slot hold the payer owns
    Slots(HoldId),
}

/// Input to [`PaymentBinder::open_checkout`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// Paying customer; also the attendee of every ticket
    pub payer: CustomerId,
    /// Seats and slot holds to pay for
    pub items: Vec<CheckoutItem>,
    /// Payment method
    pub method: PaymentMethod,
    /// ISO currency code
    pub currency: String,
    /// Free-form description
    pub description: Option<String>,
}

/// A Pending payment and its Pending tickets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkout {
    /// The payment
    pub payment: Payment,
    /// One ticket per seat and per held slot
    pub tickets: Vec<Ticket>,
}

/// Result of confirming a payment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmReceipt {
    /// Payment after the call
    pub payment: Payment,
    /// Tickets this call moved to Confirmed
    pub confirmed: Vec<TicketId>,
    /// Tickets that were already Confirmed (or Used) before this call
    pub already_confirmed: Vec<TicketId>,
    /// Tickets left Pending because their inventory was gone
    pub violations: Vec<ConsistencyViolation>,
    /// The payment was already Completed: this was a duplicate delivery
    pub replay: bool,
}

impl ConfirmReceipt {
    /// Turn reported violations into an error.
    ///
    /// # Errors
    ///
    /// `ConsistencyViolation` if any ticket couldn't consume its inventory.
    pub fn into_result(self) -> Result<Self, BinderError> {
        if self.violations.is_empty() {
            Ok(self)
        } else {
            Err(BinderError::ConsistencyViolation(self.violations))
        }
    }
}

/// Result of failing or refunding a payment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentReceipt {
    /// Payment after the call
    pub payment: Payment,
    /// Tickets this call cancelled or refunded
    pub affected: Vec<TicketId>,
    /// The payment was already in the requested status
    pub replay: bool,
}

/// Converts payment outcomes into ticket and inventory state.
#[derive(Clone)]
pub struct PaymentBinder {
    store: Arc<dyn InventoryStore>,
    clock: Arc<dyn Clock>,
    delivery: Arc<dyn TicketDelivery>,
}

impl PaymentBinder {
    /// Create a binder over `store`, handing confirmations to `delivery`.
    #[must_use]
    pub fn new(
        store: Arc<dyn InventoryStore>,
        clock: Arc<dyn Clock>,
        delivery: Arc<dyn TicketDelivery>,
    ) -> Self {
        Self {
            store,
            clock,
            delivery,
        }
    }

    pub(crate) fn store(&self) -> &dyn InventoryStore {
        self.store.as_ref()
    }

    /// Open a checkout over holds the payer currently owns.
    ///
    /// Seats must carry a live hold by the payer. A slot hold must be the payer's,
    /// live, and yields one ticket per remaining slot. The amount is the sum of the
    /// ticket prices.
    ///
    /// # Errors
    ///
    /// - `EmptyCheckout` with no items
    /// - `HoldNotHeld` if any item isn't held live by the payer
    /// - `HoldInCheckout` if an item already backs another Pending payment of the payer
    /// - `AmountOverflow` if the total doesn't fit
    pub async fn open_checkout(&self, request: CheckoutRequest) -> Result<Checkout, BinderError> {
        if request.items.is_empty() {
            return Err(BinderError::EmptyCheckout);
        }
        let now = self.clock.now();
        let payer = request.payer;

        let mut seen = HashSet::new();
        let mut lines: Vec<(TicketBinding, Money)> = Vec::new();
        for item in request.items.iter().filter(|item| seen.insert(**item)) {
            match *item {
                CheckoutItem::Seat(unit_id) => {
                    let unit = self
                        .store
                        .load_unit(unit_id)
                        .await?
                        .filter(|unit| unit.is_held_by(payer, now))
                        .ok_or_else(|| BinderError::HoldNotHeld(format!("seat {unit_id}")))?;
                    lines.push((TicketBinding::Seat { unit_id }, unit.price()));
                }
                CheckoutItem::Slots(hold_id) => {
                    let hold = self
                        .store
                        .load_slot_hold(hold_id)
                        .await?
                        .filter(|hold| hold.holder == payer && hold.is_live(now) && hold.quantity > 0)
                        .ok_or_else(|| BinderError::HoldNotHeld(format!("slot hold {hold_id}")))?;
                    let pool = self
                        .store
                        .load_pool(hold.ticket_type_id)
                        .await?
                        .ok_or_else(|| StoreError::not_found("ticket type", hold.ticket_type_id))?;
                    let binding = TicketBinding::Slot {
                        ticket_type_id: hold.ticket_type_id,
                        hold_id,
                    };
                    lines.extend((0..hold.quantity).map(|_| (binding, pool.price())));
                }
            }
        }

        let amount = lines
            .iter()
            .try_fold(Money::ZERO, |total, (_, price)| total.checked_add(*price))
            .ok_or(BinderError::AmountOverflow)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let checkout = build_checkout(&request, &lines, amount, now);
            match self
                .store
                .insert_checkout(checkout.payment.clone(), checkout.tickets.clone())
                .await
            {
                Ok(()) => {
                    info!(
                        payment_id = %checkout.payment.id,
                        payer = %payer,
                        transaction_id = %checkout.payment.transaction_id,
                        amount = %amount,
                        tickets = checkout.tickets.len(),
                        "Checkout opened"
                    );
                    return Ok(checkout);
                }
                Err(StoreError::Duplicate { entity, id }) if attempt < CHECKOUT_ATTEMPTS => {
                    warn!(entity, id = %id, attempt, "Generated reference collided, regenerating");
                }
                Err(StoreError::InCheckout { entity, id }) => {
                    warn!(payer = %payer, entity, id = %id, "Checkout refused: item already in a pending checkout");
                    return Err(BinderError::HoldInCheckout(format!("{entity} {id}")));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Record the gateway order id of a payment so callbacks can find it.
    ///
    /// # Errors
    ///
    /// `PaymentNotFound`, or a store error if another payment uses the order id.
    pub async fn attach_external_order(
        &self,
        payment_id: PaymentId,
        external_order_id: String,
    ) -> Result<Payment, BinderError> {
        let payment = self
            .store
            .set_external_order(payment_id, external_order_id, self.clock.now())
            .await
            .map_err(|err| match err {
                StoreError::NotFound { .. } => BinderError::PaymentNotFound(payment_id),
                other => BinderError::Store(other),
            })?;
        debug!(payment_id = %payment_id, external_order_id = ?payment.external_order_id, "External order attached");
        Ok(payment)
    }

    /// Confirm a payment: Pending → Completed, then each Pending ticket → Confirmed.
    ///
    /// # Errors
    ///
    /// - `PaymentNotFound`
    /// - `ConflictingOutcome` if the payment already Failed or was Refunded
    ///
    /// Tickets whose inventory is gone are reported in
    /// [`ConfirmReceipt::violations`]; use [`ConfirmReceipt::into_result`] to treat
    /// them as an error.
    pub async fn confirm_payment(&self, payment_id: PaymentId) -> Result<ConfirmReceipt, BinderError> {
        self.confirm_with_receipt(payment_id, None).await
    }

    pub(crate) async fn confirm_with_receipt(
        &self,
        payment_id: PaymentId,
        receipt: Option<String>,
    ) -> Result<ConfirmReceipt, BinderError> {
        let now = self.clock.now();
        let (payment, replay) = self
            .settle(payment_id, PaymentStatus::Pending, PaymentStatus::Completed, receipt, now)
            .await?;

        let mut outcome = ConfirmReceipt {
            payment,
            confirmed: Vec::new(),
            already_confirmed: Vec::new(),
            violations: Vec::new(),
            replay,
        };

        for ticket in self.store.tickets_for_payment(payment_id).await? {
            match ticket.status {
                TicketStatus::Pending => {}
                TicketStatus::Confirmed | TicketStatus::Used => {
                    outcome.already_confirmed.push(ticket.id);
                    continue;
                }
                TicketStatus::Cancelled | TicketStatus::Refunded => continue,
            }

            if let Err(kind) = self.consume(&ticket, now).await? {
                let violation = ConsistencyViolation {
                    ticket_id: ticket.id,
                    payment_id,
                    kind,
                };
                error!(
                    payment_id = %payment_id,
                    ticket_id = %ticket.id,
                    violation = %violation,
                    "Consistency violation: inventory not held at confirm time"
                );
                outcome.violations.push(violation);
                continue;
            }

            match self
                .store
                .transition_ticket(ticket.id, TicketStatus::Pending, TicketStatus::Confirmed, now)
                .await?
            {
                StatusChange::Applied(confirmed) => {
                    outcome.confirmed.push(confirmed.id);
                    self.deliver(&confirmed).await;
                }
                StatusChange::Unchanged(current) if current.status.is_live() => {
                    outcome.already_confirmed.push(current.id);
                }
                StatusChange::Unchanged(current) => {
                    warn!(
                        ticket_id = %current.id,
                        status = %current.status,
                        "Ticket changed during confirmation, returning its inventory"
                    );
                    self.unconsume(&current, now).await?;
                }
            }
        }

        BinderMetrics::record_confirmed(outcome.confirmed.len());
        BinderMetrics::record_violations(outcome.violations.len());
        info!(
            payment_id = %payment_id,
            confirmed = outcome.confirmed.len(),
            already_confirmed = outcome.already_confirmed.len(),
            violations = outcome.violations.len(),
            replay,
            "Payment confirmed"
        );
        Ok(outcome)
    }

    /// Fail a payment: Pending → Failed, cancel its Pending tickets and release their holds.
    ///
    /// Releases are holder-scoped: a hold that another requester owns by now is left alone.
    ///
    /// # Errors
    ///
    /// - `PaymentNotFound`
    /// - `ConflictingOutcome` if the payment already Completed or was Refunded
    pub async fn fail_payment(&self, payment_id: PaymentId) -> Result<PaymentReceipt, BinderError> {
        self.fail_with_receipt(payment_id, None).await
    }

    pub(crate) async fn fail_with_receipt(
        &self,
        payment_id: PaymentId,
        receipt: Option<String>,
    ) -> Result<PaymentReceipt, BinderError> {
        let now = self.clock.now();
        let (payment, replay) = self
            .settle(payment_id, PaymentStatus::Pending, PaymentStatus::Failed, receipt, now)
            .await?;

        let mut affected = Vec::new();
        for ticket in self.store.tickets_for_payment(payment_id).await? {
            if ticket.status != TicketStatus::Pending {
                continue;
            }
            if let StatusChange::Applied(cancelled) = self
                .store
                .transition_ticket(ticket.id, TicketStatus::Pending, TicketStatus::Cancelled, now)
                .await?
            {
                self.release_hold(&cancelled, now).await?;
                affected.push(cancelled.id);
            }
        }

        info!(payment_id = %payment_id, cancelled = affected.len(), replay, "Payment failed");
        Ok(PaymentReceipt {
            payment,
            affected,
            replay,
        })
    }

    /// Refund a payment: Completed → Refunded, Confirmed tickets → Refunded.
    ///
    /// Pool slots go back to their pool. Seats stay Sold; re-listing a refunded seat
    /// is a separate step. Tickets still Pending (their confirmation hit a consistency
    /// violation) are cancelled, and a seat or slot they did consume is given back.
    ///
    /// # Errors
    ///
    /// - `PaymentNotFound`
    /// - `ConflictingOutcome` unless the payment is Completed (or already Refunded)
    pub async fn refund_payment(&self, payment_id: PaymentId) -> Result<PaymentReceipt, BinderError> {
        let now = self.clock.now();
        let (payment, replay) = self
            .settle(payment_id, PaymentStatus::Completed, PaymentStatus::Refunded, None, now)
            .await?;

        let mut affected = Vec::new();
        for ticket in self.store.tickets_for_payment(payment_id).await? {
            match ticket.status {
                TicketStatus::Confirmed => {
                    if let StatusChange::Applied(refunded) = self
                        .store
                        .transition_ticket(ticket.id, TicketStatus::Confirmed, TicketStatus::Refunded, now)
                        .await?
                    {
                        self.return_slot(&refunded).await?;
                        affected.push(refunded.id);
                    }
                }
                TicketStatus::Pending => {
                    if let StatusChange::Applied(cancelled) = self
                        .store
                        .transition_ticket(ticket.id, TicketStatus::Pending, TicketStatus::Cancelled, now)
                        .await?
                    {
                        warn!(ticket_id = %cancelled.id, payment_id = %payment_id, "Unissued ticket cancelled by refund");
                        self.unconsume(&cancelled, now).await?;
                        affected.push(cancelled.id);
                    }
                }
                TicketStatus::Used | TicketStatus::Cancelled | TicketStatus::Refunded => {}
            }
        }

        info!(payment_id = %payment_id, refunded = affected.len(), replay, "Payment refunded");
        Ok(PaymentReceipt {
            payment,
            affected,
            replay,
        })
    }

    /// Cancel a ticket on behalf of its attendee.
    ///
    /// A Pending ticket gives its hold back. A Confirmed ticket returns its pool slot;
    /// a sold seat stays Sold. Cancelling a cancelled ticket is a no-op.
    ///
    /// # Errors
    ///
    /// - `TicketNotFound`
    /// - `NotTicketHolder` if `requester` isn't the attendee
    /// - `InvalidTicketState` for Used or Refunded tickets
    pub async fn cancel_ticket(&self, requester: CustomerId, ticket_id: TicketId) -> Result<Ticket, BinderError> {
        let now = self.clock.now();
        let ticket = self
            .store
            .load_ticket(ticket_id)
            .await?
            .ok_or(BinderError::TicketNotFound(ticket_id))?;
        if ticket.attendee != requester {
            return Err(BinderError::NotTicketHolder(ticket_id));
        }

        let expected = ticket.status;
        match expected {
            TicketStatus::Cancelled => return Ok(ticket),
            TicketStatus::Used | TicketStatus::Refunded => {
                return Err(BinderError::InvalidTicketState {
                    ticket_id,
                    status: expected,
                });
            }
            TicketStatus::Pending | TicketStatus::Confirmed => {}
        }

        match self
            .store
            .transition_ticket(ticket_id, expected, TicketStatus::Cancelled, now)
            .await?
        {
            StatusChange::Applied(cancelled) => {
                if expected == TicketStatus::Pending {
                    self.release_hold(&cancelled, now).await?;
                } else {
                    self.return_slot(&cancelled).await?;
                }
                info!(ticket_id = %ticket_id, previous = %expected, "Ticket cancelled");
                Ok(cancelled)
            }
            StatusChange::Unchanged(current) if current.status == TicketStatus::Cancelled => Ok(current),
            StatusChange::Unchanged(current) => Err(BinderError::InvalidTicketState {
                ticket_id,
                status: current.status,
            }),
        }
    }

    /// Scan a ticket at the venue: Confirmed → Used.
    ///
    /// # Errors
    ///
    /// - `TicketNotFound`
    /// - `InvalidTicketState` unless the ticket is Confirmed
    pub async fn validate_ticket(&self, ticket_id: TicketId) -> Result<Ticket, BinderError> {
        let change = self
            .store
            .transition_ticket(ticket_id, TicketStatus::Confirmed, TicketStatus::Used, self.clock.now())
            .await
            .map_err(|err| match err {
                StoreError::NotFound { .. } => BinderError::TicketNotFound(ticket_id),
                other => BinderError::Store(other),
            })?;

        match change {
            StatusChange::Applied(used) => {
                info!(ticket_id = %ticket_id, ticket_number = %used.ticket_number, "Ticket validated");
                Ok(used)
            }
            StatusChange::Unchanged(current) => {
                warn!(ticket_id = %ticket_id, status = %current.status, "Ticket rejected at validation");
                Err(BinderError::InvalidTicketState {
                    ticket_id,
                    status: current.status,
                })
            }
        }
    }

    /// Move a payment from `expected` to `to`. Returns the payment and whether this was
    /// a replay of an outcome already applied.
    async fn settle(
        &self,
        payment_id: PaymentId,
        expected: PaymentStatus,
        to: PaymentStatus,
        receipt: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Payment, bool), BinderError> {
        let change = self
            .store
            .transition_payment(payment_id, expected, to, receipt, now)
            .await
            .map_err(|err| match err {
                StoreError::NotFound { .. } => BinderError::PaymentNotFound(payment_id),
                other => BinderError::Store(other),
            })?;

        match change {
            StatusChange::Applied(payment) => {
                BinderMetrics::record_payment(to.as_str());
                info!(payment_id = %payment_id, from = %expected, to = %to, "Payment status changed");
                Ok((payment, false))
            }
            StatusChange::Unchanged(payment) if payment.status == to => {
                BinderMetrics::record_duplicate_callback();
                debug!(payment_id = %payment_id, status = %to, "Payment outcome replayed");
                Ok((payment, true))
            }
            StatusChange::Unchanged(payment) => {
                warn!(
                    payment_id = %payment_id,
                    current = %payment.status,
                    requested = %to,
                    "Conflicting payment outcome"
                );
                Err(BinderError::ConflictingOutcome {
                    payment_id,
                    current: payment.status,
                    requested: to,
                })
            }
        }
    }

    /// Consume the seat or slot bound to a Pending ticket. The outer error is a store
    /// failure; the inner one a violation.
    async fn consume(
        &self,
        ticket: &Ticket,
        now: DateTime<Utc>,
    ) -> Result<Result<(), ViolationKind>, BinderError> {
        match ticket.binding {
            TicketBinding::Seat { unit_id } => {
                let command = UnitCommand::Confirm {
                    holder: ticket.attendee,
                    ticket: ticket.id,
                };
                let UnitTransition { result, .. } = self.store.transition_unit(unit_id, command, now).await?;
                Ok(result
                    .map(|_| ())
                    .map_err(|refusal| ViolationKind::Seat { unit_id, refusal }))
            }
            TicketBinding::Slot {
                ticket_type_id,
                hold_id,
            } => match self
                .store
                .commit_slot(ticket_type_id, hold_id, ticket.id, now)
                .await?
            {
                SlotCommit::Committed | SlotCommit::AlreadyCommitted => Ok(Ok(())),
                SlotCommit::Refused(refusal) => Ok(Err(ViolationKind::Slot { hold_id, refusal })),
            },
        }
    }

    /// Give back inventory consumed for a ticket that didn't end up Confirmed.
    async fn unconsume(&self, ticket: &Ticket, now: DateTime<Utc>) -> Result<(), BinderError> {
        match ticket.binding {
            TicketBinding::Seat { unit_id } => {
                self.store
                    .transition_unit(unit_id, UnitCommand::Revoke { ticket: ticket.id }, now)
                    .await?;
            }
            TicketBinding::Slot { .. } => self.return_slot(ticket).await?,
        }
        Ok(())
    }

    /// Release the hold backing a cancelled Pending ticket, only if the attendee still owns it.
    async fn release_hold(&self, ticket: &Ticket, now: DateTime<Utc>) -> Result<(), BinderError> {
        match ticket.binding {
            TicketBinding::Seat { unit_id } => {
                let UnitTransition { result, .. } = self
                    .store
                    .transition_unit(unit_id, UnitCommand::ReleaseHold { holder: ticket.attendee }, now)
                    .await?;
                if matches!(result, Ok(TransitionOutcome::Applied { .. })) {
                    ReservationMetrics::record_released("payment_failed", 1);
                }
            }
            TicketBinding::Slot { hold_id, .. } => {
                self.store.release_slots(hold_id, 1).await?;
            }
        }
        Ok(())
    }

    /// Return the pool slot of a ticket that had one sold. No-op for seats.
    async fn return_slot(&self, ticket: &Ticket) -> Result<(), BinderError> {
        if let TicketBinding::Slot { ticket_type_id, .. } = ticket.binding {
            let returned = self.store.refund_slot(ticket_type_id, ticket.id).await?;
            debug!(ticket_id = %ticket.id, returned, "Pool slot returned");
        }
        Ok(())
    }

    async fn deliver(&self, ticket: &Ticket) {
        let confirmed = match TicketConfirmed::for_ticket(ticket) {
            Ok(confirmed) => confirmed,
            Err(err) => {
                error!(ticket_id = %ticket.id, error = %err, "Failed to build ticket confirmation");
                return;
            }
        };
        if let Err(err) = self.delivery.deliver(confirmed).await {
            warn!(ticket_id = %ticket.id, error = %err, "Ticket delivery failed");
        }
    }
}

fn build_checkout(
    request: &CheckoutRequest,
    lines: &[(TicketBinding, Money)],
    amount: Money,
    now: DateTime<Utc>,
) -> Checkout {
    let mut rng = rand::thread_rng();
    let payment_id = PaymentId::new();

    let payment = Payment {
        id: payment_id,
        payer: request.payer,
        amount,
        currency: request.currency.clone(),
        method: request.method,
        status: PaymentStatus::Pending,
        transaction_id: numbering::transaction_id(now, &mut rng),
        external_order_id: None,
        external_receipt_id: None,
        description: request.description.clone(),
        created_at: now,
        updated_at: now,
    };

    let tickets = lines
        .iter()
        .map(|(binding, price)| Ticket {
            id: TicketId::new(),
            payment_id,
            attendee: request.payer,
            binding: *binding,
            ticket_number: numbering::ticket_number(now, &mut rng),
            price: *price,
            status: TicketStatus::Pending,
            used_at: None,
            created_at: now,
            updated_at: now,
        })
        .collect();

    Checkout { payment, tickets }
}
