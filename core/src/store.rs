//! The Inventory Store abstraction.
//!
//! The store is the single shared mutable resource. It owns the per-unit
//! serialization: [`InventoryStore::transition_unit`] must run
//! [`crate::transition::apply`] while holding exclusive access to that one unit,
//! so that two writers never act on the same pre-transition state. Writers on
//! different units must not block each other.
//!
//! Pool counters get the same discipline: every counter change happens inside
//! the store while the pool is locked.
//!
//! # Implementations
//!
//! - `PostgresInventoryStore` (in `seatkeeper-postgres`): `SELECT ... FOR UPDATE` row locks
//! - `InMemoryInventoryStore` (in `seatkeeper-testing`): one async mutex per unit and per pool

use crate::pool::TicketTypePool;
use crate::transition::{Refusal, TransitionOutcome, UnitCommand};
use crate::types::{
    CustomerId, HoldId, InvariantViolation, InventoryUnit, Payment, PaymentId, PaymentStatus,
    SlotHold, Ticket, TicketId, TicketStatus, TicketTypeId, UnitId, UnknownVariant,
};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by every store operation
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Errors that can occur during store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The referenced record doesn't exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record
        entity: &'static str,
        /// Identifier looked up
        id: String,
    },

    /// A record with the same key already exists.
    #[error("{entity} already exists: {id}")]
    Duplicate {
        /// Kind of record
        entity: &'static str,
        /// Conflicting key
        id: String,
    },

    /// A seat or slot hold is already bound to a ticket of another Pending payment.
    #[error("{entity} {id} is already in a pending checkout")]
    InCheckout {
        /// Kind of record
        entity: &'static str,
        /// Bound key
        id: String,
    },

    /// The underlying storage is unreachable or timed out. Callers may retry.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A persisted record can't be decoded or violates an invariant.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Shorthand for [`StoreError::NotFound`]
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`StoreError::Duplicate`]
    pub fn duplicate(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::Duplicate {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`StoreError::InCheckout`]
    pub fn in_checkout(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::InCheckout {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether a retry could succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<InvariantViolation> for StoreError {
    fn from(err: InvariantViolation) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<UnknownVariant> for StoreError {
    fn from(err: UnknownVariant) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// A unit after a command was applied (or refused) under its serialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitTransition {
    /// Unit state after the command
    pub unit: InventoryUnit,
    /// What the state machine decided
    pub result: Result<TransitionOutcome, Refusal>,
}

/// Result of a slot-hold attempt on a pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotGrant {
    /// The new hold, absent when nothing was granted
    pub hold: Option<SlotHold>,
    /// Slots granted
    pub granted: u32,
    /// Slots available just before the grant (after purging expired holds)
    pub available: u32,
    /// Slots returned to the pool from expired holds during this call
    pub reclaimed: u32,
}

/// Why a slot couldn't be committed to a ticket.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum SlotRefusal {
    /// The hold no longer exists (released or swept).
    #[error("slot hold {0} no longer exists")]
    HoldMissing(HoldId),

    /// The hold expired before the commit.
    #[error("slot hold expired at {expired_at}")]
    HoldExpired {
        /// When the hold expired
        expired_at: DateTime<Utc>,
    },

    /// Every slot of the hold was already committed to other tickets.
    #[error("slot hold {0} has no slots left")]
    HoldExhausted(HoldId),
}

/// Result of committing one held slot to a ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotCommit {
    /// A held slot became sold.
    Committed,
    /// The ticket already owns a sold slot (duplicate delivery).
    AlreadyCommitted,
    /// Nothing changed.
    Refused(SlotRefusal),
}

/// Result of a compare-and-set status change on a payment or ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusChange<T> {
    /// The record was in the expected status and was moved.
    Applied(T),
    /// The record was in some other status and was left as is.
    Unchanged(T),
}

impl<T> StatusChange<T> {
    /// Whether the change was applied
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// The record after the call, whichever way it went
    pub fn into_inner(self) -> T {
        match self {
            Self::Applied(value) | Self::Unchanged(value) => value,
        }
    }
}

/// Durable record of seats, ticket-type pools, slot holds, payments and tickets.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be shared as `Arc<dyn InventoryStore>`.
pub trait InventoryStore: Send + Sync {
    // ---------------------------------------------------------------- units

    /// Add a new unit.
    ///
    /// # Errors
    ///
    /// `Duplicate` if the id is taken, `Unavailable` on storage failure.
    fn insert_unit(&self, unit: InventoryUnit) -> StoreFuture<'_, ()>;

    /// Read a unit without locking it.
    ///
    /// # Errors
    ///
    /// `Unavailable` or `Corrupt`.
    fn load_unit(&self, id: UnitId) -> StoreFuture<'_, Option<InventoryUnit>>;

    /// Every unit of a section, ordered by label. Unknown sections are empty.
    ///
    /// # Errors
    ///
    /// `Unavailable` or `Corrupt`.
    fn units_in_section<'a>(&'a self, section: &'a str) -> StoreFuture<'a, Vec<InventoryUnit>>;

    /// Apply `command` to one unit under that unit's serialization and persist the result.
    ///
    /// A refusal is data, not an error: the returned [`UnitTransition`] carries it along
    /// with the untouched unit.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `Unavailable` on storage failure.
    fn transition_unit(
        &self,
        id: UnitId,
        command: UnitCommand,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, UnitTransition>;

    /// Up to `limit` units whose hold expired before `now`, oldest expiry first.
    ///
    /// # Errors
    ///
    /// `Unavailable` on storage failure.
    fn expired_units(&self, now: DateTime<Utc>, limit: u32) -> StoreFuture<'_, Vec<UnitId>>;

    // ---------------------------------------------------------------- pools

    /// Add a new ticket-type pool.
    ///
    /// # Errors
    ///
    /// `Duplicate` if the id is taken.
    fn insert_pool(&self, pool: TicketTypePool) -> StoreFuture<'_, ()>;

    /// Read a pool's counters.
    ///
    /// # Errors
    ///
    /// `Unavailable` or `Corrupt`.
    fn load_pool(&self, id: TicketTypeId) -> StoreFuture<'_, Option<TicketTypePool>>;

    /// Claim up to `requested` slots for `holder` until `expires_at`.
    ///
    /// Under the pool's lock, expired holds on this pool are purged first, then
    /// `min(requested, available)` slots are granted. No hold record is created
    /// when nothing is granted.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown pool.
    fn hold_slots(
        &self,
        ticket_type_id: TicketTypeId,
        holder: CustomerId,
        requested: u32,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, SlotGrant>;

    /// Read a slot hold.
    ///
    /// # Errors
    ///
    /// `Unavailable` or `Corrupt`.
    fn load_slot_hold(&self, id: HoldId) -> StoreFuture<'_, Option<SlotHold>>;

    /// Return up to `count` slots of a hold to its pool. The hold is removed when it
    /// reaches zero. A missing hold releases nothing.
    ///
    /// # Errors
    ///
    /// `Unavailable` on storage failure.
    fn release_slots(&self, hold_id: HoldId, count: u32) -> StoreFuture<'_, u32>;

    /// Move one slot of `hold_id` to sold on behalf of `ticket_id`.
    ///
    /// Idempotent per ticket: a second call for the same ticket reports
    /// [`SlotCommit::AlreadyCommitted`] and changes nothing.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown pool.
    fn commit_slot(
        &self,
        ticket_type_id: TicketTypeId,
        hold_id: HoldId,
        ticket_id: TicketId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, SlotCommit>;

    /// Give back the sold slot owned by `ticket_id`. Returns `false` if the ticket
    /// owns none (never committed, or already refunded).
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown pool.
    fn refund_slot(
        &self,
        ticket_type_id: TicketTypeId,
        ticket_id: TicketId,
    ) -> StoreFuture<'_, bool>;

    /// Remove up to `limit` slot holds that expired before `now`, returning their
    /// slots to the pools. Returns the number of slots returned.
    ///
    /// # Errors
    ///
    /// `Unavailable` on storage failure.
    fn sweep_expired_slot_holds(&self, now: DateTime<Utc>, limit: u32) -> StoreFuture<'_, u32>;

    // ---------------------------------------------------------------- payments

    /// Persist a Pending payment together with its Pending tickets, atomically.
    ///
    /// A seat can back one Pending checkout per attendee, and a slot hold one Pending
    /// checkout: a ticket bound to either while a Pending ticket of another Pending
    /// payment already is rejects the whole checkout. A Pending ticket left by another
    /// attendee doesn't count, since its hold is gone.
    ///
    /// # Errors
    ///
    /// - `Duplicate` on a transaction id or ticket number collision
    /// - `InCheckout` if a seat or slot hold is already bound as above
    fn insert_checkout(&self, payment: Payment, tickets: Vec<Ticket>) -> StoreFuture<'_, ()>;

    /// Read a payment.
    ///
    /// # Errors
    ///
    /// `Unavailable` or `Corrupt`.
    fn load_payment(&self, id: PaymentId) -> StoreFuture<'_, Option<Payment>>;

    /// Look a payment up by its gateway order id (indexed).
    ///
    /// # Errors
    ///
    /// `Unavailable` or `Corrupt`.
    fn find_payment_by_external_order<'a>(
        &'a self,
        external_order_id: &'a str,
    ) -> StoreFuture<'a, Option<Payment>>;

    /// Record the gateway order id of a payment.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown payment, `Duplicate` if another payment uses the order id.
    fn set_external_order(
        &self,
        id: PaymentId,
        external_order_id: String,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Payment>;

    /// Move a payment from `expected` to `to`, recording `receipt` when given.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown payment.
    fn transition_payment(
        &self,
        id: PaymentId,
        expected: PaymentStatus,
        to: PaymentStatus,
        receipt: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, StatusChange<Payment>>;

    // ---------------------------------------------------------------- tickets

    /// Tickets bound to a payment, in creation order.
    ///
    /// # Errors
    ///
    /// `Unavailable` or `Corrupt`.
    fn tickets_for_payment(&self, payment_id: PaymentId) -> StoreFuture<'_, Vec<Ticket>>;

    /// Read a ticket.
    ///
    /// # Errors
    ///
    /// `Unavailable` or `Corrupt`.
    fn load_ticket(&self, id: TicketId) -> StoreFuture<'_, Option<Ticket>>;

    /// Move a ticket from `expected` to `to`. Moving to `Used` stamps `used_at`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown ticket.
    fn transition_ticket(
        &self,
        id: TicketId,
        expected: TicketStatus,
        to: TicketStatus,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, StatusChange<Ticket>>;
}
