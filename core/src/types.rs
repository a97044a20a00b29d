//! Domain types for seat and ticket-slot holds.
//!
//! This module contains the value objects and records shared by every layer:
//! identifiers, money, inventory units, ticket-type pools, tickets and payments.
//!
//! Inventory units keep their fields private. The only code that changes a unit's
//! status is [`crate::transition::apply`]; stores rebuild units from rows through
//! [`InventoryUnit::from_parts`], which re-checks the hold invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for an addressable inventory unit (a seat)
    UnitId
);
uuid_id!(
    /// Authenticated principal that places holds and pays for tickets
    CustomerId
);
uuid_id!(
    /// Unique identifier for a ticket
    TicketId
);
uuid_id!(
    /// Unique identifier for a payment attempt
    PaymentId
);
uuid_id!(
    /// Unique identifier for a ticket-type pool (unseated inventory)
    TicketTypeId
);
uuid_id!(
    /// Unique identifier for a slot hold on a ticket-type pool
    HoldId
);

// ============================================================================
// Money Value Object (cents-based to avoid floating point errors)
// ============================================================================

/// Represents money in cents to avoid floating-point arithmetic errors
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// Zero amount
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Multiplies money by a quantity with overflow checking
    #[must_use]
    pub const fn checked_multiply(self, quantity: u32) -> Option<Self> {
        match self.0.checked_mul(quantity as u64) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Persisted enum helpers
// ============================================================================

/// A persisted status string that doesn't match any known variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    /// Which enum was being parsed
    pub kind: &'static str,
    /// The offending value
    pub value: String,
}

/// A record whose fields contradict the hold or counter invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{entity} {id} violates invariant: {detail}")]
pub struct InvariantViolation {
    /// Kind of record
    pub entity: &'static str,
    /// Record identifier
    pub id: String,
    /// What is wrong
    pub detail: String,
}

// ============================================================================
// Inventory Units
// ============================================================================

/// Status of an addressable inventory unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitStatus {
    /// Free to be held
    Available,
    /// Held by a requester until `reserved_until`
    Reserved,
    /// Consumed by a confirmed ticket
    Sold,
    /// Withheld from sale by the venue
    Blocked,
}

impl UnitStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Reserved => "reserved",
            Self::Sold => "sold",
            Self::Blocked => "blocked",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "available" => Ok(Self::Available),
            "reserved" => Ok(Self::Reserved),
            "sold" => Ok(Self::Sold),
            "blocked" => Ok(Self::Blocked),
            _ => Err(UnknownVariant {
                kind: "unit status",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw field set of an [`InventoryUnit`], as read from or written to storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitParts {
    /// Unit identifier
    pub id: UnitId,
    /// Section (capacity pool) the unit belongs to
    pub section: String,
    /// Human label, e.g. "A-12"
    pub label: String,
    /// Price of the unit
    pub price: Money,
    /// Current status
    pub status: UnitStatus,
    /// Holder of the current hold (lookup only)
    pub reserved_by: Option<CustomerId>,
    /// Hold expiry
    pub reserved_until: Option<DateTime<Utc>>,
    /// Ticket that consumed the unit
    pub sold_to: Option<TicketId>,
}

/// One addressable inventory item (a physical seat).
///
/// Invariants, checked on construction:
/// - `reserved_until` and `reserved_by` are set if and only if the status is `Reserved`
/// - `sold_to` is only set while the status is `Sold`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUnit {
    id: UnitId,
    section: String,
    label: String,
    price: Money,
    status: UnitStatus,
    reserved_by: Option<CustomerId>,
    reserved_until: Option<DateTime<Utc>>,
    sold_to: Option<TicketId>,
}

impl InventoryUnit {
    /// Creates a new available unit
    #[must_use]
    pub fn available(id: UnitId, section: impl Into<String>, label: impl Into<String>, price: Money) -> Self {
        Self {
            id,
            section: section.into(),
            label: label.into(),
            price,
            status: UnitStatus::Available,
            reserved_by: None,
            reserved_until: None,
            sold_to: None,
        }
    }

    /// Rebuild a unit from stored fields.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation`] if the fields describe an impossible state,
    /// such as a `Reserved` unit without an expiry.
    pub fn from_parts(parts: UnitParts) -> Result<Self, InvariantViolation> {
        let violation = |detail: &str| InvariantViolation {
            entity: "unit",
            id: parts.id.to_string(),
            detail: detail.to_string(),
        };

        let reserved = parts.status == UnitStatus::Reserved;
        if reserved != parts.reserved_until.is_some() {
            return Err(violation("reserved_until must be set exactly when reserved"));
        }
        if reserved != parts.reserved_by.is_some() {
            return Err(violation("reserved_by must be set exactly when reserved"));
        }
        if parts.sold_to.is_some() && parts.status != UnitStatus::Sold {
            return Err(violation("sold_to set on a unit that is not sold"));
        }

        Ok(Self {
            id: parts.id,
            section: parts.section,
            label: parts.label,
            price: parts.price,
            status: parts.status,
            reserved_by: parts.reserved_by,
            reserved_until: parts.reserved_until,
            sold_to: parts.sold_to,
        })
    }

    /// Split into raw fields for persistence
    #[must_use]
    pub fn into_parts(self) -> UnitParts {
        UnitParts {
            id: self.id,
            section: self.section,
            label: self.label,
            price: self.price,
            status: self.status,
            reserved_by: self.reserved_by,
            reserved_until: self.reserved_until,
            sold_to: self.sold_to,
        }
    }

    /// Unit identifier
    #[must_use]
    pub const fn id(&self) -> UnitId {
        self.id
    }

    /// Section name
    #[must_use]
    pub fn section(&self) -> &str {
        &self.section
    }

    /// Seat label
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Unit price
    #[must_use]
    pub const fn price(&self) -> Money {
        self.price
    }

    /// Current status
    #[must_use]
    pub const fn status(&self) -> UnitStatus {
        self.status
    }

    /// Current holder, if reserved
    #[must_use]
    pub const fn reserved_by(&self) -> Option<CustomerId> {
        self.reserved_by
    }

    /// Hold expiry, if reserved
    #[must_use]
    pub const fn reserved_until(&self) -> Option<DateTime<Utc>> {
        self.reserved_until
    }

    /// Ticket that bought the unit, if sold
    #[must_use]
    pub const fn sold_to(&self) -> Option<TicketId> {
        self.sold_to
    }

    /// Whether the unit carries a hold that hasn't expired at `now`
    #[must_use]
    pub fn has_live_hold(&self, now: DateTime<Utc>) -> bool {
        self.status == UnitStatus::Reserved && self.reserved_until.is_some_and(|until| now <= until)
    }

    /// Whether the unit carries a hold whose expiry is in the past
    #[must_use]
    pub fn has_stale_hold(&self, now: DateTime<Utc>) -> bool {
        self.status == UnitStatus::Reserved && self.reserved_until.is_some_and(|until| until < now)
    }

    /// Whether `holder` owns a live hold on this unit
    #[must_use]
    pub fn is_held_by(&self, holder: CustomerId, now: DateTime<Utc>) -> bool {
        self.has_live_hold(now) && self.reserved_by == Some(holder)
    }

    pub(crate) fn set_reserved(&mut self, holder: CustomerId, until: DateTime<Utc>) {
        self.status = UnitStatus::Reserved;
        self.reserved_by = Some(holder);
        self.reserved_until = Some(until);
        self.sold_to = None;
    }

    pub(crate) fn set_available(&mut self) {
        self.status = UnitStatus::Available;
        self.reserved_by = None;
        self.reserved_until = None;
        self.sold_to = None;
    }

    pub(crate) fn set_sold(&mut self, ticket: TicketId) {
        self.status = UnitStatus::Sold;
        self.reserved_by = None;
        self.reserved_until = None;
        self.sold_to = Some(ticket);
    }

    pub(crate) fn set_blocked(&mut self) {
        self.status = UnitStatus::Blocked;
        self.reserved_by = None;
        self.reserved_until = None;
        self.sold_to = None;
    }
}

// ============================================================================
// Slot Holds (counted pool reservations)
// ============================================================================

/// A time-bounded claim on `quantity` slots of a ticket-type pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHold {
    /// Hold identifier
    pub id: HoldId,
    /// Pool the slots were drawn from
    pub ticket_type_id: TicketTypeId,
    /// Requester owning the hold
    pub holder: CustomerId,
    /// Slots still held (decreases as tickets are confirmed)
    pub quantity: u32,
    /// Hold expiry
    pub expires_at: DateTime<Utc>,
    /// When the hold was placed
    pub created_at: DateTime<Utc>,
}

impl SlotHold {
    /// Whether the hold is still live at `now`
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

// ============================================================================
// Tickets
// ============================================================================

/// What inventory a ticket consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketBinding {
    /// A specific seat
    Seat {
        /// The seat
        unit_id: UnitId,
    },
    /// One slot of an unseated ticket-type pool, drawn from a slot hold
    Slot {
        /// The pool
        ticket_type_id: TicketTypeId,
        /// The hold the slot was reserved under
        hold_id: HoldId,
    },
}

/// Ticket lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketStatus {
    /// Awaiting payment
    Pending,
    /// Paid, inventory consumed
    Confirmed,
    /// Scanned at the venue
    Used,
    /// Cancelled before or after payment
    Cancelled,
    /// Payment refunded
    Refunded,
}

impl TicketStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Used => "used",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "used" => Ok(Self::Used),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            _ => Err(UnknownVariant {
                kind: "ticket status",
                value: s.to_string(),
            }),
        }
    }

    /// Confirmed or used tickets hold inventory permanently
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Used)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-facing ticket number, e.g. `TKT-20260101-7QH3MZK9XW2D`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketNumber(String);

impl TicketNumber {
    /// Wraps an existing ticket number
    #[must_use]
    pub const fn new(number: String) -> Self {
        Self(number)
    }

    /// Returns the ticket number as a string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A ticket bound to a payment attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket identifier
    pub id: TicketId,
    /// Payment this ticket is paid by
    pub payment_id: PaymentId,
    /// Ticket owner
    pub attendee: CustomerId,
    /// Inventory consumed by the ticket
    pub binding: TicketBinding,
    /// Unique, unguessable number printed on the ticket
    pub ticket_number: TicketNumber,
    /// Price at purchase time (immutable)
    pub price: Money,
    /// Lifecycle status
    pub status: TicketStatus,
    /// When the ticket was scanned
    pub used_at: Option<DateTime<Utc>>,
    /// When the ticket was created
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Payments
// ============================================================================

/// Payment lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// Awaiting the gateway outcome
    Pending,
    /// Funds captured
    Completed,
    /// Capture failed
    Failed,
    /// Funds returned
    Refunded,
}

impl PaymentStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            _ => Err(UnknownVariant {
                kind: "payment status",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment method
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    /// Card payment
    Card,
    /// M-Pesa mobile money
    Mpesa,
    /// `PayPal`
    PayPal,
}

impl PaymentMethod {
    /// Convert method to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Mpesa => "mpesa",
            Self::PayPal => "paypal",
        }
    }

    /// Parse method from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known method.
    pub fn parse(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "card" => Ok(Self::Card),
            "mpesa" => Ok(Self::Mpesa),
            "paypal" => Ok(Self::PayPal),
            _ => Err(UnknownVariant {
                kind: "payment method",
                value: s.to_string(),
            }),
        }
    }
}

/// A payment attempt covering one or more tickets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Payment identifier
    pub id: PaymentId,
    /// Paying customer
    pub payer: CustomerId,
    /// Total amount
    pub amount: Money,
    /// ISO currency code
    pub currency: String,
    /// Payment method
    pub method: PaymentMethod,
    /// Lifecycle status
    pub status: PaymentStatus,
    /// Internal transaction reference
    pub transaction_id: String,
    /// Gateway order id (indexed for callback lookup)
    pub external_order_id: Option<String>,
    /// Gateway receipt id, recorded when the outcome arrives
    pub external_receipt_id: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// When the payment was created
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::Duration;

    fn parts(status: UnitStatus) -> UnitParts {
        UnitParts {
            id: UnitId::new(),
            section: "Orchestra".to_string(),
            label: "A-1".to_string(),
            price: Money::from_cents(5_000),
            status,
            reserved_by: None,
            reserved_until: None,
            sold_to: None,
        }
    }

    #[test]
    fn reserved_unit_requires_expiry_and_holder() {
        let err = InventoryUnit::from_parts(parts(UnitStatus::Reserved)).unwrap_err();
        assert!(err.detail.contains("reserved_until"));

        let mut with_expiry = parts(UnitStatus::Reserved);
        with_expiry.reserved_until = Some(Utc::now());
        let err = InventoryUnit::from_parts(with_expiry).unwrap_err();
        assert!(err.detail.contains("reserved_by"));
    }

    #[test]
    fn available_unit_rejects_stray_expiry() {
        let mut stray = parts(UnitStatus::Available);
        stray.reserved_until = Some(Utc::now());
        assert!(InventoryUnit::from_parts(stray).is_err());
    }

    #[test]
    fn sold_to_only_on_sold_units() {
        let mut p = parts(UnitStatus::Blocked);
        p.sold_to = Some(TicketId::new());
        assert!(InventoryUnit::from_parts(p.clone()).is_err());

        p.status = UnitStatus::Sold;
        assert!(InventoryUnit::from_parts(p).is_ok());
    }

    #[test]
    fn hold_liveness_boundary_is_inclusive() {
        let now = Utc::now();
        let holder = CustomerId::new();
        let mut unit = InventoryUnit::available(UnitId::new(), "GA", "1", Money::ZERO);
        unit.set_reserved(holder, now);

        assert!(unit.has_live_hold(now));
        assert!(!unit.has_stale_hold(now));
        assert!(unit.has_stale_hold(now + Duration::milliseconds(1)));
        assert!(unit.is_held_by(holder, now));
        assert!(!unit.is_held_by(CustomerId::new(), now));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            UnitStatus::Available,
            UnitStatus::Reserved,
            UnitStatus::Sold,
            UnitStatus::Blocked,
        ] {
            assert_eq!(UnitStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(PaymentStatus::parse("captured").is_err());
        assert_eq!(PaymentMethod::parse("mpesa").unwrap(), PaymentMethod::Mpesa);
    }

    #[test]
    fn money_display_and_overflow() {
        assert_eq!(Money::from_cents(12_345).to_string(), "123.45");
        assert_eq!(Money::from_cents(u64::MAX).checked_multiply(2), None);
        assert_eq!(
            Money::from_cents(250).checked_multiply(4),
            Some(Money::from_cents(1_000))
        );
    }
}
