//! Counted ticket-type pools (unseated inventory).
//!
//! Slots of a pool aren't addressable, so a pool is a counted semaphore:
//! `held` tracks slots claimed by live [`crate::types::SlotHold`] records and `sold`
//! tracks slots consumed by confirmed tickets. Every method keeps
//! `sold + held <= quantity`.

use crate::types::{InvariantViolation, Money, TicketTypeId};
use serde::{Deserialize, Serialize};

/// Raw field set of a [`TicketTypePool`], as read from or written to storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolParts {
    /// Pool identifier
    pub id: TicketTypeId,
    /// Display name, e.g. "General Admission"
    pub name: String,
    /// Price of one slot
    pub price: Money,
    /// Capacity
    pub quantity: u32,
    /// Slots consumed by confirmed tickets
    pub sold: u32,
    /// Slots claimed by live holds
    pub held: u32,
}

/// A ticket type with a finite number of interchangeable slots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketTypePool {
    id: TicketTypeId,
    name: String,
    price: Money,
    quantity: u32,
    sold: u32,
    held: u32,
}

impl TicketTypePool {
    /// Creates an empty pool with `quantity` slots
    #[must_use]
    pub fn new(id: TicketTypeId, name: impl Into<String>, price: Money, quantity: u32) -> Self {
        Self {
            id,
            name: name.into(),
            price,
            quantity,
            sold: 0,
            held: 0,
        }
    }

    /// Rebuild a pool from stored counters.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation`] if `sold + held` exceeds `quantity`.
    pub fn from_parts(parts: PoolParts) -> Result<Self, InvariantViolation> {
        let committed = u64::from(parts.sold) + u64::from(parts.held);
        if committed > u64::from(parts.quantity) {
            return Err(InvariantViolation {
                entity: "ticket type",
                id: parts.id.to_string(),
                detail: format!(
                    "sold ({}) + held ({}) exceeds quantity ({})",
                    parts.sold, parts.held, parts.quantity
                ),
            });
        }
        Ok(Self {
            id: parts.id,
            name: parts.name,
            price: parts.price,
            quantity: parts.quantity,
            sold: parts.sold,
            held: parts.held,
        })
    }

    /// Split into raw fields for persistence
    #[must_use]
    pub fn into_parts(self) -> PoolParts {
        PoolParts {
            id: self.id,
            name: self.name,
            price: self.price,
            quantity: self.quantity,
            sold: self.sold,
            held: self.held,
        }
    }

    /// Pool identifier
    #[must_use]
    pub const fn id(&self) -> TicketTypeId {
        self.id
    }

    /// Display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Price of one slot
    #[must_use]
    pub const fn price(&self) -> Money {
        self.price
    }

    /// Capacity
    #[must_use]
    pub const fn quantity(&self) -> u32 {
        self.quantity
    }

    /// Slots consumed by confirmed tickets
    #[must_use]
    pub const fn sold(&self) -> u32 {
        self.sold
    }

    /// Slots claimed by live holds
    #[must_use]
    pub const fn held(&self) -> u32 {
        self.held
    }

    /// Slots neither sold nor held
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.quantity.saturating_sub(self.sold).saturating_sub(self.held)
    }

    /// Claim up to `requested` slots. Returns how many were granted.
    pub fn hold(&mut self, requested: u32) -> u32 {
        let granted = requested.min(self.available());
        self.held += granted;
        granted
    }

    /// Return up to `count` held slots to the pool. Returns how many were returned.
    pub fn release_held(&mut self, count: u32) -> u32 {
        let released = count.min(self.held);
        self.held -= released;
        released
    }

    /// Move one held slot to sold. Returns `false` if nothing is held.
    pub fn commit_held(&mut self) -> bool {
        if self.held == 0 {
            return false;
        }
        self.held -= 1;
        self.sold += 1;
        true
    }

    /// Give back one sold slot (refund or cancellation). Returns `false` if nothing is sold.
    pub fn uncommit_sold(&mut self) -> bool {
        if self.sold == 0 {
            return false;
        }
        self.sold -= 1;
        true
    }
}
