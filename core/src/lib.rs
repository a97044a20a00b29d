//! # Seatkeeper Core
//!
//! Domain types and pure logic for holding seats and ticket-type slots.
//!
//! This crate contains no I/O. It provides:
//!
//! - **Types**: inventory units, ticket-type pools, slot holds, tickets, payments
//! - **Transition**: the per-unit state machine, the only code that changes a unit's status
//! - **Pool**: counted-semaphore arithmetic for unseated inventory
//! - **Store**: the `InventoryStore` trait every backend implements
//! - **Delivery**: the `TicketConfirmed` payload and the `TicketDelivery` hand-off
//! - **Environment**: injected dependencies (the clock)
//!
//! ## Example
//!
//! ```
//! use seatkeeper_core::transition::{apply, UnitCommand};
//! use seatkeeper_core::types::{CustomerId, InventoryUnit, Money, UnitId, UnitStatus};
//! use chrono::{Duration, Utc};
//!
//! let mut seat = InventoryUnit::available(UnitId::new(), "Orchestra", "A-1", Money::from_cents(7_500));
//! let now = Utc::now();
//!
//! let outcome = apply(
//!     &mut seat,
//!     &UnitCommand::Reserve { holder: CustomerId::new(), until: now + Duration::seconds(600) },
//!     now,
//! );
//!
//! assert!(outcome.is_ok());
//! assert_eq!(seat.status(), UnitStatus::Reserved);
//! ```

pub use chrono::{DateTime, Utc};

pub mod delivery;
pub mod numbering;
pub mod pool;
pub mod store;
pub mod transition;
pub mod types;

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Every hold-expiry decision reads the time from a `Clock`, never from
    /// `Utc::now()` directly, so tests can move time forward deterministically.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
