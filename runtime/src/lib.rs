//! # Seatkeeper Runtime
//!
//! The services that run on top of an [`InventoryStore`](seatkeeper_core::store::InventoryStore):
//!
//! - **[`ReservationEngine`]**: places and releases holds on seats and ticket-type slots
//! - **[`ExpiryReaper`]**: background sweep returning expired holds to Available
//! - **[`PaymentBinder`]**: turns payment outcomes into Confirmed tickets and Sold inventory
//!
//! All three share the store and a [`Clock`](seatkeeper_core::environment::Clock); none
//! keeps state of its own, so any number of instances can run side by side.
//!
//! ## Example
//!
//! ```ignore
//! use seatkeeper_runtime::{EngineSettings, ReservationEngine};
//!
//! let engine = ReservationEngine::new(store, clock, EngineSettings::default());
//! let outcome = engine.reserve_seats(customer, &[seat_a, seat_b], None).await?;
//!
//! for conflict in &outcome.conflicts {
//!     println!("{} not granted: {}", conflict.unit_id, conflict.reason);
//! }
//! ```

pub mod binder;
pub mod callback;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod reaper;

pub use binder::{Checkout, CheckoutItem, CheckoutRequest, ConfirmReceipt, PaymentBinder, PaymentReceipt};
pub use callback::{CallbackResult, GatewayCallback, GatewayOutcome, PaymentRef};
pub use engine::{
    BlockOutcome, Conflict, ConflictReason, EngineSettings, ReservationEngine, ReserveOutcome,
    SeatAvailability, SlotReservation, DEFAULT_HOLD,
};
pub use error::{BinderError, ConsistencyViolation, EngineError, ViolationKind};
pub use metrics::MetricsServer;
pub use reaper::{ExpiryReaper, ReaperSettings, SweepReport};
