//! # Seatkeeper Testing
//!
//! Testing utilities for seat and slot holds.
//!
//! This crate provides:
//! - [`InMemoryInventoryStore`]: an `InventoryStore` with per-unit async mutexes
//! - Clocks: [`FixedClock`] and [`ManualClock`] (time you can move forward)
//! - [`RecordingDelivery`]: captures `TicketConfirmed` records
//! - Fixtures for seeding venue sections and ticket-type pools
//!
//! ## Example
//!
//! ```
//! use seatkeeper_testing::{fixtures, InMemoryInventoryStore, ManualClock};
//! use seatkeeper_core::environment::Clock;
//! use seatkeeper_core::types::Money;
//! use chrono::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryInventoryStore::new();
//! let seats = fixtures::seed_section(&store, "Orchestra", 2, 10, Money::from_cents(7_500)).await?;
//! assert_eq!(seats.len(), 20);
//!
//! let clock = ManualClock::starting_at_test_epoch();
//! let before = clock.now();
//! clock.advance(Duration::seconds(2));
//! assert_eq!(clock.now() - before, Duration::seconds(2));
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use seatkeeper_core::environment::Clock;

mod inventory_mocks;

pub use inventory_mocks::InMemoryInventoryStore;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use seatkeeper_core::delivery::{DeliveryError, TicketConfirmed, TicketDelivery};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use tokio::sync::Mutex;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use seatkeeper_testing::mocks::FixedClock;
    /// use seatkeeper_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2026-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    fn test_epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_225_600, 0).unwrap_or_default()
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to the engine and the
    /// reaper and advance both at once. Millisecond resolution.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        millis: Arc<AtomicI64>,
    }

    impl ManualClock {
        /// Create a clock frozen at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                millis: Arc::new(AtomicI64::new(time.timestamp_millis())),
            }
        }

        /// Create a clock frozen at the same instant as [`test_clock`]
        #[must_use]
        pub fn starting_at_test_epoch() -> Self {
            Self::new(test_epoch())
        }

        /// Move time forward by `by`
        pub fn advance(&self, by: Duration) {
            self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
        }

        /// Jump to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            self.millis.store(time.timestamp_millis(), Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
        }
    }

    /// Ticket delivery that records every `TicketConfirmed` it receives.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingDelivery {
        delivered: Arc<Mutex<Vec<TicketConfirmed>>>,
        failing: Arc<AtomicBool>,
    }

    impl RecordingDelivery {
        /// Create an empty recorder
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make subsequent deliveries fail (after recording the attempt)
        pub fn fail_deliveries(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Everything delivered so far, in order
        pub async fn delivered(&self) -> Vec<TicketConfirmed> {
            self.delivered.lock().await.clone()
        }
    }

    impl TicketDelivery for RecordingDelivery {
        fn deliver(
            &self,
            confirmed: TicketConfirmed,
        ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>> {
            Box::pin(async move {
                let ticket_id = confirmed.ticket_id;
                self.delivered.lock().await.push(confirmed);
                if self.failing.load(Ordering::SeqCst) {
                    return Err(DeliveryError(format!("notifier offline for {ticket_id}")));
                }
                Ok(())
            })
        }
    }
}

/// Seeding helpers for venue inventory
pub mod fixtures {
    use seatkeeper_core::pool::TicketTypePool;
    use seatkeeper_core::store::{InventoryStore, StoreError};
    use seatkeeper_core::types::{InventoryUnit, Money, TicketTypeId, UnitId};

    /// Seed a section of `rows` × `seats_per_row` available seats labelled `A-1`, `A-2`, …
    ///
    /// Rows past `Z` continue as `AA`, `AB`, …
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn seed_section<S: InventoryStore + ?Sized>(
        store: &S,
        section: &str,
        rows: u32,
        seats_per_row: u32,
        price: Money,
    ) -> Result<Vec<UnitId>, StoreError> {
        let mut ids = Vec::new();
        for row in 0..rows {
            let row_label = row_label(row);
            for seat in 1..=seats_per_row {
                let id = UnitId::new();
                store
                    .insert_unit(InventoryUnit::available(
                        id,
                        section,
                        format!("{row_label}-{seat}"),
                        price,
                    ))
                    .await?;
                ids.push(id);
            }
        }
        tracing::debug!(section, rows, seats_per_row, "Seeded section");
        Ok(ids)
    }

    /// Seed a ticket-type pool with `quantity` slots.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn seed_pool<S: InventoryStore + ?Sized>(
        store: &S,
        name: &str,
        price: Money,
        quantity: u32,
    ) -> Result<TicketTypeId, StoreError> {
        let id = TicketTypeId::new();
        store
            .insert_pool(TicketTypePool::new(id, name, price, quantity))
            .await?;
        Ok(id)
    }

    fn row_label(mut row: u32) -> String {
        let mut label = Vec::new();
        loop {
            let letter = b'A' + u8::try_from(row % 26).unwrap_or(0);
            label.push(char::from(letter));
            if row < 26 {
                break;
            }
            row = row / 26 - 1;
        }
        label.iter().rev().collect()
    }

    #[cfg(test)]
    mod tests {
        use super::row_label;

        #[test]
        fn row_labels() {
            assert_eq!(row_label(0), "A");
            assert_eq!(row_label(25), "Z");
            assert_eq!(row_label(26), "AA");
            assert_eq!(row_label(27), "AB");
        }
    }
}

/// Install a test subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, RecordingDelivery, test_clock};
