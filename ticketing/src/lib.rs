//! Seatkeeper service shell.
//!
//! Holds the deployable side of the seat and slot hold engine:
//!
//! - [`Config`]: environment configuration with defaults
//! - [`TicketingApp`]: opens the inventory store (`PostgreSQL` or in-memory) and
//!   builds the reservation engine, the payment binder and the expiry reaper over it
//! - The `server` binary: runs the reaper loop and the Prometheus endpoint until
//!   Ctrl+C or SIGTERM
//!
//! # Example
//!
//! ```rust,ignore
//! use ticketing::{Config, TicketingApp};
//!
//! let app = TicketingApp::new(Config::from_env()).await?;
//! let outcome = app.engine().reserve_seats(customer, &seats, None).await?;
//! app.run().await?;
//! ```

pub mod app;
pub mod config;

pub use app::{AppError, TicketingApp};
pub use config::{Config, StoreBackend};
