//! Application coordinator: wires the inventory store, the reservation engine, the
//! payment binder and the expiry reaper, and runs the background side of the service.
//!
//! # Graceful Shutdown
//!
//! When the shutdown future resolves (Ctrl+C or SIGTERM for [`TicketingApp::run`]):
//! 1. Shutdown signal broadcast to the reaper
//! 2. Wait for the reaper to finish its current sweep (bounded by `SHUTDOWN_TIMEOUT`)
//! 3. Clean exit

use crate::config::{Config, StoreBackend};
use seatkeeper_core::delivery::{LogDelivery, TicketDelivery};
use seatkeeper_core::environment::{Clock, SystemClock};
use seatkeeper_core::store::{InventoryStore, StoreError};
use seatkeeper_postgres::PostgresInventoryStore;
use seatkeeper_runtime::metrics::MetricsError;
use seatkeeper_runtime::{ExpiryReaper, MetricsServer, PaymentBinder, ReservationEngine};
use std::future::Future;
use std::net::AddrParseError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Errors that stop the service from starting.
#[derive(Error, Debug)]
pub enum AppError {
    /// The inventory store couldn't be opened or migrated
    #[error("Inventory store error: {0}")]
    Store(#[from] StoreError),

    /// The metrics endpoint couldn't be started
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// `METRICS_HOST` / `METRICS_PORT` don't form an address
    #[error("Invalid metrics address: {0}")]
    MetricsAddress(#[from] AddrParseError),

    /// `SEATKEEPER_STORE=memory` in a build without the `memory-store` feature
    #[error("The in-memory store is not compiled in (enable the memory-store feature)")]
    MemoryStoreDisabled,
}

/// Main application: owns the services built over one inventory store.
pub struct TicketingApp {
    config: Config,
    store: Arc<dyn InventoryStore>,
    engine: ReservationEngine,
    binder: PaymentBinder,
    reaper: ExpiryReaper,
}

impl TicketingApp {
    /// Open the configured store and build the services over it.
    ///
    /// # Errors
    ///
    /// Returns error if the `PostgreSQL` store can't be reached or migrated.
    pub async fn new(config: Config) -> Result<Self, AppError> {
        let store: Arc<dyn InventoryStore> = match config.store.backend {
            StoreBackend::Postgres => {
                let store =
                    PostgresInventoryStore::connect(&config.store.url, &config.connection_settings()).await?;
                if config.store.run_migrations {
                    store.migrate().await?;
                }
                Arc::new(store)
            }
            StoreBackend::Memory => memory_store()?,
        };

        Ok(Self::with_parts(config, store, Arc::new(SystemClock), Arc::new(LogDelivery)))
    }

    /// Build the services over an existing store, clock and delivery.
    #[must_use]
    pub fn with_parts(
        config: Config,
        store: Arc<dyn InventoryStore>,
        clock: Arc<dyn Clock>,
        delivery: Arc<dyn TicketDelivery>,
    ) -> Self {
        let engine = ReservationEngine::new(store.clone(), clock.clone(), config.engine_settings());
        let binder = PaymentBinder::new(store.clone(), clock.clone(), delivery);
        let reaper = ExpiryReaper::new(store.clone(), clock, config.reaper_settings());

        info!(
            backend = %config.store.backend,
            default_hold_secs = config.holds.default_seconds,
            reaper_enabled = config.reaper.enabled,
            "Application services built"
        );

        Self {
            config,
            store,
            engine,
            binder,
            reaper,
        }
    }

    /// The configuration the app was built with
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The shared inventory store
    #[must_use]
    pub fn store(&self) -> Arc<dyn InventoryStore> {
        self.store.clone()
    }

    /// Reservation engine
    #[must_use]
    pub const fn engine(&self) -> &ReservationEngine {
        &self.engine
    }

    /// Payment/ticket binder
    #[must_use]
    pub const fn binder(&self) -> &PaymentBinder {
        &self.binder
    }

    /// Expiry reaper
    #[must_use]
    pub const fn reaper(&self) -> &ExpiryReaper {
        &self.reaper
    }

    /// Run until Ctrl+C or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns error if the metrics endpoint can't be started.
    pub async fn run(self) -> Result<(), AppError> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the metrics endpoint and the reaper until `shutdown` resolves, then stop
    /// the reaper gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if the metrics endpoint can't be started.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), AppError> {
        if self.config.server.metrics_enabled {
            let mut metrics = MetricsServer::new(self.config.metrics_addr()?);
            metrics.serve()?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let reaper = self
            .config
            .reaper
            .enabled
            .then(|| self.reaper.clone().spawn(shutdown_tx.subscribe()));
        if reaper.is_none() {
            info!("Expiry reaper disabled in this process");
        }

        info!("Seatkeeper is running");
        shutdown.await;
        info!("Shutting down gracefully...");

        // Send shutdown signal to all background tasks
        let _ = shutdown_tx.send(());

        if let Some(handle) = reaper {
            match tokio::time::timeout(self.config.shutdown_timeout(), handle).await {
                Ok(Ok(())) => info!("Expiry reaper stopped gracefully"),
                Ok(Err(e)) => warn!(error = %e, "Expiry reaper task failed"),
                Err(_) => warn!("Expiry reaper shutdown timed out"),
            }
        }

        info!("Graceful shutdown complete");
        Ok(())
    }
}

#[cfg(feature = "memory-store")]
#[allow(clippy::unnecessary_wraps)]
fn memory_store() -> Result<Arc<dyn InventoryStore>, AppError> {
    warn!("Using the in-memory inventory store: holds are lost on restart");
    Ok(Arc::new(seatkeeper_testing::InMemoryInventoryStore::new()))
}

#[cfg(not(feature = "memory-store"))]
fn memory_store() -> Result<Arc<dyn InventoryStore>, AppError> {
    Err(AppError::MemoryStoreDisabled)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// A handler that can't be installed never fires; the other one still does.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
