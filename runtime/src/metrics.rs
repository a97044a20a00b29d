//! Prometheus metrics for holds, sweeps and payments.
//!
//! Components record through the small recorder structs at the bottom of this file;
//! [`MetricsServer`] installs the Prometheus recorder and, for the daemon, the
//! scrape endpoint.
//!
//! # Example
//!
//! ```rust,no_run
//! use seatkeeper_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.serve()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once served.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder without an HTTP endpoint (render via [`Self::render`]).
    ///
    /// # Errors
    ///
    /// Returns error if the exporter can't be built or installed. A recorder that is
    /// already installed (tests) is only warned about.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        match builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
                Ok(())
            }
            Err(e) => already_installed(&e.to_string()),
        }
    }

    /// Install the recorder and serve `/metrics` on the configured address.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter can't be built or installed.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        if let Err(e) = metrics::set_global_recorder(recorder) {
            return already_installed(&e.to_string());
        }
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder isn't ours.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

fn already_installed(message: &str) -> Result<(), MetricsError> {
    if message.contains("already") {
        tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
        Ok(())
    } else {
        Err(MetricsError::Install(message.to_string()))
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Reservation Engine
    describe_counter!(
        "seatkeeper_units_reserved_total",
        "Seats moved to Reserved (fresh holds and reclaimed stale holds)"
    );
    describe_counter!(
        "seatkeeper_reservation_conflicts_total",
        "Seats refused to a requester, by reason"
    );
    describe_counter!(
        "seatkeeper_units_released_total",
        "Seats returned to Available, by source"
    );
    describe_counter!("seatkeeper_slots_held_total", "Ticket-type slots granted");
    describe_counter!(
        "seatkeeper_insufficient_inventory_total",
        "Slot requests that got nothing"
    );

    // Expiry Reaper
    describe_counter!("seatkeeper_reaper_sweeps_total", "Completed reaper sweeps");
    describe_counter!(
        "seatkeeper_reaper_failures_total",
        "Records the reaper skipped because of an error"
    );
    describe_histogram!(
        "seatkeeper_reaper_sweep_duration_seconds",
        "Time taken by one reaper sweep"
    );

    // Payment/Ticket Binder
    describe_counter!(
        "seatkeeper_payments_total",
        "Payment status transitions applied, by resulting status"
    );
    describe_counter!(
        "seatkeeper_tickets_confirmed_total",
        "Tickets moved to Confirmed"
    );
    describe_counter!(
        "seatkeeper_consistency_violations_total",
        "Tickets whose inventory was gone at confirm time"
    );
    describe_counter!(
        "seatkeeper_duplicate_callbacks_total",
        "Gateway outcomes replayed for a payment already in that state"
    );
}

/// Reservation metrics recorder.
pub struct ReservationMetrics;

impl ReservationMetrics {
    /// Record seats moved to Reserved.
    pub fn record_reserved(count: usize) {
        counter!("seatkeeper_units_reserved_total").increment(count as u64);
    }

    /// Record one refused seat.
    pub fn record_conflict(reason: &'static str) {
        counter!("seatkeeper_reservation_conflicts_total", "reason" => reason).increment(1);
    }

    /// Record seats returned to Available.
    ///
    /// `source` is one of `release`, `expiry`, `lazy`, `payment_failed`.
    pub fn record_released(source: &'static str, count: usize) {
        if count > 0 {
            counter!("seatkeeper_units_released_total", "source" => source).increment(count as u64);
        }
    }

    /// Record slots granted from a pool.
    pub fn record_slots_held(count: u32) {
        counter!("seatkeeper_slots_held_total").increment(u64::from(count));
    }

    /// Record a slot request that got nothing.
    pub fn record_insufficient() {
        counter!("seatkeeper_insufficient_inventory_total").increment(1);
    }
}

/// Reaper metrics recorder.
pub struct ReaperMetrics;

impl ReaperMetrics {
    /// Record a finished sweep.
    pub fn record_sweep(duration: Duration) {
        counter!("seatkeeper_reaper_sweeps_total").increment(1);
        histogram!("seatkeeper_reaper_sweep_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a skipped record.
    pub fn record_failure() {
        counter!("seatkeeper_reaper_failures_total").increment(1);
    }
}

/// Binder metrics recorder.
pub struct BinderMetrics;

impl BinderMetrics {
    /// Record a payment transition.
    pub fn record_payment(status: &'static str) {
        counter!("seatkeeper_payments_total", "status" => status).increment(1);
    }

    /// Record tickets moved to Confirmed.
    pub fn record_confirmed(count: usize) {
        counter!("seatkeeper_tickets_confirmed_total").increment(count as u64);
    }

    /// Record tickets whose inventory was gone.
    pub fn record_violations(count: usize) {
        counter!("seatkeeper_consistency_violations_total").increment(count as u64);
    }

    /// Record a replayed gateway outcome.
    pub fn record_duplicate_callback() {
        counter!("seatkeeper_duplicate_callbacks_total").increment(1);
    }
}
