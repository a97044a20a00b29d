//! Reservation Engine.
//!
//! Places and releases holds on seats and ticket-type slots. Every unit is moved
//! through [`InventoryStore::transition_unit`], which serializes writers per unit;
//! the engine itself never retries, so the order of accepted transitions on a unit
//! is the order in which writers got hold of it.
//!
//! Batches are fault-isolated per unit: a request for three seats where one is
//! taken grants two and reports one conflict. Nothing is rolled back.

use crate::error::EngineError;
use crate::metrics::ReservationMetrics;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use seatkeeper_core::environment::Clock;
use seatkeeper_core::store::{InventoryStore, StoreError, UnitTransition};
use seatkeeper_core::transition::{Refusal, TransitionOutcome, UnitCommand};
use seatkeeper_core::types::{CustomerId, HoldId, InventoryUnit, Money, TicketTypeId, UnitId, UnitStatus};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default hold duration (10 minutes)
pub const DEFAULT_HOLD: Duration = Duration::from_secs(600);

/// Engine settings.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Hold duration used when the caller doesn't pass one
    pub default_hold: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_hold: DEFAULT_HOLD,
        }
    }
}

/// Why a unit wasn't granted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConflictReason {
    /// No unit with that id
    NotFound,
    /// The state machine refused (live hold by someone else, sold, blocked)
    Refused(Refusal),
    /// The store failed for this one unit
    StoreFailure(StoreError),
}

impl ConflictReason {
    /// Stable label for metrics
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Refused(refusal) => refusal.code(),
            Self::StoreFailure(err) if err.is_transient() => "store_unavailable",
            Self::StoreFailure(_) => "store_error",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused(refusal) => write!(f, "{refusal}"),
            other => f.write_str(other.code()),
        }
    }
}

/// A unit that wasn't granted, and why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    /// The unit
    pub unit_id: UnitId,
    /// Why it wasn't granted
    pub reason: ConflictReason,
}

/// Result of [`ReservationEngine::reserve_seats`]. Always partial: inspect `conflicts`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReserveOutcome {
    /// Units the requester now holds (including ones it already held)
    pub granted: Vec<UnitId>,
    /// Subset of `granted` the requester already held; their expiry is unchanged
    pub already_held: Vec<UnitId>,
    /// Units not granted
    pub conflicts: Vec<Conflict>,
    /// Expiry of the holds placed by this call
    pub expires_at: DateTime<Utc>,
}

impl ReserveOutcome {
    /// Whether every requested unit was granted
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Result of [`ReservationEngine::block_units`] / [`ReservationEngine::unblock_units`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    /// Units whose status changed
    pub changed: Vec<UnitId>,
    /// Units left as they were because they already were in the target status
    pub unchanged: Vec<UnitId>,
    /// Units that couldn't be moved
    pub conflicts: Vec<Conflict>,
}

/// A granted slot hold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotReservation {
    /// Hold to reference at checkout
    pub hold_id: HoldId,
    /// Pool the slots came from
    pub ticket_type_id: TicketTypeId,
    /// Slots asked for
    pub requested: u32,
    /// Slots granted (`min(requested, available)`)
    pub granted: u32,
    /// Hold expiry
    pub expires_at: DateTime<Utc>,
}

/// One seat as shown on a section map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatAvailability {
    /// The seat
    pub unit_id: UnitId,
    /// Label within its section (`A-12`)
    pub label: String,
    /// Price
    pub price: Money,
    /// Status a new request would see: a stale hold shows as Available
    pub status: UnitStatus,
    /// Expiry of the live hold on a Reserved seat
    pub held_until: Option<DateTime<Utc>>,
}

impl SeatAvailability {
    fn of(unit: &InventoryUnit, now: DateTime<Utc>) -> Self {
        let stale = unit.has_stale_hold(now);
        Self {
            unit_id: unit.id(),
            label: unit.label().to_string(),
            price: unit.price(),
            status: if stale { UnitStatus::Available } else { unit.status() },
            held_until: if stale { None } else { unit.reserved_until() },
        }
    }
}

/// Places and releases holds.
#[derive(Clone)]
pub struct ReservationEngine {
    store: Arc<dyn InventoryStore>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl ReservationEngine {
    /// Create an engine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn InventoryStore>, clock: Arc<dyn Clock>, settings: EngineSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// Engine settings
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Hold each of `unit_ids` for `requester`.
    ///
    /// Available units and units with a stale hold are granted; units the requester
    /// already holds are granted again without touching their expiry. Everything else
    /// becomes a conflict. Duplicate ids are treated once.
    ///
    /// # Errors
    ///
    /// Only `InvalidHoldDuration`. Per-unit problems are reported in the outcome.
    pub async fn reserve_seats(
        &self,
        requester: CustomerId,
        unit_ids: &[UnitId],
        hold: Option<Duration>,
    ) -> Result<ReserveOutcome, EngineError> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, hold)?;

        let ids = dedupe(unit_ids);
        let command = UnitCommand::Reserve {
            holder: requester,
            until: expires_at,
        };
        let results = self.apply_each(&ids, &command, now).await;

        let mut outcome = ReserveOutcome {
            granted: Vec::with_capacity(ids.len()),
            already_held: Vec::new(),
            conflicts: Vec::new(),
            expires_at,
        };
        let mut reclaimed = 0;

        for (unit_id, result) in results {
            match result {
                Ok(UnitTransition {
                    result: Ok(TransitionOutcome::Applied { reclaimed_stale, .. }),
                    ..
                }) => {
                    if reclaimed_stale {
                        debug!(unit_id = %unit_id, "Reclaimed stale hold");
                        reclaimed += 1;
                    }
                    outcome.granted.push(unit_id);
                }
                Ok(UnitTransition {
                    result: Ok(TransitionOutcome::Unchanged),
                    ..
                }) => {
                    debug!(unit_id = %unit_id, requester = %requester, "Unit already held by requester");
                    outcome.granted.push(unit_id);
                    outcome.already_held.push(unit_id);
                }
                Ok(UnitTransition {
                    result: Err(refusal), ..
                }) => {
                    debug!(unit_id = %unit_id, reason = %refusal, "Reservation refused");
                    outcome.conflicts.push(Conflict {
                        unit_id,
                        reason: ConflictReason::Refused(refusal),
                    });
                }
                Err(err) => outcome.conflicts.push(Conflict {
                    unit_id,
                    reason: store_conflict(unit_id, err),
                }),
            }
        }

        let fresh = outcome.granted.len() - outcome.already_held.len();
        ReservationMetrics::record_reserved(fresh);
        ReservationMetrics::record_released("lazy", reclaimed);
        for conflict in &outcome.conflicts {
            ReservationMetrics::record_conflict(conflict.reason.code());
        }

        if outcome.conflicts.is_empty() {
            info!(
                requester = %requester,
                granted = outcome.granted.len(),
                expires_at = %expires_at,
                "Seats reserved"
            );
        } else {
            warn!(
                requester = %requester,
                granted = outcome.granted.len(),
                conflicts = outcome.conflicts.len(),
                "Seats partially reserved"
            );
        }

        Ok(outcome)
    }

    /// Release `unit_ids` back to Available, whoever holds them.
    ///
    /// Idempotent: units that aren't Reserved are skipped. Returns the ids that
    /// actually moved. Units the store fails on are logged and skipped.
    pub async fn release_seats(&self, requester: CustomerId, unit_ids: &[UnitId]) -> Vec<UnitId> {
        let now = self.clock.now();
        let ids = dedupe(unit_ids);
        let results = self.apply_each(&ids, &UnitCommand::Release, now).await;

        let mut released = Vec::new();
        for (unit_id, result) in results {
            match result {
                Ok(UnitTransition {
                    result: Ok(TransitionOutcome::Applied { .. }),
                    ..
                }) => released.push(unit_id),
                Ok(_) => debug!(unit_id = %unit_id, "Release was a no-op"),
                Err(StoreError::NotFound { .. }) => debug!(unit_id = %unit_id, "Release of unknown unit"),
                Err(err) => error!(unit_id = %unit_id, error = %err, "Failed to release unit"),
            }
        }

        ReservationMetrics::record_released("release", released.len());
        info!(requester = %requester, released = released.len(), "Seats released");
        released
    }

    /// The seats of `section` ordered by label, with the status each would show a new
    /// request. Nothing is written: stale holds are only reported as Available.
    ///
    /// # Errors
    ///
    /// Store failure.
    pub async fn section_availability(&self, section: &str) -> Result<Vec<SeatAvailability>, EngineError> {
        let now = self.clock.now();
        let units = self.store.units_in_section(section).await?;
        debug!(section, units = units.len(), "Section listed");
        Ok(units.iter().map(|unit| SeatAvailability::of(unit, now)).collect())
    }

    /// Hold up to `quantity` slots of a ticket-type pool for `requester`.
    ///
    /// Grants `min(quantity, available)` after reclaiming the pool's expired holds.
    ///
    /// # Errors
    ///
    /// - `ZeroQuantity` / `InvalidHoldDuration` for bad input
    /// - `TicketTypeNotFound` for an unknown pool
    /// - `InsufficientInventory` when nothing could be granted
    pub async fn reserve_slots(
        &self,
        requester: CustomerId,
        ticket_type_id: TicketTypeId,
        quantity: u32,
        hold: Option<Duration>,
    ) -> Result<SlotReservation, EngineError> {
        if quantity == 0 {
            return Err(EngineError::ZeroQuantity);
        }
        let now = self.clock.now();
        let expires_at = self.expiry(now, hold)?;

        let grant = self
            .store
            .hold_slots(ticket_type_id, requester, quantity, expires_at, now)
            .await
            .map_err(|err| match err {
                StoreError::NotFound { .. } => EngineError::TicketTypeNotFound(ticket_type_id),
                other => EngineError::Store(other),
            })?;

        if grant.reclaimed > 0 {
            debug!(ticket_type_id = %ticket_type_id, slots = grant.reclaimed, "Reclaimed expired slot holds");
        }

        let Some(hold) = grant.hold else {
            warn!(
                ticket_type_id = %ticket_type_id,
                requester = %requester,
                requested = quantity,
                available = grant.available,
                "Insufficient inventory"
            );
            ReservationMetrics::record_insufficient();
            return Err(EngineError::InsufficientInventory {
                requested: quantity,
                available: grant.available,
            });
        };

        ReservationMetrics::record_slots_held(grant.granted);
        info!(
            ticket_type_id = %ticket_type_id,
            requester = %requester,
            hold_id = %hold.id,
            requested = quantity,
            granted = grant.granted,
            "Slots reserved"
        );

        Ok(SlotReservation {
            hold_id: hold.id,
            ticket_type_id,
            requested: quantity,
            granted: grant.granted,
            expires_at,
        })
    }

    /// Release the remaining slots of a slot hold owned by `requester`.
    ///
    /// Releasing a hold that no longer exists returns 0.
    ///
    /// # Errors
    ///
    /// `HoldNotFound` if the hold belongs to another requester.
    pub async fn release_slots(&self, requester: CustomerId, hold_id: HoldId) -> Result<u32, EngineError> {
        let Some(hold) = self.store.load_slot_hold(hold_id).await? else {
            debug!(hold_id = %hold_id, "Release of missing slot hold");
            return Ok(0);
        };
        if hold.holder != requester {
            return Err(EngineError::HoldNotFound(hold_id));
        }

        let released = self.store.release_slots(hold_id, hold.quantity).await?;
        info!(hold_id = %hold_id, requester = %requester, released, "Slots released");
        Ok(released)
    }

    /// Withhold available units from sale.
    pub async fn block_units(&self, unit_ids: &[UnitId]) -> BlockOutcome {
        self.set_blocked(unit_ids, UnitCommand::Block).await
    }

    /// Return blocked units to sale.
    pub async fn unblock_units(&self, unit_ids: &[UnitId]) -> BlockOutcome {
        self.set_blocked(unit_ids, UnitCommand::Unblock).await
    }

    async fn set_blocked(&self, unit_ids: &[UnitId], command: UnitCommand) -> BlockOutcome {
        let now = self.clock.now();
        let ids = dedupe(unit_ids);
        let name = command.name();
        let results = self.apply_each(&ids, &command, now).await;

        let mut outcome = BlockOutcome::default();
        for (unit_id, result) in results {
            match result {
                Ok(UnitTransition {
                    result: Ok(TransitionOutcome::Applied { .. }),
                    ..
                }) => outcome.changed.push(unit_id),
                Ok(UnitTransition {
                    result: Ok(TransitionOutcome::Unchanged),
                    ..
                }) => outcome.unchanged.push(unit_id),
                Ok(UnitTransition {
                    result: Err(refusal), ..
                }) => outcome.conflicts.push(Conflict {
                    unit_id,
                    reason: ConflictReason::Refused(refusal),
                }),
                Err(err) => outcome.conflicts.push(Conflict {
                    unit_id,
                    reason: store_conflict(unit_id, err),
                }),
            }
        }

        info!(
            command = name,
            changed = outcome.changed.len(),
            conflicts = outcome.conflicts.len(),
            "Block status updated"
        );
        outcome
    }

    /// Run one command per unit. Units are independent, so they run concurrently;
    /// the store serializes writers on the same unit.
    async fn apply_each(
        &self,
        ids: &[UnitId],
        command: &UnitCommand,
        now: DateTime<Utc>,
    ) -> Vec<(UnitId, Result<UnitTransition, StoreError>)> {
        let futures = ids.iter().map(|&id| {
            let command = command.clone();
            async move { (id, self.store.transition_unit(id, command, now).await) }
        });
        join_all(futures).await
    }

    fn expiry(&self, now: DateTime<Utc>, hold: Option<Duration>) -> Result<DateTime<Utc>, EngineError> {
        let hold = hold.unwrap_or(self.settings.default_hold);
        if hold.is_zero() {
            return Err(EngineError::InvalidHoldDuration(hold));
        }
        chrono::Duration::from_std(hold)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .ok_or(EngineError::InvalidHoldDuration(hold))
    }
}

fn store_conflict(unit_id: UnitId, err: StoreError) -> ConflictReason {
    match err {
        StoreError::NotFound { .. } => ConflictReason::NotFound,
        other => {
            error!(unit_id = %unit_id, error = %other, "Store failure on unit");
            ConflictReason::StoreFailure(other)
        }
    }
}

fn dedupe(ids: &[UnitId]) -> SmallVec<[UnitId; 8]> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
