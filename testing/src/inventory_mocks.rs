//! In-memory Inventory Store.
//!
//! Provides fast, deterministic storage for engine, reaper and binder tests:
//! - one `tokio::sync::Mutex` per unit, so writers on different units never wait on each other
//! - one mutex per ticket-type pool, guarding its counters and slot holds together
//! - a single book for payments and tickets
//!
//! Failures can be injected per unit to exercise the transient-failure paths, and a
//! cancel can be slipped in ahead of a ticket's confirmation to exercise the race
//! between the two.

use seatkeeper_core::pool::TicketTypePool;
use seatkeeper_core::store::{
    InventoryStore, SlotCommit, SlotGrant, SlotRefusal, StatusChange, StoreError, StoreFuture,
    UnitTransition,
};
use seatkeeper_core::transition::{self, UnitCommand};
use seatkeeper_core::types::{
    CustomerId, HoldId, InventoryUnit, Payment, PaymentId, PaymentStatus, SlotHold, Ticket,
    TicketBinding, TicketId, TicketStatus, TicketTypeId, UnitId, UnitStatus,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug)]
struct PoolEntry {
    pool: TicketTypePool,
    holds: HashMap<HoldId, SlotHold>,
    committed: HashSet<TicketId>,
}

impl PoolEntry {
    /// Drop expired holds and return their slots. Returns `(slots, removed hold ids)`.
    fn purge_expired(&mut self, now: DateTime<Utc>, limit: u32) -> (u32, Vec<HoldId>) {
        let mut expired: Vec<&SlotHold> = self
            .holds
            .values()
            .filter(|hold| hold.expires_at < now)
            .collect();
        expired.sort_by_key(|hold| hold.expires_at);
        let expired: Vec<HoldId> = expired
            .into_iter()
            .take(limit as usize)
            .map(|hold| hold.id)
            .collect();

        let mut slots = 0;
        for id in &expired {
            if let Some(hold) = self.holds.remove(id) {
                slots += self.pool.release_held(hold.quantity);
            }
        }
        (slots, expired)
    }
}

#[derive(Debug, Default)]
struct Book {
    payments: HashMap<PaymentId, Payment>,
    by_external_order: HashMap<String, PaymentId>,
    transaction_ids: HashSet<String>,
    tickets: HashMap<TicketId, Ticket>,
    by_payment: HashMap<PaymentId, Vec<TicketId>>,
    ticket_numbers: HashSet<String>,
    cancel_before_confirm: HashSet<TicketId>,
}

impl Book {
    /// The key under which `ticket` is already bound to another Pending checkout, if any
    fn pending_binding(&self, ticket: &Ticket) -> Option<StoreError> {
        let bound = self.tickets.values().any(|other| {
            other.status == TicketStatus::Pending
                && other.binding == ticket.binding
                && (matches!(ticket.binding, TicketBinding::Slot { .. }) || other.attendee == ticket.attendee)
                && self
                    .payments
                    .get(&other.payment_id)
                    .is_some_and(|payment| payment.status == PaymentStatus::Pending)
        });
        if !bound {
            return None;
        }
        Some(match ticket.binding {
            TicketBinding::Seat { unit_id } => StoreError::in_checkout("seat", unit_id),
            TicketBinding::Slot { hold_id, .. } => StoreError::in_checkout("slot hold", hold_id),
        })
    }
}

#[derive(Debug, Default)]
struct Inner {
    units: RwLock<HashMap<UnitId, Arc<Mutex<InventoryUnit>>>>,
    pools: RwLock<HashMap<TicketTypeId, Arc<Mutex<PoolEntry>>>>,
    hold_index: RwLock<HashMap<HoldId, TicketTypeId>>,
    book: Mutex<Book>,
    failing_units: RwLock<HashSet<UnitId>>,
}

/// In-memory Inventory Store for fast, deterministic testing.
///
/// Clones share the same underlying data.
///
/// # Example
///
/// ```
/// use seatkeeper_testing::InMemoryInventoryStore;
/// use seatkeeper_core::store::InventoryStore;
/// use seatkeeper_core::types::{InventoryUnit, Money, UnitId};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryInventoryStore::new();
/// let id = UnitId::new();
/// store.insert_unit(InventoryUnit::available(id, "Orchestra", "A-1", Money::from_cents(5_000))).await?;
///
/// assert!(store.load_unit(id).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryInventoryStore {
    inner: Arc<Inner>,
}

impl InMemoryInventoryStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every transition on `id` fail with `StoreError::Unavailable` until cleared
    pub async fn inject_unit_failure(&self, id: UnitId) {
        self.inner.failing_units.write().await.insert(id);
    }

    /// Stop failing transitions on `id`
    pub async fn clear_unit_failure(&self, id: UnitId) {
        self.inner.failing_units.write().await.remove(&id);
    }

    /// Cancel `id` just before its next Pending → Confirmed change, as if the attendee
    /// got there first
    pub async fn inject_cancel_before_confirm(&self, id: TicketId) {
        self.inner.book.lock().await.cancel_before_confirm.insert(id);
    }

    /// Every unit, for assertions
    pub async fn units(&self) -> Vec<InventoryUnit> {
        let handles: Vec<_> = self.inner.units.read().await.values().cloned().collect();
        let mut units = Vec::with_capacity(handles.len());
        for handle in handles {
            units.push(handle.lock().await.clone());
        }
        units
    }

    /// Number of units currently in `status`
    pub async fn count_with_status(&self, status: UnitStatus) -> usize {
        self.units()
            .await
            .iter()
            .filter(|unit| unit.status() == status)
            .count()
    }

    /// Live and expired slot holds on a pool, for assertions
    pub async fn slot_holds(&self, ticket_type_id: TicketTypeId) -> Vec<SlotHold> {
        let Some(entry) = self.pool_entry(ticket_type_id).await else {
            return Vec::new();
        };
        let entry = entry.lock().await;
        entry.holds.values().cloned().collect()
    }

    async fn unit_handle(&self, id: UnitId) -> Option<Arc<Mutex<InventoryUnit>>> {
        self.inner.units.read().await.get(&id).cloned()
    }

    async fn pool_entry(&self, id: TicketTypeId) -> Option<Arc<Mutex<PoolEntry>>> {
        self.inner.pools.read().await.get(&id).cloned()
    }
}

impl InventoryStore for InMemoryInventoryStore {
    fn insert_unit(&self, unit: InventoryUnit) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut units = self.inner.units.write().await;
            if units.contains_key(&unit.id()) {
                return Err(StoreError::duplicate("unit", unit.id()));
            }
            units.insert(unit.id(), Arc::new(Mutex::new(unit)));
            Ok(())
        })
    }

    fn load_unit(&self, id: UnitId) -> StoreFuture<'_, Option<InventoryUnit>> {
        Box::pin(async move {
            match self.unit_handle(id).await {
                Some(handle) => Ok(Some(handle.lock().await.clone())),
                None => Ok(None),
            }
        })
    }

    fn units_in_section<'a>(&'a self, section: &'a str) -> StoreFuture<'a, Vec<InventoryUnit>> {
        Box::pin(async move {
            let mut section_units: Vec<_> = self
                .units()
                .await
                .into_iter()
                .filter(|unit| unit.section() == section)
                .collect();
            section_units.sort_by(|a, b| a.label().cmp(b.label()));
            Ok(section_units)
        })
    }

    fn transition_unit(
        &self,
        id: UnitId,
        command: UnitCommand,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, UnitTransition> {
        Box::pin(async move {
            if self.inner.failing_units.read().await.contains(&id) {
                return Err(StoreError::Unavailable(format!("injected failure on unit {id}")));
            }
            let handle = self
                .unit_handle(id)
                .await
                .ok_or_else(|| StoreError::not_found("unit", id))?;

            let mut unit = handle.lock().await;
            let result = transition::apply(&mut unit, &command, now);
            Ok(UnitTransition {
                unit: unit.clone(),
                result,
            })
        })
    }

    fn expired_units(&self, now: DateTime<Utc>, limit: u32) -> StoreFuture<'_, Vec<UnitId>> {
        Box::pin(async move {
            let handles: Vec<_> = self.inner.units.read().await.values().cloned().collect();
            let mut expired = Vec::new();
            for handle in handles {
                let unit = handle.lock().await;
                if !unit.has_stale_hold(now) {
                    continue;
                }
                if let Some(until) = unit.reserved_until() {
                    expired.push((until, unit.id()));
                }
            }
            expired.sort();
            Ok(expired
                .into_iter()
                .take(limit as usize)
                .map(|(_, id)| id)
                .collect())
        })
    }

    fn insert_pool(&self, pool: TicketTypePool) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut pools = self.inner.pools.write().await;
            if pools.contains_key(&pool.id()) {
                return Err(StoreError::duplicate("ticket type", pool.id()));
            }
            pools.insert(
                pool.id(),
                Arc::new(Mutex::new(PoolEntry {
                    pool,
                    holds: HashMap::new(),
                    committed: HashSet::new(),
                })),
            );
            Ok(())
        })
    }

    fn load_pool(&self, id: TicketTypeId) -> StoreFuture<'_, Option<TicketTypePool>> {
        Box::pin(async move {
            match self.pool_entry(id).await {
                Some(entry) => Ok(Some(entry.lock().await.pool.clone())),
                None => Ok(None),
            }
        })
    }

    fn hold_slots(
        &self,
        ticket_type_id: TicketTypeId,
        holder: CustomerId,
        requested: u32,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, SlotGrant> {
        Box::pin(async move {
            let entry = self
                .pool_entry(ticket_type_id)
                .await
                .ok_or_else(|| StoreError::not_found("ticket type", ticket_type_id))?;
            let mut entry = entry.lock().await;

            let (reclaimed, purged) = entry.purge_expired(now, u32::MAX);
            let available = entry.pool.available();
            let granted = entry.pool.hold(requested);

            let hold = (granted > 0).then(|| SlotHold {
                id: HoldId::new(),
                ticket_type_id,
                holder,
                quantity: granted,
                expires_at,
                created_at: now,
            });

            let mut index = self.inner.hold_index.write().await;
            for id in purged {
                index.remove(&id);
            }
            if let Some(hold) = &hold {
                entry.holds.insert(hold.id, hold.clone());
                index.insert(hold.id, ticket_type_id);
            }

            Ok(SlotGrant {
                hold,
                granted,
                available,
                reclaimed,
            })
        })
    }

    fn load_slot_hold(&self, id: HoldId) -> StoreFuture<'_, Option<SlotHold>> {
        Box::pin(async move {
            let Some(ticket_type_id) = self.inner.hold_index.read().await.get(&id).copied() else {
                return Ok(None);
            };
            let Some(entry) = self.pool_entry(ticket_type_id).await else {
                return Ok(None);
            };
            let entry = entry.lock().await;
            Ok(entry.holds.get(&id).cloned())
        })
    }

    fn release_slots(&self, hold_id: HoldId, count: u32) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let Some(ticket_type_id) = self.inner.hold_index.read().await.get(&hold_id).copied()
            else {
                return Ok(0);
            };
            let Some(entry) = self.pool_entry(ticket_type_id).await else {
                return Ok(0);
            };
            let mut entry = entry.lock().await;

            let Some(hold) = entry.holds.get_mut(&hold_id) else {
                return Ok(0);
            };
            let take = count.min(hold.quantity);
            hold.quantity -= take;
            let emptied = hold.quantity == 0;
            if emptied {
                entry.holds.remove(&hold_id);
            }
            let released = entry.pool.release_held(take);
            if emptied {
                self.inner.hold_index.write().await.remove(&hold_id);
            }
            Ok(released)
        })
    }

    fn commit_slot(
        &self,
        ticket_type_id: TicketTypeId,
        hold_id: HoldId,
        ticket_id: TicketId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, SlotCommit> {
        Box::pin(async move {
            let entry = self
                .pool_entry(ticket_type_id)
                .await
                .ok_or_else(|| StoreError::not_found("ticket type", ticket_type_id))?;
            let mut entry = entry.lock().await;

            if entry.committed.contains(&ticket_id) {
                return Ok(SlotCommit::AlreadyCommitted);
            }
            let Some(hold) = entry.holds.get_mut(&hold_id) else {
                return Ok(SlotCommit::Refused(SlotRefusal::HoldMissing(hold_id)));
            };
            if !hold.is_live(now) {
                return Ok(SlotCommit::Refused(SlotRefusal::HoldExpired {
                    expired_at: hold.expires_at,
                }));
            }
            if hold.quantity == 0 {
                return Ok(SlotCommit::Refused(SlotRefusal::HoldExhausted(hold_id)));
            }

            hold.quantity -= 1;
            let emptied = hold.quantity == 0;
            if emptied {
                entry.holds.remove(&hold_id);
            }
            entry.pool.commit_held();
            entry.committed.insert(ticket_id);
            if emptied {
                self.inner.hold_index.write().await.remove(&hold_id);
            }
            Ok(SlotCommit::Committed)
        })
    }

    fn refund_slot(
        &self,
        ticket_type_id: TicketTypeId,
        ticket_id: TicketId,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let entry = self
                .pool_entry(ticket_type_id)
                .await
                .ok_or_else(|| StoreError::not_found("ticket type", ticket_type_id))?;
            let mut entry = entry.lock().await;

            if !entry.committed.remove(&ticket_id) {
                return Ok(false);
            }
            Ok(entry.pool.uncommit_sold())
        })
    }

    fn sweep_expired_slot_holds(&self, now: DateTime<Utc>, limit: u32) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let entries: Vec<_> = self.inner.pools.read().await.values().cloned().collect();
            let mut remaining = limit;
            let mut returned = 0;
            for entry in entries {
                if remaining == 0 {
                    break;
                }
                let mut entry = entry.lock().await;
                let (slots, purged) = entry.purge_expired(now, remaining);
                remaining = remaining.saturating_sub(u32::try_from(purged.len()).unwrap_or(u32::MAX));
                returned += slots;

                let mut index = self.inner.hold_index.write().await;
                for id in purged {
                    index.remove(&id);
                }
            }
            Ok(returned)
        })
    }

    fn insert_checkout(&self, payment: Payment, tickets: Vec<Ticket>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut book = self.inner.book.lock().await;
            if book.payments.contains_key(&payment.id) {
                return Err(StoreError::duplicate("payment", payment.id));
            }
            if book.transaction_ids.contains(&payment.transaction_id) {
                return Err(StoreError::duplicate("transaction", &payment.transaction_id));
            }
            let mut numbers = HashSet::new();
            for ticket in &tickets {
                let number = ticket.ticket_number.as_str();
                if book.ticket_numbers.contains(number) || !numbers.insert(number) {
                    return Err(StoreError::duplicate("ticket number", number));
                }
                if let Some(bound) = book.pending_binding(ticket) {
                    return Err(bound);
                }
            }

            book.transaction_ids.insert(payment.transaction_id.clone());
            let ids = tickets.iter().map(|ticket| ticket.id).collect();
            for ticket in tickets {
                book.ticket_numbers.insert(ticket.ticket_number.as_str().to_string());
                book.tickets.insert(ticket.id, ticket);
            }
            book.by_payment.insert(payment.id, ids);
            book.payments.insert(payment.id, payment);
            Ok(())
        })
    }

    fn load_payment(&self, id: PaymentId) -> StoreFuture<'_, Option<Payment>> {
        Box::pin(async move { Ok(self.inner.book.lock().await.payments.get(&id).cloned()) })
    }

    fn find_payment_by_external_order<'a>(
        &'a self,
        external_order_id: &'a str,
    ) -> StoreFuture<'a, Option<Payment>> {
        Box::pin(async move {
            let book = self.inner.book.lock().await;
            Ok(book
                .by_external_order
                .get(external_order_id)
                .and_then(|id| book.payments.get(id))
                .cloned())
        })
    }

    fn set_external_order(
        &self,
        id: PaymentId,
        external_order_id: String,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Payment> {
        Box::pin(async move {
            let mut book = self.inner.book.lock().await;
            if book
                .by_external_order
                .get(&external_order_id)
                .is_some_and(|owner| *owner != id)
            {
                return Err(StoreError::duplicate("external order", external_order_id));
            }

            let payment = book
                .payments
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("payment", id))?;
            let previous = payment.external_order_id.replace(external_order_id.clone());
            payment.updated_at = now;
            let payment = payment.clone();

            if let Some(previous) = previous {
                book.by_external_order.remove(&previous);
            }
            book.by_external_order.insert(external_order_id, id);
            Ok(payment)
        })
    }

    fn transition_payment(
        &self,
        id: PaymentId,
        expected: PaymentStatus,
        to: PaymentStatus,
        receipt: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, StatusChange<Payment>> {
        Box::pin(async move {
            let mut book = self.inner.book.lock().await;
            let payment = book
                .payments
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("payment", id))?;

            if payment.status != expected {
                return Ok(StatusChange::Unchanged(payment.clone()));
            }
            payment.status = to;
            if receipt.is_some() {
                payment.external_receipt_id = receipt;
            }
            payment.updated_at = now;
            Ok(StatusChange::Applied(payment.clone()))
        })
    }

    fn tickets_for_payment(&self, payment_id: PaymentId) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let book = self.inner.book.lock().await;
            Ok(book
                .by_payment
                .get(&payment_id)
                .into_iter()
                .flatten()
                .filter_map(|id| book.tickets.get(id).cloned())
                .collect())
        })
    }

    fn load_ticket(&self, id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async move { Ok(self.inner.book.lock().await.tickets.get(&id).cloned()) })
    }

    fn transition_ticket(
        &self,
        id: TicketId,
        expected: TicketStatus,
        to: TicketStatus,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, StatusChange<Ticket>> {
        Box::pin(async move {
            let mut book = self.inner.book.lock().await;
            let raced = expected == TicketStatus::Pending
                && to == TicketStatus::Confirmed
                && book.cancel_before_confirm.remove(&id);
            let ticket = book
                .tickets
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("ticket", id))?;

            if raced {
                ticket.status = TicketStatus::Cancelled;
                ticket.updated_at = now;
            }
            if ticket.status != expected {
                return Ok(StatusChange::Unchanged(ticket.clone()));
            }
            ticket.status = to;
            if to == TicketStatus::Used {
                ticket.used_at = Some(now);
            }
            ticket.updated_at = now;
            Ok(StatusChange::Applied(ticket.clone()))
        })
    }
}
