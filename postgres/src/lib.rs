//! `PostgreSQL` inventory store for Seatkeeper.
//!
//! Implements [`InventoryStore`] over sqlx. Per-unit serialization comes from row
//! locks: every transition runs in its own transaction that first takes
//! `SELECT … FOR UPDATE` on the unit (or pool) row, applies the pure state machine
//! from `seatkeeper-core`, writes the result and commits. Writers on different rows
//! never wait on each other.
//!
//! Pool operations lock the `ticket_types` row before touching any `slot_holds` row,
//! so two pool writers can't deadlock.
//!
//! # Example
//!
//! ```ignore
//! use seatkeeper_postgres::{ConnectionSettings, PostgresInventoryStore};
//!
//! let store = PostgresInventoryStore::connect(
//!     "postgres://localhost/seatkeeper",
//!     &ConnectionSettings::default(),
//! )
//! .await?;
//! store.migrate().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod rows;

use chrono::{DateTime, Utc};
use rows::{
    HOLD_COLUMNS, PAYMENT_COLUMNS, POOL_COLUMNS, TICKET_COLUMNS, UNIT_COLUMNS, binding_columns, db_error,
    to_cents, to_count, unique_violation,
};
use seatkeeper_core::pool::TicketTypePool;
use seatkeeper_core::store::{
    InventoryStore, SlotCommit, SlotGrant, SlotRefusal, StatusChange, StoreError, StoreFuture,
    UnitTransition,
};
use seatkeeper_core::transition::{self, TransitionOutcome, UnitCommand};
use seatkeeper_core::types::{
    CustomerId, HoldId, InventoryUnit, Payment, PaymentId, PaymentStatus, SlotHold, Ticket,
    TicketBinding, TicketId, TicketStatus, TicketTypeId, UnitId,
};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Uuid;
use sqlx::Row;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Connection pool sizing.
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    /// Maximum pooled connections
    pub max_connections: u32,
    /// Connections kept open when idle
    pub min_connections: u32,
    /// How long to wait for a free connection
    pub acquire_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Durable [`InventoryStore`] on `PostgreSQL`.
#[derive(Clone, Debug)]
pub struct PostgresInventoryStore {
    pool: PgPool,
}

impl PostgresInventoryStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database can't be reached.
    pub async fn connect(database_url: &str, settings: &ConnectionSettings) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect: {e}")))?;

        info!(
            max_connections = settings.max_connections,
            min_connections = settings.min_connections,
            "Connected to inventory database"
        );
        Ok(Self::new(pool))
    }

    /// Run the embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Migration failed: {e}")))?;
        info!("Inventory migrations applied");
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_pool(conn: &mut PgConnection, id: TicketTypeId) -> Result<Option<TicketTypePool>, StoreError> {
        let row = sqlx::query(&format!("SELECT {POOL_COLUMNS} FROM ticket_types WHERE id = $1 FOR UPDATE"))
            .bind(*id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error)?;
        row.as_ref().map(rows::pool_from_row).transpose()
    }

    async fn save_counters(conn: &mut PgConnection, pool: &TicketTypePool, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE ticket_types SET sold = $2, held = $3, updated_at = $4 WHERE id = $1")
            .bind(*pool.id().as_uuid())
            .bind(to_count(pool.sold())?)
            .bind(to_count(pool.held())?)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    /// Lock the seats and slot holds `tickets` bind, then look for a Pending ticket of
    /// another Pending payment already bound to one of them.
    async fn find_pending_binding(
        conn: &mut PgConnection,
        payer: CustomerId,
        tickets: &[Ticket],
    ) -> Result<Option<StoreError>, StoreError> {
        let mut unit_ids = Vec::new();
        let mut hold_ids = Vec::new();
        for ticket in tickets {
            match ticket.binding {
                TicketBinding::Seat { unit_id } => unit_ids.push(*unit_id.as_uuid()),
                TicketBinding::Slot { hold_id, .. } => hold_ids.push(*hold_id.as_uuid()),
            }
        }
        unit_ids.sort_unstable();
        unit_ids.dedup();
        hold_ids.sort_unstable();
        hold_ids.dedup();

        // Serializes concurrent checkouts over the same seat or hold
        sqlx::query("SELECT id FROM inventory_units WHERE id = ANY($1) ORDER BY id FOR UPDATE")
            .bind(&unit_ids)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error)?;
        sqlx::query("SELECT id FROM slot_holds WHERE id = ANY($1) ORDER BY id FOR UPDATE")
            .bind(&hold_ids)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error)?;

        let row = sqlx::query(
            r"
            SELECT t.unit_id, t.hold_id
            FROM tickets t
            JOIN payments p ON p.id = t.payment_id
            WHERE t.status = 'pending' AND p.status = 'pending'
              AND ((t.unit_id = ANY($1) AND t.attendee = $3) OR t.hold_id = ANY($2))
            LIMIT 1
            ",
        )
        .bind(&unit_ids)
        .bind(&hold_ids)
        .bind(*payer.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let unit_id: Option<Uuid> = row.try_get("unit_id").map_err(db_error)?;
        let hold_id: Option<Uuid> = row.try_get("hold_id").map_err(db_error)?;
        Ok(Some(match (unit_id, hold_id) {
            (Some(unit_id), _) => StoreError::in_checkout("seat", UnitId::from_uuid(unit_id)),
            (None, Some(hold_id)) => StoreError::in_checkout("slot hold", HoldId::from_uuid(hold_id)),
            (None, None) => StoreError::Corrupt("pending ticket without a binding".to_string()),
        }))
    }

    async fn fetch_payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.as_ref().map(rows::payment_from_row).transpose()
    }

    async fn fetch_ticket(&self, id: TicketId) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.as_ref().map(rows::ticket_from_row).transpose()
    }
}

impl InventoryStore for PostgresInventoryStore {
    fn insert_unit(&self, unit: InventoryUnit) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let id = unit.id();
            let parts = unit.into_parts();
            sqlx::query(
                r"
                INSERT INTO inventory_units
                    (id, section, label, price_cents, status, reserved_by, reserved_until, sold_to)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(*id.as_uuid())
            .bind(&parts.section)
            .bind(&parts.label)
            .bind(to_cents(parts.price)?)
            .bind(parts.status.as_str())
            .bind(parts.reserved_by.map(|c| *c.as_uuid()))
            .bind(parts.reserved_until)
            .bind(parts.sold_to.map(|t| *t.as_uuid()))
            .execute(&self.pool)
            .await
            .map_err(|e| match unique_violation(&e) {
                Some(_) => StoreError::duplicate("unit", id),
                None => db_error(e),
            })?;
            Ok(())
        })
    }

    fn load_unit(&self, id: UnitId) -> StoreFuture<'_, Option<InventoryUnit>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {UNIT_COLUMNS} FROM inventory_units WHERE id = $1"))
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
            row.as_ref().map(rows::unit_from_row).transpose()
        })
    }

    fn units_in_section<'a>(&'a self, section: &'a str) -> StoreFuture<'a, Vec<InventoryUnit>> {
        Box::pin(async move {
            let found = sqlx::query(&format!(
                "SELECT {UNIT_COLUMNS} FROM inventory_units WHERE section = $1 ORDER BY label COLLATE \"C\""
            ))
            .bind(section)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
            found.iter().map(rows::unit_from_row).collect()
        })
    }

    fn transition_unit(
        &self,
        id: UnitId,
        command: UnitCommand,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, UnitTransition> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_error)?;

            let row = sqlx::query(&format!(
                "SELECT {UNIT_COLUMNS} FROM inventory_units WHERE id = $1 FOR UPDATE"
            ))
            .bind(*id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?;
            let Some(row) = row else {
                return Err(StoreError::not_found("unit", id));
            };

            let mut unit = rows::unit_from_row(&row)?;
            let result = transition::apply(&mut unit, &command, now);

            if matches!(result, Ok(TransitionOutcome::Applied { .. })) {
                sqlx::query(
                    r"
                    UPDATE inventory_units
                    SET status = $2, reserved_by = $3, reserved_until = $4, sold_to = $5, updated_at = $6
                    WHERE id = $1
                    ",
                )
                .bind(*id.as_uuid())
                .bind(unit.status().as_str())
                .bind(unit.reserved_by().map(|c| *c.as_uuid()))
                .bind(unit.reserved_until())
                .bind(unit.sold_to().map(|t| *t.as_uuid()))
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            }

            tx.commit().await.map_err(db_error)?;
            debug!(unit_id = %id, command = command.name(), status = %unit.status(), "Unit transition");
            Ok(UnitTransition { unit, result })
        })
    }

    fn expired_units(&self, now: DateTime<Utc>, limit: u32) -> StoreFuture<'_, Vec<UnitId>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id FROM inventory_units
                WHERE status = 'reserved' AND reserved_until < $1
                ORDER BY reserved_until ASC
                LIMIT $2
                ",
            )
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

            rows.iter()
                .map(|row| row.try_get::<Uuid, _>("id").map(UnitId::from_uuid).map_err(db_error))
                .collect()
        })
    }

    fn insert_pool(&self, pool: TicketTypePool) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO ticket_types (id, name, price_cents, quantity, sold, held)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(*pool.id().as_uuid())
            .bind(pool.name())
            .bind(to_cents(pool.price())?)
            .bind(to_count(pool.quantity())?)
            .bind(to_count(pool.sold())?)
            .bind(to_count(pool.held())?)
            .execute(&self.pool)
            .await
            .map_err(|e| match unique_violation(&e) {
                Some(_) => StoreError::duplicate("ticket type", pool.id()),
                None => db_error(e),
            })?;
            Ok(())
        })
    }

    fn load_pool(&self, id: TicketTypeId) -> StoreFuture<'_, Option<TicketTypePool>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {POOL_COLUMNS} FROM ticket_types WHERE id = $1"))
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
            row.as_ref().map(rows::pool_from_row).transpose()
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
            let mut tx = self.pool.begin().await.map_err(db_error)?;
            let mut pool = Self::lock_pool(&mut tx, ticket_type_id)
                .await?
                .ok_or_else(|| StoreError::not_found("ticket type", ticket_type_id))?;

            let purged = sqlx::query(
                "DELETE FROM slot_holds WHERE ticket_type_id = $1 AND expires_at < $2 RETURNING quantity",
            )
            .bind(*ticket_type_id.as_uuid())
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error)?;

            let mut reclaimed = 0;
            for row in &purged {
                let quantity: i32 = row.try_get("quantity").map_err(db_error)?;
                reclaimed += pool.release_held(u32::try_from(quantity).unwrap_or(0));
            }

            let available = pool.available();
            let granted = pool.hold(requested);
            let hold = (granted > 0).then(|| SlotHold {
                id: HoldId::new(),
                ticket_type_id,
                holder,
                quantity: granted,
                expires_at,
                created_at: now,
            });

            if let Some(hold) = &hold {
                sqlx::query(
                    r"
                    INSERT INTO slot_holds (id, ticket_type_id, holder, quantity, expires_at, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ",
                )
                .bind(*hold.id.as_uuid())
                .bind(*ticket_type_id.as_uuid())
                .bind(*holder.as_uuid())
                .bind(to_count(hold.quantity)?)
                .bind(hold.expires_at)
                .bind(hold.created_at)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            }

            if granted > 0 || reclaimed > 0 {
                Self::save_counters(&mut tx, &pool, now).await?;
            }
            tx.commit().await.map_err(db_error)?;

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
            let row = sqlx::query(&format!("SELECT {HOLD_COLUMNS} FROM slot_holds WHERE id = $1"))
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
            row.as_ref().map(rows::hold_from_row).transpose()
        })
    }

    fn release_slots(&self, hold_id: HoldId, count: u32) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let Some(hold) = self.load_slot_hold(hold_id).await? else {
                return Ok(0);
            };

            let mut tx = self.pool.begin().await.map_err(db_error)?;
            let mut pool = Self::lock_pool(&mut tx, hold.ticket_type_id)
                .await?
                .ok_or_else(|| StoreError::not_found("ticket type", hold.ticket_type_id))?;

            let row = sqlx::query("SELECT quantity FROM slot_holds WHERE id = $1 FOR UPDATE")
                .bind(*hold_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error)?;
            let Some(row) = row else {
                return Ok(0);
            };
            let quantity: i32 = row.try_get("quantity").map_err(db_error)?;
            let quantity = u32::try_from(quantity).unwrap_or(0);

            let released = count.min(quantity);
            if released == quantity {
                sqlx::query("DELETE FROM slot_holds WHERE id = $1")
                    .bind(*hold_id.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error)?;
            } else {
                sqlx::query("UPDATE slot_holds SET quantity = $2 WHERE id = $1")
                    .bind(*hold_id.as_uuid())
                    .bind(to_count(quantity - released)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error)?;
            }

            let returned = pool.release_held(released);
            Self::save_counters(&mut tx, &pool, Utc::now()).await?;
            tx.commit().await.map_err(db_error)?;
            Ok(returned)
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
            let mut tx = self.pool.begin().await.map_err(db_error)?;
            let mut pool = Self::lock_pool(&mut tx, ticket_type_id)
                .await?
                .ok_or_else(|| StoreError::not_found("ticket type", ticket_type_id))?;

            let committed = sqlx::query("SELECT 1 FROM committed_slots WHERE ticket_id = $1")
                .bind(*ticket_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error)?;
            if committed.is_some() {
                return Ok(SlotCommit::AlreadyCommitted);
            }

            let row = sqlx::query(&format!(
                "SELECT {HOLD_COLUMNS} FROM slot_holds WHERE id = $1 AND ticket_type_id = $2 FOR UPDATE"
            ))
            .bind(*hold_id.as_uuid())
            .bind(*ticket_type_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?;
            let Some(row) = row else {
                return Ok(SlotCommit::Refused(SlotRefusal::HoldMissing(hold_id)));
            };
            let hold = rows::hold_from_row(&row)?;
            if !hold.is_live(now) {
                return Ok(SlotCommit::Refused(SlotRefusal::HoldExpired {
                    expired_at: hold.expires_at,
                }));
            }
            if hold.quantity == 0 {
                return Ok(SlotCommit::Refused(SlotRefusal::HoldExhausted(hold_id)));
            }

            if hold.quantity == 1 {
                sqlx::query("DELETE FROM slot_holds WHERE id = $1")
                    .bind(*hold_id.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error)?;
            } else {
                sqlx::query("UPDATE slot_holds SET quantity = quantity - 1 WHERE id = $1")
                    .bind(*hold_id.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error)?;
            }

            pool.commit_held();
            sqlx::query("INSERT INTO committed_slots (ticket_id, ticket_type_id, committed_at) VALUES ($1, $2, $3)")
                .bind(*ticket_id.as_uuid())
                .bind(*ticket_type_id.as_uuid())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            Self::save_counters(&mut tx, &pool, now).await?;

            tx.commit().await.map_err(db_error)?;
            Ok(SlotCommit::Committed)
        })
    }

    fn refund_slot(
        &self,
        ticket_type_id: TicketTypeId,
        ticket_id: TicketId,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_error)?;
            let mut pool = Self::lock_pool(&mut tx, ticket_type_id)
                .await?
                .ok_or_else(|| StoreError::not_found("ticket type", ticket_type_id))?;

            let deleted = sqlx::query("DELETE FROM committed_slots WHERE ticket_id = $1 AND ticket_type_id = $2")
                .bind(*ticket_id.as_uuid())
                .bind(*ticket_type_id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            if deleted.rows_affected() == 0 {
                return Ok(false);
            }

            let returned = pool.uncommit_sold();
            Self::save_counters(&mut tx, &pool, Utc::now()).await?;
            tx.commit().await.map_err(db_error)?;
            Ok(returned)
        })
    }

    fn sweep_expired_slot_holds(&self, now: DateTime<Utc>, limit: u32) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let expired = sqlx::query(
                r"
                SELECT id, ticket_type_id FROM slot_holds
                WHERE expires_at < $1
                ORDER BY expires_at ASC
                LIMIT $2
                ",
            )
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

            let mut by_pool: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
            for row in &expired {
                let id: Uuid = row.try_get("id").map_err(db_error)?;
                let pool_id: Uuid = row.try_get("ticket_type_id").map_err(db_error)?;
                by_pool.entry(pool_id).or_default().push(id);
            }

            let mut returned = 0;
            for (pool_id, hold_ids) in by_pool {
                let ticket_type_id = TicketTypeId::from_uuid(pool_id);
                let mut tx = self.pool.begin().await.map_err(db_error)?;
                let Some(mut pool) = Self::lock_pool(&mut tx, ticket_type_id).await? else {
                    continue;
                };

                // Re-checked under the pool lock: a hold may have been purged meanwhile
                let purged = sqlx::query(
                    "DELETE FROM slot_holds WHERE id = ANY($1) AND expires_at < $2 RETURNING quantity",
                )
                .bind(&hold_ids)
                .bind(now)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_error)?;

                let mut slots = 0;
                for row in &purged {
                    let quantity: i32 = row.try_get("quantity").map_err(db_error)?;
                    slots += pool.release_held(u32::try_from(quantity).unwrap_or(0));
                }
                if slots > 0 {
                    Self::save_counters(&mut tx, &pool, now).await?;
                }
                tx.commit().await.map_err(db_error)?;

                debug!(ticket_type_id = %ticket_type_id, holds = purged.len(), slots, "Expired slot holds swept");
                returned += slots;
            }
            Ok(returned)
        })
    }

    fn insert_checkout(&self, payment: Payment, tickets: Vec<Ticket>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let duplicate = |e: sqlx::Error, ticket: Option<&Ticket>| match unique_violation(&e) {
                Some("payments_transaction_id_key") => StoreError::duplicate("transaction", &payment.transaction_id),
                Some("tickets_ticket_number_key") => match ticket {
                    Some(ticket) => StoreError::duplicate("ticket number", &ticket.ticket_number),
                    None => StoreError::duplicate("ticket number", "?"),
                },
                Some("tickets_pkey") => match ticket {
                    Some(ticket) => StoreError::duplicate("ticket", ticket.id),
                    None => StoreError::duplicate("ticket", "?"),
                },
                Some(_) => StoreError::duplicate("payment", payment.id),
                None => db_error(e),
            };

            let mut tx = self.pool.begin().await.map_err(db_error)?;
            if let Some(bound) = Self::find_pending_binding(&mut tx, payment.payer, &tickets).await? {
                return Err(bound);
            }

            sqlx::query(
                r"
                INSERT INTO payments
                    (id, payer, amount_cents, currency, method, status, transaction_id,
                     external_order_id, external_receipt_id, description, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ",
            )
            .bind(*payment.id.as_uuid())
            .bind(*payment.payer.as_uuid())
            .bind(to_cents(payment.amount)?)
            .bind(&payment.currency)
            .bind(payment.method.as_str())
            .bind(payment.status.as_str())
            .bind(&payment.transaction_id)
            .bind(&payment.external_order_id)
            .bind(&payment.external_receipt_id)
            .bind(&payment.description)
            .bind(payment.created_at)
            .bind(payment.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| duplicate(e, None))?;

            for ticket in &tickets {
                let (unit_id, ticket_type_id, hold_id) = binding_columns(ticket.binding);
                sqlx::query(
                    r"
                    INSERT INTO tickets
                        (id, payment_id, attendee, unit_id, ticket_type_id, hold_id,
                         ticket_number, price_cents, status, used_at, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    ",
                )
                .bind(*ticket.id.as_uuid())
                .bind(*ticket.payment_id.as_uuid())
                .bind(*ticket.attendee.as_uuid())
                .bind(unit_id)
                .bind(ticket_type_id)
                .bind(hold_id)
                .bind(ticket.ticket_number.as_str())
                .bind(to_cents(ticket.price)?)
                .bind(ticket.status.as_str())
                .bind(ticket.used_at)
                .bind(ticket.created_at)
                .bind(ticket.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| duplicate(e, Some(ticket)))?;
            }

            tx.commit().await.map_err(db_error)?;
            Ok(())
        })
    }

    fn load_payment(&self, id: PaymentId) -> StoreFuture<'_, Option<Payment>> {
        Box::pin(self.fetch_payment(id))
    }

    fn find_payment_by_external_order<'a>(
        &'a self,
        external_order_id: &'a str,
    ) -> StoreFuture<'a, Option<Payment>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments WHERE external_order_id = $1"
            ))
            .bind(external_order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
            row.as_ref().map(rows::payment_from_row).transpose()
        })
    }

    fn set_external_order(
        &self,
        id: PaymentId,
        external_order_id: String,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Payment> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "UPDATE payments SET external_order_id = $2, updated_at = $3 WHERE id = $1 RETURNING {PAYMENT_COLUMNS}"
            ))
            .bind(*id.as_uuid())
            .bind(&external_order_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| match unique_violation(&e) {
                Some(_) => StoreError::duplicate("external order", &external_order_id),
                None => db_error(e),
            })?;

            match row {
                Some(row) => rows::payment_from_row(&row),
                None => Err(StoreError::not_found("payment", id)),
            }
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
            let row = sqlx::query(&format!(
                r"
                UPDATE payments
                SET status = $3, external_receipt_id = COALESCE($4, external_receipt_id), updated_at = $5
                WHERE id = $1 AND status = $2
                RETURNING {PAYMENT_COLUMNS}
                "
            ))
            .bind(*id.as_uuid())
            .bind(expected.as_str())
            .bind(to.as_str())
            .bind(receipt)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            if let Some(row) = row {
                return rows::payment_from_row(&row).map(StatusChange::Applied);
            }
            self.fetch_payment(id)
                .await?
                .map(StatusChange::Unchanged)
                .ok_or_else(|| StoreError::not_found("payment", id))
        })
    }

    fn tickets_for_payment(&self, payment_id: PaymentId) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {TICKET_COLUMNS} FROM tickets WHERE payment_id = $1 ORDER BY seq ASC"
            ))
            .bind(*payment_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
            rows.iter().map(rows::ticket_from_row).collect()
        })
    }

    fn load_ticket(&self, id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(self.fetch_ticket(id))
    }

    fn transition_ticket(
        &self,
        id: TicketId,
        expected: TicketStatus,
        to: TicketStatus,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, StatusChange<Ticket>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r"
                UPDATE tickets
                SET status = $3,
                    used_at = CASE WHEN $3::text = 'used' THEN $4 ELSE used_at END,
                    updated_at = $4
                WHERE id = $1 AND status = $2
                RETURNING {TICKET_COLUMNS}
                "
            ))
            .bind(*id.as_uuid())
            .bind(expected.as_str())
            .bind(to.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            if let Some(row) = row {
                return rows::ticket_from_row(&row).map(StatusChange::Applied);
            }
            self.fetch_ticket(id)
                .await?
                .map(StatusChange::Unchanged)
                .ok_or_else(|| StoreError::not_found("ticket", id))
        })
    }
}
