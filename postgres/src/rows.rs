//! Row decoding and column conversions.
//!
//! Rows that don't decode into a valid domain value surface as `StoreError::Corrupt`.

use chrono::{DateTime, Utc};
use seatkeeper_core::pool::{PoolParts, TicketTypePool};
use seatkeeper_core::store::StoreError;
use seatkeeper_core::types::{
    CustomerId, HoldId, InventoryUnit, Money, Payment, PaymentId, PaymentMethod, PaymentStatus,
    SlotHold, Ticket, TicketBinding, TicketId, TicketNumber, TicketStatus, TicketTypeId, UnitId,
    UnitParts, UnitStatus,
};
use sqlx::postgres::PgRow;
use sqlx::types::Uuid;
use sqlx::Row;

pub(crate) const UNIT_COLUMNS: &str =
    "id, section, label, price_cents, status, reserved_by, reserved_until, sold_to";

pub(crate) const POOL_COLUMNS: &str = "id, name, price_cents, quantity, sold, held";

pub(crate) const HOLD_COLUMNS: &str = "id, ticket_type_id, holder, quantity, expires_at, created_at";

pub(crate) const PAYMENT_COLUMNS: &str = "id, payer, amount_cents, currency, method, status, \
     transaction_id, external_order_id, external_receipt_id, description, created_at, updated_at";

pub(crate) const TICKET_COLUMNS: &str = "id, payment_id, attendee, unit_id, ticket_type_id, hold_id, \
     ticket_number, price_cents, status, used_at, created_at, updated_at";

/// Map a driver error. Decode failures are corruption; everything else is treated as
/// the database being unavailable.
pub(crate) fn db_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(err.to_string())
        }
        _ => StoreError::Unavailable(err.to_string()),
    }
}

/// Name of the unique constraint `err` violated, if that's what it is.
pub(crate) fn unique_violation(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Some(db.constraint().unwrap_or_default()),
        _ => None,
    }
}

pub(crate) fn to_cents(money: Money) -> Result<i64, StoreError> {
    i64::try_from(money.cents()).map_err(|_| StoreError::Corrupt(format!("amount {money} out of range")))
}

pub(crate) fn to_count(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("count {value} out of range")))
}

fn money(cents: i64) -> Result<Money, StoreError> {
    u64::try_from(cents)
        .map(Money::from_cents)
        .map_err(|_| StoreError::Corrupt(format!("negative amount: {cents}")))
}

fn count(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative count: {value}")))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(db_error)
}

pub(crate) fn unit_from_row(row: &PgRow) -> Result<InventoryUnit, StoreError> {
    let status: String = get(row, "status")?;
    let unit = InventoryUnit::from_parts(UnitParts {
        id: UnitId::from_uuid(get(row, "id")?),
        section: get(row, "section")?,
        label: get(row, "label")?,
        price: money(get(row, "price_cents")?)?,
        status: UnitStatus::parse(&status)?,
        reserved_by: get::<Option<Uuid>>(row, "reserved_by")?.map(CustomerId::from_uuid),
        reserved_until: get(row, "reserved_until")?,
        sold_to: get::<Option<Uuid>>(row, "sold_to")?.map(TicketId::from_uuid),
    })?;
    Ok(unit)
}

pub(crate) fn pool_from_row(row: &PgRow) -> Result<TicketTypePool, StoreError> {
    let pool = TicketTypePool::from_parts(PoolParts {
        id: TicketTypeId::from_uuid(get(row, "id")?),
        name: get(row, "name")?,
        price: money(get(row, "price_cents")?)?,
        quantity: count(get(row, "quantity")?)?,
        sold: count(get(row, "sold")?)?,
        held: count(get(row, "held")?)?,
    })?;
    Ok(pool)
}

pub(crate) fn hold_from_row(row: &PgRow) -> Result<SlotHold, StoreError> {
    Ok(SlotHold {
        id: HoldId::from_uuid(get(row, "id")?),
        ticket_type_id: TicketTypeId::from_uuid(get(row, "ticket_type_id")?),
        holder: CustomerId::from_uuid(get(row, "holder")?),
        quantity: count(get(row, "quantity")?)?,
        expires_at: get(row, "expires_at")?,
        created_at: get(row, "created_at")?,
    })
}

pub(crate) fn payment_from_row(row: &PgRow) -> Result<Payment, StoreError> {
    let method: String = get(row, "method")?;
    let status: String = get(row, "status")?;
    Ok(Payment {
        id: PaymentId::from_uuid(get(row, "id")?),
        payer: CustomerId::from_uuid(get(row, "payer")?),
        amount: money(get(row, "amount_cents")?)?,
        currency: get(row, "currency")?,
        method: PaymentMethod::parse(&method)?,
        status: PaymentStatus::parse(&status)?,
        transaction_id: get(row, "transaction_id")?,
        external_order_id: get(row, "external_order_id")?,
        external_receipt_id: get(row, "external_receipt_id")?,
        description: get(row, "description")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) fn ticket_from_row(row: &PgRow) -> Result<Ticket, StoreError> {
    let id = TicketId::from_uuid(get(row, "id")?);
    let unit_id: Option<Uuid> = get(row, "unit_id")?;
    let ticket_type_id: Option<Uuid> = get(row, "ticket_type_id")?;
    let hold_id: Option<Uuid> = get(row, "hold_id")?;

    let binding = match (unit_id, ticket_type_id, hold_id) {
        (Some(unit_id), None, None) => TicketBinding::Seat {
            unit_id: UnitId::from_uuid(unit_id),
        },
        (None, Some(ticket_type_id), Some(hold_id)) => TicketBinding::Slot {
            ticket_type_id: TicketTypeId::from_uuid(ticket_type_id),
            hold_id: HoldId::from_uuid(hold_id),
        },
        _ => return Err(StoreError::Corrupt(format!("ticket {id} has no valid binding"))),
    };

    let status: String = get(row, "status")?;
    let used_at: Option<DateTime<Utc>> = get(row, "used_at")?;
    Ok(Ticket {
        id,
        payment_id: PaymentId::from_uuid(get(row, "payment_id")?),
        attendee: CustomerId::from_uuid(get(row, "attendee")?),
        binding,
        ticket_number: TicketNumber::new(get(row, "ticket_number")?),
        price: money(get(row, "price_cents")?)?,
        status: TicketStatus::parse(&status)?,
        used_at,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

/// Seat, pool and hold columns of a ticket binding.
pub(crate) fn binding_columns(binding: TicketBinding) -> (Option<Uuid>, Option<Uuid>, Option<Uuid>) {
    match binding {
        TicketBinding::Seat { unit_id } => (Some(*unit_id.as_uuid()), None, None),
        TicketBinding::Slot {
            ticket_type_id,
            hold_id,
        } => (None, Some(*ticket_type_id.as_uuid()), Some(*hold_id.as_uuid())),
    }
}
