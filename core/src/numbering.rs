//! Ticket numbers and transaction references.

use crate::types::TicketNumber;
use chrono::{DateTime, Utc};
use rand::Rng;

/// Symbols used in ticket numbers (Crockford base32: no `I`, `L`, `O` or `U`).
pub const TICKET_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Random characters per ticket number (5 bits each)
pub const TICKET_RANDOM_LEN: usize = 12;

/// Generate a ticket number `TKT-YYYYMMDD-XXXXXXXXXXXX`.
pub fn ticket_number<R: Rng + ?Sized>(now: DateTime<Utc>, rng: &mut R) -> TicketNumber {
    let suffix = random_symbols(rng, TICKET_RANDOM_LEN);
    TicketNumber::new(format!("TKT-{}-{suffix}", now.format("%Y%m%d")))
}

/// Generate a transaction reference `TXN-YYYYMMDDHHMMSS-XXXXXXXX`.
pub fn transaction_id<R: Rng + ?Sized>(now: DateTime<Utc>, rng: &mut R) -> String {
    let suffix: String = (0..8)
        .map(|_| char::from(HEX_UPPER[rng.gen_range(0..HEX_UPPER.len())]))
        .collect();
    format!("TXN-{}-{suffix}", now.format("%Y%m%d%H%M%S"))
}

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

fn random_symbols<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(TICKET_ALPHABET[rng.gen_range(0..TICKET_ALPHABET.len())]))
        .collect()
}
