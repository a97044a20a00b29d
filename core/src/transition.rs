//! The per-unit state machine.
//!
//! [`apply`] is the only function that changes an [`InventoryUnit`]'s status. It is pure:
//! stores call it while they hold the unit's serialization (a mutex in memory, a row lock
//! in Postgres) and persist the result. Because every mutation path runs through here,
//! the hold invariants checked by [`InventoryUnit::from_parts`] hold after every
//! accepted transition.
//!
//! ```text
//! Available --reserve--> Reserved --confirm--> Sold
//! Reserved  --release/expire--> Available
//! Available --block--> Blocked --unblock--> Available
//! ```

use crate::types::{CustomerId, InventoryUnit, TicketId, UnitStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A requested change to one unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitCommand {
    /// Place (or keep) a hold for `holder` until `until`.
    ///
    /// A stale hold owned by anyone is reclaimed. A live hold owned by `holder`
    /// is left untouched, including its expiry.
    Reserve {
        /// Requester placing the hold
        holder: CustomerId,
        /// Hold expiry
        until: DateTime<Utc>,
    },
    /// Release any hold, whoever owns it.
    Release,
    /// Release the hold only if `holder` owns it.
    ReleaseHold {
        /// Expected owner of the hold
        holder: CustomerId,
    },
    /// Release the hold only if it has expired.
    Expire,
    /// Consume the unit for `ticket`. Requires a live hold owned by `holder`.
    Confirm {
        /// Owner the hold must belong to
        holder: CustomerId,
        /// Ticket consuming the unit
        ticket: TicketId,
    },
    /// Undo a sale whose ticket never became Confirmed (the ticket was cancelled
    /// while its inventory was being consumed). Only touches a unit sold to `ticket`.
    Revoke {
        /// Ticket the unit was sold to
        ticket: TicketId,
    },
    /// Withhold an available unit from sale.
    Block,
    /// Return a blocked unit to sale.
    Unblock,
}

impl UnitCommand {
    /// Short name used in logs and metrics
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Reserve { .. } => "reserve",
            Self::Release => "release",
            Self::ReleaseHold { .. } => "release_hold",
            Self::Expire => "expire",
            Self::Confirm { .. } => "confirm",
            Self::Revoke { .. } => "revoke",
            Self::Block => "block",
            Self::Unblock => "unblock",
        }
    }
}

/// Result of an accepted command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionOutcome {
    /// The unit changed state.
    Applied {
        /// Status before the command
        from: UnitStatus,
        /// Status after the command
        to: UnitStatus,
        /// A stale hold was reclaimed on the way (lazy expiry)
        reclaimed_stale: bool,
    },
    /// The command was a no-op: the unit already is where the command would put it.
    Unchanged,
}

impl TransitionOutcome {
    /// Whether the unit changed state
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Why a command was refused. The unit is left untouched.
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Refusal {
    /// The unit is live-held, sold or blocked.
    #[error("unavailable ({0})")]
    Unavailable(UnitStatus),

    /// The unit carries no hold to confirm.
    #[error("not reserved ({0})")]
    NotReserved(UnitStatus),

    /// The requester's hold expired before confirmation.
    #[error("hold expired at {expired_at}")]
    HoldExpired {
        /// When the hold expired
        expired_at: DateTime<Utc>,
    },

    /// Another requester owns the hold.
    #[error("held by another requester")]
    HeldByAnother,

    /// The unit was sold to a different ticket.
    #[error("sold to ticket {0}")]
    SoldElsewhere(TicketId),
}

impl Refusal {
    /// Stable label for metrics
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(status) => status.as_str(),
            Self::NotReserved(_) => "not_reserved",
            Self::HoldExpired { .. } => "hold_expired",
            Self::HeldByAnother => "held_by_another",
            Self::SoldElsewhere(_) => "sold_elsewhere",
        }
    }
}

/// Apply `command` to `unit` at time `now`.
///
/// # Errors
///
/// Returns a [`Refusal`] when the command is not allowed from the unit's current state.
/// The unit is not modified in that case.
pub fn apply(
    unit: &mut InventoryUnit,
    command: &UnitCommand,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, Refusal> {
    let from = unit.status();
    let stale = unit.has_stale_hold(now);

    match command {
        UnitCommand::Reserve { holder, until } => match from {
            UnitStatus::Available => {
                unit.set_reserved(*holder, *until);
                Ok(applied(from, UnitStatus::Reserved, false))
            }
            UnitStatus::Reserved if stale => {
                unit.set_reserved(*holder, *until);
                Ok(applied(from, UnitStatus::Reserved, true))
            }
            UnitStatus::Reserved if unit.reserved_by() == Some(*holder) => {
                Ok(TransitionOutcome::Unchanged)
            }
            other => Err(Refusal::Unavailable(other)),
        },

        UnitCommand::Release => match from {
            UnitStatus::Reserved => {
                unit.set_available();
                Ok(applied(from, UnitStatus::Available, false))
            }
            _ => Ok(TransitionOutcome::Unchanged),
        },

        UnitCommand::ReleaseHold { holder } => {
            if from == UnitStatus::Reserved && unit.reserved_by() == Some(*holder) {
                unit.set_available();
                Ok(applied(from, UnitStatus::Available, false))
            } else {
                Ok(TransitionOutcome::Unchanged)
            }
        }

        UnitCommand::Expire => {
            if stale {
                unit.set_available();
                Ok(applied(from, UnitStatus::Available, true))
            } else {
                Ok(TransitionOutcome::Unchanged)
            }
        }

        UnitCommand::Confirm { holder, ticket } => match from {
            UnitStatus::Reserved if unit.reserved_by() != Some(*holder) => {
                Err(Refusal::HeldByAnother)
            }
            UnitStatus::Reserved if stale => Err(Refusal::HoldExpired {
                expired_at: unit.reserved_until().unwrap_or(now),
            }),
            UnitStatus::Reserved => {
                unit.set_sold(*ticket);
                Ok(applied(from, UnitStatus::Sold, false))
            }
            UnitStatus::Sold => match unit.sold_to() {
                Some(sold_to) if sold_to == *ticket => Ok(TransitionOutcome::Unchanged),
                Some(sold_to) => Err(Refusal::SoldElsewhere(sold_to)),
                None => Err(Refusal::NotReserved(from)),
            },
            other => Err(Refusal::NotReserved(other)),
        },

        UnitCommand::Revoke { ticket } => {
            if from == UnitStatus::Sold && unit.sold_to() == Some(*ticket) {
                unit.set_available();
                Ok(applied(from, UnitStatus::Available, false))
            } else {
                Ok(TransitionOutcome::Unchanged)
            }
        }

        UnitCommand::Block => match from {
            UnitStatus::Available => {
                unit.set_blocked();
                Ok(applied(from, UnitStatus::Blocked, false))
            }
            UnitStatus::Reserved if stale => {
                unit.set_blocked();
                Ok(applied(from, UnitStatus::Blocked, true))
            }
            UnitStatus::Blocked => Ok(TransitionOutcome::Unchanged),
            other => Err(Refusal::Unavailable(other)),
        },

        UnitCommand::Unblock => match from {
            UnitStatus::Blocked => {
                unit.set_available();
                Ok(applied(from, UnitStatus::Available, false))
            }
            UnitStatus::Available => Ok(TransitionOutcome::Unchanged),
            other => Err(Refusal::Unavailable(other)),
        },
    }
}

const fn applied(from: UnitStatus, to: UnitStatus, reclaimed_stale: bool) -> TransitionOutcome {
    TransitionOutcome::Applied {
        from,
        to,
        reclaimed_stale,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::types::{Money, UnitId};
    use chrono::Duration;
    use proptest::prelude::*;

    fn seat() -> InventoryUnit {
        InventoryUnit::available(UnitId::new(), "Balcony", "B-7", Money::from_cents(4_500))
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T19:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn reserve_available_sets_holder_and_expiry() {
        let mut unit = seat();
        let alice = CustomerId::new();
        let until = t0() + Duration::seconds(600);

        let outcome = apply(&mut unit, &UnitCommand::Reserve { holder: alice, until }, t0()).unwrap();

        assert_eq!(outcome, applied(UnitStatus::Available, UnitStatus::Reserved, false));
        assert_eq!(unit.reserved_by(), Some(alice));
        assert_eq!(unit.reserved_until(), Some(until));
    }

    #[test]
    fn live_hold_refuses_other_requester() {
        let mut unit = seat();
        let (alice, bob) = (CustomerId::new(), CustomerId::new());
        let until = t0() + Duration::seconds(1);
        apply(&mut unit, &UnitCommand::Reserve { holder: alice, until }, t0()).unwrap();

        let refusal = apply(
            &mut unit,
            &UnitCommand::Reserve { holder: bob, until: until + Duration::seconds(600) },
            t0(),
        )
        .unwrap_err();

        assert_eq!(refusal.to_string(), "unavailable (reserved)");
        assert_eq!(unit.reserved_by(), Some(alice));
    }

    #[test]
    fn own_live_hold_is_unchanged_and_keeps_expiry() {
        let mut unit = seat();
        let alice = CustomerId::new();
        let until = t0() + Duration::seconds(60);
        apply(&mut unit, &UnitCommand::Reserve { holder: alice, until }, t0()).unwrap();

        let outcome = apply(
            &mut unit,
            &UnitCommand::Reserve { holder: alice, until: until + Duration::seconds(600) },
            t0() + Duration::seconds(30),
        )
        .unwrap();

        assert_eq!(outcome, TransitionOutcome::Unchanged);
        assert_eq!(unit.reserved_until(), Some(until));
    }

    #[test]
    fn stale_hold_is_reclaimed_lazily() {
        let mut unit = seat();
        let (alice, bob) = (CustomerId::new(), CustomerId::new());
        apply(
            &mut unit,
            &UnitCommand::Reserve { holder: alice, until: t0() + Duration::seconds(1) },
            t0(),
        )
        .unwrap();

        let later = t0() + Duration::seconds(2);
        let outcome = apply(
            &mut unit,
            &UnitCommand::Reserve { holder: bob, until: later + Duration::seconds(600) },
            later,
        )
        .unwrap();

        assert_eq!(outcome, applied(UnitStatus::Reserved, UnitStatus::Reserved, true));
        assert_eq!(unit.reserved_by(), Some(bob));
    }

    #[test]
    fn release_is_permissive_and_idempotent() {
        let mut unit = seat();
        apply(
            &mut unit,
            &UnitCommand::Reserve { holder: CustomerId::new(), until: t0() + Duration::seconds(60) },
            t0(),
        )
        .unwrap();

        assert!(apply(&mut unit, &UnitCommand::Release, t0()).unwrap().is_applied());
        assert_eq!(unit.status(), UnitStatus::Available);
        assert_eq!(unit.reserved_until(), None);
        assert_eq!(apply(&mut unit, &UnitCommand::Release, t0()).unwrap(), TransitionOutcome::Unchanged);
    }

    #[test]
    fn release_hold_ignores_other_holders() {
        let mut unit = seat();
        let (alice, bob) = (CustomerId::new(), CustomerId::new());
        apply(
            &mut unit,
            &UnitCommand::Reserve { holder: alice, until: t0() + Duration::seconds(60) },
            t0(),
        )
        .unwrap();

        let outcome = apply(&mut unit, &UnitCommand::ReleaseHold { holder: bob }, t0()).unwrap();
        assert_eq!(outcome, TransitionOutcome::Unchanged);
        assert_eq!(unit.reserved_by(), Some(alice));
    }

    #[test]
    fn expire_only_touches_stale_holds() {
        let mut unit = seat();
        let until = t0() + Duration::seconds(10);
        apply(&mut unit, &UnitCommand::Reserve { holder: CustomerId::new(), until }, t0()).unwrap();

        assert_eq!(apply(&mut unit, &UnitCommand::Expire, until).unwrap(), TransitionOutcome::Unchanged);
        assert!(
            apply(&mut unit, &UnitCommand::Expire, until + Duration::seconds(1))
                .unwrap()
                .is_applied()
        );
        assert_eq!(unit.status(), UnitStatus::Available);
    }

    #[test]
    fn confirm_requires_live_hold_of_holder() {
        let (alice, bob) = (CustomerId::new(), CustomerId::new());
        let ticket = TicketId::new();
        let until = t0() + Duration::seconds(1);

        let mut unit = seat();
        apply(&mut unit, &UnitCommand::Reserve { holder: alice, until }, t0()).unwrap();
        let refusal = apply(
            &mut unit,
            &UnitCommand::Confirm { holder: alice, ticket },
            t0() + Duration::seconds(2),
        )
        .unwrap_err();
        assert_eq!(refusal, Refusal::HoldExpired { expired_at: until });
        assert_eq!(unit.status(), UnitStatus::Reserved);

        let refusal =
            apply(&mut unit, &UnitCommand::Confirm { holder: bob, ticket }, t0()).unwrap_err();
        assert_eq!(refusal, Refusal::HeldByAnother);

        let outcome = apply(&mut unit, &UnitCommand::Confirm { holder: alice, ticket }, t0()).unwrap();
        assert_eq!(outcome, applied(UnitStatus::Reserved, UnitStatus::Sold, false));
        assert_eq!(unit.sold_to(), Some(ticket));
        assert_eq!(unit.reserved_until(), None);
    }

    #[test]
    fn confirm_replay_for_same_ticket_is_unchanged() {
        let alice = CustomerId::new();
        let ticket = TicketId::new();
        let mut unit = seat();
        apply(
            &mut unit,
            &UnitCommand::Reserve { holder: alice, until: t0() + Duration::seconds(60) },
            t0(),
        )
        .unwrap();
        apply(&mut unit, &UnitCommand::Confirm { holder: alice, ticket }, t0()).unwrap();

        let replay = apply(&mut unit, &UnitCommand::Confirm { holder: alice, ticket }, t0()).unwrap();
        assert_eq!(replay, TransitionOutcome::Unchanged);

        let other = TicketId::new();
        let refusal = apply(&mut unit, &UnitCommand::Confirm { holder: alice, ticket: other }, t0())
            .unwrap_err();
        assert_eq!(refusal, Refusal::SoldElsewhere(ticket));
    }

    #[test]
    fn sold_units_survive_release_and_expiry() {
        let alice = CustomerId::new();
        let mut unit = seat();
        apply(
            &mut unit,
            &UnitCommand::Reserve { holder: alice, until: t0() + Duration::seconds(60) },
            t0(),
        )
        .unwrap();
        apply(&mut unit, &UnitCommand::Confirm { holder: alice, ticket: TicketId::new() }, t0())
            .unwrap();

        let far = t0() + Duration::days(1);
        for command in [UnitCommand::Release, UnitCommand::Expire, UnitCommand::ReleaseHold { holder: alice }] {
            assert_eq!(apply(&mut unit, &command, far).unwrap(), TransitionOutcome::Unchanged);
        }
        assert_eq!(unit.status(), UnitStatus::Sold);
    }

    #[test]
    fn revoke_only_undoes_sale_to_that_ticket() {
        let alice = CustomerId::new();
        let ticket = TicketId::new();
        let mut unit = seat();
        apply(
            &mut unit,
            &UnitCommand::Reserve { holder: alice, until: t0() + Duration::seconds(60) },
            t0(),
        )
        .unwrap();
        apply(&mut unit, &UnitCommand::Confirm { holder: alice, ticket }, t0()).unwrap();

        let other = UnitCommand::Revoke { ticket: TicketId::new() };
        assert_eq!(apply(&mut unit, &other, t0()).unwrap(), TransitionOutcome::Unchanged);

        let outcome = apply(&mut unit, &UnitCommand::Revoke { ticket }, t0()).unwrap();
        assert_eq!(outcome, applied(UnitStatus::Sold, UnitStatus::Available, false));
        assert_eq!(unit.sold_to(), None);
    }

    #[test]
    fn block_and_unblock() {
        let mut unit = seat();
        assert!(apply(&mut unit, &UnitCommand::Block, t0()).unwrap().is_applied());
        assert_eq!(apply(&mut unit, &UnitCommand::Block, t0()).unwrap(), TransitionOutcome::Unchanged);

        let refusal = apply(
            &mut unit,
            &UnitCommand::Reserve { holder: CustomerId::new(), until: t0() + Duration::seconds(5) },
            t0(),
        )
        .unwrap_err();
        assert_eq!(refusal.to_string(), "unavailable (blocked)");

        assert!(apply(&mut unit, &UnitCommand::Unblock, t0()).unwrap().is_applied());
        assert_eq!(unit.status(), UnitStatus::Available);
    }

    #[test]
    fn live_hold_cannot_be_blocked() {
        let mut unit = seat();
        apply(
            &mut unit,
            &UnitCommand::Reserve { holder: CustomerId::new(), until: t0() + Duration::seconds(60) },
            t0(),
        )
        .unwrap();
        assert_eq!(
            apply(&mut unit, &UnitCommand::Block, t0()).unwrap_err(),
            Refusal::Unavailable(UnitStatus::Reserved)
        );
    }

    fn command_strategy(holders: Vec<CustomerId>, tickets: Vec<TicketId>) -> impl Strategy<Value = UnitCommand> {
        let h = holders.clone();
        let h2 = holders.clone();
        let h3 = holders;
        prop_oneof![
            (0..3usize, 0..120i64).prop_map(move |(i, secs)| UnitCommand::Reserve {
                holder: h[i],
                until: t0() + Duration::seconds(secs),
            }),
            Just(UnitCommand::Release),
            (0..3usize).prop_map(move |i| UnitCommand::ReleaseHold { holder: h2[i] }),
            Just(UnitCommand::Expire),
            (0..3usize, 0..2usize).prop_map(move |(i, t)| UnitCommand::Confirm {
                holder: h3[i],
                ticket: tickets[t],
            }),
            Just(UnitCommand::Block),
            Just(UnitCommand::Unblock),
        ]
    }

    proptest! {
        #[test]
        fn every_reachable_state_satisfies_hold_invariants(
            steps in prop::collection::vec((0..3usize, 0..120i64), 1..40),
            seed_commands in prop::collection::vec(
                command_strategy(
                    vec![CustomerId::new(), CustomerId::new(), CustomerId::new()],
                    vec![TicketId::new(), TicketId::new()],
                ),
                1..40,
            ),
        ) {
            let mut unit = seat();
            let mut sold_to = None;

            for (command, (_, offset)) in seed_commands.iter().zip(steps.iter().cycle()) {
                let now = t0() + Duration::seconds(*offset);
                let before = unit.clone();
                if apply(&mut unit, command, now).is_err() {
                    prop_assert_eq!(&unit, &before);
                }

                // Rebuilding from the persisted fields must always succeed.
                prop_assert!(InventoryUnit::from_parts(unit.clone().into_parts()).is_ok());

                // Once sold, the unit stays sold to the same ticket.
                if let Some(ticket) = sold_to {
                    prop_assert_eq!(unit.status(), UnitStatus::Sold);
                    prop_assert_eq!(unit.sold_to(), Some(ticket));
                }
                if unit.status() == UnitStatus::Sold {
                    sold_to = unit.sold_to();
                }
            }
        }
    }
}
