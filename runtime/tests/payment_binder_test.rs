//! Payment/ticket binder tests: checkout, confirm, fail, refund, cancel, validate
//! and gateway callbacks, all over the in-memory store.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::Duration as ChronoDuration;
use seatkeeper_core::store::InventoryStore;
use seatkeeper_core::types::{
    CustomerId, Money, PaymentMethod, PaymentStatus, TicketBinding, TicketStatus, TicketTypeId,
    UnitId, UnitStatus,
};
use seatkeeper_runtime::{
    BinderError, CallbackResult, Checkout, CheckoutItem, CheckoutRequest, EngineSettings,
    GatewayCallback, GatewayOutcome, PaymentBinder, PaymentRef, ReservationEngine,
};
use seatkeeper_testing::{fixtures, init_test_tracing, InMemoryInventoryStore, ManualClock, RecordingDelivery};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    store: Arc<InMemoryInventoryStore>,
    clock: ManualClock,
    delivery: RecordingDelivery,
    engine: ReservationEngine,
    binder: PaymentBinder,
}

fn harness() -> Harness {
    init_test_tracing();
    let store = Arc::new(InMemoryInventoryStore::new());
    let clock = ManualClock::starting_at_test_epoch();
    let delivery = RecordingDelivery::new();
    let engine = ReservationEngine::new(store.clone(), Arc::new(clock.clone()), EngineSettings::default());
    let binder = PaymentBinder::new(store.clone(), Arc::new(clock.clone()), Arc::new(delivery.clone()));
    Harness {
        store,
        clock,
        delivery,
        engine,
        binder,
    }
}

fn request(payer: CustomerId, items: Vec<CheckoutItem>) -> CheckoutRequest {
    CheckoutRequest {
        payer,
        items,
        method: PaymentMethod::PayPal,
        currency: "USD".to_string(),
        description: Some("Spring concert".to_string()),
    }
}

impl Harness {
    /// Seed `count` seats at $50, hold them all for `payer` and open a checkout.
    async fn seat_checkout(&self, payer: CustomerId, count: u32) -> (Vec<UnitId>, Checkout) {
        let seats = fixtures::seed_section(self.store.as_ref(), "Orchestra", 1, count, Money::from_cents(5_000))
            .await
            .unwrap();
        let outcome = self.engine.reserve_seats(payer, &seats, None).await.unwrap();
        assert!(outcome.is_complete());
        let items = seats.iter().copied().map(CheckoutItem::Seat).collect();
        let checkout = self.binder.open_checkout(request(payer, items)).await.unwrap();
        (seats, checkout)
    }

    /// Seed a pool of `quantity` at $20, hold `held` slots for `payer` and open a checkout.
    async fn slot_checkout(&self, payer: CustomerId, quantity: u32, held: u32) -> (TicketTypeId, Checkout) {
        let general = fixtures::seed_pool(self.store.as_ref(), "General Admission", Money::from_cents(2_000), quantity)
            .await
            .unwrap();
        let hold = self.engine.reserve_slots(payer, general, held, None).await.unwrap();
        let checkout = self
            .binder
            .open_checkout(request(payer, vec![CheckoutItem::Slots(hold.hold_id)]))
            .await
            .unwrap();
        (general, checkout)
    }

    async fn unit_status(&self, id: UnitId) -> UnitStatus {
        self.store.load_unit(id).await.unwrap().unwrap().status()
    }
}

#[tokio::test]
async fn checkout_prices_seats_and_slots() {
    let h = harness();
    let payer = CustomerId::new();
    let seats = fixtures::seed_section(h.store.as_ref(), "Orchestra", 1, 2, Money::from_cents(5_000))
        .await
        .unwrap();
    let general = fixtures::seed_pool(h.store.as_ref(), "GA", Money::from_cents(2_000), 10)
        .await
        .unwrap();
    h.engine.reserve_seats(payer, &seats, None).await.unwrap();
    let hold = h.engine.reserve_slots(payer, general, 3, None).await.unwrap();

    let checkout = h
        .binder
        .open_checkout(request(
            payer,
            vec![
                CheckoutItem::Seat(seats[0]),
                CheckoutItem::Seat(seats[1]),
                CheckoutItem::Seat(seats[0]),
                CheckoutItem::Slots(hold.hold_id),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(checkout.payment.amount, Money::from_cents(2 * 5_000 + 3 * 2_000));
    assert_eq!(checkout.payment.status, PaymentStatus::Pending);
    assert!(checkout.payment.transaction_id.starts_with("TXN-20260101000000-"));
    assert_eq!(checkout.tickets.len(), 5);
    assert!(checkout.tickets.iter().all(|ticket| ticket.status == TicketStatus::Pending));
    assert!(checkout.tickets.iter().all(|ticket| ticket.attendee == payer));
    assert!(checkout
        .tickets
        .iter()
        .all(|ticket| ticket.ticket_number.as_str().starts_with("TKT-20260101-")));

    let stored = h.store.tickets_for_payment(checkout.payment.id).await.unwrap();
    assert_eq!(stored.len(), 5);
}

#[tokio::test]
async fn checkout_requires_live_holds_by_the_payer() {
    let h = harness();
    let (alice, bob) = (CustomerId::new(), CustomerId::new());
    let seats = fixtures::seed_section(h.store.as_ref(), "Orchestra", 1, 1, Money::from_cents(5_000))
        .await
        .unwrap();

    let err = h.binder.open_checkout(request(alice, Vec::new())).await.unwrap_err();
    assert_eq!(err, BinderError::EmptyCheckout);

    let err = h
        .binder
        .open_checkout(request(alice, vec![CheckoutItem::Seat(seats[0])]))
        .await
        .unwrap_err();
    assert!(matches!(err, BinderError::HoldNotHeld(_)));

    h.engine
        .reserve_seats(bob, &seats, Some(Duration::from_secs(60)))
        .await
        .unwrap();
    let err = h
        .binder
        .open_checkout(request(alice, vec![CheckoutItem::Seat(seats[0])]))
        .await
        .unwrap_err();
    assert!(matches!(err, BinderError::HoldNotHeld(_)));

    h.clock.advance(ChronoDuration::seconds(61));
    let err = h
        .binder
        .open_checkout(request(bob, vec![CheckoutItem::Seat(seats[0])]))
        .await
        .unwrap_err();
    assert!(matches!(err, BinderError::HoldNotHeld(_)));
}

#[tokio::test]
async fn confirm_sells_seats_and_emits_one_delivery_per_ticket() {
    let h = harness();
    let payer = CustomerId::new();
    let (seats, checkout) = h.seat_checkout(payer, 3).await;

    let receipt = h
        .binder
        .confirm_payment(checkout.payment.id)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(receipt.payment.status, PaymentStatus::Completed);
    assert_eq!(receipt.confirmed.len(), 3);
    assert!(!receipt.replay);
    for seat in &seats {
        assert_eq!(h.unit_status(*seat).await, UnitStatus::Sold);
    }

    let delivered = h.delivery.delivered().await;
    assert_eq!(delivered.len(), 3);
    let first = &checkout.tickets[0];
    let record = delivered
        .iter()
        .find(|record| record.ticket_id == first.id)
        .unwrap();
    assert_eq!(record.ticket_number, first.ticket_number);
    assert!(record.qr_payload.contains(first.ticket_number.as_str()));
}

#[tokio::test]
async fn duplicate_confirm_applies_once() {
    let h = harness();
    let payer = CustomerId::new();
    let (seats, checkout) = h.seat_checkout(payer, 2).await;

    let first = h.binder.confirm_payment(checkout.payment.id).await.unwrap();
    let second = h.binder.confirm_payment(checkout.payment.id).await.unwrap();

    assert_eq!(first.confirmed.len(), 2);
    assert!(second.replay);
    assert!(second.confirmed.is_empty());
    assert_eq!(second.already_confirmed.len(), 2);
    assert!(second.violations.is_empty());

    let tickets = h.store.tickets_for_payment(checkout.payment.id).await.unwrap();
    assert!(tickets.iter().all(|ticket| ticket.status == TicketStatus::Confirmed));
    for (seat, ticket) in seats.iter().zip(&checkout.tickets) {
        let unit = h.store.load_unit(*seat).await.unwrap().unwrap();
        assert_eq!(unit.sold_to(), Some(ticket.id));
    }
    assert_eq!(h.delivery.delivered().await.len(), 2);
}

#[tokio::test]
async fn confirm_counts_sold_slots() {
    let h = harness();
    let payer = CustomerId::new();
    let (general, checkout) = h.slot_checkout(payer, 10, 4).await;

    let receipt = h.binder.confirm_payment(checkout.payment.id).await.unwrap();
    assert_eq!(receipt.confirmed.len(), 4);

    let pool = h.store.load_pool(general).await.unwrap().unwrap();
    assert_eq!((pool.sold(), pool.held(), pool.available()), (4, 0, 6));
}

#[tokio::test]
async fn expired_slot_hold_is_a_violation_and_other_tickets_still_confirm() {
    let h = harness();
    let payer = CustomerId::new();
    let seats = fixtures::seed_section(h.store.as_ref(), "Orchestra", 1, 1, Money::from_cents(5_000))
        .await
        .unwrap();
    let general = fixtures::seed_pool(h.store.as_ref(), "GA", Money::from_cents(2_000), 5)
        .await
        .unwrap();
    h.engine
        .reserve_seats(payer, &seats, Some(Duration::from_secs(600)))
        .await
        .unwrap();
    let hold = h
        .engine
        .reserve_slots(payer, general, 1, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    let checkout = h
        .binder
        .open_checkout(request(
            payer,
            vec![CheckoutItem::Seat(seats[0]), CheckoutItem::Slots(hold.hold_id)],
        ))
        .await
        .unwrap();

    h.clock.advance(ChronoDuration::seconds(5));
    let receipt = h.binder.confirm_payment(checkout.payment.id).await.unwrap();

    assert_eq!(receipt.confirmed.len(), 1);
    assert_eq!(receipt.violations.len(), 1);
    assert_eq!(h.unit_status(seats[0]).await, UnitStatus::Sold);
    assert_eq!(h.store.load_pool(general).await.unwrap().unwrap().sold(), 0);

    let slot_ticket = checkout
        .tickets
        .iter()
        .find(|ticket| matches!(ticket.binding, TicketBinding::Slot { .. }))
        .unwrap();
    assert_eq!(receipt.violations[0].ticket_id, slot_ticket.id);
    let stored = h.store.load_ticket(slot_ticket.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TicketStatus::Pending);
}

#[tokio::test]
async fn delivery_failure_does_not_undo_confirmation() {
    let h = harness();
    let (_, checkout) = h.seat_checkout(CustomerId::new(), 1).await;
    h.delivery.fail_deliveries(true);

    let receipt = h.binder.confirm_payment(checkout.payment.id).await.unwrap();
    assert_eq!(receipt.confirmed.len(), 1);
    assert_eq!(h.delivery.delivered().await.len(), 1);

    let ticket = h.store.load_ticket(checkout.tickets[0].id).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Confirmed);
}

#[tokio::test]
async fn fail_payment_cancels_tickets_and_releases_holds_immediately() {
    let h = harness();
    let payer = CustomerId::new();
    let (seats, checkout) = h.seat_checkout(payer, 2).await;

    let receipt = h.binder.fail_payment(checkout.payment.id).await.unwrap();
    assert_eq!(receipt.payment.status, PaymentStatus::Failed);
    assert_eq!(receipt.affected.len(), 2);
    for seat in &seats {
        assert_eq!(h.unit_status(*seat).await, UnitStatus::Available);
    }

    let replay = h.binder.fail_payment(checkout.payment.id).await.unwrap();
    assert!(replay.replay);
    assert!(replay.affected.is_empty());

    let err = h.binder.confirm_payment(checkout.payment.id).await.unwrap_err();
    assert_eq!(
        err,
        BinderError::ConflictingOutcome {
            payment_id: checkout.payment.id,
            current: PaymentStatus::Failed,
            requested: PaymentStatus::Completed,
        }
    );
}

#[tokio::test]
async fn fail_payment_leaves_holds_now_owned_by_someone_else() {
    let h = harness();
    let (alice, bob) = (CustomerId::new(), CustomerId::new());
    let seats = fixtures::seed_section(h.store.as_ref(), "Orchestra", 1, 1, Money::from_cents(5_000))
        .await
        .unwrap();
    h.engine
        .reserve_seats(alice, &seats, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    let checkout = h
        .binder
        .open_checkout(request(alice, vec![CheckoutItem::Seat(seats[0])]))
        .await
        .unwrap();

    h.clock.advance(ChronoDuration::seconds(2));
    h.engine.reserve_seats(bob, &seats, None).await.unwrap();

    h.binder.fail_payment(checkout.payment.id).await.unwrap();

    let unit = h.store.load_unit(seats[0]).await.unwrap().unwrap();
    assert_eq!(unit.status(), UnitStatus::Reserved);
    assert_eq!(unit.reserved_by(), Some(bob));
}

#[tokio::test]
async fn fail_payment_returns_slots_to_the_pool() {
    let h = harness();
    let (general, checkout) = h.slot_checkout(CustomerId::new(), 5, 3).await;

    h.binder.fail_payment(checkout.payment.id).await.unwrap();

    let pool = h.store.load_pool(general).await.unwrap().unwrap();
    assert_eq!((pool.held(), pool.available()), (0, 5));
}

#[tokio::test]
async fn refund_keeps_seats_sold_and_returns_slots() {
    let h = harness();
    let payer = CustomerId::new();
    let (seats, seat_checkout) = h.seat_checkout(payer, 1).await;
    let (general, slot_checkout) = h.slot_checkout(payer, 5, 2).await;

    let err = h.binder.refund_payment(seat_checkout.payment.id).await.unwrap_err();
    assert!(matches!(
        err,
        BinderError::ConflictingOutcome {
            current: PaymentStatus::Pending,
            ..
        }
    ));

    h.binder.confirm_payment(seat_checkout.payment.id).await.unwrap();
    h.binder.confirm_payment(slot_checkout.payment.id).await.unwrap();

    let refunded = h.binder.refund_payment(seat_checkout.payment.id).await.unwrap();
    assert_eq!(refunded.payment.status, PaymentStatus::Refunded);
    assert_eq!(refunded.affected.len(), 1);
    assert_eq!(h.unit_status(seats[0]).await, UnitStatus::Sold);

    h.binder.refund_payment(slot_checkout.payment.id).await.unwrap();
    let pool = h.store.load_pool(general).await.unwrap().unwrap();
    assert_eq!((pool.sold(), pool.available()), (0, 5));

    let replay = h.binder.refund_payment(slot_checkout.payment.id).await.unwrap();
    assert!(replay.replay);
    assert!(replay.affected.is_empty());
    assert_eq!(h.store.load_pool(general).await.unwrap().unwrap().sold(), 0);
}

#[tokio::test]
async fn unknown_payment_is_not_found() {
    let h = harness();
    let missing = seatkeeper_core::types::PaymentId::new();

    assert_eq!(
        h.binder.confirm_payment(missing).await.unwrap_err(),
        BinderError::PaymentNotFound(missing)
    );
    assert_eq!(
        h.binder.fail_payment(missing).await.unwrap_err(),
        BinderError::PaymentNotFound(missing)
    );
    assert_eq!(
        h.binder.refund_payment(missing).await.unwrap_err(),
        BinderError::PaymentNotFound(missing)
    );
}

#[tokio::test]
async fn cancel_pending_ticket_releases_its_hold() {
    let h = harness();
    let (alice, bob) = (CustomerId::new(), CustomerId::new());
    let (seats, checkout) = h.seat_checkout(alice, 2).await;
    let ticket = &checkout.tickets[0];

    let err = h.binder.cancel_ticket(bob, ticket.id).await.unwrap_err();
    assert_eq!(err, BinderError::NotTicketHolder(ticket.id));

    let cancelled = h.binder.cancel_ticket(alice, ticket.id).await.unwrap();
    assert_eq!(cancelled.status, TicketStatus::Cancelled);
    assert_eq!(h.unit_status(seats[0]).await, UnitStatus::Available);
    assert_eq!(h.unit_status(seats[1]).await, UnitStatus::Reserved);

    let again = h.binder.cancel_ticket(alice, ticket.id).await.unwrap();
    assert_eq!(again.status, TicketStatus::Cancelled);

    // The remaining ticket still confirms; the cancelled one is skipped
    let receipt = h.binder.confirm_payment(checkout.payment.id).await.unwrap();
    assert_eq!(receipt.confirmed, vec![checkout.tickets[1].id]);
    assert_eq!(h.unit_status(seats[0]).await, UnitStatus::Available);
}

#[tokio::test]
async fn cancel_confirmed_slot_ticket_returns_the_slot() {
    let h = harness();
    let payer = CustomerId::new();
    let (general, checkout) = h.slot_checkout(payer, 5, 2).await;
    h.binder.confirm_payment(checkout.payment.id).await.unwrap();

    h.binder.cancel_ticket(payer, checkout.tickets[0].id).await.unwrap();

    let pool = h.store.load_pool(general).await.unwrap().unwrap();
    assert_eq!((pool.sold(), pool.available()), (1, 4));
}

#[tokio::test]
async fn validate_marks_confirmed_tickets_used_once() {
    let h = harness();
    let (_, checkout) = h.seat_checkout(CustomerId::new(), 1).await;
    let ticket_id = checkout.tickets[0].id;

    let err = h.binder.validate_ticket(ticket_id).await.unwrap_err();
    assert_eq!(
        err,
        BinderError::InvalidTicketState {
            ticket_id,
            status: TicketStatus::Pending,
        }
    );

    h.binder.confirm_payment(checkout.payment.id).await.unwrap();
    let used = h.binder.validate_ticket(ticket_id).await.unwrap();
    assert_eq!(used.status, TicketStatus::Used);
    assert_eq!(used.used_at, Some(h.clock_now()));

    let err = h.binder.validate_ticket(ticket_id).await.unwrap_err();
    assert!(matches!(
        err,
        BinderError::InvalidTicketState {
            status: TicketStatus::Used,
            ..
        }
    ));

    let missing = seatkeeper_core::types::TicketId::new();
    assert_eq!(
        h.binder.validate_ticket(missing).await.unwrap_err(),
        BinderError::TicketNotFound(missing)
    );
}

impl Harness {
    fn clock_now(&self) -> chrono::DateTime<chrono::Utc> {
        use seatkeeper_core::environment::Clock;
        self.clock.now()
    }
}

#[tokio::test]
async fn callback_by_external_order_confirms_and_records_receipt() {
    let h = harness();
    let (seats, checkout) = h.seat_checkout(CustomerId::new(), 1).await;
    h.binder
        .attach_external_order(checkout.payment.id, "PAYPAL-ORDER-1".to_string())
        .await
        .unwrap();

    let callback = GatewayCallback {
        payment: PaymentRef::ExternalOrder("PAYPAL-ORDER-1".to_string()),
        outcome: GatewayOutcome::Success,
        amount: checkout.payment.amount,
        external_receipt_id: Some("CAPTURE-9".to_string()),
    };

    let first = h.binder.handle_gateway_callback(callback.clone()).await.unwrap();
    let CallbackResult::Confirmed(receipt) = first else {
        panic!("expected confirmation");
    };
    assert_eq!(receipt.confirmed.len(), 1);
    assert_eq!(receipt.payment.external_receipt_id.as_deref(), Some("CAPTURE-9"));
    assert_eq!(h.unit_status(seats[0]).await, UnitStatus::Sold);

    let second = h.binder.handle_gateway_callback(callback).await.unwrap();
    assert!(matches!(second, CallbackResult::Confirmed(ref r) if r.replay && r.confirmed.is_empty()));
}

#[tokio::test]
async fn callback_with_wrong_amount_changes_nothing() {
    let h = harness();
    let (seats, checkout) = h.seat_checkout(CustomerId::new(), 1).await;

    let err = h
        .binder
        .handle_gateway_callback(GatewayCallback {
            payment: PaymentRef::Id(checkout.payment.id),
            outcome: GatewayOutcome::Success,
            amount: Money::from_cents(1),
            external_receipt_id: None,
        })
        .await
        .unwrap_err();

    assert_eq!(
        err,
        BinderError::AmountMismatch {
            payment_id: checkout.payment.id,
            expected: checkout.payment.amount,
            received: Money::from_cents(1),
        }
    );
    let payment = h.store.load_payment(checkout.payment.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(h.unit_status(seats[0]).await, UnitStatus::Reserved);
}

#[tokio::test]
async fn failure_callback_fails_the_payment() {
    let h = harness();
    let (seats, checkout) = h.seat_checkout(CustomerId::new(), 1).await;

    let result = h
        .binder
        .handle_gateway_callback(GatewayCallback {
            payment: PaymentRef::Id(checkout.payment.id),
            outcome: GatewayOutcome::Failure,
            amount: Money::ZERO,
            external_receipt_id: None,
        })
        .await
        .unwrap();

    assert!(matches!(result, CallbackResult::Failed(ref r) if r.affected.len() == 1));
    assert_eq!(h.unit_status(seats[0]).await, UnitStatus::Available);
}

#[tokio::test]
async fn callback_for_unknown_order_is_reported() {
    let h = harness();
    let err = h
        .binder
        .handle_gateway_callback(GatewayCallback {
            payment: PaymentRef::ExternalOrder("missing".to_string()),
            outcome: GatewayOutcome::Success,
            amount: Money::ZERO,
            external_receipt_id: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err, BinderError::ExternalOrderNotFound("missing".to_string()));
}

#[tokio::test]
async fn held_seat_backs_one_pending_checkout() {
    let h = harness();
    let payer = CustomerId::new();
    let (seats, first) = h.seat_checkout(payer, 1).await;

    let err = h
        .binder
        .open_checkout(request(payer, vec![CheckoutItem::Seat(seats[0])]))
        .await
        .unwrap_err();
    assert_eq!(err, BinderError::HoldInCheckout(format!("seat {}", seats[0])));
    assert_eq!(h.unit_status(seats[0]).await, UnitStatus::Reserved);

    let receipt = h.binder.confirm_payment(first.payment.id).await.unwrap();
    assert_eq!(receipt.confirmed, vec![first.tickets[0].id]);
    assert!(receipt.violations.is_empty());
    assert_eq!(h.unit_status(seats[0]).await, UnitStatus::Sold);
}

#[tokio::test]
async fn slot_hold_backs_one_pending_checkout() {
    let h = harness();
    let payer = CustomerId::new();
    let general = fixtures::seed_pool(h.store.as_ref(), "GA", Money::from_cents(2_000), 5)
        .await
        .unwrap();
    let hold = h.engine.reserve_slots(payer, general, 2, None).await.unwrap();
    let first = h
        .binder
        .open_checkout(request(payer, vec![CheckoutItem::Slots(hold.hold_id)]))
        .await
        .unwrap();

    let err = h
        .binder
        .open_checkout(request(payer, vec![CheckoutItem::Slots(hold.hold_id)]))
        .await
        .unwrap_err();
    assert!(matches!(err, BinderError::HoldInCheckout(_)));

    // Once the first checkout failed, its hold is gone with it
    h.binder.fail_payment(first.payment.id).await.unwrap();
    let err = h
        .binder
        .open_checkout(request(payer, vec![CheckoutItem::Slots(hold.hold_id)]))
        .await
        .unwrap_err();
    assert!(matches!(err, BinderError::HoldNotHeld(_)));
}

#[tokio::test]
async fn abandoned_checkout_of_an_expired_hold_does_not_block_the_next_holder() {
    let h = harness();
    let (alice, bob) = (CustomerId::new(), CustomerId::new());
    let seats = fixtures::seed_section(h.store.as_ref(), "Orchestra", 1, 1, Money::from_cents(5_000))
        .await
        .unwrap();
    h.engine
        .reserve_seats(alice, &seats, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    let abandoned = h
        .binder
        .open_checkout(request(alice, vec![CheckoutItem::Seat(seats[0])]))
        .await
        .unwrap();

    h.clock.advance(ChronoDuration::seconds(2));
    h.engine.reserve_seats(bob, &seats, None).await.unwrap();
    let checkout = h
        .binder
        .open_checkout(request(bob, vec![CheckoutItem::Seat(seats[0])]))
        .await
        .unwrap();

    // Alice's gateway times out later: Bob's hold is untouched
    h.binder.fail_payment(abandoned.payment.id).await.unwrap();
    let receipt = h.binder.confirm_payment(checkout.payment.id).await.unwrap();
    assert_eq!(receipt.confirmed.len(), 1);
    let unit = h.store.load_unit(seats[0]).await.unwrap().unwrap();
    assert_eq!(unit.sold_to(), Some(checkout.tickets[0].id));
}

#[tokio::test]
async fn refund_cancels_tickets_a_violation_left_pending() {
    let h = harness();
    let payer = CustomerId::new();
    let seats = fixtures::seed_section(h.store.as_ref(), "Orchestra", 1, 1, Money::from_cents(5_000))
        .await
        .unwrap();
    h.engine
        .reserve_seats(payer, &seats, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    let checkout = h
        .binder
        .open_checkout(request(payer, vec![CheckoutItem::Seat(seats[0])]))
        .await
        .unwrap();
    let ticket_id = checkout.tickets[0].id;

    h.clock.advance(ChronoDuration::seconds(5));
    let receipt = h.binder.confirm_payment(checkout.payment.id).await.unwrap();
    assert_eq!(receipt.payment.status, PaymentStatus::Completed);
    assert_eq!(receipt.violations.len(), 1);
    assert_eq!(
        h.store.load_ticket(ticket_id).await.unwrap().unwrap().status,
        TicketStatus::Pending
    );

    let refund = h.binder.refund_payment(checkout.payment.id).await.unwrap();
    assert_eq!(refund.payment.status, PaymentStatus::Refunded);
    assert_eq!(refund.affected, vec![ticket_id]);
    assert_eq!(
        h.store.load_ticket(ticket_id).await.unwrap().unwrap().status,
        TicketStatus::Cancelled
    );
    // The stale hold was never consumed; the next request reclaims it
    let outcome = h.engine.reserve_seats(CustomerId::new(), &seats, None).await.unwrap();
    assert_eq!(outcome.granted, seats);
}

#[tokio::test]
async fn success_callback_reports_violations_as_an_error() {
    let h = harness();
    let payer = CustomerId::new();
    let seats = fixtures::seed_section(h.store.as_ref(), "Orchestra", 1, 1, Money::from_cents(5_000))
        .await
        .unwrap();
    h.engine
        .reserve_seats(payer, &seats, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    let checkout = h
        .binder
        .open_checkout(request(payer, vec![CheckoutItem::Seat(seats[0])]))
        .await
        .unwrap();
    h.clock.advance(ChronoDuration::seconds(5));

    let err = h
        .binder
        .handle_gateway_callback(GatewayCallback {
            payment: PaymentRef::Id(checkout.payment.id),
            outcome: GatewayOutcome::Success,
            amount: checkout.payment.amount,
            external_receipt_id: Some("CAPTURE-1".to_string()),
        })
        .await
        .unwrap_err();

    let BinderError::ConsistencyViolation(violations) = err else {
        panic!("expected a consistency violation");
    };
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].ticket_id, checkout.tickets[0].id);
    let payment = h.store.load_payment(checkout.payment.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.external_receipt_id.as_deref(), Some("CAPTURE-1"));
}

#[tokio::test]
async fn cancel_racing_confirm_gives_the_seat_back() {
    let h = harness();
    let payer = CustomerId::new();
    let (seats, checkout) = h.seat_checkout(payer, 2).await;
    let (raced, kept) = (checkout.tickets[0].id, checkout.tickets[1].id);
    h.store.inject_cancel_before_confirm(raced).await;

    let receipt = h.binder.confirm_payment(checkout.payment.id).await.unwrap();

    assert_eq!(receipt.confirmed, vec![kept]);
    assert!(receipt.violations.is_empty());
    assert_eq!(h.store.load_ticket(raced).await.unwrap().unwrap().status, TicketStatus::Cancelled);
    assert_eq!(h.unit_status(seats[0]).await, UnitStatus::Available);
    assert_eq!(h.unit_status(seats[1]).await, UnitStatus::Sold);
    assert_eq!(h.delivery.delivered().await.len(), 1);
}

#[tokio::test]
async fn cancel_racing_confirm_gives_the_slot_back() {
    let h = harness();
    let (general, checkout) = h.slot_checkout(CustomerId::new(), 5, 1).await;
    let sold_before = h.store.load_pool(general).await.unwrap().unwrap().sold();
    h.store.inject_cancel_before_confirm(checkout.tickets[0].id).await;

    let receipt = h.binder.confirm_payment(checkout.payment.id).await.unwrap();

    assert!(receipt.confirmed.is_empty());
    assert!(receipt.violations.is_empty());
    let pool = h.store.load_pool(general).await.unwrap().unwrap();
    assert_eq!(pool.sold(), sold_before);
    assert_eq!((pool.held(), pool.available()), (0, 5));
}
