//! Runs against a real Postgres named by `DATABASE_URL`:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/ftgo_orchestration_test cargo test -- --ignored
//! ```

use std::sync::{Arc, Barrier};
use std::thread;

use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use ftgo_orchestration_service::config::Settings;
use ftgo_orchestration_service::decomposition::{
    Cart, CartItem, DeliveryMeta, MenuCatalog, OrderDecomposer,
};
use ftgo_orchestration_service::dispatch::Dispatcher;
use ftgo_orchestration_service::events::{Notifier, TracingSink};
use ftgo_orchestration_service::ledger::CapacityLedger;
use ftgo_orchestration_service::models::{
    OrderStatus, OrderingMode, PaymentMethod, PaymentStatus, RiderStatus,
};
use ftgo_orchestration_service::payment::PaymentDesk;
use ftgo_orchestration_service::state_machine::{Actor, SubOrderWorkflow};
use ftgo_orchestration_service::store::PgStore;
use ftgo_orchestration_service::OrchestrationError;
use uuid::Uuid;

fn store() -> Arc<PgStore> {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = PgStore::new(url);
    store.run_migrations().expect("migrations");
    Arc::new(store)
}

fn notifier() -> Notifier {
    Notifier::new(Arc::new(TracingSink))
}

fn delivery_meta() -> DeliveryMeta {
    DeliveryMeta {
        mode: OrderingMode::Delivery,
        delivery_address: "4 Harbour Rd".to_string(),
        payment_method: PaymentMethod::Card,
        scheduled_time: None,
        slot_id: None,
        table_ref: None,
    }
}

fn cart_of(item_ref: &str) -> Cart {
    Cart {
        user_id: Uuid::new_v4(),
        items: vec![CartItem {
            item_ref: item_ref.to_string(),
            quantity: 1,
        }],
        discount_amount: BigDecimal::from(0),
        applied_coupon: None,
    }
}

#[test]
#[ignore]
fn concurrent_reservations_never_overbook() {
    let ledger = Arc::new(CapacityLedger::new(store()));
    let start = Utc::now() + Duration::hours(1);
    let slot = ledger
        .open_slot(Uuid::new_v4(), start, start + Duration::hours(1), 3)
        .unwrap();

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            let slot_id = slot.id;
            thread::spawn(move || {
                barrier.wait();
                ledger.reserve(slot_id).unwrap()
            })
        })
        .collect();
    let granted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(granted, 3);
    assert_eq!(ledger.get_slot(slot.id).unwrap().current_capacity, 3);
}

#[test]
#[ignore]
fn paid_order_is_claimed_by_exactly_one_rider() {
    let store = store();
    let settings = Settings::default();
    let vendor_id = Uuid::new_v4();
    let catalog = MenuCatalog::new().with_item(
        "noodles",
        vendor_id,
        "Noodles",
        BigDecimal::from(9),
    );
    let decomposer = OrderDecomposer::new(store.clone(), Arc::new(catalog), notifier());
    let dispatcher = Dispatcher::new(store.clone(), notifier(), settings.clone());

    let riders: Vec<Uuid> = (0..3)
        .map(|i| {
            let rider = dispatcher.register_rider(&format!("rider-{}", i)).unwrap();
            dispatcher.set_availability(rider.id, true, None).unwrap();
            rider.id
        })
        .collect();

    let order = decomposer
        .create_aggregate_order(&cart_of("noodles"), &delivery_meta())
        .unwrap();
    let sub_order = decomposer.sub_orders(order.id).unwrap().remove(0);

    let payments = PaymentDesk::new(
        store.clone(),
        Dispatcher::new(store.clone(), notifier(), settings.clone()),
        notifier(),
        settings.clone(),
    );
    let paid = payments.confirm_payment(order.id).unwrap();
    assert_eq!(paid.payment_status, PaymentStatus::Paid);

    let offers: Vec<_> = dispatcher
        .offers_for(sub_order.id)
        .unwrap()
        .into_iter()
        .filter(|o| riders.contains(&o.rider_id))
        .collect();
    assert_eq!(offers.len(), riders.len());

    let dispatcher = Arc::new(dispatcher);
    let barrier = Arc::new(Barrier::new(offers.len()));
    let handles: Vec<_> = offers
        .into_iter()
        .map(|offer| {
            let dispatcher = dispatcher.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (offer.rider_id, dispatcher.accept(offer.id, offer.rider_id))
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<Uuid> = results
        .iter()
        .filter(|(_, r)| r.is_ok())
        .map(|(rider_id, _)| *rider_id)
        .collect();
    assert_eq!(winners.len(), 1);
    assert!(results.iter().all(|(_, r)| match r {
        Ok(_) => true,
        Err(OrchestrationError::OfferUnavailable { .. }) => true,
        Err(_) => false,
    }));

    let workflow = SubOrderWorkflow::new(store.clone(), notifier(), settings);
    let bound = workflow.get(sub_order.id).unwrap();
    assert_eq!(bound.status, OrderStatus::Accepted);
    assert_eq!(bound.rider_id, Some(winners[0]));

    workflow
        .update_status(sub_order.id, OrderStatus::Preparing, Actor::Vendor(vendor_id))
        .unwrap();
    workflow
        .update_status(sub_order.id, OrderStatus::OutForDelivery, Actor::Rider(winners[0]))
        .unwrap();
    let delivered = workflow
        .update_status(sub_order.id, OrderStatus::Delivered, Actor::Rider(winners[0]))
        .unwrap();
    assert!(delivered.actual_delivery_time.is_some());

    let rider = dispatcher.set_availability(winners[0], false, None).unwrap();
    assert_eq!(rider.status, RiderStatus::Idle);
    assert_eq!(
        decomposer.get_aggregate_order(order.id).unwrap().status,
        OrderStatus::Delivered
    );
}

#[test]
#[ignore]
fn reserving_one_slot_leaves_its_neighbours_alone() {
    let ledger = CapacityLedger::new(store());
    let vendor_id = Uuid::new_v4();
    let start = Utc::now() + Duration::hours(2);
    let lunch = ledger
        .open_slot(vendor_id, start, start + Duration::hours(1), 2)
        .unwrap();
    let dinner = ledger
        .open_slot(vendor_id, start + Duration::hours(6), start + Duration::hours(7), 2)
        .unwrap();

    assert!(ledger.reserve(lunch.id).unwrap());
    assert!(ledger.reserve(lunch.id).unwrap());
    assert!(!ledger.reserve(lunch.id).unwrap());

    let lunch = ledger.get_slot(lunch.id).unwrap();
    assert_eq!((lunch.current_capacity, lunch.version), (2, 2));
    let untouched = ledger.get_slot(dinner.id).unwrap();
    assert_eq!((untouched.current_capacity, untouched.version), (0, 0));
    assert!(untouched.is_active);

    let closed = ledger.set_slot_active(dinner.id, false).unwrap();
    assert!(!closed.is_active);
    assert!(ledger.get_slot(lunch.id).unwrap().is_active);
    assert!(!ledger.reserve(dinner.id).unwrap());
    assert!(ledger.release(lunch.id).unwrap());
    assert_eq!(ledger.get_slot(lunch.id).unwrap().current_capacity, 1);
    assert_eq!(ledger.get_slot(dinner.id).unwrap().current_capacity, 0);
}

#[test]
#[ignore]
fn rider_accepting_two_offers_at_once_gets_one() {
    let store = store();
    let settings = Settings::default();
    let (noodle_bar, taqueria) = (Uuid::new_v4(), Uuid::new_v4());
    let catalog = MenuCatalog::new()
        .with_item("noodles", noodle_bar, "Noodles", BigDecimal::from(9))
        .with_item("taco", taqueria, "Taco", BigDecimal::from(4));
    let decomposer = OrderDecomposer::new(store.clone(), Arc::new(catalog), notifier());
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), notifier(), settings.clone()));
    let payments = PaymentDesk::new(
        store.clone(),
        Dispatcher::new(store.clone(), notifier(), settings.clone()),
        notifier(),
        settings,
    );

    let rider = dispatcher.register_rider("solo").unwrap();
    dispatcher.set_availability(rider.id, true, None).unwrap();

    let offers: Vec<_> = ["noodles", "taco"]
        .iter()
        .map(|item| {
            let order = decomposer
                .create_aggregate_order(&cart_of(item), &delivery_meta())
                .unwrap();
            payments.confirm_payment(order.id).unwrap();
            let sub_order = decomposer.sub_orders(order.id).unwrap().remove(0);
            dispatcher
                .offers_for(sub_order.id)
                .unwrap()
                .into_iter()
                .find(|o| o.rider_id == rider.id)
                .unwrap()
        })
        .collect();

    let barrier = Arc::new(Barrier::new(offers.len()));
    let handles: Vec<_> = offers
        .iter()
        .map(|offer| {
            let dispatcher = dispatcher.clone();
            let barrier = barrier.clone();
            let (offer_id, sub_order_id, rider_id) = (offer.id, offer.sub_order_id, offer.rider_id);
            thread::spawn(move || {
                barrier.wait();
                (sub_order_id, dispatcher.accept(offer_id, rider_id))
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let won: Vec<Uuid> = results
        .iter()
        .filter(|(_, r)| r.is_ok())
        .map(|(id, _)| *id)
        .collect();
    assert_eq!(won.len(), 1);
    assert!(results
        .iter()
        .any(|(_, r)| matches!(r, Err(OrchestrationError::AccessDenied(_)))));

    let workflow = SubOrderWorkflow::new(store.clone(), notifier(), Settings::default());
    for (sub_order_id, _) in &results {
        let stored = workflow.get(*sub_order_id).unwrap();
        if *sub_order_id == won[0] {
            assert_eq!(stored.rider_id, Some(rider.id));
            assert_eq!(stored.status, OrderStatus::Accepted);
        } else {
            assert_eq!(stored.rider_id, None);
            assert_eq!(stored.status, OrderStatus::Offered);
        }
    }

    let rider = dispatcher.set_availability(rider.id, false, None).unwrap();
    assert_eq!(rider.status, RiderStatus::OnDelivery);
    assert!(!rider.online);
}
