//! Fixtures for unit tests: an in-memory store wired to a recording sink.

use std::sync::{Arc, Mutex, PoisonError};

use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use ftgo_proto::orchestration_service::{notification_event, Notification};
use uuid::Uuid;

use crate::checkout::CheckoutDesk;
use crate::config::Settings;
use crate::decomposition::{Cart, CartItem, MenuCatalog, OrderDecomposer};
use crate::dispatch::Dispatcher;
use crate::events::{event_kind, NotificationSink, Notifier, NotifyError};
use crate::models::{
    AggregateOrder, Fulfillment, OrderStatus, OrderingMode, PaymentMethod, PaymentStatus,
    ReservationSlot, Rider, RiderStatus, SubOrder,
};
use crate::payment::PaymentDesk;
use crate::state_machine::SubOrderWorkflow;
use crate::store::{MemoryStore, Repository, Store, StoreError};

pub(crate) fn pending_order(mode: OrderingMode) -> AggregateOrder {
    let now = Utc::now();
    AggregateOrder {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        status: OrderStatus::Pending,
        payment_status: PaymentStatus::Pending,
        payment_method: PaymentMethod::Card,
        ordering_mode: mode,
        delivery_address: "1 Main St".to_string(),
        scheduled_time: None,
        total_amount: BigDecimal::from(20),
        discount_amount: BigDecimal::from(0),
        applied_coupon: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn delivery_sub_order(order: &AggregateOrder, status: OrderStatus) -> SubOrder {
    SubOrder {
        id: Uuid::new_v4(),
        aggregate_order_id: order.id,
        vendor_id: Uuid::new_v4(),
        position: 0,
        rider_id: None,
        fulfillment: Fulfillment::Delivery,
        status,
        total_amount: BigDecimal::from(20),
        version: 0,
        preparation_start_time: None,
        estimated_delivery_time: None,
        actual_delivery_time: None,
        created_at: order.created_at,
        updated_at: order.created_at,
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<(Uuid, Notification)>>,
}

impl RecordingSink {
    pub(crate) fn notifications(&self) -> Vec<(Uuid, Notification)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn sent(&self) -> Vec<(Uuid, notification_event::Event)> {
        self.notifications()
            .into_iter()
            .filter_map(|(to, n)| n.event.and_then(|e| e.event).map(|e| (to, e)))
            .collect()
    }

    pub(crate) fn kinds_for(&self, recipient_id: Uuid) -> Vec<&'static str> {
        self.sent()
            .iter()
            .filter(|(to, _)| *to == recipient_id)
            .map(|(_, event)| event_kind(event))
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, recipient_id: Uuid, notification: &Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((recipient_id, notification.clone()));
        Ok(())
    }
}

/// Three vendors with a small menu: `pasta` and `tiramisu` from the first,
/// `sushi` from the second, `taco` from the third.
pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub sink: Arc<RecordingSink>,
    pub notifier: Notifier,
    pub settings: Settings,
    pub vendors: [Uuid; 3],
    pub catalog: Arc<MenuCatalog>,
}

impl Harness {
    pub fn new() -> Self {
        let sink = Arc::new(RecordingSink::default());
        let vendors = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let catalog = MenuCatalog::new()
            .with_item("pasta", vendors[0], "Pasta", BigDecimal::from(10))
            .with_item("tiramisu", vendors[0], "Tiramisu", BigDecimal::from(6))
            .with_item("sushi", vendors[1], "Sushi", BigDecimal::from(15))
            .with_item("taco", vendors[2], "Taco", BigDecimal::from(4));
        Self {
            store: Arc::new(MemoryStore::new()),
            notifier: Notifier::new(sink.clone()),
            sink,
            settings: Settings::default(),
            vendors,
            catalog: Arc::new(catalog),
        }
    }

    pub fn workflow(&self) -> SubOrderWorkflow<MemoryStore> {
        SubOrderWorkflow::new(self.store.clone(), self.notifier.clone(), self.settings.clone())
    }

    pub fn dispatcher(&self) -> Dispatcher<MemoryStore> {
        Dispatcher::new(self.store.clone(), self.notifier.clone(), self.settings.clone())
    }

    pub fn decomposer(&self) -> OrderDecomposer<MemoryStore, MenuCatalog> {
        OrderDecomposer::new(self.store.clone(), self.catalog.clone(), self.notifier.clone())
    }

    pub fn checkout_desk(&self) -> CheckoutDesk<MemoryStore, MenuCatalog> {
        CheckoutDesk::new(&self.decomposer(), self.settings.clone())
    }

    pub fn payment_desk(&self) -> PaymentDesk<MemoryStore> {
        PaymentDesk::new(
            self.store.clone(),
            self.dispatcher(),
            self.notifier.clone(),
            self.settings.clone(),
        )
    }

    fn write<T>(&self, f: impl FnOnce(&mut <MemoryStore as Store>::Repo) -> Result<T, StoreError>) -> T {
        self.store.transaction(f).unwrap()
    }

    pub fn seed(&self, order: &AggregateOrder, sub_orders: &[SubOrder]) {
        self.write(|repo| {
            repo.insert_aggregate_order(order)?;
            for sub_order in sub_orders {
                repo.insert_sub_order(sub_order, &[])?;
            }
            Ok(())
        })
    }

    fn rider_with(&self, status: RiderStatus) -> Rider {
        let rider = Rider {
            id: Uuid::new_v4(),
            name: "rider".to_string(),
            online: true,
            latitude: None,
            longitude: None,
            status,
            updated_at: Utc::now(),
        };
        self.write(|repo| repo.insert_rider(&rider));
        rider
    }

    pub fn online_rider(&self) -> Rider {
        self.rider_with(RiderStatus::Idle)
    }

    pub fn on_delivery_rider(&self) -> Rider {
        self.rider_with(RiderStatus::OnDelivery)
    }

    pub fn rider(&self, id: Uuid) -> Rider {
        self.write(|repo| repo.get_rider(id))
    }

    pub fn sub_order(&self, id: Uuid) -> SubOrder {
        self.write(|repo| repo.get_sub_order(id))
    }

    pub fn aggregate(&self, id: Uuid) -> AggregateOrder {
        self.write(|repo| repo.get_aggregate_order(id))
    }

    pub fn slot(&self, id: Uuid) -> ReservationSlot {
        self.write(|repo| repo.get_slot(id))
    }

    pub fn slot_with_reservations(&self, max_capacity: i32, current: i32) -> ReservationSlot {
        self.slot_for(Uuid::new_v4(), max_capacity, current)
    }

    pub fn slot_for(&self, vendor_id: Uuid, max_capacity: i32, current: i32) -> ReservationSlot {
        let start_time = Utc::now() + Duration::hours(2);
        let slot = ReservationSlot {
            id: Uuid::new_v4(),
            vendor_id,
            start_time,
            end_time: start_time + Duration::hours(1),
            max_capacity,
            current_capacity: current,
            is_active: true,
            version: 0,
        };
        self.write(|repo| repo.insert_slot(&slot));
        slot
    }

    pub fn cart(&self, items: Vec<CartItem>) -> Cart {
        Cart {
            user_id: Uuid::new_v4(),
            items,
            discount_amount: BigDecimal::from(0),
            applied_coupon: None,
        }
    }

    /// Aggregate orders and sub-orders currently stored.
    pub fn counts(&self) -> (usize, usize) {
        self.write(|repo| Ok(repo.counts()))
    }

    /// Shifts every offer on the sub-order `by` into the past.
    pub fn age_offers(&self, sub_order_id: Uuid, by: Duration) {
        self.write(|repo| {
            for offer in repo.offers_mut().filter(|o| o.sub_order_id == sub_order_id) {
                offer.expires_at = offer.expires_at - by;
                offer.created_at = offer.created_at - by;
            }
            Ok(())
        })
    }
}
