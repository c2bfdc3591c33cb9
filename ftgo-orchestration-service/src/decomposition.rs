//! Order decomposition engine.
//!
//! A cart is split into one sub-order per vendor, in the order vendors first
//! appear. Reserving the slot and writing every row happen in one
//! transaction, so a full slot leaves no trace.

use std::collections::HashMap;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{log_failure, OrchestrationError, Result};
use crate::events::{Notifier, Outbox};
use crate::ledger::reserve_in;
use crate::models::{
    AggregateOrder, Fulfillment, OrderStatus, OrderingMode, PaymentMethod, PaymentStatus,
    SubOrder, SubOrderLineItem,
};
use crate::store::{Repository, Store};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CartItem {
    pub item_ref: String,
    pub quantity: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Cart {
    pub user_id: Uuid,
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub discount_amount: BigDecimal,
    #[serde(default)]
    pub applied_coupon: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeliveryMeta {
    pub mode: OrderingMode,
    pub delivery_address: String,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub slot_id: Option<Uuid>,
    #[serde(default)]
    pub table_ref: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CatalogEntry {
    pub vendor_id: Uuid,
    pub name: String,
    pub unit_price: BigDecimal,
}

/// Pricing lookup. Its answers are trusted as-is.
pub trait Catalog: Send + Sync {
    fn vendor_and_price(&self, item_ref: &str) -> Option<CatalogEntry>;
}

#[derive(Default)]
pub struct MenuCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl MenuCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(
        mut self,
        item_ref: &str,
        vendor_id: Uuid,
        name: &str,
        unit_price: BigDecimal,
    ) -> Self {
        self.entries.insert(
            item_ref.to_string(),
            CatalogEntry {
                vendor_id,
                name: name.to_string(),
                unit_price,
            },
        );
        self
    }
}

impl Catalog for MenuCatalog {
    fn vendor_and_price(&self, item_ref: &str) -> Option<CatalogEntry> {
        self.entries.get(item_ref).cloned()
    }
}

struct PricedLine {
    item_ref: String,
    name: String,
    quantity: i32,
    unit_price: BigDecimal,
}

struct VendorGroup {
    vendor_id: Uuid,
    lines: Vec<PricedLine>,
}

impl VendorGroup {
    fn subtotal(&self) -> BigDecimal {
        self.lines
            .iter()
            .map(|l| &l.unit_price * BigDecimal::from(l.quantity))
            .sum()
    }
}

/// A validated, priced cart ready to be written.
pub(crate) struct OrderPlan {
    user_id: Uuid,
    meta: DeliveryMeta,
    discount_amount: BigDecimal,
    applied_coupon: Option<String>,
    groups: Vec<VendorGroup>,
}

fn invalid(reason: impl Into<String>) -> OrchestrationError {
    OrchestrationError::InvalidRequest(reason.into())
}

fn validate_meta(meta: &DeliveryMeta) -> Result<()> {
    match meta.mode {
        OrderingMode::Delivery | OrderingMode::Takeaway => {
            if meta.slot_id.is_some() || meta.table_ref.is_some() {
                return Err(invalid(format!(
                    "{} orders take no slot or table",
                    meta.mode
                )));
            }
        }
        OrderingMode::Preorder => {
            if meta.slot_id.is_none() {
                return Err(invalid("preorder requires a reservation slot"));
            }
            if meta.table_ref.is_some() {
                return Err(invalid("preorder takes no table"));
            }
        }
        OrderingMode::DineIn => {}
    }
    if meta.mode == OrderingMode::Delivery && meta.delivery_address.trim().is_empty() {
        return Err(invalid("delivery requires an address"));
    }
    Ok(())
}

pub(crate) fn plan_order<C: Catalog + ?Sized>(
    catalog: &C,
    cart: &Cart,
    meta: &DeliveryMeta,
) -> Result<OrderPlan> {
    validate_meta(meta)?;
    if cart.items.is_empty() {
        return Err(invalid("cart is empty"));
    }
    if cart.discount_amount < BigDecimal::from(0) {
        return Err(invalid("discount cannot be negative"));
    }

    let mut groups: Vec<VendorGroup> = Vec::new();
    for item in &cart.items {
        if item.quantity < 1 {
            return Err(invalid(format!("quantity of {} must be positive", item.item_ref)));
        }
        let entry = catalog
            .vendor_and_price(&item.item_ref)
            .ok_or_else(|| invalid(format!("unknown item {}", item.item_ref)))?;
        let line = PricedLine {
            item_ref: item.item_ref.clone(),
            name: entry.name,
            quantity: item.quantity,
            unit_price: entry.unit_price,
        };
        match groups.iter_mut().find(|g| g.vendor_id == entry.vendor_id) {
            Some(group) => group.lines.push(line),
            None => groups.push(VendorGroup {
                vendor_id: entry.vendor_id,
                lines: vec![line],
            }),
        }
    }

    Ok(OrderPlan {
        user_id: cart.user_id,
        meta: meta.clone(),
        discount_amount: cart.discount_amount.clone(),
        applied_coupon: cart.applied_coupon.clone(),
        groups,
    })
}

fn fulfillment_for(meta: &DeliveryMeta, vendor_id: Uuid, slot_vendor: Option<Uuid>) -> Fulfillment {
    // Slot and table go to the vendor owning the slot; without a slot the
    // table applies to every vendor.
    let holds_slot = slot_vendor == Some(vendor_id);
    match meta.mode {
        OrderingMode::Delivery => Fulfillment::Delivery,
        OrderingMode::Takeaway => Fulfillment::Takeaway,
        OrderingMode::DineIn => Fulfillment::DineIn {
            slot_id: meta.slot_id.filter(|_| holds_slot),
            table_ref: meta
                .table_ref
                .clone()
                .filter(|_| holds_slot || slot_vendor.is_none()),
        },
        OrderingMode::Preorder => Fulfillment::Preorder {
            slot_id: meta.slot_id.filter(|_| holds_slot),
        },
    }
}

/// Reserves the slot, if any, and writes the aggregate order with its
/// sub-orders. Any failure aborts the enclosing transaction.
pub(crate) fn decompose_in<R: Repository>(
    repo: &mut R,
    plan: &OrderPlan,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> Result<AggregateOrder> {
    let slot_vendor = match plan.meta.slot_id {
        Some(slot_id) => {
            let slot = repo.get_slot(slot_id)?;
            if !plan.groups.iter().any(|g| g.vendor_id == slot.vendor_id) {
                return Err(invalid(format!(
                    "slot {} belongs to a vendor not in the cart",
                    slot_id
                )));
            }
            if !reserve_in(repo, slot_id)? {
                return Err(OrchestrationError::CapacityExhausted { slot_id });
            }
            Some(slot.vendor_id)
        }
        None => None,
    };

    let order = AggregateOrder {
        id: Uuid::new_v4(),
        user_id: plan.user_id,
        status: OrderStatus::Pending,
        payment_status: PaymentStatus::Pending,
        payment_method: plan.meta.payment_method,
        ordering_mode: plan.meta.mode,
        delivery_address: plan.meta.delivery_address.clone(),
        scheduled_time: plan.meta.scheduled_time,
        total_amount: plan.groups.iter().map(VendorGroup::subtotal).sum(),
        discount_amount: plan.discount_amount.clone(),
        applied_coupon: plan.applied_coupon.clone(),
        created_at: now,
        updated_at: now,
    };
    repo.insert_aggregate_order(&order)?;

    for (position, group) in plan.groups.iter().enumerate() {
        let sub_order = SubOrder {
            id: Uuid::new_v4(),
            aggregate_order_id: order.id,
            vendor_id: group.vendor_id,
            position: position as i32,
            rider_id: None,
            fulfillment: fulfillment_for(&plan.meta, group.vendor_id, slot_vendor),
            status: OrderStatus::Pending,
            total_amount: group.subtotal(),
            version: 0,
            preparation_start_time: None,
            estimated_delivery_time: None,
            actual_delivery_time: None,
            created_at: now,
            updated_at: now,
        };
        let line_items: Vec<SubOrderLineItem> = group
            .lines
            .iter()
            .enumerate()
            .map(|(position, line)| SubOrderLineItem {
                id: Uuid::new_v4(),
                sub_order_id: sub_order.id,
                position: position as i32,
                item_ref: line.item_ref.clone(),
                name: line.name.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price.clone(),
            })
            .collect();
        repo.insert_sub_order(&sub_order, &line_items)?;
        outbox.sub_order_created(&sub_order);
    }
    Ok(order)
}

pub struct OrderDecomposer<S, C> {
    pub(crate) store: Arc<S>,
    pub(crate) catalog: Arc<C>,
    pub(crate) notifier: Notifier,
}

impl<S: Store, C: Catalog> OrderDecomposer<S, C> {
    pub fn new(store: Arc<S>, catalog: Arc<C>, notifier: Notifier) -> Self {
        Self {
            store,
            catalog,
            notifier,
        }
    }

    /// Creates the aggregate order and one `PENDING` sub-order per vendor.
    #[instrument(skip(self))]
    pub fn create_aggregate_order(&self, cart: &Cart, meta: &DeliveryMeta) -> Result<AggregateOrder> {
        let plan = plan_order(self.catalog.as_ref(), cart, meta)
            .map_err(|err| log_failure("create_aggregate_order", err))?;
        let (order, outbox) = self
            .store
            .transaction(|repo| {
                let mut outbox = Outbox::default();
                let order = decompose_in(repo, &plan, Utc::now(), &mut outbox)?;
                Ok((order, outbox))
            })
            .map_err(|err| log_failure("create_aggregate_order", err))?;

        tracing::info!(
            aggregate_order_id = %order.id,
            vendors = plan.groups.len(),
            mode = %order.ordering_mode,
            "aggregate order created"
        );
        self.notifier.publish(outbox);
        Ok(order)
    }

    pub fn get_aggregate_order(&self, aggregate_order_id: Uuid) -> Result<AggregateOrder> {
        self.store
            .transaction(|repo| Ok(repo.get_aggregate_order(aggregate_order_id)?))
            .map_err(|err| log_failure("get_aggregate_order", err))
    }

    pub fn sub_orders(&self, aggregate_order_id: Uuid) -> Result<Vec<SubOrder>> {
        self.store
            .transaction(|repo| {
                repo.get_aggregate_order(aggregate_order_id)?;
                Ok(repo.sub_orders_of(aggregate_order_id)?)
            })
            .map_err(|err| log_failure("sub_orders", err))
    }

    pub fn line_items(&self, sub_order_id: Uuid) -> Result<Vec<SubOrderLineItem>> {
        self.store
            .transaction(|repo| {
                repo.get_sub_order(sub_order_id)?;
                Ok(repo.line_items_of(sub_order_id)?)
            })
            .map_err(|err| log_failure("line_items", err))
    }
}
