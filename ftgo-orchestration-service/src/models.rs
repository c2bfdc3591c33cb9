use std::fmt;
use std::io::Write;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::{
    deserialize::{self, FromSql, FromSqlRow},
    expression::AsExpression,
    pg::{Pg, PgValue},
    prelude::*,
    serialize::{self, IsNull, Output, ToSql},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::schema::{
    aggregate_orders, pending_checkouts, reservation_slots, rider_offers, riders,
    sub_order_line_items,
};

/// Maps a unit enum onto a Postgres enum type by its upper-case label.
macro_rules! pg_enum {
    ($name:ident, $sql_type:ty, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match *self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql<$sql_type, Pg> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                out.write_all(self.as_str().as_bytes())?;
                Ok(IsNull::No)
            }
        }

        impl FromSql<$sql_type, Pg> for $name {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                match std::str::from_utf8(bytes.as_bytes())? {
                    $($label => Ok($name::$variant),)+
                    _ => Err("Unrecognized enum variant".into()),
                }
            }
        }
    };
}

/// Status shared by sub-orders and their aggregate order.
#[derive(
    FromSqlRow, AsExpression, Serialize, Deserialize, PartialEq, Eq, Hash, Copy, Clone, Debug,
)]
#[diesel(sql_type = crate::schema::sql_types::OrderStatus)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    PendingApproval,
    Confirmed,
    Offered,
    Accepted,
    Preparing,
    OutForDelivery,
    Delivered,
    Rejected,
    Cancelled,
}

pg_enum!(OrderStatus, crate::schema::sql_types::OrderStatus, {
    Pending => "PENDING",
    PendingApproval => "PENDING_APPROVAL",
    Confirmed => "CONFIRMED",
    Offered => "OFFERED",
    Accepted => "ACCEPTED",
    Preparing => "PREPARING",
    OutForDelivery => "OUT_FOR_DELIVERY",
    Delivered => "DELIVERED",
    Rejected => "REJECTED",
    Cancelled => "CANCELLED",
});

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    /// Position along the lifecycle DAG. Every legal transition except an
    /// explicit rider release moves to a strictly greater rank.
    pub fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::PendingApproval => 1,
            OrderStatus::Confirmed => 2,
            OrderStatus::Offered => 3,
            OrderStatus::Accepted => 4,
            OrderStatus::Preparing => 5,
            OrderStatus::OutForDelivery => 6,
            OrderStatus::Delivered | OrderStatus::Rejected | OrderStatus::Cancelled => 7,
        }
    }
}

#[derive(
    FromSqlRow, AsExpression, Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Debug,
)]
#[diesel(sql_type = crate::schema::sql_types::PaymentStatus)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    RefundPending,
}

pg_enum!(PaymentStatus, crate::schema::sql_types::PaymentStatus, {
    Pending => "PENDING",
    Paid => "PAID",
    RefundPending => "REFUND_PENDING",
});

#[derive(
    FromSqlRow, AsExpression, Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Debug,
)]
#[diesel(sql_type = crate::schema::sql_types::PaymentMethod)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Card,
    CashOnDelivery,
}

pg_enum!(PaymentMethod, crate::schema::sql_types::PaymentMethod, {
    Card => "CARD",
    CashOnDelivery => "CASH_ON_DELIVERY",
});

#[derive(
    FromSqlRow, AsExpression, Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Debug,
)]
#[diesel(sql_type = crate::schema::sql_types::OrderingMode)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderingMode {
    Delivery,
    Takeaway,
    DineIn,
    Preorder,
}

pg_enum!(OrderingMode, crate::schema::sql_types::OrderingMode, {
    Delivery => "DELIVERY",
    Takeaway => "TAKEAWAY",
    DineIn => "DINE_IN",
    Preorder => "PREORDER",
});

impl OrderingMode {
    /// Preorder and dine-in aggregates follow the vendor's approval decision
    /// instead of mirroring their sub-orders.
    pub fn is_approval_gated(&self) -> bool {
        matches!(self, OrderingMode::DineIn | OrderingMode::Preorder)
    }
}

#[derive(FromSqlRow, AsExpression, PartialEq, Eq, Copy, Clone, Debug)]
#[diesel(sql_type = crate::schema::sql_types::OrderType)]
pub enum OrderType {
    Delivery,
    Takeaway,
    DineIn,
    Preorder,
}

pg_enum!(OrderType, crate::schema::sql_types::OrderType, {
    Delivery => "DELIVERY",
    Takeaway => "TAKEAWAY",
    DineIn => "DINE_IN",
    Preorder => "PREORDER",
});

#[derive(FromSqlRow, AsExpression, PartialEq, Eq, Copy, Clone, Debug)]
#[diesel(sql_type = crate::schema::sql_types::OfferStatus)]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

pg_enum!(OfferStatus, crate::schema::sql_types::OfferStatus, {
    Pending => "PENDING",
    Accepted => "ACCEPTED",
    Rejected => "REJECTED",
    Expired => "EXPIRED",
});

#[derive(FromSqlRow, AsExpression, PartialEq, Eq, Copy, Clone, Debug)]
#[diesel(sql_type = crate::schema::sql_types::RiderStatus)]
pub enum RiderStatus {
    Idle,
    OnDelivery,
}

pg_enum!(RiderStatus, crate::schema::sql_types::RiderStatus, {
    Idle => "IDLE",
    OnDelivery => "ON_DELIVERY",
});

/// How a sub-order reaches the customer. Only the variants that involve a
/// reservation carry a slot reference, and only `Delivery` is ever dispatched.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub enum Fulfillment {
    Delivery,
    Takeaway,
    DineIn {
        slot_id: Option<Uuid>,
        table_ref: Option<String>,
    },
    Preorder {
        slot_id: Option<Uuid>,
    },
}

impl Fulfillment {
    pub fn order_type(&self) -> OrderType {
        match self {
            Fulfillment::Delivery => OrderType::Delivery,
            Fulfillment::Takeaway => OrderType::Takeaway,
            Fulfillment::DineIn { .. } => OrderType::DineIn,
            Fulfillment::Preorder { .. } => OrderType::Preorder,
        }
    }

    pub fn slot_id(&self) -> Option<Uuid> {
        match self {
            Fulfillment::DineIn { slot_id, .. } | Fulfillment::Preorder { slot_id } => *slot_id,
            Fulfillment::Delivery | Fulfillment::Takeaway => None,
        }
    }

    pub fn table_ref(&self) -> Option<&str> {
        match self {
            Fulfillment::DineIn { table_ref, .. } => table_ref.as_deref(),
            _ => None,
        }
    }

    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Fulfillment::Delivery)
    }

    pub fn requires_approval(&self) -> bool {
        !self.is_dispatchable()
    }

    pub fn from_columns(
        order_type: OrderType,
        slot_id: Option<Uuid>,
        table_ref: Option<String>,
    ) -> Result<Self, String> {
        match (order_type, slot_id, table_ref) {
            (OrderType::Delivery, None, None) => Ok(Fulfillment::Delivery),
            (OrderType::Takeaway, None, None) => Ok(Fulfillment::Takeaway),
            (OrderType::DineIn, slot_id, table_ref) => {
                Ok(Fulfillment::DineIn { slot_id, table_ref })
            }
            (OrderType::Preorder, slot_id, None) => Ok(Fulfillment::Preorder { slot_id }),
            (order_type, slot_id, table_ref) => Err(format!(
                "{} sub-order cannot carry slot {:?} / table {:?}",
                order_type, slot_id, table_ref
            )),
        }
    }
}

#[derive(Queryable, Selectable, Identifiable, Insertable, Clone, Debug, PartialEq)]
#[diesel(table_name = aggregate_orders)]
pub struct AggregateOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub ordering_mode: OrderingMode,
    pub delivery_address: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub total_amount: BigDecimal,
    pub discount_amount: BigDecimal,
    pub applied_coupon: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The part of an aggregate order fulfilled by one vendor.
///
/// `version` increases on every write and guards the optimistic write path.
/// `rider_id` is only ever set while the status is `ACCEPTED` or later.
#[derive(Clone, Debug, PartialEq)]
pub struct SubOrder {
    pub id: Uuid,
    pub aggregate_order_id: Uuid,
    pub vendor_id: Uuid,
    pub position: i32,
    pub rider_id: Option<Uuid>,
    pub fulfillment: Fulfillment,
    pub status: OrderStatus,
    pub total_amount: BigDecimal,
    pub version: i64,
    pub preparation_start_time: Option<DateTime<Utc>>,
    pub estimated_delivery_time: Option<DateTime<Utc>>,
    pub actual_delivery_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubOrder {
    /// Copy of this sub-order stamped as its next persisted version.
    pub fn next_version(&self, now: DateTime<Utc>) -> SubOrder {
        SubOrder {
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }
}

#[derive(Queryable, Selectable, Identifiable, Insertable, Clone, Debug, PartialEq)]
#[diesel(table_name = sub_order_line_items)]
pub struct SubOrderLineItem {
    pub id: Uuid,
    pub sub_order_id: Uuid,
    pub position: i32,
    pub item_ref: String,
    pub name: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

#[derive(Queryable, Selectable, Identifiable, Insertable, Clone, Debug, PartialEq)]
#[diesel(table_name = reservation_slots)]
pub struct ReservationSlot {
    pub id: Uuid,
    pub vendor_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub max_capacity: i32,
    pub current_capacity: i32,
    pub is_active: bool,
    pub version: i64,
}

#[derive(Queryable, Selectable, Identifiable, Insertable, Clone, Debug, PartialEq)]
#[diesel(table_name = riders)]
pub struct Rider {
    pub id: Uuid,
    pub name: String,
    pub online: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: RiderStatus,
    pub updated_at: DateTime<Utc>,
}

impl Rider {
    pub fn is_eligible(&self) -> bool {
        self.online && self.status == RiderStatus::Idle
    }
}

#[derive(Serialize, Deserialize, PartialEq, Copy, Clone, Debug)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Queryable, Selectable, Identifiable, Insertable, Clone, Debug, PartialEq)]
#[diesel(table_name = rider_offers)]
pub struct RiderOffer {
    pub id: Uuid,
    pub sub_order_id: Uuid,
    pub rider_id: Uuid,
    pub status: OfferStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RiderOffer {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Pending and not yet past its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == OfferStatus::Pending && !self.is_expired(now)
    }
}

#[derive(Queryable, Selectable, Identifiable, Insertable, Clone, Debug, PartialEq)]
#[diesel(table_name = pending_checkouts, primary_key(token))]
pub struct PendingCheckout {
    pub token: String,
    pub user_id: Uuid,
    pub payload: Value,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
