use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ftgo_proto::common::Money;
use ftgo_proto::orchestration_service::{
    notification_event, Notification, NotificationEvent, PreorderDecidedEvent,
    RiderAssignmentChangedEvent, RiderOfferedEvent, StatusUpdatedEvent, SubOrderCreatedEvent,
};
use kafka::client::RequiredAcks;
use kafka::producer::{Producer, Record};
use prost::Message;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AggregateOrder, OrderStatus, RiderOffer, SubOrder};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Kafka error")]
    Kafka(#[from] kafka::Error),
    #[error("Notification sink unavailable: {0}")]
    Unavailable(String),
}

/// Delivery mechanism for notifications. Implementations are best-effort;
/// callers log failures and carry on.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, recipient_id: Uuid, notification: &Notification) -> Result<(), NotifyError>;
}

/// Publishes each notification as a protobuf record keyed by recipient.
pub struct KafkaSink {
    producer: Mutex<Producer>,
    topic: String,
}

impl KafkaSink {
    pub fn connect(kafka_url: String, topic: String) -> Result<Self, NotifyError> {
        let producer = Producer::from_hosts(vec![kafka_url])
            .with_ack_timeout(Duration::from_secs(1))
            .with_required_acks(RequiredAcks::One)
            .create()?;
        Ok(Self {
            producer: Mutex::new(producer),
            topic,
        })
    }
}

impl NotificationSink for KafkaSink {
    fn notify(&self, recipient_id: Uuid, notification: &Notification) -> Result<(), NotifyError> {
        let mut producer = self.producer.lock().unwrap_or_else(PoisonError::into_inner);
        producer.send(&Record::from_key_value(
            &self.topic,
            recipient_id.to_string(),
            notification.encode_to_vec(),
        ))?;
        Ok(())
    }
}

/// Writes notifications to the log only.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, recipient_id: Uuid, notification: &Notification) -> Result<(), NotifyError> {
        let kind = notification
            .event
            .as_ref()
            .and_then(|e| e.event.as_ref())
            .map(event_kind)
            .unwrap_or("empty");
        tracing::info!(%recipient_id, kind, "notification");
        Ok(())
    }
}

pub fn event_kind(event: &notification_event::Event) -> &'static str {
    use notification_event::Event;

    match event {
        Event::SubOrderCreated(_) => "sub_order_created",
        Event::StatusUpdated(_) => "status_updated",
        Event::PreorderApproved(_) => "preorder_approved",
        Event::PreorderRejected(_) => "preorder_rejected",
        Event::RiderAssignmentChanged(_) => "rider_assignment_changed",
        Event::RiderOffered(_) => "rider_offered",
    }
}

fn timestamp(time: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

/// Notifications gathered while a transaction runs. They are handed to a
/// [`Notifier`] only once the transaction has committed.
#[derive(Default, Debug)]
pub struct Outbox {
    envelopes: Vec<(Uuid, notification_event::Event)>,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    fn push(&mut self, recipient_id: Uuid, event: notification_event::Event) {
        self.envelopes.push((recipient_id, event));
    }

    pub fn sub_order_created(&mut self, sub_order: &SubOrder) {
        self.push(
            sub_order.vendor_id,
            notification_event::Event::SubOrderCreated(SubOrderCreatedEvent {
                id: sub_order.id.to_string(),
                aggregate_order_id: sub_order.aggregate_order_id.to_string(),
                vendor_id: sub_order.vendor_id.to_string(),
                order_type: sub_order.fulfillment.order_type().to_string(),
                total_amount: Some(Money {
                    amount: sub_order.total_amount.to_string(),
                }),
            }),
        );
    }

    /// Tells the customer and, when one is bound, the rider.
    pub fn status_updated(
        &mut self,
        order: &AggregateOrder,
        sub_order: &SubOrder,
        previous: OrderStatus,
    ) {
        let event = notification_event::Event::StatusUpdated(StatusUpdatedEvent {
            sub_order_id: sub_order.id.to_string(),
            aggregate_order_id: order.id.to_string(),
            previous_status: previous.to_string(),
            status: sub_order.status.to_string(),
            aggregate_status: order.status.to_string(),
        });
        if let Some(rider_id) = sub_order.rider_id {
            self.push(rider_id, event.clone());
        }
        self.push(order.user_id, event);
    }

    pub fn preorder_decided(&mut self, order: &AggregateOrder) {
        let decided = PreorderDecidedEvent {
            aggregate_order_id: order.id.to_string(),
            scheduled_time: order.scheduled_time.map(timestamp),
        };
        let event = match order.status {
            OrderStatus::Confirmed => notification_event::Event::PreorderApproved(decided),
            OrderStatus::Rejected => notification_event::Event::PreorderRejected(decided),
            _ => return,
        };
        self.push(order.user_id, event);
    }

    pub fn rider_assignment_changed(
        &mut self,
        order: &AggregateOrder,
        sub_order: &SubOrder,
        rider_id: Uuid,
        assigned: bool,
    ) {
        let event = notification_event::Event::RiderAssignmentChanged(RiderAssignmentChangedEvent {
            sub_order_id: sub_order.id.to_string(),
            rider_id: rider_id.to_string(),
            assigned,
        });
        self.push(sub_order.vendor_id, event.clone());
        self.push(order.user_id, event);
    }

    pub fn rider_offered(&mut self, offer: &RiderOffer, sub_order: &SubOrder) {
        self.push(
            offer.rider_id,
            notification_event::Event::RiderOffered(RiderOfferedEvent {
                offer_id: offer.id.to_string(),
                sub_order_id: sub_order.id.to_string(),
                vendor_id: sub_order.vendor_id.to_string(),
                expires_at: Some(timestamp(offer.expires_at)),
            }),
        );
    }
}

#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Sends every notification in `outbox`. Failures are logged and dropped.
    pub fn publish(&self, outbox: Outbox) {
        let sent_at = timestamp(Utc::now());
        for (recipient_id, event) in outbox.envelopes {
            let kind = event_kind(&event);
            let notification = Notification {
                recipient_id: recipient_id.to_string(),
                sent_at: Some(sent_at.clone()),
                event: Some(NotificationEvent { event: Some(event) }),
            };
            if let Err(err) = self.sink.notify(recipient_id, &notification) {
                tracing::warn!(%recipient_id, kind, error = %err, "notification dropped");
            }
        }
    }
}
