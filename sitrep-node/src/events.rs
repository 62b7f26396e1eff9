//! Application-facing event fan-out: one broadcast channel per event category.

use sitrep_core::dispatch::{
    CachedProfile, ChatEvent, Event, FormAckEvent, HelloEvent, OrderEvent, PinEvent,
    PositionReport,
};
use sitrep_core::protocol::{LinkedForm, Profile};
use tokio::sync::broadcast;
use tracing::trace;

/// Events buffered per subscriber before the slowest one starts lagging.
pub const CHANNEL_CAPACITY: usize = 256;

/// Subscribers call `subscribe_*` and drop the receiver to unsubscribe. Any number of
/// subscribers may listen to the same category.
#[derive(Clone)]
pub struct EventBus {
    hello_tx: broadcast::Sender<HelloEvent>,
    position_tx: broadcast::Sender<PositionReport>,
    profile_tx: broadcast::Sender<CachedProfile>,
    contact_tx: broadcast::Sender<Profile>,
    pin_tx: broadcast::Sender<PinEvent>,
    chat_tx: broadcast::Sender<ChatEvent>,
    order_tx: broadcast::Sender<OrderEvent>,
    linked_form_tx: broadcast::Sender<LinkedForm>,
    form_ack_tx: broadcast::Sender<FormAckEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            hello_tx: broadcast::channel(capacity).0,
            position_tx: broadcast::channel(capacity).0,
            profile_tx: broadcast::channel(capacity).0,
            contact_tx: broadcast::channel(capacity).0,
            pin_tx: broadcast::channel(capacity).0,
            chat_tx: broadcast::channel(capacity).0,
            order_tx: broadcast::channel(capacity).0,
            linked_form_tx: broadcast::channel(capacity).0,
            form_ack_tx: broadcast::channel(capacity).0,
        }
    }

    /// Deliver an event to its category. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let delivered = match event {
            Event::Hello(e) => self.hello_tx.send(e).is_ok(),
            Event::Position(e) => self.position_tx.send(e).is_ok(),
            Event::Profile(e) => self.profile_tx.send(e).is_ok(),
            Event::Contact(e) => self.contact_tx.send(e).is_ok(),
            Event::Pin(e) => self.pin_tx.send(e).is_ok(),
            Event::Chat(e) => self.chat_tx.send(e).is_ok(),
            Event::Order(e) => self.order_tx.send(e).is_ok(),
            Event::LinkedForm(e) => self.linked_form_tx.send(e).is_ok(),
            Event::FormAck(e) => self.form_ack_tx.send(e).is_ok(),
        };
        if !delivered {
            trace!("event dropped: no subscribers");
        }
    }

    pub fn subscribe_hello(&self) -> broadcast::Receiver<HelloEvent> {
        self.hello_tx.subscribe()
    }

    pub fn subscribe_positions(&self) -> broadcast::Receiver<PositionReport> {
        self.position_tx.subscribe()
    }

    pub fn subscribe_profiles(&self) -> broadcast::Receiver<CachedProfile> {
        self.profile_tx.subscribe()
    }

    pub fn subscribe_contacts(&self) -> broadcast::Receiver<Profile> {
        self.contact_tx.subscribe()
    }

    pub fn subscribe_pins(&self) -> broadcast::Receiver<PinEvent> {
        self.pin_tx.subscribe()
    }

    pub fn subscribe_chat(&self) -> broadcast::Receiver<ChatEvent> {
        self.chat_tx.subscribe()
    }

    pub fn subscribe_orders(&self) -> broadcast::Receiver<OrderEvent> {
        self.order_tx.subscribe()
    }

    pub fn subscribe_linked_forms(&self) -> broadcast::Receiver<LinkedForm> {
        self.linked_form_tx.subscribe()
    }

    pub fn subscribe_form_acks(&self) -> broadcast::Receiver<FormAckEvent> {
        self.form_ack_tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
