//! Host-driven dispatcher: the host passes received datagrams or envelopes, the
//! dispatcher updates its caches and returns the actions the host must perform.

use std::collections::HashMap;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, trace, warn};

use crate::ack::{chat_message_id, DeliveryLedger, RecipientStatus};
use crate::envelope::Envelope;
use crate::now_millis;
use crate::protocol::{
    valid_coordinates, AckKind, Chat, ChatAck, FormAck, Hello, LinkedForm, Message, Order,
    OrderAck, PinAdd, Position, Profile, ProfileRequest,
};
use crate::throttle::{ThrottlePolicy, ThrottlePurpose};
use crate::wire;

/// Identity and profile of this device.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub device_id: String,
    pub callsign: String,
    pub profile: Profile,
}

impl LocalNode {
    pub fn new(device_id: impl Into<String>, callsign: impl Into<String>) -> Self {
        let device_id = device_id.into();
        let callsign = callsign.into();
        let profile = Profile {
            device_id: device_id.clone(),
            callsign: Some(callsign.clone()),
            ..Default::default()
        };
        Self {
            device_id,
            callsign,
            profile,
        }
    }
}

/// Where an inbound message came from, and where a reply to it goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Local network; `host` is the datagram's source address without port.
    Lan { host: String },
    /// Broker relay; replies are addressed to the sending device.
    Broker { device_id: String },
}

impl Origin {
    pub fn lan(host: impl Into<String>) -> Self {
        Origin::Lan { host: host.into() }
    }

    /// Key for throttle windows: peer address on the LAN, device id via the broker.
    pub fn peer_key(&self) -> &str {
        match self {
            Origin::Lan { host } => host,
            Origin::Broker { device_id } => device_id,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            Origin::Lan { host } => Some(host),
            Origin::Broker { .. } => None,
        }
    }
}

/// Most recent profile seen for a device.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedProfile {
    pub profile: Profile,
    pub origin: Origin,
    pub received_at: i64,
}

impl CachedProfile {
    pub fn device_id(&self) -> &str {
        &self.profile.device_id
    }

    pub fn nickname(&self) -> Option<&str> {
        self.profile
            .nickname
            .as_deref()
            .or(self.profile.nick.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HelloEvent {
    pub device_id: String,
    pub callsign: String,
    pub nickname: Option<String>,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    pub device_id: String,
    pub callsign: String,
    pub lat: f64,
    pub lon: f64,
    pub ts: i64,
    pub origin: Origin,
}

/// A validated map pin with its attachment decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Pin {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub pin_type: String,
    pub title: String,
    pub description: String,
    pub ts: i64,
    pub origin_device_id: String,
    pub callsign: String,
    pub photo: Option<Vec<u8>>,
}

impl Pin {
    fn from_wire(p: PinAdd) -> Result<Self, &'static str> {
        if !valid_coordinates(p.lat, p.lon) {
            return Err("coordinates out of range");
        }
        if p.origin_device_id.is_empty() {
            return Err("empty originDeviceId");
        }
        let photo = match p.photo_base64.as_deref() {
            None | Some("") => None,
            Some(text) => Some(BASE64.decode(text).map_err(|_| "photo is not base64")?),
        };
        Ok(Self {
            id: p.id,
            lat: p.lat,
            lon: p.lon,
            pin_type: p.pin_type,
            title: p.title,
            description: p.description,
            ts: p.ts,
            origin_device_id: p.origin_device_id,
            callsign: p.callsign,
            photo,
        })
    }

    /// Wire form of this pin, sent as `device_id` / `callsign`.
    pub fn to_wire(&self, device_id: &str, callsign: &str) -> PinAdd {
        PinAdd {
            device_id: device_id.to_string(),
            callsign: callsign.to_string(),
            id: self.id,
            lat: self.lat,
            lon: self.lon,
            pin_type: self.pin_type.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            ts: self.ts,
            origin_device_id: self.origin_device_id.clone(),
            photo_base64: self.photo.as_ref().map(|p| BASE64.encode(p)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PinEvent {
    Added(Pin),
    /// A peer asked for our pins; the application republishes what it has stored.
    Requested { device_id: String, origin: Origin },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub thread_id: String,
    pub from_device_id: String,
    pub to_device_id: String,
    pub text: String,
    pub ts: i64,
    pub direction: Direction,
    pub acknowledged: bool,
}

impl ChatLine {
    pub fn message_id(&self) -> String {
        chat_message_id(&self.thread_id, self.ts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Message(ChatLine),
    /// `acknowledged` is true when the ack matched a line this device sent.
    Ack { ack: ChatAck, acknowledged: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
    Received(Order),
    Ack {
        ack: OrderAck,
        status: Option<RecipientStatus>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormKind {
    Report,
    Methane,
    Medevac,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormAckEvent {
    pub kind: FormKind,
    pub ack: FormAck,
}

/// Application-facing notification produced by dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Hello(HelloEvent),
    Position(PositionReport),
    Profile(CachedProfile),
    /// Raw profile message, for address-book style consumers.
    Contact(Profile),
    Pin(PinEvent),
    Chat(ChatEvent),
    Order(OrderEvent),
    LinkedForm(LinkedForm),
    FormAck(FormAckEvent),
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Notify(Event),
    Reply { to: Origin, message: Message },
}

/// Routes inbound messages by type and owns the state handlers mutate.
pub struct Dispatcher {
    local: LocalNode,
    profiles: HashMap<String, CachedProfile>,
    throttle: ThrottlePolicy,
    ledger: DeliveryLedger,
}

impl Dispatcher {
    pub fn new(local: LocalNode) -> Self {
        Self::with_throttle(local, ThrottlePolicy::new())
    }

    pub fn with_throttle(local: LocalNode, throttle: ThrottlePolicy) -> Self {
        Self {
            local,
            profiles: HashMap::new(),
            throttle,
            ledger: DeliveryLedger::new(),
        }
    }

    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    pub fn device_id(&self) -> &str {
        &self.local.device_id
    }

    /// Replace the profile sent in answer to `profile_req`.
    pub fn set_local_profile(&mut self, mut profile: Profile) {
        profile.device_id = self.local.device_id.clone();
        if let Some(cs) = &profile.callsign {
            self.local.callsign = cs.clone();
        }
        self.local.profile = profile;
    }

    pub fn profile(&self, device_id: &str) -> Option<&CachedProfile> {
        self.profiles.get(device_id)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &CachedProfile> {
        self.profiles.values()
    }

    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut DeliveryLedger {
        &mut self.ledger
    }

    /// Message answering a peer's `profile_req`.
    pub fn profile_message(&self) -> Message {
        Message::Profile(self.local.profile.clone())
    }

    pub fn profile_request_message(&self) -> Message {
        Message::ProfileRequest(ProfileRequest {
            callsign: Some(self.local.callsign.clone()),
            device_id: Some(self.local.device_id.clone()),
        })
    }

    /// Process one UDP datagram received from `host`.
    pub fn on_datagram(&mut self, host: &str, bytes: &[u8], now: Instant) -> Vec<Action> {
        let datagram = match wire::decode_datagram(bytes) {
            Ok(d) => d,
            Err(e) => {
                debug!(%host, error = %e, "dropping malformed datagram");
                return Vec::new();
            }
        };
        if datagram.sender == self.local.device_id {
            trace!(kind = %datagram.kind, "ignoring own datagram");
            return Vec::new();
        }
        if datagram.message_type().is_none() {
            debug!(%host, kind = %datagram.kind, "unhandled message type");
            return Vec::new();
        }
        let kind = datagram.kind.clone();
        match datagram.into_message() {
            Ok(msg) => self.handle(Origin::lan(host), msg, now),
            Err(e) => {
                warn!(%host, %kind, error = %e, "dropping message with invalid fields");
                Vec::new()
            }
        }
    }

    /// Process an envelope received through the broker. Sealed envelopes must be opened
    /// and signatures checked by the caller first.
    pub fn on_envelope(&mut self, envelope: &Envelope, now: Instant) -> Vec<Action> {
        if envelope.device_id == self.local.device_id {
            trace!(kind = %envelope.kind, "ignoring own envelope");
            return Vec::new();
        }
        match envelope.message() {
            Ok(msg) => self.handle(
                Origin::Broker {
                    device_id: envelope.device_id.clone(),
                },
                msg,
                now,
            ),
            Err(e) => {
                warn!(device = %envelope.device_id, kind = %envelope.kind, error = %e, "dropping envelope");
                Vec::new()
            }
        }
    }

    /// Route a typed message. Each arm notifies and emits at most one reply.
    pub fn handle(&mut self, origin: Origin, msg: Message, now: Instant) -> Vec<Action> {
        if msg.sender_id() == self.local.device_id {
            return Vec::new();
        }
        match msg {
            Message::Hello(m) => self.on_hello(origin, m, now),
            Message::Position(m) => self.on_position(origin, m, now),
            Message::Profile(m) => self.on_profile(origin, m),
            Message::ProfileRequest(_) => self.on_profile_request(origin, now),
            Message::PinAdd(m) => match Pin::from_wire(m) {
                Ok(pin) => vec![Action::Notify(Event::Pin(PinEvent::Added(pin)))],
                Err(reason) => {
                    warn!(peer = origin.peer_key(), reason, "dropping invalid pin");
                    Vec::new()
                }
            },
            Message::PinRequest(m) => vec![Action::Notify(Event::Pin(PinEvent::Requested {
                device_id: m.device_id,
                origin,
            }))],
            Message::Chat(m) => self.on_chat(origin, m),
            Message::ChatAck(m) => self.on_chat_ack(m),
            Message::Order(m) => self.on_order(origin, m),
            Message::OrderAck(m) => self.on_order_ack(m),
            Message::LinkedForm(m) => self.on_linked_form(origin, m),
            Message::ReportAck(m) => self.on_form_ack(FormKind::Report, m),
            Message::MethaneAck(m) => self.on_form_ack(FormKind::Methane, m),
            Message::MedevacAck(m) => self.on_form_ack(FormKind::Medevac, m),
        }
    }

    fn throttled_profile_request(&mut self, origin: &Origin, now: Instant) -> Option<Action> {
        if self
            .throttle
            .should_throttle(ThrottlePurpose::ProfileRequest, origin.peer_key(), now)
        {
            return None;
        }
        Some(Action::Reply {
            to: origin.clone(),
            message: self.profile_request_message(),
        })
    }

    fn on_hello(&mut self, origin: Origin, m: Hello, now: Instant) -> Vec<Action> {
        let nickname = m.display_nickname().map(str::to_string);
        let mut actions = vec![Action::Notify(Event::Hello(HelloEvent {
            device_id: m.device_id,
            callsign: m.callsign,
            nickname,
            origin: origin.clone(),
        }))];
        actions.extend(self.throttled_profile_request(&origin, now));
        actions
    }

    fn on_position(&mut self, origin: Origin, m: Position, now: Instant) -> Vec<Action> {
        if !valid_coordinates(m.lat, m.lon) {
            warn!(device = %m.device_id, lat = m.lat, lon = m.lon, "dropping position out of range");
            return Vec::new();
        }
        let mut actions = vec![Action::Notify(Event::Position(PositionReport {
            device_id: m.device_id,
            callsign: m.callsign,
            lat: m.lat,
            lon: m.lon,
            ts: m.ts,
            origin: origin.clone(),
        }))];
        actions.extend(self.throttled_profile_request(&origin, now));
        actions
    }

    fn on_profile(&mut self, origin: Origin, m: Profile) -> Vec<Action> {
        if m.device_id.is_empty() {
            warn!(peer = origin.peer_key(), "dropping profile without deviceId");
            return Vec::new();
        }
        let cached = CachedProfile {
            profile: m.clone(),
            origin,
            received_at: now_millis(),
        };
        self.profiles.insert(m.device_id.clone(), cached.clone());
        vec![
            Action::Notify(Event::Profile(cached)),
            Action::Notify(Event::Contact(m)),
        ]
    }

    fn on_profile_request(&mut self, origin: Origin, now: Instant) -> Vec<Action> {
        if self
            .throttle
            .should_throttle(ThrottlePurpose::ProfileReply, origin.peer_key(), now)
        {
            debug!(peer = origin.peer_key(), "profile reply throttled");
            return Vec::new();
        }
        vec![Action::Reply {
            to: origin,
            message: self.profile_message(),
        }]
    }

    fn on_chat(&mut self, origin: Origin, m: Chat) -> Vec<Action> {
        let ack = ChatAck {
            thread_id: m.thread_id.clone(),
            from_device_id: self.local.device_id.clone(),
            to_device_id: m.from_device_id.clone(),
            ts: m.ts,
        };
        let line = ChatLine {
            thread_id: m.thread_id,
            from_device_id: m.from_device_id,
            to_device_id: m.to_device_id,
            text: m.text,
            ts: m.ts,
            direction: Direction::Incoming,
            acknowledged: false,
        };
        vec![
            Action::Notify(Event::Chat(ChatEvent::Message(line))),
            Action::Reply {
                to: origin,
                message: Message::ChatAck(ack),
            },
        ]
    }

    fn on_chat_ack(&mut self, m: ChatAck) -> Vec<Action> {
        let acknowledged = m.to_device_id == self.local.device_id
            && self
                .ledger
                .apply_ack(
                    &chat_message_id(&m.thread_id, m.ts),
                    &m.from_device_id,
                    AckKind::Delivered,
                    now_millis(),
                )
                .is_some();
        vec![Action::Notify(Event::Chat(ChatEvent::Ack {
            ack: m,
            acknowledged,
        }))]
    }

    fn on_order(&mut self, origin: Origin, m: Order) -> Vec<Action> {
        if !m.to_device_ids.iter().any(|id| *id == self.local.device_id) {
            trace!(order = %m.order_id, "order not addressed to us");
            return Vec::new();
        }
        let ack = OrderAck {
            order_id: m.order_id.clone(),
            from_device_id: self.local.device_id.clone(),
            to_device_id: m.from_device_id.clone(),
            ack_type: AckKind::Delivered,
            timestamp_millis: now_millis(),
        };
        vec![
            Action::Reply {
                to: origin,
                message: Message::OrderAck(ack),
            },
            Action::Notify(Event::Order(OrderEvent::Received(m))),
        ]
    }

    fn on_order_ack(&mut self, m: OrderAck) -> Vec<Action> {
        if m.to_device_id != self.local.device_id {
            return Vec::new();
        }
        let status =
            self.ledger
                .apply_ack(&m.order_id, &m.from_device_id, m.ack_type, m.timestamp_millis);
        vec![Action::Notify(Event::Order(OrderEvent::Ack { ack: m, status }))]
    }

    fn on_linked_form(&mut self, origin: Origin, m: LinkedForm) -> Vec<Action> {
        let pair_ok = |lat: Option<f64>, lon: Option<f64>| match (lat, lon) {
            (None, None) => true,
            (Some(lat), Some(lon)) => valid_coordinates(lat, lon),
            _ => false,
        };
        if !pair_ok(m.target_lat, m.target_lon) || !pair_ok(m.observer_lat, m.observer_lon) {
            warn!(peer = origin.peer_key(), form = m.id, "dropping linked form with bad coordinates");
            return Vec::new();
        }
        vec![Action::Notify(Event::LinkedForm(m))]
    }

    fn on_form_ack(&mut self, kind: FormKind, m: FormAck) -> Vec<Action> {
        if m.to_device_id != self.local.device_id {
            return Vec::new();
        }
        vec![Action::Notify(Event::FormAck(FormAckEvent { kind, ack: m }))]
    }
}
