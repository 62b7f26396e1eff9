//! Transport coordinator: owns both transports, keeps exactly one active and gives the
//! application a single send surface plus the event bus.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sitrep_core::ack::{chat_message_id, RecipientStatus};
use sitrep_core::dispatch::{
    CachedProfile, ChatLine, Direction, Dispatcher, FormKind, LocalNode, Origin, Pin,
};
use sitrep_core::protocol::{
    valid_coordinates, AckKind, Chat, FormAck, Hello, LinkedForm, Message, Order, OrderAck,
    PinRequest, Position, Profile,
};
use sitrep_core::now_millis;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::transport::{
    BrokerClient, BrokerSecurity, BrokerSettings, BrokerTransport, ConnectionState,
    LocalBroadcastTransport, LocalSettings, Shared, SharedState, TransportError,
};

/// Hello announce period when none is configured.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
pub enum TransportMode {
    #[default]
    #[serde(rename = "local")]
    LocalUdp,
    #[serde(rename = "broker")]
    Broker,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportMode::LocalUdp => "local",
            TransportMode::Broker => "broker",
        })
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "udp" | "localudp" => Ok(TransportMode::LocalUdp),
            "broker" | "mqtt" => Ok(TransportMode::Broker),
            other => Err(format!("unknown transport mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub local: LocalNode,
    pub udp: LocalSettings,
    pub initial_peers: Vec<String>,
    /// Mode entered by [`TransportCoordinator::start`].
    pub mode: TransportMode,
    /// `None` disables the periodic hello.
    pub announce_interval: Option<Duration>,
    pub broker: Option<BrokerSettings>,
    pub security: BrokerSecurity,
}

impl CoordinatorSettings {
    pub fn new(local: LocalNode) -> Self {
        Self {
            local,
            udp: LocalSettings::default(),
            initial_peers: Vec::new(),
            mode: TransportMode::default(),
            announce_interval: Some(DEFAULT_ANNOUNCE_INTERVAL),
            broker: None,
            security: BrokerSecurity::default(),
        }
    }
}

/// Contents of an order before it is addressed and stamped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderDraft {
    pub order_type: String,
    pub to_device_ids: Vec<String>,
    pub orientation: String,
    pub decision: String,
    pub order: String,
    pub mission: String,
    pub execution: String,
    pub logistics: String,
    pub command_signaling: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("broker mode requested but no broker is configured")]
    BrokerUnavailable,
    #[error("coordinates out of range: {lat}, {lon}")]
    InvalidCoordinates { lat: f64, lon: f64 },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct TransportCoordinator {
    shared: Shared,
    bus: EventBus,
    local: LocalBroadcastTransport,
    broker: Option<BrokerTransport>,
    configured_mode: TransportMode,
    mode: watch::Sender<TransportMode>,
    /// Serializes mode switches.
    switch: Mutex<()>,
    announce_interval: Option<Duration>,
    announce_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportCoordinator {
    /// Build both transports. Broker mode is available only when broker settings and a
    /// client are both supplied.
    pub fn new(settings: CoordinatorSettings, broker_client: Option<Arc<dyn BrokerClient>>) -> Self {
        let mut state = SharedState::new(Dispatcher::new(settings.local));
        state.peers.extend(settings.initial_peers);
        let shared: Shared = Arc::new(Mutex::new(state));
        let bus = EventBus::new();

        let local = LocalBroadcastTransport::new(settings.udp, shared.clone(), bus.clone());
        let broker = match (settings.broker, broker_client) {
            (Some(broker_settings), Some(client)) => Some(BrokerTransport::new(
                broker_settings,
                client,
                settings.security,
                shared.clone(),
                bus.clone(),
            )),
            (Some(broker_settings), None) => {
                warn!(host = %broker_settings.host, "broker configured without a client; broker mode unavailable");
                None
            }
            (None, _) => None,
        };

        Self {
            shared,
            bus,
            local,
            broker,
            configured_mode: settings.mode,
            mode: watch::channel(settings.mode).0,
            switch: Mutex::new(()),
            announce_interval: settings.announce_interval,
            announce_task: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn local_transport(&self) -> &LocalBroadcastTransport {
        &self.local
    }

    pub fn broker_transport(&self) -> Option<&BrokerTransport> {
        self.broker.as_ref()
    }

    /// Start in the configured mode.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        self.set_mode(self.configured_mode).await
    }

    /// Stop whichever transport is active, then start `mode`. Stopping is best effort;
    /// the requested transport is started regardless.
    pub async fn set_mode(&self, mode: TransportMode) -> Result<(), CoordinatorError> {
        let _switch = self.switch.lock().await;
        if mode == TransportMode::Broker && self.broker.is_none() {
            return Err(CoordinatorError::BrokerUnavailable);
        }
        let previous = self.active_mode();
        self.stop_mode(previous).await;
        self.mode.send_replace(mode);

        match mode {
            TransportMode::LocalUdp => {
                self.local.start().await?;
                self.start_announce().await;
            }
            TransportMode::Broker => {
                if let Some(broker) = &self.broker {
                    broker.start().await?;
                }
            }
        }
        info!(%previous, %mode, "transport mode active");
        Ok(())
    }

    /// Stop every transport. The mode is kept for the next [`start`](Self::start).
    pub async fn stop(&self) {
        let _switch = self.switch.lock().await;
        self.stop_mode(TransportMode::LocalUdp).await;
        if self.broker.is_some() {
            self.stop_mode(TransportMode::Broker).await;
        }
    }

    async fn stop_mode(&self, mode: TransportMode) {
        match mode {
            TransportMode::LocalUdp => {
                if let Some(task) = self.announce_task.lock().await.take() {
                    task.abort();
                }
                self.local.stop().await;
            }
            TransportMode::Broker => {
                if let Some(broker) = &self.broker {
                    broker.stop().await;
                }
            }
        }
    }

    async fn start_announce(&self) {
        let Some(period) = self.announce_interval else {
            return;
        };
        let local = self.local.clone();
        let shared = self.shared.clone();
        let task = tokio::spawn(async move { announce_loop(local, shared, period).await });
        if let Some(old) = self.announce_task.lock().await.replace(task) {
            old.abort();
        }
    }

    pub fn active_mode(&self) -> TransportMode {
        *self.mode.borrow()
    }

    pub fn watch_mode(&self) -> watch::Receiver<TransportMode> {
        self.mode.subscribe()
    }

    /// Connection state of the given transport; `None` for an unconfigured broker.
    pub fn watch_state(&self, mode: TransportMode) -> Option<watch::Receiver<ConnectionState>> {
        match mode {
            TransportMode::LocalUdp => Some(self.local.watch_state()),
            TransportMode::Broker => self.broker.as_ref().map(BrokerTransport::watch_state),
        }
    }

    pub fn state(&self, mode: TransportMode) -> ConnectionState {
        match mode {
            TransportMode::LocalUdp => self.local.state(),
            TransportMode::Broker => self
                .broker
                .as_ref()
                .map_or(ConnectionState::Disconnected, BrokerTransport::state),
        }
    }

    pub fn is_udp_active(&self) -> bool {
        self.active_mode() == TransportMode::LocalUdp && self.local.state().is_connected()
    }

    pub fn is_broker_active(&self) -> bool {
        self.active_mode() == TransportMode::Broker
            && self.state(TransportMode::Broker).is_connected()
    }

    /// Send through the active transport. `recipients` are device ids; on the LAN they
    /// resolve to hosts through the profile cache, and any unresolved id falls back to
    /// broadcast.
    async fn route(&self, msg: &Message, recipients: &[String]) -> Result<(), CoordinatorError> {
        match self.active_mode() {
            TransportMode::LocalUdp => {
                let hosts = self.resolve_hosts(recipients).await;
                self.local.send(msg, &hosts).await?;
            }
            TransportMode::Broker => {
                let broker = self.broker.as_ref().ok_or(CoordinatorError::BrokerUnavailable)?;
                broker.send(msg, recipients).await?;
            }
        }
        debug!(kind = %msg.kind(), recipients = recipients.len(), "message sent");
        Ok(())
    }

    async fn resolve_hosts(&self, device_ids: &[String]) -> Vec<String> {
        let s = self.shared.lock().await;
        let mut hosts = Vec::with_capacity(device_ids.len());
        for id in device_ids {
            match s.dispatcher.profile(id).map(|p| &p.origin) {
                Some(Origin::Lan { host }) => {
                    if !hosts.contains(host) {
                        hosts.push(host.clone());
                    }
                }
                _ => {
                    debug!(device = %id, "no known address; broadcasting");
                    return Vec::new();
                }
            }
        }
        hosts
    }

    async fn local_identity(&self) -> (String, String) {
        let s = self.shared.lock().await;
        let local = s.dispatcher.local();
        (local.device_id.clone(), local.callsign.clone())
    }

    pub async fn send_hello(&self) -> Result<(), CoordinatorError> {
        let hello = hello_message(&*self.shared.lock().await);
        self.route(&hello, &[]).await
    }

    pub async fn send_position(&self, lat: f64, lon: f64) -> Result<(), CoordinatorError> {
        if !valid_coordinates(lat, lon) {
            return Err(CoordinatorError::InvalidCoordinates { lat, lon });
        }
        let (device_id, callsign) = self.local_identity().await;
        let msg = Message::Position(Position {
            callsign,
            device_id,
            lat,
            lon,
            ts: now_millis(),
        });
        self.route(&msg, &[]).await
    }

    pub async fn set_local_profile(&self, profile: Profile) {
        self.shared.lock().await.dispatcher.set_local_profile(profile);
    }

    /// Broadcast the local profile.
    pub async fn publish_profile(&self) -> Result<(), CoordinatorError> {
        let msg = self.shared.lock().await.dispatcher.profile_message();
        self.route(&msg, &[]).await
    }

    /// Ask one device (or everyone, with `None`) for its profile.
    pub async fn request_profile(&self, device_id: Option<&str>) -> Result<(), CoordinatorError> {
        let msg = self.shared.lock().await.dispatcher.profile_request_message();
        let recipients: Vec<String> = device_id.map(str::to_string).into_iter().collect();
        self.route(&msg, &recipients).await
    }

    pub async fn publish_pin(&self, pin: &Pin) -> Result<(), CoordinatorError> {
        if !valid_coordinates(pin.lat, pin.lon) {
            return Err(CoordinatorError::InvalidCoordinates {
                lat: pin.lat,
                lon: pin.lon,
            });
        }
        let (device_id, callsign) = self.local_identity().await;
        let msg = Message::PinAdd(pin.to_wire(&device_id, &callsign));
        self.route(&msg, &[]).await
    }

    pub async fn request_pins(&self) -> Result<(), CoordinatorError> {
        let (device_id, _) = self.local_identity().await;
        self.route(&Message::PinRequest(PinRequest { device_id }), &[])
            .await
    }

    /// Send a chat line. An empty `to_device_id` addresses the whole thread by broadcast.
    pub async fn send_chat(
        &self,
        thread_id: &str,
        to_device_id: &str,
        text: &str,
    ) -> Result<ChatLine, CoordinatorError> {
        let ts = now_millis();
        let (device_id, _) = self.local_identity().await;
        let recipients: Vec<String> = if to_device_id.is_empty() {
            Vec::new()
        } else {
            vec![to_device_id.to_string()]
        };
        self.shared.lock().await.dispatcher.ledger_mut().record_sent(
            &chat_message_id(thread_id, ts),
            recipients.iter().cloned(),
            ts,
        );
        let msg = Message::Chat(Chat {
            thread_id: thread_id.to_string(),
            from_device_id: device_id.clone(),
            to_device_id: to_device_id.to_string(),
            text: text.to_string(),
            ts,
        });
        self.route(&msg, &recipients).await?;
        Ok(ChatLine {
            thread_id: thread_id.to_string(),
            from_device_id: device_id,
            to_device_id: to_device_id.to_string(),
            text: text.to_string(),
            ts,
            direction: Direction::Outgoing,
            acknowledged: false,
        })
    }

    /// Stamp, record and send an order. Returns the order as sent.
    pub async fn send_order(&self, draft: OrderDraft) -> Result<Order, CoordinatorError> {
        let (device_id, callsign) = self.local_identity().await;
        let order = Order {
            order_id: uuid::Uuid::new_v4().to_string(),
            order_type: draft.order_type,
            from_device_id: device_id,
            from_callsign: callsign,
            to_device_ids: draft.to_device_ids,
            created_at_millis: now_millis(),
            orientation: draft.orientation,
            decision: draft.decision,
            order: draft.order,
            mission: draft.mission,
            execution: draft.execution,
            logistics: draft.logistics,
            command_signaling: draft.command_signaling,
        };
        self.shared.lock().await.dispatcher.ledger_mut().record_sent(
            &order.order_id,
            order.to_device_ids.iter().cloned(),
            order.created_at_millis,
        );
        self.route(&Message::Order(order.clone()), &order.to_device_ids)
            .await?;
        Ok(order)
    }

    /// Send the READ receipt for a received order. Returns false when it was already sent.
    /// A failed send leaves the receipt unsent so the call can be retried.
    pub async fn mark_order_read(&self, order: &Order) -> Result<bool, CoordinatorError> {
        let (device_id, _) = self.local_identity().await;
        if !self
            .shared
            .lock()
            .await
            .dispatcher
            .ledger_mut()
            .mark_read_sent(&order.order_id)
        {
            return Ok(false);
        }
        let ack = Message::OrderAck(OrderAck {
            order_id: order.order_id.clone(),
            from_device_id: device_id,
            to_device_id: order.from_device_id.clone(),
            ack_type: AckKind::Read,
            timestamp_millis: now_millis(),
        });
        if let Err(e) = self.route(&ack, &[order.from_device_id.clone()]).await {
            self.shared
                .lock()
                .await
                .dispatcher
                .ledger_mut()
                .release_read_sent(&order.order_id);
            return Err(e);
        }
        Ok(true)
    }

    pub async fn send_linked_form(&self, mut form: LinkedForm) -> Result<(), CoordinatorError> {
        for (lat, lon) in [
            (form.target_lat, form.target_lon),
            (form.observer_lat, form.observer_lon),
        ] {
            if let (Some(lat), Some(lon)) = (lat, lon) {
                if !valid_coordinates(lat, lon) {
                    return Err(CoordinatorError::InvalidCoordinates { lat, lon });
                }
            }
        }
        form.device_id = self.local_identity().await.0;
        self.route(&Message::LinkedForm(form), &[]).await
    }

    /// Acknowledge a report, METHANE or MEDEVAC form to its author.
    pub async fn send_form_ack(
        &self,
        kind: FormKind,
        report_id: &str,
        to_device_id: &str,
        ack_type: AckKind,
    ) -> Result<(), CoordinatorError> {
        let (device_id, _) = self.local_identity().await;
        let ack = FormAck {
            report_id: report_id.to_string(),
            from_device_id: device_id,
            to_device_id: to_device_id.to_string(),
            ack_type,
            timestamp_millis: now_millis(),
        };
        let msg = match kind {
            FormKind::Report => Message::ReportAck(ack),
            FormKind::Methane => Message::MethaneAck(ack),
            FormKind::Medevac => Message::MedevacAck(ack),
        };
        self.route(&msg, &[to_device_id.to_string()]).await
    }

    pub async fn profile(&self, device_id: &str) -> Option<CachedProfile> {
        self.shared.lock().await.dispatcher.profile(device_id).cloned()
    }

    pub async fn profiles(&self) -> Vec<CachedProfile> {
        let s = self.shared.lock().await;
        let mut all: Vec<CachedProfile> = s.dispatcher.profiles().cloned().collect();
        all.sort_by(|a, b| a.device_id().cmp(b.device_id()));
        all
    }

    pub async fn delivery_status(&self, message_id: &str, recipient: &str) -> Option<RecipientStatus> {
        self.shared.lock().await.dispatcher.ledger().status(message_id, recipient)
    }

    pub async fn delivery_statuses(&self, message_id: &str) -> Vec<(String, RecipientStatus)> {
        self.shared.lock().await.dispatcher.ledger().recipients(message_id)
    }

    pub async fn is_acknowledged(&self, message_id: &str) -> bool {
        self.shared.lock().await.dispatcher.ledger().is_acknowledged(message_id)
    }

    pub async fn add_peer(&self, addr: impl Into<String>) {
        self.local.add_peer(addr).await;
    }

    pub async fn remove_peer(&self, addr: &str) {
        self.local.remove_peer(addr).await;
    }

    pub async fn set_peers<I, S>(&self, addrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local.set_peers(addrs).await;
    }

    pub async fn peers(&self) -> Vec<String> {
        self.local.peers().await
    }
}

fn hello_message(state: &SharedState) -> Message {
    let local = state.dispatcher.local();
    Message::Hello(Hello {
        callsign: local.callsign.clone(),
        device_id: local.device_id.clone(),
        nickname: local.profile.nickname.clone(),
        nick: local.profile.nickname.clone(),
    })
}

/// Discovery beacon: peers answering with `profile_req` complete the profile exchange.
async fn announce_loop(local: LocalBroadcastTransport, shared: Shared, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let hello = hello_message(&*shared.lock().await);
        if let Err(e) = local.send(&hello, &[]).await {
            warn!(error = %e, "hello announce failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use sitrep_core::dispatch::OrderEvent;
    use sitrep_core::envelope::Envelope;
    use sitrep_core::wire::{decode_datagram, encode_datagram};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    use super::*;
    use crate::transport::broker::mock::MockBroker;

    const WAIT: Duration = Duration::from_secs(2);

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn settings(with_broker: bool) -> CoordinatorSettings {
        let mut s = CoordinatorSettings::new(LocalNode::new("me", "ME-1"));
        s.udp = LocalSettings {
            bind_addr: Ipv4Addr::LOCALHOST.into(),
            port: free_port(),
            broadcast_addr: Ipv4Addr::LOCALHOST,
        };
        s.announce_interval = None;
        if with_broker {
            s.broker = Some(BrokerSettings::new("broker.local"));
        }
        s
    }

    fn with_mock() -> (TransportCoordinator, Arc<MockBroker>) {
        let mock = Arc::new(MockBroker::default());
        let c = TransportCoordinator::new(settings(true), Some(mock.clone()));
        (c, mock)
    }

    fn active_count(c: &TransportCoordinator) -> usize {
        [TransportMode::LocalUdp, TransportMode::Broker]
            .into_iter()
            .filter(|m| c.state(*m) != ConnectionState::Disconnected)
            .count()
    }

    async fn recv_message(sock: &UdpSocket) -> Message {
        let mut buf = vec![0u8; 65_536];
        let (n, _) = timeout(WAIT, sock.recv_from(&mut buf)).await.unwrap().unwrap();
        decode_datagram(&buf[..n]).unwrap().into_message().unwrap()
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("local".parse::<TransportMode>(), Ok(TransportMode::LocalUdp));
        assert_eq!("MQTT".parse::<TransportMode>(), Ok(TransportMode::Broker));
        assert!("carrier-pigeon".parse::<TransportMode>().is_err());
        assert_eq!(TransportMode::Broker.to_string(), "broker");
    }

    #[tokio::test]
    async fn mode_switching_keeps_one_transport_active() {
        let (c, _mock) = with_mock();
        for mode in [TransportMode::Broker, TransportMode::LocalUdp, TransportMode::Broker] {
            c.set_mode(mode).await.unwrap();
            assert_eq!(c.active_mode(), mode);
            assert_eq!(active_count(&c), 1);
        }
        assert!(c.is_broker_active());
        assert!(!c.is_udp_active());
        c.stop().await;
        assert_eq!(active_count(&c), 0);
        assert!(!c.is_broker_active());
    }

    #[tokio::test]
    async fn local_broker_local_round_trip() {
        let (c, _mock) = with_mock();
        c.start().await.unwrap();
        assert!(c.is_udp_active());
        c.set_mode(TransportMode::Broker).await.unwrap();
        assert!(c.is_broker_active());
        assert!(!c.is_udp_active());
        c.set_mode(TransportMode::LocalUdp).await.unwrap();
        assert!(c.is_udp_active());
        assert_eq!(active_count(&c), 1);
        // Re-entering the active mode rebinds the same port.
        c.set_mode(TransportMode::LocalUdp).await.unwrap();
        assert!(c.is_udp_active());
    }

    #[tokio::test]
    async fn read_receipt_retried_after_failed_send() {
        let mut s = settings(false);
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        s.initial_peers = vec![peer.local_addr().unwrap().to_string()];
        let c = TransportCoordinator::new(s, None);
        let order = Order {
            order_id: "o-7".into(),
            order_type: "FRAGO".into(),
            from_device_id: "B".into(),
            from_callsign: "BRAVO".into(),
            to_device_ids: vec!["me".into()],
            created_at_millis: 1,
            orientation: String::new(),
            decision: String::new(),
            order: "hold".into(),
            mission: String::new(),
            execution: String::new(),
            logistics: String::new(),
            command_signaling: String::new(),
        };

        assert!(c.mark_order_read(&order).await.is_err());
        c.start().await.unwrap();
        assert!(c.mark_order_read(&order).await.unwrap());
        match recv_message(&peer).await {
            Message::OrderAck(a) => {
                assert_eq!(a.order_id, "o-7");
                assert_eq!(a.ack_type, AckKind::Read);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!c.mark_order_read(&order).await.unwrap());
    }

    #[tokio::test]
    async fn broker_mode_without_client_fails_before_switching() {
        let c = TransportCoordinator::new(settings(true), None);
        c.start().await.unwrap();
        assert!(matches!(
            c.set_mode(TransportMode::Broker).await,
            Err(CoordinatorError::BrokerUnavailable)
        ));
        assert_eq!(c.active_mode(), TransportMode::LocalUdp);
        assert!(c.is_udp_active());
        assert!(c.watch_state(TransportMode::Broker).is_none());
    }

    #[tokio::test]
    async fn broker_connect_failure_surfaces_error() {
        let c = TransportCoordinator::new(settings(true), Some(Arc::new(MockBroker::failing())));
        c.start().await.unwrap();
        assert!(c.set_mode(TransportMode::Broker).await.is_err());
        assert_eq!(c.active_mode(), TransportMode::Broker);
        assert!(matches!(c.state(TransportMode::Broker), ConnectionState::Error(_)));
        assert!(!c.is_broker_active());
        assert_eq!(c.state(TransportMode::LocalUdp), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn sends_go_only_to_active_transport() {
        let (c, mock) = with_mock();
        c.start().await.unwrap();
        c.send_position(59.33, 18.06).await.unwrap();
        assert!(mock.published.lock().unwrap().is_empty());

        c.set_mode(TransportMode::Broker).await.unwrap();
        c.send_position(59.33, 18.06).await.unwrap();
        let sent = mock.published_on("sitrep/all");
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].message().unwrap(), Message::Position(_)));
    }

    #[tokio::test]
    async fn invalid_position_rejected() {
        let (c, mock) = with_mock();
        c.set_mode(TransportMode::Broker).await.unwrap();
        assert!(matches!(
            c.send_position(95.0, 0.0).await,
            Err(CoordinatorError::InvalidCoordinates { .. })
        ));
        assert!(mock.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn order_over_broker_tracks_recipients_and_read_once() {
        let (c, mock) = with_mock();
        c.set_mode(TransportMode::Broker).await.unwrap();
        let order = c
            .send_order(OrderDraft {
                order_type: "OPORD".into(),
                to_device_ids: vec!["B".into(), "C".into()],
                mission: "secure bridge".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(order.from_callsign, "ME-1");
        assert_eq!(mock.published_on("sitrep/device/B").len(), 1);
        assert_eq!(mock.published_on("sitrep/device/C").len(), 1);
        let status = c.delivery_status(&order.order_id, "B").await.unwrap();
        assert!(!status.is_delivered());
        assert_eq!(c.delivery_statuses(&order.order_id).await.len(), 2);

        let mut orders = c.events().subscribe_orders();
        let ack = Message::OrderAck(OrderAck {
            order_id: order.order_id.clone(),
            from_device_id: "B".into(),
            to_device_id: "me".into(),
            ack_type: AckKind::Delivered,
            timestamp_millis: 5,
        });
        let env = Envelope::wrap("B", &ack, 5).unwrap();
        mock.inject(sitrep_core::envelope::encode(&env).unwrap()).await;
        match timeout(WAIT, orders.recv()).await.unwrap().unwrap() {
            OrderEvent::Ack { status: Some(s), .. } => assert!(s.is_delivered()),
            other => panic!("unexpected {other:?}"),
        }

        let received = Order {
            order_id: "incoming".into(),
            from_device_id: "B".into(),
            ..order.clone()
        };
        assert!(c.mark_order_read(&received).await.unwrap());
        assert!(!c.mark_order_read(&received).await.unwrap());
        let reads = mock.published_on("sitrep/device/B");
        assert_eq!(reads.len(), 2);
        match reads[1].message().unwrap() {
            Message::OrderAck(a) => assert_eq!(a.ack_type, AckKind::Read),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn lan_recipients_resolve_through_profile_cache() {
        let c = TransportCoordinator::new(settings(false), None);
        c.start().await.unwrap();
        let listen = c.local_transport().local_addr().await.unwrap();

        let line = c.send_chat("general", "B", "radio check").await.unwrap();
        assert_eq!(line.direction, Direction::Outgoing);
        assert!(!c.is_acknowledged(&line.message_id()).await);
        assert!(c.resolve_hosts(&["B".to_string()]).await.is_empty());

        let profile = Message::Profile(Profile {
            device_id: "B".into(),
            callsign: Some("BRAVO".into()),
            ..Default::default()
        });
        let mut profiles = c.events().subscribe_profiles();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&encode_datagram(&profile).unwrap(), listen).await.unwrap();
        timeout(WAIT, profiles.recv()).await.unwrap().unwrap();

        assert_eq!(c.profile("B").await.unwrap().origin, Origin::lan("127.0.0.1"));
        assert_eq!(c.profiles().await.len(), 1);
        assert_eq!(
            c.resolve_hosts(&["B".to_string()]).await,
            vec!["127.0.0.1".to_string()]
        );
        // One unknown recipient sends the whole message by broadcast.
        assert!(c
            .resolve_hosts(&["B".to_string(), "Z".to_string()])
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn peers_pass_through_to_local_transport() {
        let mut s = settings(false);
        s.initial_peers = vec!["10.0.0.7".into()];
        let c = TransportCoordinator::new(s, None);
        assert_eq!(c.peers().await, vec!["10.0.0.7".to_string()]);
        c.add_peer("10.0.0.8").await;
        c.remove_peer("10.0.0.7").await;
        assert_eq!(c.peers().await, vec!["10.0.0.8".to_string()]);
        c.set_peers(Vec::<String>::new()).await;
        assert!(c.peers().await.is_empty());
    }

    #[tokio::test]
    async fn announce_reaches_peers() {
        let mut s = settings(false);
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        s.initial_peers = vec![peer.local_addr().unwrap().to_string()];
        s.announce_interval = Some(Duration::from_millis(50));
        let c = TransportCoordinator::new(s, None);
        c.start().await.unwrap();
        match recv_message(&peer).await {
            Message::Hello(h) => {
                assert_eq!(h.device_id, "me");
                assert_eq!(h.callsign, "ME-1");
            }
            other => panic!("unexpected {other:?}"),
        }
        match recv_message(&peer).await {
            Message::Hello(_) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn profile_and_pins_broadcast_to_peers() {
        let mut s = settings(false);
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        s.initial_peers = vec![peer.local_addr().unwrap().to_string()];
        let c = TransportCoordinator::new(s, None);
        c.start().await.unwrap();

        c.set_local_profile(Profile {
            callsign: Some("ME-1".into()),
            squad: Some("2".into()),
            ..Default::default()
        })
        .await;
        c.publish_profile().await.unwrap();
        match recv_message(&peer).await {
            Message::Profile(p) => {
                assert_eq!(p.device_id, "me");
                assert_eq!(p.squad.as_deref(), Some("2"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let pin = Pin {
            id: 3,
            lat: 10.0,
            lon: 20.0,
            pin_type: "hostile".into(),
            title: "MG nest".into(),
            description: String::new(),
            ts: 1,
            origin_device_id: "me".into(),
            callsign: "ME-1".into(),
            photo: None,
        };
        c.publish_pin(&pin).await.unwrap();
        match recv_message(&peer).await {
            Message::PinAdd(p) => assert_eq!((p.id, p.device_id.as_str()), (3, "me")),
            other => panic!("unexpected {other:?}"),
        }
        c.request_pins().await.unwrap();
        assert!(matches!(recv_message(&peer).await, Message::PinRequest(_)));
    }
}
