//! LAN transport: one well-known UDP port, broadcast fan-out, and per-peer unicast
//! links for peers that broadcast cannot reach (other subnets, APs filtering broadcast).

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use sitrep_core::dispatch::{Action, Origin};
use sitrep_core::protocol::{Message, DEFAULT_PORT};
use sitrep_core::wire::encode_datagram;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{state_channel, ConnectionState, Shared, TransportError};
use crate::events::EventBus;

const RECV_BUF_LEN: usize = 65_536;

#[derive(Debug, Clone)]
pub struct LocalSettings {
    /// Address the listener and outgoing sockets bind to.
    pub bind_addr: IpAddr,
    pub port: u16,
    pub broadcast_addr: Ipv4Addr,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
        }
    }
}

/// Cached unicast path to one address: a connected socket owned by a writer task.
pub(crate) struct PeerLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl PeerLink {
    fn close(self) {
        self.task.abort();
    }
}

/// Unicast destination. Bare hosts use the transport's port.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Addr(SocketAddr),
    Host(String, u16),
}

impl Target {
    fn parse(addr: &str, default_port: u16) -> Self {
        if let Ok(sa) = addr.parse::<SocketAddr>() {
            return Target::Addr(sa);
        }
        if let Ok(ip) = addr.parse::<IpAddr>() {
            return Target::Addr(SocketAddr::new(ip, default_port));
        }
        if let Some((host, port)) = addr.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Target::Host(host.to_string(), port);
            }
        }
        Target::Host(addr.to_string(), default_port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Addr(a) => write!(f, "{a}"),
            Target::Host(h, p) => write!(f, "{h}:{p}"),
        }
    }
}

struct Running {
    recv_task: JoinHandle<()>,
    broadcast: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl Running {
    /// Abort the receive loop and wait for it, so the listener is closed before the port
    /// is bound again.
    async fn shutdown(self) {
        self.recv_task.abort();
        let _ = self.recv_task.await;
    }
}

struct Inner {
    settings: LocalSettings,
    shared: Shared,
    bus: EventBus,
    state: watch::Sender<ConnectionState>,
    running: Mutex<Option<Running>>,
}

/// Cheap to clone; clones share the same sockets and state.
#[derive(Clone)]
pub struct LocalBroadcastTransport {
    inner: Arc<Inner>,
}

impl LocalBroadcastTransport {
    pub fn new(settings: LocalSettings, shared: Shared, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                shared,
                bus,
                state: state_channel(),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &LocalSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Listener address while started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Bind the listener and the broadcast sender, then spawn the receive loop.
    pub async fn start(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        let mut running = inner.running.lock().await;
        if let Some(old) = running.take() {
            old.shutdown().await;
        }
        inner.state.send_replace(ConnectionState::Connecting);

        let listen = SocketAddr::new(inner.settings.bind_addr, inner.settings.port);
        let listener = match UdpSocket::bind(listen).await {
            Ok(s) => s,
            Err(source) => return Err(inner.fail_bind(listen, source)),
        };
        let sender_addr = SocketAddr::new(inner.settings.bind_addr, 0);
        let sender = match UdpSocket::bind(sender_addr).await {
            Ok(s) => s,
            Err(source) => return Err(inner.fail_bind(sender_addr, source)),
        };
        if let Err(source) = sender.set_broadcast(true) {
            return Err(inner.fail_bind(sender_addr, source));
        }
        let local_addr = listener.local_addr().unwrap_or(listen);

        let recv_inner = self.inner.clone();
        let recv_task = tokio::spawn(async move { recv_loop(recv_inner, listener).await });
        *running = Some(Running {
            recv_task,
            broadcast: Arc::new(sender),
            local_addr,
        });
        inner.state.send_replace(ConnectionState::Connected);
        info!(%local_addr, "local transport listening");
        Ok(())
    }

    /// Cancel the listener, the broadcast sender and every cached peer link.
    pub async fn stop(&self) {
        let running = self.inner.running.lock().await.take();
        if let Some(r) = running {
            r.shutdown().await;
        }
        let links: Vec<_> = {
            let mut s = self.inner.shared.lock().await;
            s.links.drain().map(|(_, l)| l).collect()
        };
        for link in links {
            link.close();
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
        debug!("local transport stopped");
    }

    /// Encode and send. Explicit recipients get unicast only; otherwise broadcast plus
    /// unicast to every known peer.
    pub async fn send(&self, msg: &Message, recipients: &[String]) -> Result<(), TransportError> {
        let bytes = encode_datagram(msg)?;
        self.send_bytes(bytes, recipients).await
    }

    pub async fn send_bytes(&self, bytes: Vec<u8>, recipients: &[String]) -> Result<(), TransportError> {
        let broadcast = self
            .inner
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.broadcast.clone())
            .ok_or(TransportError::NotStarted)?;

        if !recipients.is_empty() {
            self.inner.unicast_many(recipients, &bytes).await;
            return Ok(());
        }

        let dest = SocketAddr::new(IpAddr::V4(self.inner.settings.broadcast_addr), self.inner.settings.port);
        let sent = broadcast.send_to(&bytes, dest).await;
        let peers: Vec<String> = self.inner.shared.lock().await.peers.iter().cloned().collect();
        self.inner.unicast_many(&peers, &bytes).await;
        if let Err(e) = sent {
            warn!(%dest, error = %e, "broadcast send failed");
            self.inner
                .state
                .send_replace(ConnectionState::Error(format!("broadcast to {dest} failed: {e}")));
            return Err(TransportError::Send(e));
        }
        Ok(())
    }

    pub async fn add_peer(&self, addr: impl Into<String>) {
        self.inner.shared.lock().await.peers.insert(addr.into());
    }

    /// Forget a peer and close its link. Unknown addresses are ignored.
    pub async fn remove_peer(&self, addr: &str) {
        let link = {
            let mut s = self.inner.shared.lock().await;
            s.peers.remove(addr);
            s.links.remove(addr)
        };
        if let Some(link) = link {
            link.close();
        }
    }

    /// Replace the whole peer set; links of dropped peers are closed.
    pub async fn set_peers<I, S>(&self, addrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let next: HashSet<String> = addrs.into_iter().map(Into::into).collect();
        let dropped: Vec<PeerLink> = {
            let mut s = self.inner.shared.lock().await;
            let gone: Vec<String> = s.peers.difference(&next).cloned().collect();
            s.peers = next;
            gone.iter().filter_map(|a| s.links.remove(a)).collect()
        };
        for link in dropped {
            link.close();
        }
    }

    pub async fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.shared.lock().await.peers.iter().cloned().collect();
        peers.sort();
        peers
    }
}

impl Inner {
    fn fail_bind(&self, addr: SocketAddr, source: std::io::Error) -> TransportError {
        warn!(%addr, error = %source, "local transport bind failed");
        self.state
            .send_replace(ConnectionState::Error(format!("bind {addr}: {source}")));
        TransportError::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Queue `bytes` on each address's link, creating links on first use.
    async fn unicast_many(&self, addrs: &[String], bytes: &[u8]) {
        if addrs.is_empty() {
            return;
        }
        let senders: Vec<(String, mpsc::UnboundedSender<Vec<u8>>)> = {
            let mut s = self.shared.lock().await;
            addrs
                .iter()
                .map(|addr| {
                    let stale = s.links.get(addr).map_or(true, |l| l.tx.is_closed());
                    if stale {
                        if let Some(old) = s.links.remove(addr) {
                            old.close();
                        }
                        let link = spawn_link(self.settings.bind_addr, Target::parse(addr, self.settings.port));
                        s.links.insert(addr.clone(), link);
                    }
                    let tx = s.links.get(addr).map(|l| l.tx.clone());
                    (addr.clone(), tx)
                })
                .filter_map(|(a, tx)| tx.map(|tx| (a, tx)))
                .collect()
        };
        for (addr, tx) in senders {
            if tx.send(bytes.to_vec()).is_err() {
                debug!(%addr, "peer link closed before send");
            }
        }
    }

    /// Replies leave through the listener, addressed to the sender's host on the shared
    /// port. No peer link is created for them.
    async fn perform(&self, socket: &UdpSocket, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Notify(event) => self.bus.publish(event),
                Action::Reply {
                    to: Origin::Lan { host },
                    message,
                } => {
                    let bytes = match encode_datagram(&message) {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(kind = %message.kind(), error = %e, "reply not encodable");
                            continue;
                        }
                    };
                    match Target::parse(&host, self.settings.port) {
                        Target::Addr(dest) => {
                            if let Err(e) = socket.send_to(&bytes, dest).await {
                                warn!(%dest, error = %e, "reply send failed");
                            }
                        }
                        Target::Host(..) => warn!(%host, "reply host is not an address"),
                    }
                }
                Action::Reply { to, .. } => {
                    debug!(?to, "reply addressed off-LAN; ignored by local transport");
                }
            }
        }
    }
}

fn spawn_link(bind: IpAddr, target: Target) -> PeerLink {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_link(bind, target, rx));
    PeerLink { tx, task }
}

/// Connect a socket to `target` and forward queued datagrams. Failures are logged and end
/// the link; the next send to this address creates a fresh one.
async fn run_link(bind: IpAddr, target: Target, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    let socket = match UdpSocket::bind(SocketAddr::new(bind, 0)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(peer = %target, error = %e, "peer link bind failed");
            return;
        }
    };
    let connected = match &target {
        Target::Addr(addr) => socket.connect(addr).await,
        Target::Host(host, port) => socket.connect((host.as_str(), *port)).await,
    };
    if let Err(e) = connected {
        warn!(peer = %target, error = %e, "peer link connect failed");
        return;
    }
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = socket.send(&bytes).await {
            warn!(peer = %target, error = %e, "unicast send failed");
        }
    }
}

async fn recv_loop(inner: Arc<Inner>, socket: UdpSocket) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let host = from.ip().to_string();
                let actions = {
                    let mut s = inner.shared.lock().await;
                    s.dispatcher.on_datagram(&host, &buf[..n], Instant::now())
                };
                inner.perform(&socket, actions).await;
            }
            Err(e) => {
                warn!(error = %e, "local transport receive failed");
                inner
                    .state
                    .send_replace(ConnectionState::Error(format!("receive failed: {e}")));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sitrep_core::dispatch::{ChatEvent, Dispatcher, LocalNode};
    use sitrep_core::protocol::{Chat, Hello};
    use sitrep_core::wire::decode_datagram;
    use tokio::time::timeout;

    use super::*;
    use crate::transport::shared;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(200);

    fn free_port(ip: &str) -> u16 {
        std::net::UdpSocket::bind((ip, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn transport_on(ip: &str, port: u16, device_id: &str) -> LocalBroadcastTransport {
        let settings = LocalSettings {
            bind_addr: ip.parse().unwrap(),
            port,
            broadcast_addr: ip.parse().unwrap(),
        };
        let dispatcher = Dispatcher::new(LocalNode::new(device_id, device_id.to_uppercase()));
        LocalBroadcastTransport::new(settings, shared(dispatcher), EventBus::new())
    }

    async fn started(device_id: &str) -> (LocalBroadcastTransport, SocketAddr) {
        let t = transport_on("127.0.0.1", free_port("127.0.0.1"), device_id);
        t.start().await.unwrap();
        let addr = t.local_addr().await.unwrap();
        (t, addr)
    }

    fn hello(device_id: &str) -> Message {
        Message::Hello(Hello {
            callsign: "BRAVO".into(),
            device_id: device_id.into(),
            nickname: None,
            nick: None,
        })
    }

    #[tokio::test]
    async fn start_and_stop_transition_state() {
        let (t, _) = started("me").await;
        assert_eq!(t.state(), ConnectionState::Connected);
        t.stop().await;
        assert_eq!(t.state(), ConnectionState::Disconnected);
        assert!(t.local_addr().await.is_none());
        assert!(matches!(
            t.send(&hello("me"), &[]).await,
            Err(TransportError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn bind_conflict_reports_error_state() {
        let (_a, addr) = started("a").await;
        let b = transport_on("127.0.0.1", addr.port(), "b");
        let err = b.start().await.unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));
        assert!(matches!(b.state(), ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn position_datagram_reaches_listener() {
        let (t, addr) = started("me").await;
        let mut positions = t.inner.bus.subscribe_positions();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let raw = br#"{"type":"pos","deviceId":"B","lat":59.33,"lon":18.06,"callsign":"X","ts":1000}"#;
        peer.send_to(raw, addr).await.unwrap();
        let p = timeout(WAIT, positions.recv()).await.unwrap().unwrap();
        assert_eq!(p.device_id, "B");
        assert_eq!(p.callsign, "X");
        assert_eq!((p.lat, p.lon), (59.33, 18.06));

        let bad = br#"{"type":"pos","deviceId":"B","lat":91,"lon":18.06,"callsign":"X","ts":1001}"#;
        peer.send_to(bad, addr).await.unwrap();
        assert!(timeout(QUIET, positions.recv()).await.is_err());
        assert_eq!(t.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn own_datagrams_are_suppressed() {
        let (t, addr) = started("me").await;
        let mut hellos = t.inner.bus.subscribe_hello();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let own = encode_datagram(&hello("me")).unwrap();
        peer.send_to(&own, addr).await.unwrap();
        peer.send_to(b"garbage", addr).await.unwrap();
        assert!(timeout(QUIET, hellos.recv()).await.is_err());

        let other = encode_datagram(&hello("B")).unwrap();
        peer.send_to(&other, addr).await.unwrap();
        assert_eq!(timeout(WAIT, hellos.recv()).await.unwrap().unwrap().device_id, "B");
    }

    #[tokio::test]
    async fn explicit_recipients_get_unicast() {
        let (t, _) = started("me").await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap().to_string();

        t.send(&hello("me"), &[peer_addr.clone()]).await.unwrap();
        t.send(&hello("me"), &[peer_addr]).await.unwrap();
        let mut buf = [0u8; 2048];
        for _ in 0..2 {
            let (n, _) = timeout(WAIT, peer.recv_from(&mut buf)).await.unwrap().unwrap();
            assert_eq!(decode_datagram(&buf[..n]).unwrap().sender, "me");
        }
        // Both sends went through one cached link.
        assert_eq!(t.inner.shared.lock().await.links.len(), 1);
    }

    #[tokio::test]
    async fn restarts_on_the_same_port() {
        let (t, addr) = started("me").await;
        t.stop().await;
        t.start().await.unwrap();
        assert_eq!(t.local_addr().await, Some(addr));
        t.start().await.unwrap();
        assert_eq!(t.state(), ConnectionState::Connected);

        let mut hellos = t.inner.bus.subscribe_hello();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&encode_datagram(&hello("B")).unwrap(), addr).await.unwrap();
        assert_eq!(timeout(WAIT, hellos.recv()).await.unwrap().unwrap().device_id, "B");
    }

    #[tokio::test]
    async fn broadcast_also_reaches_known_peers() {
        let (t, _) = started("me").await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        t.add_peer(peer.local_addr().unwrap().to_string()).await;

        t.send(&hello("me"), &[]).await.unwrap();
        let mut buf = [0u8; 2048];
        let (n, _) = timeout(WAIT, peer.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(decode_datagram(&buf[..n]).unwrap().kind, "hello");
    }

    #[tokio::test]
    async fn peer_set_mutation() {
        let t = transport_on("127.0.0.1", 1, "me");
        t.add_peer("10.0.0.1").await;
        t.remove_peer("10.0.0.9").await;
        assert_eq!(t.peers().await, vec!["10.0.0.1".to_string()]);
        t.set_peers(["10.0.0.2", "10.0.0.3"]).await;
        assert_eq!(t.peers().await, vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()]);
        t.remove_peer("10.0.0.2").await;
        assert_eq!(t.peers().await, vec!["10.0.0.3".to_string()]);
    }

    #[tokio::test]
    async fn removing_peer_evicts_link() {
        let (t, _) = started("me").await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap().to_string();
        t.add_peer(addr.clone()).await;
        t.send(&hello("me"), &[addr.clone()]).await.unwrap();
        assert!(t.inner.shared.lock().await.links.contains_key(&addr));
        t.remove_peer(&addr).await;
        assert!(!t.inner.shared.lock().await.links.contains_key(&addr));
    }

    #[test]
    fn target_parsing() {
        assert_eq!(
            Target::parse("10.0.0.5", 35876),
            Target::Addr("10.0.0.5:35876".parse().unwrap())
        );
        assert_eq!(
            Target::parse("10.0.0.5:4000", 35876),
            Target::Addr("10.0.0.5:4000".parse().unwrap())
        );
        assert_eq!(
            Target::parse("fe80::1", 35876),
            Target::Addr(SocketAddr::new("fe80::1".parse().unwrap(), 35876))
        );
        assert_eq!(
            Target::parse("alpha.local", 35876),
            Target::Host("alpha.local".into(), 35876)
        );
        assert_eq!(
            Target::parse("alpha.local:9", 35876),
            Target::Host("alpha.local".into(), 9)
        );
    }

    // Two devices on distinct loopback addresses sharing the well-known port.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn chat_is_acknowledged_end_to_end() {
        let port = free_port("127.0.0.1");
        let a = transport_on("127.0.0.1", port, "A");
        let b = transport_on("127.0.0.2", port, "B");
        a.start().await.unwrap();
        b.start().await.unwrap();
        let mut a_chat = a.inner.bus.subscribe_chat();
        let mut b_chat = b.inner.bus.subscribe_chat();

        let chat = Message::Chat(Chat {
            thread_id: "general".into(),
            from_device_id: "A".into(),
            to_device_id: "B".into(),
            text: "radio check".into(),
            ts: 500,
        });
        a.inner
            .shared
            .lock()
            .await
            .dispatcher
            .ledger_mut()
            .record_sent("general:500", ["B"], 500);
        a.send(&chat, &["127.0.0.2".to_string()]).await.unwrap();

        match timeout(WAIT, b_chat.recv()).await.unwrap().unwrap() {
            ChatEvent::Message(line) => assert_eq!(line.text, "radio check"),
            other => panic!("unexpected {other:?}"),
        }
        match timeout(WAIT, a_chat.recv()).await.unwrap().unwrap() {
            ChatEvent::Ack { ack, acknowledged } => {
                assert_eq!(ack.from_device_id, "B");
                assert!(acknowledged);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(a
            .inner
            .shared
            .lock()
            .await
            .dispatcher
            .ledger()
            .is_acknowledged("general:500"));
        // The ack went out through B's listener, not a cached link.
        assert!(b.inner.shared.lock().await.links.is_empty());
    }
}
