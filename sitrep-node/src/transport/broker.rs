//! Broker relay transport. Messages travel as [`Envelope`]s over a pub/sub broker: one
//! topic every device subscribes to plus one direct topic per device.
//!
//! The broker protocol itself is a collaborator ([`BrokerClient`]); this module owns
//! the envelope mapping, signature policy, payload encryption and dispatch.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use sitrep_core::dispatch::{Action, Origin};
use sitrep_core::envelope::{self, Envelope};
use sitrep_core::identity::{Ed25519Signer, MessageSigner, PayloadCipher, SignaturePolicy};
use sitrep_core::protocol::Message;
use sitrep_core::now_millis;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{state_channel, ConnectionState, Shared, TransportError};
use crate::events::EventBus;

fn default_broker_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "sitrep".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSettings {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

impl BrokerSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_broker_port(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
        }
    }

    /// Topic every device subscribes to.
    pub fn broadcast_topic(&self) -> String {
        format!("{}/all", self.topic_prefix)
    }

    pub fn device_topic(&self, device_id: &str) -> String {
        format!("{}/device/{}", self.topic_prefix, device_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connect failed: {0}")]
    Connect(String),
    #[error("broker publish failed: {0}")]
    Publish(String),
    #[error("broker connection closed")]
    Closed,
}

/// Pub/sub connection to a message broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Connect and subscribe to `topics`. Inbound payloads arrive on the returned channel,
    /// which closes when the connection is lost.
    async fn connect(
        &self,
        settings: &BrokerSettings,
        topics: &[String],
    ) -> Result<mpsc::Receiver<Vec<u8>>, BrokerError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn disconnect(&self);
}

/// Signing and encryption applied on the broker path.
#[derive(Clone, Default)]
pub struct BrokerSecurity {
    /// Signs outbound envelopes. Inbound signatures are verified whether or not one is set.
    pub signer: Option<Arc<dyn MessageSigner>>,
    pub policy: SignaturePolicy,
    pub cipher: Option<PayloadCipher>,
}

impl fmt::Debug for BrokerSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSecurity")
            .field("signer", &self.signer.is_some())
            .field("policy", &self.policy)
            .field("cipher", &self.cipher.is_some())
            .finish()
    }
}

struct Inner {
    settings: BrokerSettings,
    client: Arc<dyn BrokerClient>,
    security: BrokerSecurity,
    verifier: Arc<dyn MessageSigner>,
    shared: Shared,
    bus: EventBus,
    state: watch::Sender<ConnectionState>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct BrokerTransport {
    inner: Arc<Inner>,
}

impl BrokerTransport {
    pub fn new(
        settings: BrokerSettings,
        client: Arc<dyn BrokerClient>,
        security: BrokerSecurity,
        shared: Shared,
        bus: EventBus,
    ) -> Self {
        let verifier = match &security.signer {
            Some(signer) => signer.clone(),
            None => Arc::new(Ed25519Signer::generate()) as Arc<dyn MessageSigner>,
        };
        Self {
            inner: Arc::new(Inner {
                settings,
                client,
                security,
                verifier,
                shared,
                bus,
                state: state_channel(),
                recv_task: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Connect, subscribe to the broadcast and own device topics, spawn the receive loop.
    pub async fn start(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        let mut task = inner.recv_task.lock().await;
        if let Some(old) = task.take() {
            old.abort();
        }
        inner.state.send_replace(ConnectionState::Connecting);

        let device_id = inner.shared.lock().await.dispatcher.device_id().to_string();
        let topics = vec![
            inner.settings.broadcast_topic(),
            inner.settings.device_topic(&device_id),
        ];
        let rx = match inner.client.connect(&inner.settings, &topics).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(host = %inner.settings.host, error = %e, "broker connect failed");
                inner.state.send_replace(ConnectionState::Error(e.to_string()));
                return Err(e.into());
            }
        };

        let recv_inner = self.inner.clone();
        *task = Some(tokio::spawn(async move {
            recv_loop(recv_inner, device_id, rx).await
        }));
        inner.state.send_replace(ConnectionState::Connected);
        info!(host = %inner.settings.host, port = inner.settings.port, "broker transport connected");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(task) = self.inner.recv_task.lock().await.take() {
            task.abort();
        }
        self.inner.client.disconnect().await;
        self.inner.state.send_replace(ConnectionState::Disconnected);
        debug!("broker transport stopped");
    }

    /// Publish to the broadcast topic, or to each recipient's device topic.
    pub async fn send(&self, msg: &Message, recipients: &[String]) -> Result<(), TransportError> {
        if self.inner.recv_task.lock().await.is_none() {
            return Err(TransportError::NotStarted);
        }
        let topics: Vec<String> = if recipients.is_empty() {
            vec![self.inner.settings.broadcast_topic()]
        } else {
            recipients
                .iter()
                .map(|id| self.inner.settings.device_topic(id))
                .collect()
        };
        self.inner.publish(msg, &topics).await
    }
}

impl Inner {
    async fn outbound(&self, msg: &Message) -> Result<Vec<u8>, TransportError> {
        let device_id = self.shared.lock().await.dispatcher.device_id().to_string();
        let mut env = Envelope::wrap(&device_id, msg, now_millis())?;
        if let Some(cipher) = &self.security.cipher {
            env.seal(cipher)?;
        }
        if let Some(signer) = &self.security.signer {
            env.sign(signer.as_ref())?;
        }
        Ok(envelope::encode(&env)?)
    }

    async fn publish(&self, msg: &Message, topics: &[String]) -> Result<(), TransportError> {
        let bytes = self.outbound(msg).await?;
        for topic in topics {
            if let Err(e) = self.client.publish(topic, bytes.clone()).await {
                warn!(%topic, kind = %msg.kind(), error = %e, "broker publish failed");
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Validate one inbound payload and turn it into an opened envelope, or drop it.
    fn accept(&self, local_id: &str, bytes: &[u8]) -> Option<Envelope> {
        let env = match envelope::decode(bytes) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "dropping malformed envelope");
                return None;
            }
        };
        if env.device_id == local_id {
            trace!(kind = %env.kind, "ignoring own envelope");
            return None;
        }
        let check = env.verify(self.verifier.as_ref());
        if !check.accepted_by(self.security.policy) {
            warn!(device = %env.device_id, kind = %env.kind, ?check, "rejecting envelope signature");
            return None;
        }
        if !env.encrypted {
            return Some(env);
        }
        let Some(cipher) = &self.security.cipher else {
            debug!(device = %env.device_id, "dropping encrypted envelope: no payload key");
            return None;
        };
        match env.open(cipher) {
            Ok(opened) => Some(opened),
            Err(e) => {
                warn!(device = %env.device_id, error = %e, "dropping envelope that failed to decrypt");
                None
            }
        }
    }

    async fn perform(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Notify(event) => self.bus.publish(event),
                Action::Reply {
                    to: Origin::Broker { device_id },
                    message,
                } => {
                    let topic = self.settings.device_topic(&device_id);
                    if let Err(e) = self.publish(&message, &[topic]).await {
                        debug!(device = %device_id, error = %e, "reply not delivered");
                    }
                }
                Action::Reply { to, .. } => {
                    debug!(?to, "reply addressed to LAN; ignored by broker transport");
                }
            }
        }
    }
}

async fn recv_loop(inner: Arc<Inner>, local_id: String, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        let Some(env) = inner.accept(&local_id, &bytes) else {
            continue;
        };
        let actions = {
            let mut s = inner.shared.lock().await;
            s.dispatcher.on_envelope(&env, Instant::now())
        };
        inner.perform(actions).await;
    }
    warn!("broker inbound stream ended");
    inner
        .state
        .send_replace(ConnectionState::Error(BrokerError::Closed.to_string()));
}
