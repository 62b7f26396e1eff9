//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sitrep_core::dispatch::LocalNode;
use sitrep_core::identity::{Ed25519Signer, MessageSigner, PayloadCipher, SignaturePolicy};
use sitrep_core::protocol::{Profile, DEFAULT_PORT};
use tracing::{info, warn};

use crate::coordinator::{CoordinatorSettings, TransportMode};
use crate::transport::{BrokerSecurity, BrokerSettings, LocalSettings};

/// Daemon configuration. File: ~/.config/sitrep/config.toml or /etc/sitrep/config.toml.
/// Env overrides: SITREP_DEVICE_ID, SITREP_CALLSIGN, SITREP_PORT, SITREP_MODE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Stable device id. When unset, one is generated and kept in `device_id_file`.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Where a generated device id is kept (default ~/.config/sitrep/device_id).
    #[serde(default)]
    pub device_id_file: Option<PathBuf>,
    #[serde(default = "default_callsign")]
    pub callsign: String,
    /// "local" (default) or "broker".
    #[serde(default)]
    pub mode: TransportMode,
    /// UDP port shared by every device (default 35876).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: Ipv4Addr,
    /// Addresses unicast to alongside every broadcast, as "host" or "host:port".
    #[serde(default)]
    pub peers: Vec<String>,
    /// Hello announce period; 0 disables.
    #[serde(default = "default_announce_interval_secs")]
    pub announce_interval_secs: u64,
    /// Sign broker envelopes with a per-run Ed25519 key.
    #[serde(default = "default_true")]
    pub sign_outbound: bool,
    /// Drop unsigned broker envelopes.
    #[serde(default)]
    pub require_signed: bool,
    /// Team passphrase; when set, broker payloads are encrypted.
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub broker: Option<BrokerSettings>,
}

/// Details published in answer to profile requests.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub nickname: Option<String>,
    pub first: Option<String>,
    pub last: Option<String>,
    pub company: Option<String>,
    pub platoon: Option<String>,
    pub squad: Option<String>,
    pub mobile: Option<String>,
    pub email: Option<String>,
}

fn default_callsign() -> String {
    "UNKNOWN".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_broadcast_addr() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_announce_interval_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: None,
            device_id_file: None,
            callsign: default_callsign(),
            mode: TransportMode::default(),
            port: default_port(),
            bind_addr: default_bind_addr(),
            broadcast_addr: default_broadcast_addr(),
            peers: Vec::new(),
            announce_interval_secs: default_announce_interval_secs(),
            sign_outbound: true,
            require_signed: false,
            shared_secret: None,
            profile: ProfileConfig::default(),
            broker: None,
        }
    }
}

impl Config {
    /// Device id from config, else the persisted one, else a fresh random one.
    pub fn resolved_device_id(&self) -> String {
        match &self.device_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => match &self.device_id_file {
                Some(path) => load_or_create_device_id(path),
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    warn!(device_id = %id, "no device id configured; id changes on every run");
                    id
                }
            },
        }
    }

    pub fn local_node(&self) -> LocalNode {
        let mut node = LocalNode::new(self.resolved_device_id(), self.callsign.clone());
        let p = &self.profile;
        node.profile = Profile {
            device_id: node.device_id.clone(),
            callsign: Some(self.callsign.clone()),
            nickname: p.nickname.clone(),
            nick: p.nickname.clone(),
            first: p.first.clone(),
            last: p.last.clone(),
            company: p.company.clone(),
            platoon: p.platoon.clone(),
            squad: p.squad.clone(),
            mobile: p.mobile.clone(),
            email: p.email.clone(),
        };
        node
    }

    pub fn security(&self) -> BrokerSecurity {
        BrokerSecurity {
            signer: self
                .sign_outbound
                .then(|| Arc::new(Ed25519Signer::generate()) as Arc<dyn MessageSigner>),
            policy: if self.require_signed {
                SignaturePolicy::RequireSigned
            } else {
                SignaturePolicy::AllowUnsigned
            },
            cipher: self
                .shared_secret
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(PayloadCipher::from_shared_secret),
        }
    }

    pub fn settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            local: self.local_node(),
            udp: LocalSettings {
                bind_addr: self.bind_addr,
                port: self.port,
                broadcast_addr: self.broadcast_addr,
            },
            initial_peers: self.peers.clone(),
            mode: self.mode,
            announce_interval: (self.announce_interval_secs > 0)
                .then(|| Duration::from_secs(self.announce_interval_secs)),
            broker: self.broker.clone(),
            security: self.security(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    fill_device_id_file(&mut c);
    c
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load an explicitly named file, then env vars. Unlike [`load`], a bad file is an error.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut c = toml::from_str::<Config>(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    apply_env(&mut c, |k| std::env::var(k).ok());
    fill_device_id_file(&mut c);
    Ok(c)
}

fn fill_device_id_file(c: &mut Config) {
    if c.device_id_file.is_none() {
        c.device_id_file = std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join(".config/sitrep/device_id"));
    }
}

/// Read the id kept at `path`, or generate one and write it there. A write failure
/// leaves the id valid for this run only.
fn load_or_create_device_id(path: &Path) -> String {
    if let Ok(text) = std::fs::read_to_string(path) {
        let id = text.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    let written = match path.parent() {
        Some(dir) => std::fs::create_dir_all(dir).and_then(|()| std::fs::write(path, &id)),
        None => std::fs::write(path, &id),
    };
    match written {
        Ok(()) => info!(device_id = %id, path = %path.display(), "generated device id"),
        Err(e) => warn!(
            device_id = %id,
            path = %path.display(),
            error = %e,
            "cannot persist device id; id changes on every run"
        ),
    }
    id
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("SITREP_DEVICE_ID") {
        c.device_id = Some(s);
    }
    if let Some(s) = var("SITREP_CALLSIGN") {
        c.callsign = s;
    }
    if let Some(s) = var("SITREP_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "ignoring invalid SITREP_PORT"),
        }
    }
    if let Some(s) = var("SITREP_MODE") {
        match s.parse::<TransportMode>() {
            Ok(m) => c.mode = m,
            Err(e) => warn!(error = %e, "ignoring invalid SITREP_MODE"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/sitrep/config.toml"));
    }
    out.push(PathBuf::from("/etc/sitrep/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => {
                    info!(path = %p.display(), "loaded config");
                    return Some(c);
                }
                Ok(Err(e)) => warn!(path = %p.display(), error = %e, "invalid config; using defaults"),
                Err(e) => warn!(path = %p.display(), error = %e, "cannot read config; using defaults"),
            }
            break;
        }
    }
    None
}
