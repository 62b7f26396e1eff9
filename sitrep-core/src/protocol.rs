//! SITREP wire protocol: message kinds, typed payloads and transport constants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fixed UDP port every device listens on.
pub const DEFAULT_PORT: u16 = 35876;

/// Network-wide broadcast address used for discovery and fan-out.
pub const BROADCAST_ADDR: &str = "255.255.255.255";

/// Largest UDP payload we will put on the wire (IPv4 limit).
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Wire tag carried in the `type` field of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "hello")]
    Hello,
    #[serde(rename = "pos")]
    Position,
    #[serde(rename = "profile")]
    Profile,
    #[serde(rename = "profile_req")]
    ProfileRequest,
    #[serde(rename = "pin_add")]
    PinAdd,
    #[serde(rename = "pin_req")]
    PinRequest,
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "chat_ack")]
    ChatAck,
    #[serde(rename = "order")]
    Order,
    #[serde(rename = "order_ack")]
    OrderAck,
    #[serde(rename = "linkedform")]
    LinkedForm,
    #[serde(rename = "report_ack")]
    ReportAck,
    #[serde(rename = "methane_ack")]
    MethaneAck,
    #[serde(rename = "medevac_ack")]
    MedevacAck,
}

impl MessageType {
    pub const ALL: [MessageType; 14] = [
        MessageType::Hello,
        MessageType::Position,
        MessageType::Profile,
        MessageType::ProfileRequest,
        MessageType::PinAdd,
        MessageType::PinRequest,
        MessageType::Chat,
        MessageType::ChatAck,
        MessageType::Order,
        MessageType::OrderAck,
        MessageType::LinkedForm,
        MessageType::ReportAck,
        MessageType::MethaneAck,
        MessageType::MedevacAck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Hello => "hello",
            MessageType::Position => "pos",
            MessageType::Profile => "profile",
            MessageType::ProfileRequest => "profile_req",
            MessageType::PinAdd => "pin_add",
            MessageType::PinRequest => "pin_req",
            MessageType::Chat => "chat",
            MessageType::ChatAck => "chat_ack",
            MessageType::Order => "order",
            MessageType::OrderAck => "order_ack",
            MessageType::LinkedForm => "linkedform",
            MessageType::ReportAck => "report_ack",
            MessageType::MethaneAck => "methane_ack",
            MessageType::MedevacAck => "medevac_ack",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type: {0}")]
pub struct UnknownMessageType(pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownMessageType(s.to_string()))
    }
}

/// All wire message kinds. Encoded as a flat JSON object with `type` at the top level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "hello")]
    Hello(Hello),
    #[serde(rename = "pos")]
    Position(Position),
    #[serde(rename = "profile")]
    Profile(Profile),
    #[serde(rename = "profile_req")]
    ProfileRequest(ProfileRequest),
    #[serde(rename = "pin_add")]
    PinAdd(PinAdd),
    #[serde(rename = "pin_req")]
    PinRequest(PinRequest),
    #[serde(rename = "chat")]
    Chat(Chat),
    #[serde(rename = "chat_ack")]
    ChatAck(ChatAck),
    #[serde(rename = "order")]
    Order(Order),
    #[serde(rename = "order_ack")]
    OrderAck(OrderAck),
    #[serde(rename = "linkedform")]
    LinkedForm(LinkedForm),
    #[serde(rename = "report_ack")]
    ReportAck(FormAck),
    #[serde(rename = "methane_ack")]
    MethaneAck(FormAck),
    #[serde(rename = "medevac_ack")]
    MedevacAck(FormAck),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Position(_) => MessageType::Position,
            Message::Profile(_) => MessageType::Profile,
            Message::ProfileRequest(_) => MessageType::ProfileRequest,
            Message::PinAdd(_) => MessageType::PinAdd,
            Message::PinRequest(_) => MessageType::PinRequest,
            Message::Chat(_) => MessageType::Chat,
            Message::ChatAck(_) => MessageType::ChatAck,
            Message::Order(_) => MessageType::Order,
            Message::OrderAck(_) => MessageType::OrderAck,
            Message::LinkedForm(_) => MessageType::LinkedForm,
            Message::ReportAck(_) => MessageType::ReportAck,
            Message::MethaneAck(_) => MessageType::MethaneAck,
            Message::MedevacAck(_) => MessageType::MedevacAck,
        }
    }

    /// Device that originated this message. Empty when a legacy `profile_req` omits it.
    pub fn sender_id(&self) -> &str {
        match self {
            Message::Hello(m) => &m.device_id,
            Message::Position(m) => &m.device_id,
            Message::Profile(m) => &m.device_id,
            Message::ProfileRequest(m) => m.device_id.as_deref().unwrap_or(""),
            Message::PinAdd(m) => &m.device_id,
            Message::PinRequest(m) => &m.device_id,
            Message::Chat(m) => &m.from_device_id,
            Message::ChatAck(m) => &m.from_device_id,
            Message::Order(m) => &m.from_device_id,
            Message::OrderAck(m) => &m.from_device_id,
            Message::LinkedForm(m) => &m.device_id,
            Message::ReportAck(m) | Message::MethaneAck(m) | Message::MedevacAck(m) => {
                &m.from_device_id
            }
        }
    }
}

/// Discovery announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub callsign: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    /// Legacy duplicate of `nickname`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
}

impl Hello {
    pub fn display_nickname(&self) -> Option<&str> {
        self.nickname.as_deref().or(self.nick.as_deref())
    }
}

/// Position report. Coordinates in decimal degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub callsign: String,
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callsign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platoon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squad: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callsign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Map pin. `photoBase64` carries an optional JPEG/PNG attachment as base64 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinAdd {
    pub device_id: String,
    pub callsign: String,
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub pin_type: String,
    pub title: String,
    pub description: String,
    pub ts: i64,
    pub origin_device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_base64: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinRequest {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub thread_id: String,
    pub from_device_id: String,
    pub to_device_id: String,
    pub text: String,
    pub ts: i64,
}

/// Delivered receipt for a chat line. `ts` echoes the acknowledged line's `ts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAck {
    pub thread_id: String,
    pub from_device_id: String,
    pub to_device_id: String,
    pub ts: i64,
}

/// Five-paragraph order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub order_type: String,
    pub from_device_id: String,
    pub from_callsign: String,
    pub to_device_ids: Vec<String>,
    pub created_at_millis: i64,
    pub orientation: String,
    pub decision: String,
    pub order: String,
    pub mission: String,
    pub execution: String,
    pub logistics: String,
    pub command_signaling: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckKind {
    Delivered,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    pub from_device_id: String,
    pub to_device_id: String,
    pub ack_type: AckKind,
    pub timestamp_millis: i64,
}

/// Form attached to an observation-post pin (call for fire, spot report, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedForm {
    pub device_id: String,
    pub id: i64,
    pub op_pin_id: i64,
    pub op_origin_device_id: String,
    pub form_type: String,
    /// Opaque form body, interpreted by the application per `form_type`.
    pub form_data: String,
    pub submitted_at_millis: i64,
    pub author_callsign: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer_lon: Option<f64>,
}

/// Receipt for a report, METHANE or MEDEVAC form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormAck {
    pub report_id: String,
    pub from_device_id: String,
    pub to_device_id: String,
    pub ack_type: AckKind,
    pub timestamp_millis: i64,
}

/// True when both coordinates are finite and inside WGS84 bounds.
pub fn valid_coordinates(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}
