//! Flat datagram framing: one JSON object per UDP datagram, `type` at the top level.

use serde_json::{Map, Value};

use crate::protocol::{Message, MessageType, MAX_DATAGRAM_LEN};

/// Encode a message into a single datagram.
pub fn encode_datagram(msg: &Message) -> Result<Vec<u8>, WireEncodeError> {
    let out = serde_json::to_vec(msg).map_err(WireEncodeError::Encode)?;
    if out.len() > MAX_DATAGRAM_LEN {
        return Err(WireEncodeError::TooLarge(out.len()));
    }
    Ok(out)
}

/// Error encoding a message into a datagram (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum WireEncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("datagram too large ({0} bytes)")]
    TooLarge(usize),
}

/// A decoded datagram one level below the typed message: the raw object plus the
/// two fields every receiver needs before dispatch.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub kind: String,
    /// `deviceId`, or `fromDeviceId` for kinds that only carry the latter. May be empty.
    pub sender: String,
    pub body: Map<String, Value>,
}

impl Datagram {
    /// Recognized wire kind, or `None` for types this build does not know.
    pub fn message_type(&self) -> Option<MessageType> {
        self.kind.parse().ok()
    }

    /// Parse the typed message. Fails when a required field is missing or mistyped.
    pub fn into_message(self) -> Result<Message, WireDecodeError> {
        serde_json::from_value(Value::Object(self.body)).map_err(WireDecodeError::Payload)
    }
}

/// Decode one datagram into its JSON object and read `type` / sender id.
pub fn decode_datagram(bytes: &[u8]) -> Result<Datagram, WireDecodeError> {
    let value: Value = serde_json::from_slice(bytes).map_err(WireDecodeError::Json)?;
    let Value::Object(body) = value else {
        return Err(WireDecodeError::NotAnObject);
    };
    let kind = match body.get("type") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return Err(WireDecodeError::MissingType),
    };
    let sender = ["deviceId", "fromDeviceId"]
        .iter()
        .find_map(|k| match body.get(*k) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default();
    Ok(Datagram { kind, sender, body })
}

/// Error decoding a datagram (bad JSON, wrong shape, or payload fields).
#[derive(Debug, thiserror::Error)]
pub enum WireDecodeError {
    #[error("invalid json: {0}")]
    Json(#[source] serde_json::Error),
    #[error("datagram is not a json object")]
    NotAnObject,
    #[error("missing or empty type field")]
    MissingType,
    #[error("invalid payload: {0}")]
    Payload(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Chat, Hello, PinAdd};

    fn sample_hello() -> Message {
        Message::Hello(Hello {
            callsign: "ALPHA".into(),
            device_id: "dev-a".into(),
            nickname: Some("Al".into()),
            nick: None,
        })
    }

    #[test]
    fn roundtrip_hello() {
        let msg = sample_hello();
        let bytes = encode_datagram(&msg).unwrap();
        let dg = decode_datagram(&bytes).unwrap();
        assert_eq!(dg.kind, "hello");
        assert_eq!(dg.sender, "dev-a");
        assert_eq!(dg.into_message().unwrap(), msg);
    }

    #[test]
    fn legacy_position_with_integer_coordinates() {
        let raw = br#"{"type":"pos","deviceId":"B","callsign":"X","lat":59,"lon":18,"ts":1000,"extra":true}"#;
        let dg = decode_datagram(raw).unwrap();
        match dg.into_message().unwrap() {
            Message::Position(p) => {
                assert_eq!(p.lat, 59.0);
                assert_eq!(p.lon, 18.0);
            }
            other => panic!("expected position, got {other:?}"),
        }
    }

    #[test]
    fn chat_sender_comes_from_from_device_id() {
        let msg = Message::Chat(Chat {
            thread_id: "t1".into(),
            from_device_id: "A".into(),
            to_device_id: "B".into(),
            text: "hello".into(),
            ts: 42,
        });
        let dg = decode_datagram(&encode_datagram(&msg).unwrap()).unwrap();
        assert_eq!(dg.sender, "A");
    }

    #[test]
    fn rejects_non_objects_and_missing_type() {
        assert!(matches!(
            decode_datagram(b"not json"),
            Err(WireDecodeError::Json(_))
        ));
        assert!(matches!(
            decode_datagram(b"[1,2,3]"),
            Err(WireDecodeError::NotAnObject)
        ));
        assert!(matches!(
            decode_datagram(br#"{"deviceId":"A"}"#),
            Err(WireDecodeError::MissingType)
        ));
        assert!(matches!(
            decode_datagram(br#"{"type":7,"deviceId":"A"}"#),
            Err(WireDecodeError::MissingType)
        ));
    }

    #[test]
    fn string_coordinates_are_not_coerced() {
        let raw = br#"{"type":"pos","deviceId":"B","callsign":"X","lat":"59.3","lon":18.0,"ts":1}"#;
        let dg = decode_datagram(raw).unwrap();
        assert!(matches!(dg.into_message(), Err(WireDecodeError::Payload(_))));
    }

    #[test]
    fn oversized_pin_rejected() {
        let msg = Message::PinAdd(PinAdd {
            device_id: "A".into(),
            callsign: "A".into(),
            id: 1,
            lat: 0.0,
            lon: 0.0,
            pin_type: "enemy".into(),
            title: "t".into(),
            description: "d".into(),
            ts: 1,
            origin_device_id: "A".into(),
            photo_base64: Some("A".repeat(MAX_DATAGRAM_LEN)),
        });
        assert!(matches!(
            encode_datagram(&msg),
            Err(WireEncodeError::TooLarge(_))
        ));
    }

    #[test]
    fn unknown_kind_is_not_recognized() {
        let dg = decode_datagram(br#"{"type":"weather","deviceId":"A"}"#).unwrap();
        assert!(dg.message_type().is_none());
    }
}
