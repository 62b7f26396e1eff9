//! Typed message envelope used on the broker path.
//!
//! An [`Envelope`] wraps a [`Message`] with the sender id, a send timestamp and the
//! optional signature / encryption fields. Its JSON form is compact and deterministic
//! (payload keys sorted), which is what signatures are computed over.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::{CryptoError, MessageSigner, PayloadCipher, SignaturePolicy};
use crate::protocol::{Message, MessageType};

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub device_id: String,
    /// Sender-local milliseconds since the epoch. Not comparable across devices.
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<String>,
}

/// Outcome of checking an envelope's signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Unsigned,
    Valid,
    Invalid,
}

impl SignatureCheck {
    pub fn accepted_by(self, policy: SignaturePolicy) -> bool {
        match self {
            SignatureCheck::Valid => true,
            SignatureCheck::Unsigned => policy == SignaturePolicy::AllowUnsigned,
            SignatureCheck::Invalid => false,
        }
    }
}

/// Serialize an envelope. Unset optional fields are omitted.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
    serde_json::to_vec(envelope).map_err(EnvelopeError::Encode)
}

/// Parse an envelope. Unknown fields are ignored; anything that cannot yield a valid
/// `type` and non-empty `deviceId` is rejected whole.
pub fn decode(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| EnvelopeError::InvalidFormat(e.to_string()))?;
    if envelope.device_id.is_empty() {
        return Err(EnvelopeError::InvalidFormat("empty deviceId".into()));
    }
    if envelope.encrypted && envelope.encrypted_payload.is_none() {
        return Err(EnvelopeError::InvalidFormat(
            "encrypted without encryptedPayload".into(),
        ));
    }
    Ok(envelope)
}

impl Envelope {
    /// Wrap a typed message. The payload is the message's flat fields minus `type`.
    pub fn wrap(device_id: &str, msg: &Message, timestamp: i64) -> Result<Self, EnvelopeError> {
        if device_id.is_empty() {
            return Err(EnvelopeError::InvalidFormat("empty deviceId".into()));
        }
        let mut payload = match serde_json::to_value(msg).map_err(EnvelopeError::Encode)? {
            Value::Object(map) => map,
            _ => return Err(EnvelopeError::InvalidFormat("message is not an object".into())),
        };
        payload.remove("type");
        Ok(Self {
            kind: msg.kind(),
            device_id: device_id.to_string(),
            timestamp,
            payload,
            signature: None,
            public_key: None,
            encrypted: false,
            encrypted_payload: None,
        })
    }

    /// Typed message carried by this envelope. Sealed envelopes must be opened first.
    pub fn message(&self) -> Result<Message, EnvelopeError> {
        if self.encrypted {
            return Err(EnvelopeError::Sealed);
        }
        let mut body = self.payload.clone();
        body.insert("type".into(), Value::String(self.kind.as_str().into()));
        serde_json::from_value(Value::Object(body)).map_err(EnvelopeError::Payload)
    }

    /// Bytes covered by the signature: the envelope without `signature` / `publicKey`.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        unsigned.public_key = None;
        encode(&unsigned)
    }

    pub fn sign(&mut self, signer: &dyn MessageSigner) -> Result<(), EnvelopeError> {
        let bytes = self.signing_bytes()?;
        self.signature = Some(BASE64.encode(signer.sign(&bytes)));
        self.public_key = Some(BASE64.encode(signer.public_key()));
        Ok(())
    }

    pub fn verify(&self, signer: &dyn MessageSigner) -> SignatureCheck {
        let (Some(sig), Some(pk)) = (&self.signature, &self.public_key) else {
            return if self.signature.is_none() && self.public_key.is_none() {
                SignatureCheck::Unsigned
            } else {
                SignatureCheck::Invalid
            };
        };
        let (Ok(sig), Ok(pk)) = (BASE64.decode(sig), BASE64.decode(pk)) else {
            return SignatureCheck::Invalid;
        };
        match self.signing_bytes() {
            Ok(bytes) if signer.verify(&bytes, &sig, &pk) => SignatureCheck::Valid,
            _ => SignatureCheck::Invalid,
        }
    }

    /// Replace the payload with its encrypted form. No-op when already sealed.
    pub fn seal(&mut self, cipher: &PayloadCipher) -> Result<(), EnvelopeError> {
        if self.encrypted {
            return Ok(());
        }
        let plain = serde_json::to_vec(&self.payload).map_err(EnvelopeError::Encode)?;
        self.encrypted_payload = Some(cipher.encrypt(&plain)?);
        self.payload = Map::new();
        self.encrypted = true;
        Ok(())
    }

    /// Decrypted copy of this envelope. The clear `payload` of a sealed envelope is ignored.
    pub fn open(&self, cipher: &PayloadCipher) -> Result<Envelope, EnvelopeError> {
        if !self.encrypted {
            return Ok(self.clone());
        }
        let text = self
            .encrypted_payload
            .as_deref()
            .ok_or_else(|| EnvelopeError::InvalidFormat("missing encryptedPayload".into()))?;
        let plain = cipher.decrypt(text)?;
        let payload: Map<String, Value> =
            serde_json::from_slice(&plain).map_err(EnvelopeError::Payload)?;
        let mut opened = self.clone();
        opened.payload = payload;
        opened.encrypted = false;
        opened.encrypted_payload = None;
        Ok(opened)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid envelope format: {0}")]
    InvalidFormat(String),
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("payload does not match its type: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("payload is encrypted")]
    Sealed,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
