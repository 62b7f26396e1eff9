//! SITREP tactical messaging protocol core.
//! Host-driven: no I/O; host passes received bytes and performs the returned actions.

pub mod ack;
pub mod dispatch;
pub mod envelope;
pub mod identity;
pub mod protocol;
pub mod throttle;
pub mod wire;

pub use ack::{chat_message_id, DeliveryLedger, RecipientStatus};
pub use dispatch::{
    Action, CachedProfile, ChatEvent, ChatLine, Direction, Dispatcher, Event, FormAckEvent,
    FormKind, HelloEvent, LocalNode, OrderEvent, Origin, Pin, PinEvent, PositionReport,
};
pub use envelope::{Envelope, EnvelopeError, SignatureCheck};
pub use identity::{Ed25519Signer, MessageSigner, PayloadCipher, SignaturePolicy};
pub use protocol::{AckKind, Message, MessageType, DEFAULT_PORT};
pub use throttle::{ThrottlePolicy, ThrottlePurpose};
pub use wire::{decode_datagram, encode_datagram, WireDecodeError, WireEncodeError};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
