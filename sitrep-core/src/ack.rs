//! Delivery and read tracking for chat lines and orders.

use std::collections::{HashMap, HashSet};

use crate::protocol::AckKind;

/// Identifier of a chat line for acknowledgement purposes. Acks echo thread and `ts`.
pub fn chat_message_id(thread_id: &str, ts: i64) -> String {
    format!("{thread_id}:{ts}")
}

/// Per-recipient delivery state. Timestamps are set once and never cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecipientStatus {
    pub sent_at: i64,
    pub delivered_at: Option<i64>,
    pub read_at: Option<i64>,
}

impl RecipientStatus {
    pub fn new(sent_at: i64) -> Self {
        Self {
            sent_at,
            delivered_at: None,
            read_at: None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }

    /// A READ ack does not imply DELIVERED here; callers wanting that must ack both.
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    /// Apply an ack. Returns true if a timestamp was newly set.
    pub fn apply(&mut self, kind: AckKind, at: i64) -> bool {
        let slot = match kind {
            AckKind::Delivered => &mut self.delivered_at,
            AckKind::Read => &mut self.read_at,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(at);
        true
    }
}

#[derive(Debug)]
struct SentMessage {
    sent_at: i64,
    recipients: HashMap<String, RecipientStatus>,
}

/// Tracks messages this device sent and the acks received for them, plus the read
/// receipts this device has already emitted.
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    sent: HashMap<String, SentMessage>,
    read_receipts: HashSet<String>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a send. Recipients already tracked for this message keep their state.
    pub fn record_sent<I, S>(&mut self, message_id: &str, recipients: I, sent_at: i64)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self
            .sent
            .entry(message_id.to_string())
            .or_insert_with(|| SentMessage {
                sent_at,
                recipients: HashMap::new(),
            });
        for r in recipients {
            entry
                .recipients
                .entry(r.into())
                .or_insert_with(|| RecipientStatus::new(sent_at));
        }
    }

    /// Apply an ack from `recipient`. Acks for messages we never sent are ignored; an ack
    /// from a recipient not listed at send time (e.g. a broadcast thread) adds one.
    /// Returns the recipient's status after the update.
    pub fn apply_ack(
        &mut self,
        message_id: &str,
        recipient: &str,
        kind: AckKind,
        at: i64,
    ) -> Option<RecipientStatus> {
        let msg = self.sent.get_mut(message_id)?;
        let sent_at = msg.sent_at;
        let status = msg
            .recipients
            .entry(recipient.to_string())
            .or_insert_with(|| RecipientStatus::new(sent_at));
        status.apply(kind, at);
        Some(*status)
    }

    pub fn status(&self, message_id: &str, recipient: &str) -> Option<RecipientStatus> {
        self.sent
            .get(message_id)
            .and_then(|m| m.recipients.get(recipient))
            .copied()
    }

    /// All recipient states for a message, in no particular order.
    pub fn recipients(&self, message_id: &str) -> Vec<(String, RecipientStatus)> {
        self.sent
            .get(message_id)
            .map(|m| m.recipients.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }

    /// True once any recipient has confirmed delivery. This is the chat "acknowledged" flag.
    pub fn is_acknowledged(&self, message_id: &str) -> bool {
        self.sent
            .get(message_id)
            .map(|m| m.recipients.values().any(RecipientStatus::is_delivered))
            .unwrap_or(false)
    }

    pub fn is_tracked(&self, message_id: &str) -> bool {
        self.sent.contains_key(message_id)
    }

    /// Claim the right to send the READ receipt for an order. True only the first time.
    pub fn mark_read_sent(&mut self, order_id: &str) -> bool {
        self.read_receipts.insert(order_id.to_string())
    }

    /// Give back a claim whose READ receipt could not be sent.
    pub fn release_read_sent(&mut self, order_id: &str) {
        self.read_receipts.remove(order_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_never_regresses() {
        let mut s = RecipientStatus::new(1);
        assert!(s.apply(AckKind::Delivered, 5));
        assert!(!s.apply(AckKind::Delivered, 9));
        assert_eq!(s.delivered_at, Some(5));
        assert!(s.apply(AckKind::Read, 10));
        assert!(!s.apply(AckKind::Read, 11));
        assert_eq!(s.read_at, Some(10));
    }

    #[test]
    fn read_without_delivered_is_not_enforced() {
        let mut s = RecipientStatus::new(1);
        s.apply(AckKind::Read, 3);
        assert!(s.is_read());
        assert!(!s.is_delivered());
    }

    #[test]
    fn order_two_level_ack() {
        let mut ledger = DeliveryLedger::new();
        ledger.record_sent("o1", ["B", "C"], 100);
        assert_eq!(ledger.status("o1", "B"), Some(RecipientStatus::new(100)));

        let s = ledger.apply_ack("o1", "B", AckKind::Delivered, 110).unwrap();
        assert!(s.is_delivered() && !s.is_read());
        let s = ledger.apply_ack("o1", "B", AckKind::Read, 120).unwrap();
        assert!(s.is_read() && s.is_delivered());
        assert!(!ledger.status("o1", "C").unwrap().is_delivered());
        assert_eq!(ledger.recipients("o1").len(), 2);
    }

    #[test]
    fn ack_for_unknown_message_is_ignored() {
        let mut ledger = DeliveryLedger::new();
        assert!(ledger.apply_ack("nope", "B", AckKind::Delivered, 1).is_none());
        assert!(!ledger.is_tracked("nope"));
    }

    #[test]
    fn chat_acknowledged_by_any_recipient() {
        let mut ledger = DeliveryLedger::new();
        let id = chat_message_id("general", 42);
        ledger.record_sent(&id, Vec::<String>::new(), 42);
        assert!(!ledger.is_acknowledged(&id));
        ledger.apply_ack(&id, "B", AckKind::Delivered, 50);
        assert!(ledger.is_acknowledged(&id));
        assert_eq!(ledger.status(&id, "B").unwrap().sent_at, 42);
    }

    #[test]
    fn read_receipt_claimed_once() {
        let mut ledger = DeliveryLedger::new();
        assert!(ledger.mark_read_sent("o1"));
        assert!(!ledger.mark_read_sent("o1"));
        ledger.release_read_sent("o1");
        assert!(ledger.mark_read_sent("o1"));
    }
}
