use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;

use crate::telemetry::counters;
use crate::xmpp::Stanza;

pub const DEFAULT_RECEIPT_CAPACITY: usize = 10;

/// Delivery receipts waiting for a carrier's "delivered" notice.
///
/// Registered from the send path and resolved from webhook handlers. The
/// table is bounded crudely: when it is full, every pending entry is dropped
/// before the new one is stored.
#[derive(Debug)]
pub struct ReceiptTracker {
    capacity: usize,
    pending: Mutex<HashMap<String, Stanza>>,
}

impl ReceiptTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Remember `receipt` until `provider_id` is reported delivered.
    pub fn register(&self, provider_id: impl Into<String>, receipt: Stanza) {
        let provider_id = provider_id.into();
        let mut pending = self.pending.lock();

        if pending.len() >= self.capacity {
            warn!(
                dropped = pending.len(),
                capacity = self.capacity,
                "receipt table full, dropping pending receipts"
            );
            counters::receipts_dropped(pending.len() as u64);
            pending.clear();
        }

        pending.insert(provider_id, receipt);
        counters::receipt_registered();
    }

    /// Remove and return the receipt for `provider_id`.
    pub fn resolve(&self, provider_id: &str) -> Option<Stanza> {
        let receipt = self.pending.lock().remove(provider_id);
        if receipt.is_some() {
            counters::receipt_resolved();
        }
        receipt
    }
}

impl Default for ReceiptTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RECEIPT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::address::Jid;
    use crate::xmpp::Message;

    fn receipt(id: &str) -> Stanza {
        Message::receipt(
            Jid::parse("+15551230000@gateway.example").unwrap(),
            Jid::parse("alice@gateway.example").unwrap(),
            id,
        )
        .into()
    }

    #[test]
    fn test_register_then_resolve_once() {
        let tracker = ReceiptTracker::default();
        let stanza = receipt("orig-1");
        tracker.register("SM123", stanza.clone());

        assert_eq!(tracker.resolve("SM123"), Some(stanza));
        assert_eq!(tracker.resolve("SM123"), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_resolve_unknown_is_noop() {
        let tracker = ReceiptTracker::default();
        tracker.register("SM1", receipt("a"));
        assert_eq!(tracker.resolve("SM2"), None);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_fill_to_capacity_keeps_everything() {
        let tracker = ReceiptTracker::new(10);
        for i in 0..10 {
            tracker.register(format!("SM{}", i), receipt("x"));
        }
        assert_eq!(tracker.len(), 10);
        assert!(tracker.resolve("SM0").is_some());
    }

    #[test]
    fn test_overflow_clears_before_insert() {
        let tracker = ReceiptTracker::new(10);
        for i in 0..10 {
            tracker.register(format!("SM{}", i), receipt("x"));
        }

        tracker.register("SM10", receipt("x"));

        assert_eq!(tracker.len(), 1);
        for i in 0..10 {
            assert_eq!(tracker.resolve(&format!("SM{}", i)), None);
        }
        assert!(tracker.resolve("SM10").is_some());
    }

    #[test]
    fn test_reregister_same_id_replaces() {
        let tracker = ReceiptTracker::new(2);
        tracker.register("SM1", receipt("a"));
        tracker.register("SM1", receipt("b"));
        assert_eq!(tracker.len(), 1);

        let Some(Stanza::Message(m)) = tracker.resolve("SM1") else {
            panic!("expected receipt");
        };
        assert_eq!(m.receipt_for.as_deref(), Some("b"));
    }

    #[test]
    fn test_concurrent_register_and_resolve() {
        let tracker = Arc::new(ReceiptTracker::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = format!("SM{}-{}", t, i);
                        tracker.register(id.clone(), receipt("x"));
                        assert!(tracker.resolve(&id).is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(tracker.is_empty());
    }
}
