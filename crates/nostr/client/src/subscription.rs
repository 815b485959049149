//! Per-subscription end-of-stored-events tracking.

use std::collections::HashMap;
use uuid::Uuid;

/// Fresh subscription id: an uppercase hyphenated UUIDv4.
pub fn new_subscription_id() -> String {
    Uuid::new_v4().hyphenated().to_string().to_uppercase()
}

/// State of one subscription on one relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionState {
    /// Set once the relay sent `EOSE`; later events are live.
    pub eose_reached: bool,
}

/// EOSE state for every subscription a relay has delivered events for.
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    states: HashMap<String, SubscriptionState>,
}

impl SubscriptionTracker {
    /// Start tracking `subscription_id` from scratch.
    pub fn open(&mut self, subscription_id: &str) {
        self.states
            .insert(subscription_id.to_string(), SubscriptionState::default());
    }

    /// Whether an event arriving now for `subscription_id` is stored
    /// (pre-EOSE) history. Unknown ids start tracking as pre-EOSE.
    pub fn is_stored_event(&mut self, subscription_id: &str) -> bool {
        !self
            .states
            .entry(subscription_id.to_string())
            .or_default()
            .eose_reached
    }

    pub fn mark_eose(&mut self, subscription_id: &str) {
        self.states
            .entry(subscription_id.to_string())
            .or_default()
            .eose_reached = true;
    }

    /// Whether the relay has sent `EOSE` for `subscription_id`.
    pub fn has_eose(&self, subscription_id: &str) -> bool {
        self.states
            .get(subscription_id)
            .is_some_and(|state| state.eose_reached)
    }

    pub fn remove(&mut self, subscription_id: &str) {
        self.states.remove(subscription_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.states.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
