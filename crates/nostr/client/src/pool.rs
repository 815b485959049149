//! Relay pool for multi-relay fanout.
//!
//! The pool holds one identity and a set of relays. Sends go to every relay;
//! every relay notification comes back out of the pool's single channel tagged
//! with the relay it came from. Nothing is deduplicated: an event returned by
//! three relays is reported three times.

use crate::error::Result;
use crate::handle::{Relay, parse_relay_url};
use crate::relay::{RelayConfig, RelayNotification};
use crate::subscription::new_subscription_id;
use crate::transport::{Connector, WebSocketConnector};
use indexmap::IndexMap;
use nostr::{Close, Event, Identity, Nip01Error, Request, prepare};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Relay pool configuration.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// Configuration for every relay added to the pool.
    pub relay_config: RelayConfig,
}

/// Notification emitted by a [`RelayPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolNotification {
    /// A relay notification, tagged with the relay that produced it.
    Relay {
        relay_url: String,
        notification: RelayNotification,
    },
    /// The relay list changed through [`RelayPool::set_relays`].
    RelaysChanged(Vec<String>),
}

/// Multi-relay pool sharing one identity.
///
/// Must be used from within a tokio runtime: each relay runs in its own task.
pub struct RelayPool<C: Connector = WebSocketConnector> {
    identity: Arc<Identity>,
    config: PoolConfig,
    connector: C,
    /// Relays in caller order; membership and order live in one structure.
    relays: IndexMap<String, Relay>,
    notifications: mpsc::UnboundedSender<PoolNotification>,
}

impl RelayPool<WebSocketConnector> {
    /// Create a pool connecting over WebSockets.
    pub fn new(
        identity: Identity,
        config: PoolConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PoolNotification>) {
        Self::with_connector(identity, config, WebSocketConnector)
    }

    /// Create a pool from a base64 SEC1 secret key.
    pub fn from_secret(
        secret: &str,
        config: PoolConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PoolNotification>)> {
        Ok(Self::new(Identity::from_secret(secret)?, config))
    }

    /// Create a pool from base64 (compressed public key, raw private key).
    pub fn from_pair(
        public_key: &str,
        private_key: &str,
        config: PoolConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PoolNotification>) {
        Self::new(Identity::from_pair(public_key, private_key), config)
    }
}

impl<C: Connector> RelayPool<C> {
    pub fn with_connector(
        identity: Identity,
        config: PoolConfig,
        connector: C,
    ) -> (Self, mpsc::UnboundedReceiver<PoolNotification>) {
        let (notifications, notifications_rx) = mpsc::unbounded_channel();
        let pool = Self {
            identity: Arc::new(identity),
            config,
            connector,
            relays: IndexMap::new(),
            notifications,
        };
        (pool, notifications_rx)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Relay URLs in pool order.
    pub fn relays(&self) -> Vec<String> {
        self.relays.keys().cloned().collect()
    }

    pub fn relay(&self, url: &str) -> Option<&Relay> {
        self.relays.get(url)
    }

    /// Replace the relay list.
    ///
    /// No-op when `relays` equals the current list, order included; a pure
    /// reorder still counts as a change. Otherwise adds the new relays,
    /// removes the missing ones, adopts the new order and emits
    /// [`PoolNotification::RelaysChanged`]. Duplicate entries keep their first
    /// position.
    pub fn set_relays<S: AsRef<str>>(&mut self, relays: &[S]) -> Result<()> {
        let mut wanted: Vec<String> = Vec::with_capacity(relays.len());
        for url in relays {
            let url = url.as_ref();
            if !wanted.iter().any(|existing| existing == url) {
                wanted.push(url.to_string());
            }
        }

        if self.relays.keys().eq(wanted.iter()) {
            return Ok(());
        }
        for url in &wanted {
            parse_relay_url(url)?;
        }

        for url in &wanted {
            self.add_relay(url)?;
        }
        let stale: Vec<String> = self
            .relays
            .keys()
            .filter(|url| !wanted.contains(*url))
            .cloned()
            .collect();
        for url in &stale {
            self.remove_relay(url);
        }

        let position: HashMap<&str, usize> = wanted
            .iter()
            .enumerate()
            .map(|(index, url)| (url.as_str(), index))
            .collect();
        self.relays.sort_by(|a, _, b, _| {
            let a = position.get(a.as_str()).copied().unwrap_or(usize::MAX);
            let b = position.get(b.as_str()).copied().unwrap_or(usize::MAX);
            a.cmp(&b)
        });

        let _ = self
            .notifications
            .send(PoolNotification::RelaysChanged(self.relays()));
        Ok(())
    }

    /// Add and start a relay. No-op if it is already in the pool.
    pub fn add_relay(&mut self, url: &str) -> Result<()> {
        if self.relays.contains_key(url) {
            return Ok(());
        }

        let (relay, notifications) = Relay::spawn(
            url,
            Arc::clone(&self.identity),
            self.config.relay_config.clone(),
            &self.connector,
        )?;
        self.forward(url, notifications);
        relay.start()?;

        info!("added relay {}", url);
        self.relays.insert(url.to_string(), relay);
        Ok(())
    }

    /// Stop and drop a relay. No-op if it is not in the pool.
    pub fn remove_relay(&mut self, url: &str) {
        if let Some(relay) = self.relays.shift_remove(url) {
            info!("removing relay {}", url);
            // Its task stops once the handle is gone.
            drop(relay);
        }
    }

    /// Prepare the event once and send the same signed event to every relay.
    pub fn send_event(&self, mut event: Event) -> Result<String> {
        prepare(&mut event, &self.identity)?;
        let id = event.id.clone().ok_or(Nip01Error::MissingField("id"))?;

        for (url, relay) in &self.relays {
            if let Err(error) = relay.send_event(event.clone(), true) {
                warn!("failed to send event to {}: {}", url, error);
            }
        }
        Ok(id)
    }

    /// Send a kind-1 note with `content`.
    pub fn send_text_note(&self, content: impl Into<String>) -> Result<String> {
        self.send_event(Event::text_note(content))
    }

    /// Send the request to every relay under one subscription id.
    pub fn send_request(&self, mut request: Request) -> String {
        let subscription_id = request
            .subscription_id
            .get_or_insert_with(new_subscription_id)
            .clone();

        for (url, relay) in &self.relays {
            if let Err(error) = relay.send_request(request.clone()) {
                warn!("failed to send request to {}: {}", url, error);
            }
        }
        subscription_id
    }

    /// Close a subscription on every relay, given the `Close`, the `Request`
    /// or its id.
    pub fn send_close(&self, close: impl Into<Close>) {
        let close = close.into();
        for (url, relay) in &self.relays {
            if let Err(error) = relay.send_close(close.clone()) {
                warn!("failed to send close to {}: {}", url, error);
            }
        }
    }

    /// Close the subscription `subscription_id` on every relay.
    pub fn send_close_id(&self, subscription_id: &str) {
        self.send_close(Close::new(subscription_id));
    }

    fn forward(&self, url: &str, mut notifications: mpsc::UnboundedReceiver<RelayNotification>) {
        let pool = self.notifications.clone();
        let relay_url = url.to_string();
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                let tagged = PoolNotification::Relay {
                    relay_url: relay_url.clone(),
                    notification,
                };
                if pool.send(tagged).is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, test_identity};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::time::timeout;

    const RELAY_A: &str = "wss://a.test";
    const RELAY_B: &str = "wss://b.test";

    fn pool(
        auto_connect: bool,
    ) -> (
        RelayPool<MockConnector>,
        mpsc::UnboundedReceiver<PoolNotification>,
        MockConnector,
        mpsc::UnboundedReceiver<(String, String)>,
    ) {
        let (connector, sent) = MockConnector::new(auto_connect);
        let (pool, notifications) =
            RelayPool::with_connector(test_identity(), PoolConfig::default(), connector.clone());
        (pool, notifications, connector, sent)
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(30), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_connected(
        notifications: &mut mpsc::UnboundedReceiver<PoolNotification>,
        count: usize,
    ) {
        let mut connected = 0;
        while connected < count {
            if let PoolNotification::Relay {
                notification: RelayNotification::Connected,
                ..
            } = next(notifications).await
            {
                connected += 1;
            }
        }
    }

    #[tokio::test]
    async fn relays_keep_caller_order() -> Result<()> {
        let (mut pool, mut notifications, _connector, _sent) = pool(true);
        pool.set_relays(&[RELAY_B, RELAY_A])?;
        assert_eq!(pool.relays(), vec![RELAY_B, RELAY_A]);

        let mut changed = None;
        while changed.is_none() {
            if let PoolNotification::RelaysChanged(relays) = next(&mut notifications).await {
                changed = Some(relays);
            }
        }
        assert_eq!(changed, Some(vec![RELAY_B.to_string(), RELAY_A.to_string()]));
        Ok(())
    }

    #[tokio::test]
    async fn set_relays_diffs_membership() -> Result<()> {
        let (mut pool, mut notifications, connector, _sent) = pool(true);
        pool.set_relays(&[RELAY_A, RELAY_B])?;
        wait_connected(&mut notifications, 2).await;
        pool.set_relays(&["wss://c.test", RELAY_A])?;
        wait_connected(&mut notifications, 1).await;

        assert_eq!(pool.relays(), vec!["wss://c.test", RELAY_A]);
        assert!(pool.relay(RELAY_B).is_none());
        // The kept relay was not reconnected.
        assert_eq!(connector.control(RELAY_A).opens(), 1);
        assert_eq!(connector.control("wss://c.test").opens(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn set_relays_with_same_list_is_a_no_op() -> Result<()> {
        let (mut pool, mut notifications, _connector, _sent) = pool(true);
        pool.set_relays(&[RELAY_A, RELAY_B])?;
        wait_connected(&mut notifications, 2).await;
        while notifications.try_recv().is_ok() {}

        pool.set_relays(&[RELAY_A, RELAY_B])?;
        tokio::task::yield_now().await;
        assert!(notifications.try_recv().is_err());

        // Same members, different order: a change.
        pool.set_relays(&[RELAY_B, RELAY_A])?;
        assert_eq!(
            next(&mut notifications).await,
            PoolNotification::RelaysChanged(vec![RELAY_B.to_string(), RELAY_A.to_string()])
        );
        Ok(())
    }

    #[tokio::test]
    async fn invalid_relay_list_is_rejected_whole() {
        let (mut pool, _notifications, _connector, _sent) = pool(true);
        assert!(pool.set_relays(&[RELAY_A, "https://nope.test"]).is_err());
        assert!(pool.relays().is_empty());
    }

    #[tokio::test]
    async fn add_and_remove_are_idempotent() -> Result<()> {
        let (mut pool, mut notifications, connector, _sent) = pool(true);
        pool.add_relay(RELAY_A)?;
        pool.add_relay(RELAY_A)?;
        assert_eq!(pool.relays(), vec![RELAY_A]);
        wait_connected(&mut notifications, 1).await;
        assert_eq!(connector.control(RELAY_A).opens(), 1);

        pool.remove_relay(RELAY_A);
        pool.remove_relay(RELAY_A);
        assert!(pool.relays().is_empty());
        assert_eq!(
            next(&mut notifications).await,
            PoolNotification::Relay {
                relay_url: RELAY_A.to_string(),
                notification: RelayNotification::Disconnected,
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn event_is_signed_once_for_all_relays() -> Result<()> {
        let (mut pool, mut notifications, _connector, mut sent) = pool(true);
        pool.set_relays(&[RELAY_A, RELAY_B])?;
        wait_connected(&mut notifications, 2).await;

        let id = pool.send_text_note("fan out")?;

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (relay, text) = next(&mut sent).await;
            let frame: Value = serde_json::from_str(&text)?;
            seen.push((relay, frame[1].clone()));
        }
        seen.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(seen[0].0, RELAY_A);
        assert_eq!(seen[1].0, RELAY_B);
        assert_eq!(seen[0].1, seen[1].1);
        assert_eq!(seen[0].1["id"], json!(id));
        Ok(())
    }

    #[tokio::test]
    async fn request_shares_one_subscription_id() -> Result<()> {
        let (mut pool, mut notifications, _connector, mut sent) = pool(true);
        pool.set_relays(&[RELAY_A, RELAY_B])?;
        wait_connected(&mut notifications, 2).await;

        let subscription_id = pool.send_request(Request::default().kinds([1]));
        let (_, first) = next(&mut sent).await;
        let (_, second) = next(&mut sent).await;
        assert_eq!(first, second);
        assert!(first.contains(&subscription_id));

        pool.send_close_id(&subscription_id);
        let (_, first) = next(&mut sent).await;
        let (_, second) = next(&mut sent).await;
        let expected = format!(r#"["CLOSE","{subscription_id}"]"#);
        assert_eq!(first, expected);
        assert_eq!(second, expected);
        Ok(())
    }

    #[tokio::test]
    async fn same_event_from_two_relays_is_reported_twice() -> Result<()> {
        let (mut pool, mut notifications, connector, _sent) = pool(true);
        pool.set_relays(&[RELAY_A, RELAY_B])?;
        wait_connected(&mut notifications, 2).await;

        let subscription_id = pool.send_request(Request::default());
        let frame = json!([
            "EVENT",
            subscription_id,
            {
                "id": "aa", "pubkey": "bb", "created_at": 1, "kind": 1,
                "tags": [], "content": "dup", "sig": "cc"
            }
        ])
        .to_string();
        connector.control(RELAY_A).deliver(frame.clone());
        connector.control(RELAY_B).deliver(frame);

        let mut sources = Vec::new();
        while sources.len() < 2 {
            if let PoolNotification::Relay {
                relay_url,
                notification: RelayNotification::NewEvent { event, stored, .. },
            } = next(&mut notifications).await
            {
                assert_eq!(event.content, "dup");
                assert!(stored);
                sources.push(relay_url);
            }
        }
        sources.sort();
        assert_eq!(sources, vec![RELAY_A, RELAY_B]);
        Ok(())
    }

    #[tokio::test]
    async fn relay_failures_are_tagged_with_source() -> Result<()> {
        let (mut pool, mut notifications, connector, _sent) = pool(true);
        pool.add_relay(RELAY_A)?;
        wait_connected(&mut notifications, 1).await;

        connector
            .control(RELAY_A)
            .deliver(r#"["OK","abc",false,"invalid: bad sig"]"#);
        assert_eq!(
            next(&mut notifications).await,
            PoolNotification::Relay {
                relay_url: RELAY_A.to_string(),
                notification: RelayNotification::Failed {
                    event_id: "abc".to_string(),
                    reason: "invalid: bad sig".to_string(),
                },
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn from_secret_rejects_bad_keys() {
        assert!(RelayPool::from_secret("garbage", PoolConfig::default()).is_err());
        let (pool, _notifications) =
            RelayPool::from_pair("pub", "priv", PoolConfig::default());
        assert_eq!(pool.identity().public_key(), "pub");
    }
}
