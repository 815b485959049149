//! Single relay connection state machine.
//!
//! `RelayConnection` owns one transport and reacts to three inputs: calls
//! from its owner, [`TransportEvent`]s, and expiry of its reconnect timer.
//! It never blocks and never awaits; the async driver in [`crate::handle`]
//! feeds it.
//!
//! ```text
//! Idle --start--> Connecting --connected--> Connected
//! Connected --drop (started)--> ReconnectPending --timer--> Connecting
//! Connected|Connecting --stop--> Disconnected --transport down--> Idle
//! ```

use crate::error::Result;
use crate::message::RelayMessage;
use crate::subscription::{SubscriptionTracker, new_subscription_id};
use crate::transport::{Transport, TransportEvent, TransportState};
use nostr::{
    Close, Event, Identity, Nip01Error, Request, prepare, serialize_close, serialize_event,
    serialize_request,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Delay before reconnecting after an unplanned disconnect.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or stopped and confirmed down.
    Idle,
    Connecting,
    Connected,
    /// Stop requested; waiting for the transport to report it is down.
    Disconnected,
    /// Dropped while started; a reconnect timer is armed.
    ReconnectPending,
}

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Fixed delay between an unplanned disconnect and the next attempt.
    /// Attempts repeat until `stop` or a successful connect.
    pub reconnect_delay: Duration,
    /// WebSocket handshake timeout.
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything a relay connection reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotification {
    Connected,
    /// Terminal: only emitted after `stop`.
    Disconnected,
    /// Relay accepted an event (`OK` true).
    Successfully { event_id: String },
    /// Relay rejected an event (`OK` false).
    Failed { event_id: String, reason: String },
    /// Transport error; a reconnect follows while started.
    Error(String),
    TlsErrors(Vec<String>),
    NewEvent {
        subscription_id: String,
        event: Event,
        /// True for stored history delivered before `EOSE`.
        stored: bool,
    },
    Notice(String),
    /// `EOSE` received for the subscription.
    SyncFinished { subscription_id: String },
}

/// Connection state machine for one relay.
pub struct RelayConnection<T: Transport> {
    url: Url,
    config: RelayConfig,
    identity: Arc<Identity>,
    transport: T,
    notifications: mpsc::UnboundedSender<RelayNotification>,
    state: ConnectionState,
    started: bool,
    outbound: VecDeque<String>,
    /// Serialized `REQ` commands keyed by subscription id, replayed on every
    /// connect.
    active_requests: HashMap<String, String>,
    subscriptions: SubscriptionTracker,
    reconnect_at: Option<Instant>,
}

impl<T: Transport> RelayConnection<T> {
    pub fn new(
        url: Url,
        identity: Arc<Identity>,
        config: RelayConfig,
        transport: T,
        notifications: mpsc::UnboundedSender<RelayNotification>,
    ) -> Self {
        Self {
            url,
            config,
            identity,
            transport,
            notifications,
            state: ConnectionState::Idle,
            started: false,
            outbound: VecDeque::new(),
            active_requests: HashMap::new(),
            subscriptions: SubscriptionTracker::default(),
            reconnect_at: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Commands waiting for a connected transport, oldest first.
    pub fn queued_commands(&self) -> impl Iterator<Item = &str> {
        self.outbound.iter().map(String::as_str)
    }

    /// Serialized `REQ` commands replayed on every connect.
    pub fn active_requests(&self) -> impl Iterator<Item = &str> {
        self.active_requests.values().map(String::as_str)
    }

    pub fn subscriptions(&self) -> &SubscriptionTracker {
        &self.subscriptions
    }

    /// When the pending reconnect fires, if one is armed.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn start(&mut self) {
        self.started = true;
        self.reconnect_at = None;
        self.state = ConnectionState::Connecting;
        info!("connecting to {}", self.url);
        self.transport.open(&self.url);
    }

    pub fn stop(&mut self) {
        self.started = false;
        self.reconnect_at = None;

        if self.transport.state() == TransportState::Disconnected {
            // Nothing left to close, so no transport event will follow.
            if self.state != ConnectionState::Idle {
                self.state = ConnectionState::Idle;
                self.notify(RelayNotification::Disconnected);
            }
            return;
        }

        self.state = ConnectionState::Disconnected;
        self.transport.close();
    }

    /// Reconnect timer expiry.
    pub fn on_reconnect_timer(&mut self) {
        if self.reconnect_at.take().is_some() && self.started {
            self.start();
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected => self.on_disconnected(),
            TransportEvent::Message(text) => self.on_message(&text),
            TransportEvent::Error(error) => {
                warn!("transport error on {}: {}", self.url, error);
                self.notify(RelayNotification::Error(error));
            }
            TransportEvent::TlsErrors(errors) => {
                warn!("TLS errors on {}: {:?}", self.url, errors);
                self.notify(RelayNotification::TlsErrors(errors));
            }
        }
    }

    /// Queue or send an event. Unless `prepared` is set the event is prepared
    /// with this connection's identity first. Returns the event id.
    pub fn send_event(&mut self, mut event: Event, prepared: bool) -> Result<String> {
        if !prepared {
            prepare(&mut event, &self.identity)?;
        }
        let id = event.id.clone().ok_or(Nip01Error::MissingField("id"))?;
        let command = serialize_event(&event)?;
        self.send_or_queue(command);
        Ok(id)
    }

    pub fn send_text_note(&mut self, content: impl Into<String>) -> Result<String> {
        self.send_event(Event::text_note(content), false)
    }

    /// Send a subscription. It stays active, and is replayed verbatim after
    /// every reconnect, until closed. Returns the subscription id.
    pub fn send_request(&mut self, mut request: Request) -> Result<String> {
        let subscription_id = request
            .subscription_id
            .get_or_insert_with(new_subscription_id)
            .clone();
        let command = serialize_request(&request)?;

        if self.state == ConnectionState::Connected {
            // Not queued on failure: the active request replay covers it.
            self.transmit(&command);
        }

        self.subscriptions.open(&subscription_id);
        self.active_requests.insert(subscription_id.clone(), command);
        Ok(subscription_id)
    }

    pub fn send_close(&mut self, close: &Close) -> Result<()> {
        let command = serialize_close(close)?;
        self.send_or_queue(command);
        self.active_requests.remove(&close.subscription_id);
        self.subscriptions.remove(&close.subscription_id);
        Ok(())
    }

    fn on_connected(&mut self) {
        if self.transport.state() != TransportState::Connected {
            debug!("stale connect notification from {}", self.url);
            return;
        }

        info!("connected to {}", self.url);
        self.state = ConnectionState::Connected;
        // A stale drop from the previous session may have armed the timer.
        self.reconnect_at = None;
        self.notify(RelayNotification::Connected);

        let requests: Vec<String> = self.active_requests.values().cloned().collect();
        for command in &requests {
            self.transmit(command);
        }

        while let Some(command) = self.outbound.pop_front() {
            if !self.transmit(&command) {
                self.outbound.push_front(command);
                break;
            }
        }
    }

    fn on_disconnected(&mut self) {
        if !self.started && self.state == ConnectionState::Idle {
            // `stop` already saw the transport down and reported it.
            debug!("late disconnect from {} after stop", self.url);
            return;
        }
        if !self.started {
            self.state = ConnectionState::Idle;
            info!("disconnected from {}", self.url);
            self.notify(RelayNotification::Disconnected);
            return;
        }

        info!(
            "{} disconnected, reconnecting in {:?}",
            self.url, self.config.reconnect_delay
        );
        self.state = ConnectionState::ReconnectPending;
        self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
    }

    fn on_message(&mut self, text: &str) {
        let message = match RelayMessage::parse(text) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("ignoring unsupported message from {}: {}", self.url, text);
                return;
            }
            Err(error) => {
                warn!("protocol parse error on {}: {}", self.url, error);
                return;
            }
        };

        match message {
            RelayMessage::Event(subscription_id, event) => {
                let stored = self.subscriptions.is_stored_event(&subscription_id);
                self.notify(RelayNotification::NewEvent {
                    subscription_id,
                    event,
                    stored,
                });
            }
            RelayMessage::Ok(event_id, true, _) => {
                self.notify(RelayNotification::Successfully { event_id });
            }
            RelayMessage::Ok(event_id, false, reason) => {
                debug!("{} rejected {}: {}", self.url, event_id, reason);
                self.notify(RelayNotification::Failed { event_id, reason });
            }
            RelayMessage::Eose(subscription_id) => {
                self.subscriptions.mark_eose(&subscription_id);
                self.notify(RelayNotification::SyncFinished { subscription_id });
            }
            RelayMessage::Notice(message) => {
                self.notify(RelayNotification::Notice(message));
            }
        }
    }

    fn send_or_queue(&mut self, command: String) {
        if self.state == ConnectionState::Connected && self.transmit(&command) {
            return;
        }
        self.outbound.push_back(command);
    }

    fn transmit(&mut self, command: &str) -> bool {
        debug!("sending to {}: {}", self.url, command);
        match self.transport.send_text(command) {
            Ok(()) => true,
            Err(error) => {
                warn!("send to {} failed: {}", self.url, error);
                false
            }
        }
    }

    fn notify(&self, notification: RelayNotification) {
        if self.notifications.send(notification).is_err() {
            debug!("notification receiver for {} dropped", self.url);
        }
    }
}
