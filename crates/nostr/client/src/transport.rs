//! Duplex text-message transport used by relay connections.
//!
//! A transport never calls back into the relay: everything it observes is
//! pushed as a [`TransportEvent`] onto the channel it was built with, and the
//! owning relay task reacts to those events in order.

use crate::error::{ClientError, Result};
use crate::relay::RelayConfig;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

/// Transport-level socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message(String),
    Error(String),
    TlsErrors(Vec<String>),
}

/// Sending half of a relay's transport event channel.
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Abstract text-message channel to one relay.
pub trait Transport: Send + 'static {
    /// Begin connecting. Completion is reported as [`TransportEvent::Connected`].
    fn open(&mut self, url: &Url);

    /// Close the channel. Reported as [`TransportEvent::Disconnected`] unless
    /// it was already down.
    fn close(&mut self);

    fn send_text(&mut self, text: &str) -> Result<()>;

    fn state(&self) -> TransportState;
}

/// Builds one transport per relay.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn transport(&self, url: &Url, config: &RelayConfig, events: TransportEvents)
    -> Self::Transport;
}

#[derive(Debug, Clone, Default)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn get(&self) -> TransportState {
        decode_state(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: TransportState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn swap(&self, state: TransportState) -> TransportState {
        decode_state(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

fn decode_state(raw: u8) -> TransportState {
    match raw {
        1 => TransportState::Connecting,
        2 => TransportState::Connected,
        _ => TransportState::Disconnected,
    }
}

/// [`Connector`] producing [`WebSocketTransport`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    fn transport(
        &self,
        _url: &Url,
        config: &RelayConfig,
        events: TransportEvents,
    ) -> Self::Transport {
        WebSocketTransport::new(config.connect_timeout, events)
    }
}

/// WebSocket transport. Each `open` spawns one tokio task owning the socket.
pub struct WebSocketTransport {
    connect_timeout: Duration,
    events: TransportEvents,
    state: SharedState,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration, events: TransportEvents) -> Self {
        Self {
            connect_timeout,
            events,
            state: SharedState::default(),
            outgoing: None,
            task: None,
        }
    }

    fn abort_task(&mut self) {
        self.outgoing = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self, url: &Url) {
        self.abort_task();
        // Silence a late `finish` from the old socket task, then start a
        // fresh state for this session.
        self.state.set(TransportState::Disconnected);
        self.state = SharedState::default();
        self.state.set(TransportState::Connecting);

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        self.outgoing = Some(outgoing_tx);
        self.task = Some(tokio::spawn(run_socket(
            url.clone(),
            self.connect_timeout,
            self.events.clone(),
            self.state.clone(),
            outgoing_rx,
        )));
    }

    fn close(&mut self) {
        if self.state.get() == TransportState::Connected
            && let Some(outgoing) = &self.outgoing
            && outgoing.send(Message::Close(None)).is_ok()
        {
            // The socket task sends the close frame and reports the disconnect.
            return;
        }

        self.abort_task();
        finish(&self.state, &self.events);
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        if self.state.get() != TransportState::Connected {
            return Err(ClientError::NotConnected);
        }
        let outgoing = self.outgoing.as_ref().ok_or(ClientError::NotConnected)?;
        outgoing
            .send(Message::Text(text.to_string().into()))
            .map_err(|_| ClientError::NotConnected)
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.abort_task();
    }
}

async fn run_socket(
    url: Url,
    connect_timeout: Duration,
    events: TransportEvents,
    state: SharedState,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) {
    let stream = match timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(error)) => {
            report_error(&events, error);
            finish(&state, &events);
            return;
        }
        Err(_) => {
            let _ = events.send(TransportEvent::Error(format!(
                "connection timeout after {connect_timeout:?}"
            )));
            finish(&state, &events);
            return;
        }
    };

    state.set(TransportState::Connected);
    if events.send(TransportEvent::Connected).is_err() {
        return;
    }

    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            outbound = outgoing.recv() => match outbound {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(error) = writer.send(message).await {
                        report_error(&events, error);
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                None => break,
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if events.send(TransportEvent::Message(text.to_string())).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    debug!("received ping from {} ({} bytes)", url, payload.len());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    report_error(&events, error);
                    break;
                }
            },
        }
    }

    finish(&state, &events);
}

fn report_error(events: &TransportEvents, error: tungstenite::Error) {
    warn!("websocket error: {}", error);
    let event = match error {
        tungstenite::Error::Tls(tls) => TransportEvent::TlsErrors(vec![tls.to_string()]),
        other => TransportEvent::Error(other.to_string()),
    };
    let _ = events.send(event);
}

fn finish(state: &SharedState, events: &TransportEvents) {
    if state.swap(TransportState::Disconnected) != TransportState::Disconnected {
        let _ = events.send(TransportEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_state_round_trips_every_variant() {
        let state = SharedState::default();
        assert_eq!(state.get(), TransportState::Disconnected);
        for variant in [
            TransportState::Connecting,
            TransportState::Connected,
            TransportState::Disconnected,
        ] {
            state.set(variant);
            assert_eq!(state.get(), variant);
        }
    }

    #[test]
    fn finish_reports_disconnect_once() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let state = SharedState::default();
        state.set(TransportState::Connected);

        finish(&state, &events);
        finish(&state, &events);

        assert_eq!(rx.try_recv().ok(), Some(TransportEvent::Disconnected));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_before_connect_reports_disconnect() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut transport = WebSocketTransport::new(Duration::from_secs(10), events);
        let url = Url::parse("ws://127.0.0.1:9").unwrap();

        transport.open(&url);
        assert_eq!(transport.state(), TransportState::Connecting);
        transport.close();

        assert_eq!(transport.state(), TransportState::Disconnected);
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected));
        assert!(matches!(
            transport.send_text("[]"),
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn reopen_silences_previous_session() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut transport = WebSocketTransport::new(Duration::from_secs(10), events.clone());
        let url = Url::parse("ws://127.0.0.1:9").unwrap();

        transport.open(&url);
        let previous = transport.state.clone();
        transport.open(&url);

        // The old task finishing late reports nothing and leaves the new
        // session untouched.
        finish(&previous, &events);
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.state(), TransportState::Connecting);
    }
}
