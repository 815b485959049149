//! Channel-backed transport for driving relays in tests.

use crate::error::{ClientError, Result};
use crate::relay::RelayConfig;
use crate::transport::{Connector, Transport, TransportEvent, TransportEvents, TransportState};
use nostr::Identity;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

pub(crate) const TEST_SECRET: &str = "MHQCAQEEINIXwf8vimXD46F0DbO59YuMhIu0XibQDtRxTkoPTO7PoAcGBSuBBAAKoUQDQgAEavD53liPLFPO3LomxeJALg0Kpk7HtHyfjZe1vFYrq1/ovKur1azVBdpsICPjJGHDW0LvplzCaEr18lSVo2khVQ==";

pub(crate) fn test_identity() -> Identity {
    Identity::from_secret(TEST_SECRET).unwrap()
}

/// Test-side handle on a [`MockTransport`].
#[derive(Clone)]
pub(crate) struct MockControl {
    state: Arc<Mutex<TransportState>>,
    events: TransportEvents,
    opens: Arc<AtomicUsize>,
}

impl MockControl {
    fn set_state(&self, state: TransportState) -> TransportState {
        std::mem::replace(&mut *self.state.lock().unwrap(), state)
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    /// Complete the pending connection attempt.
    pub(crate) fn connect(&self) {
        self.set_state(TransportState::Connected);
        let _ = self.events.send(TransportEvent::Connected);
    }

    /// Simulate the relay going away.
    pub(crate) fn drop_connection(&self) {
        self.set_state(TransportState::Disconnected);
        let _ = self.events.send(TransportEvent::Disconnected);
    }

    /// Deliver a text frame as if the relay sent it.
    pub(crate) fn deliver(&self, text: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Message(text.into()));
    }

    /// Number of `open` calls so far.
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockTransport {
    url: String,
    control: MockControl,
    auto_connect: bool,
    sent: mpsc::UnboundedSender<(String, String)>,
}

impl MockTransport {
    /// Standalone transport with its own event and sent-frame channels.
    pub(crate) fn new(
        auto_connect: bool,
    ) -> (
        Self,
        MockControl,
        mpsc::UnboundedReceiver<TransportEvent>,
        mpsc::UnboundedReceiver<(String, String)>,
    ) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (sent, sent_rx) = mpsc::unbounded_channel();
        let transport = Self::with_channels("wss://relay.test", auto_connect, events, sent);
        let control = transport.control.clone();
        (transport, control, events_rx, sent_rx)
    }

    fn with_channels(
        url: &str,
        auto_connect: bool,
        events: TransportEvents,
        sent: mpsc::UnboundedSender<(String, String)>,
    ) -> Self {
        Self {
            url: url.to_string(),
            control: MockControl {
                state: Arc::new(Mutex::new(TransportState::Disconnected)),
                events,
                opens: Arc::new(AtomicUsize::new(0)),
            },
            auto_connect,
            sent,
        }
    }
}

impl Transport for MockTransport {
    fn open(&mut self, _url: &Url) {
        self.control.opens.fetch_add(1, Ordering::SeqCst);
        if self.auto_connect {
            self.control.connect();
        } else {
            self.control.set_state(TransportState::Connecting);
        }
    }

    fn close(&mut self) {
        if self.control.set_state(TransportState::Disconnected) != TransportState::Disconnected {
            let _ = self.control.events.send(TransportEvent::Disconnected);
        }
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        if self.control.state() != TransportState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.sent
            .send((self.url.clone(), text.to_string()))
            .map_err(|_| ClientError::NotConnected)
    }

    fn state(&self) -> TransportState {
        self.control.state()
    }
}

/// Connector handing out [`MockTransport`]s and remembering their controls by
/// relay URL.
#[derive(Clone)]
pub(crate) struct MockConnector {
    auto_connect: bool,
    sent: mpsc::UnboundedSender<(String, String)>,
    controls: Arc<Mutex<HashMap<String, MockControl>>>,
}

impl MockConnector {
    pub(crate) fn new(auto_connect: bool) -> (Self, mpsc::UnboundedReceiver<(String, String)>) {
        let (sent, sent_rx) = mpsc::unbounded_channel();
        let connector = Self {
            auto_connect,
            sent,
            controls: Arc::new(Mutex::new(HashMap::new())),
        };
        (connector, sent_rx)
    }

    pub(crate) fn control(&self, url: &str) -> MockControl {
        self.controls.lock().unwrap()[url].clone()
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    fn transport(
        &self,
        url: &Url,
        _config: &RelayConfig,
        events: TransportEvents,
    ) -> Self::Transport {
        // Key by the caller's spelling: `Url` adds a trailing slash.
        let key = url.as_str().trim_end_matches('/').to_string();
        let transport =
            MockTransport::with_channels(&key, self.auto_connect, events, self.sent.clone());
        self.controls
            .lock()
            .unwrap()
            .insert(key, transport.control.clone());
        transport
    }
}
