//! Async handle around a [`RelayConnection`].
//!
//! Each relay runs in its own tokio task which exclusively owns the
//! connection state. The handle talks to it over a command channel and the
//! task reports back through the notification channel returned by
//! [`Relay::spawn`].

use crate::error::{ClientError, Result};
use crate::relay::{ConnectionState, RelayConfig, RelayConnection, RelayNotification};
use crate::subscription::new_subscription_id;
use crate::transport::{Connector, Transport, TransportEvent};
use nostr::{Close, Event, Identity, Nip01Error, Request, prepare};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, warn};
use url::Url;

/// How long a dropped handle waits for the transport to confirm shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum Command {
    Start,
    Stop,
    SendEvent(Event),
    SendRequest(Request),
    SendClose(Close),
}

/// Validate a relay address: it must be a `ws://` or `wss://` URL.
pub fn parse_relay_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url)?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            parsed.scheme()
        )));
    }
    Ok(parsed)
}

/// Handle to one relay connection task.
///
/// Dropping the handle stops the connection.
pub struct Relay {
    url: Url,
    identity: Arc<Identity>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl Relay {
    /// Spawn the connection task. It stays idle until [`Relay::start`].
    pub fn spawn<C: Connector>(
        url: &str,
        identity: Arc<Identity>,
        config: RelayConfig,
        connector: &C,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayNotification>)> {
        let url = parse_relay_url(url)?;
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let transport = connector.transport(&url, &config, events_tx);
        let connection = RelayConnection::new(
            url.clone(),
            Arc::clone(&identity),
            config,
            transport,
            notifications_tx,
        );
        let task = tokio::spawn(run(connection, commands_rx, events_rx));

        Ok((
            Self {
                url,
                identity,
                commands: commands_tx,
                task,
            },
            notifications_rx,
        ))
    }

    /// Relay URL as string.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn start(&self) -> Result<()> {
        self.command(Command::Start)
    }

    pub fn stop(&self) -> Result<()> {
        self.command(Command::Stop)
    }

    /// Send an event, preparing it first unless `prepared` is set. Returns
    /// the event id immediately; the event is queued if the relay is not
    /// connected.
    pub fn send_event(&self, mut event: Event, prepared: bool) -> Result<String> {
        if !prepared {
            prepare(&mut event, &self.identity)?;
        }
        let id = event.id.clone().ok_or(Nip01Error::MissingField("id"))?;
        self.command(Command::SendEvent(event))?;
        Ok(id)
    }

    pub fn send_text_note(&self, content: impl Into<String>) -> Result<String> {
        self.send_event(Event::text_note(content), false)
    }

    /// Send a subscription request and return its id.
    pub fn send_request(&self, mut request: Request) -> Result<String> {
        let subscription_id = request
            .subscription_id
            .get_or_insert_with(new_subscription_id)
            .clone();
        self.command(Command::SendRequest(request))?;
        Ok(subscription_id)
    }

    /// Close a subscription, given the `Close`, the `Request` or its id.
    pub fn send_close(&self, close: impl Into<Close>) -> Result<()> {
        self.command(Command::SendClose(close.into()))
    }

    /// Stop the connection and wait for its task to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Stop);
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(error) = task.await {
            debug!("relay task ended abnormally: {}", error);
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::RelayClosed(self.url.to_string()))
    }
}

async fn run<T: Transport>(
    mut connection: RelayConnection<T>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    loop {
        let deadline = connection.reconnect_deadline();
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => apply(&mut connection, command),
                None => break,
            },
            Some(event) = events.recv() => connection.handle_transport_event(event),
            () = reconnect_timer(deadline) => connection.on_reconnect_timer(),
        }
    }

    // Handle dropped: stop, then give the transport a moment to confirm.
    if connection.is_started() {
        connection.stop();
    }
    while connection.state() != ConnectionState::Idle {
        match timeout(CLOSE_GRACE, events.recv()).await {
            Ok(Some(event)) => connection.handle_transport_event(event),
            _ => break,
        }
    }
    debug!("relay task for {} finished", connection.url());
}

fn apply<T: Transport>(connection: &mut RelayConnection<T>, command: Command) {
    let result = match command {
        Command::Start => {
            connection.start();
            Ok(())
        }
        Command::Stop => {
            connection.stop();
            Ok(())
        }
        Command::SendEvent(event) => connection.send_event(event, true).map(|_| ()),
        Command::SendRequest(request) => connection.send_request(request).map(|_| ()),
        Command::SendClose(close) => connection.send_close(&close),
    };
    if let Err(error) = result {
        warn!("command failed on {}: {}", connection.url(), error);
    }
}

async fn reconnect_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
