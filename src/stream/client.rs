use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::stream::machine::{BackoffPolicy, ConnectionAction, ConnectionEvent, ConnectionMachine, ConnectionState};
use crate::stream::message::FeedMessage;
use crate::stream::transport::{FeedConnection, FeedTransport};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What subscribers of a stream see.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected,
    /// Transient loss; a reconnect is scheduled.
    Disconnected(String),
    Message(FeedMessage),
    /// Terminal. No further events follow.
    Closed(StreamError),
}

pub type StreamCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

type Subscribers = Arc<RwLock<HashMap<Uuid, StreamCallback>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            keepalive: config.keepalive(),
            connect_timeout: config.connect_timeout(),
            backoff: BackoffPolicy::from(config),
        }
    }
}

#[derive(Debug)]
enum ClientCommand {
    Disconnect,
}

/// Handle returned by `StreamClient::subscribe`.
pub struct Subscription {
    id: Uuid,
    subscribers: Weak<RwLock<HashMap<Uuid, StreamCallback>>>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Detach the callback. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.subscribers.upgrade() {
            Some(subscribers) => subscribers.write().remove(&self.id).is_some(),
            None => false,
        }
    }
}

/// One live subscription to the push feed for a single instrument.
///
/// The connection runs on its own tokio task driven by a `ConnectionMachine`.
/// Subscribers attach and detach independently of the connection lifecycle.
pub struct StreamClient {
    instrument: String,
    transport: Arc<dyn FeedTransport>,
    settings: StreamSettings,
    subscribers: Subscribers,
    state: Arc<RwLock<ConnectionState>>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<ClientCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    pub fn new(instrument: impl Into<String>, transport: Arc<dyn FeedTransport>, settings: StreamSettings) -> Self {
        Self {
            instrument: instrument.into(),
            transport,
            settings,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
            cmd_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Start the connection task. Only the first call on an idle client does anything.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> bool {
        let mut task = self.task.lock();
        if task.is_some() || self.state() != ConnectionState::Idle {
            debug!(instrument = %self.instrument, state = %self.state(), "Connect ignored");
            return false;
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.cmd_tx.lock() = Some(cmd_tx);
        *self.state.write() = ConnectionState::Connecting;

        info!(instrument = %self.instrument, "Starting push feed");
        *task = Some(tokio::spawn(run_connection(
            self.instrument.clone(),
            self.transport.clone(),
            self.settings,
            self.subscribers.clone(),
            self.state.clone(),
            cmd_rx,
        )));
        true
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.subscribers.write().insert(id, Arc::new(callback));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Hard stop from any state. Clears every callback; no further events are delivered.
    pub fn disconnect(&self) {
        self.subscribers.write().clear();
        if let Some(tx) = self.cmd_tx.lock().take() {
            let _ = tx.send(ClientCommand::Disconnect);
        }
        *self.state.write() = ConnectionState::Closed;
        info!(instrument = %self.instrument, "Push feed disconnected");
    }

    /// Wait for the connection task to finish.
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(instrument = %self.instrument, error = %e, "Push feed task failed");
                }
            }
        }
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        // Dropping the sender ends the task at its next await point.
        self.cmd_tx.get_mut().take();
    }
}

fn broadcast(subscribers: &Subscribers, event: &StreamEvent) {
    let callbacks: Vec<StreamCallback> = subscribers.read().values().cloned().collect();
    for callback in callbacks {
        callback(event);
    }
}

async fn run_connection(
    instrument: String,
    transport: Arc<dyn FeedTransport>,
    settings: StreamSettings,
    subscribers: Subscribers,
    state: Arc<RwLock<ConnectionState>>,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
) {
    let mut machine = ConnectionMachine::new(settings.backoff);
    let mut conn: Option<Box<dyn FeedConnection>> = None;
    let mut retry_delay = settings.backoff.base;
    let mut pending = machine.handle(ConnectionEvent::Connect);

    loop {
        for action in pending.drain(..) {
            match action {
                ConnectionAction::NotifyConnected => broadcast(&subscribers, &StreamEvent::Connected),
                ConnectionAction::NotifyDisconnected(reason) => {
                    broadcast(&subscribers, &StreamEvent::Disconnected(reason))
                }
                ConnectionAction::NotifyClosed(err) => {
                    error!(instrument = %instrument, error = %err, "Push feed closed");
                    broadcast(&subscribers, &StreamEvent::Closed(err));
                }
                ConnectionAction::ScheduleReconnect(delay) => retry_delay = delay,
                ConnectionAction::Shutdown => {
                    if let Some(mut c) = conn.take() {
                        c.close().await;
                    }
                }
                ConnectionAction::OpenSocket => {}
            }
        }
        {
            let mut shared = state.write();
            // disconnect() may already have marked the client closed
            if *shared != ConnectionState::Closed {
                *shared = machine.state();
            }
        }

        let event = match machine.state() {
            ConnectionState::Idle => ConnectionEvent::Connect,
            ConnectionState::Connecting => {
                tokio::select! {
                    biased;
                    _ = cmd_rx.recv() => ConnectionEvent::Disconnect,
                    result = tokio::time::timeout(settings.connect_timeout, transport.connect(&instrument)) => {
                        match result {
                            Ok(Ok(c)) => {
                                conn = Some(c);
                                ConnectionEvent::Opened
                            }
                            Ok(Err(e)) => {
                                warn!(instrument = %instrument, error = %e, "Push feed connect failed");
                                ConnectionEvent::Dropped(e.to_string())
                            }
                            Err(_) => {
                                let err = StreamError::ConnectTimeout(settings.connect_timeout.as_millis() as u64);
                                warn!(instrument = %instrument, error = %err, "Push feed connect failed");
                                ConnectionEvent::Dropped(err.to_string())
                            }
                        }
                    }
                }
            }
            ConnectionState::Connected => match conn.as_mut() {
                Some(c) => {
                    let event = run_session(c.as_mut(), settings.keepalive, &mut cmd_rx, &subscribers).await;
                    if matches!(event, ConnectionEvent::Dropped(_)) {
                        conn = None;
                    }
                    event
                }
                None => ConnectionEvent::Dropped("connection missing".to_string()),
            },
            ConnectionState::Reconnecting => {
                tokio::select! {
                    biased;
                    _ = cmd_rx.recv() => ConnectionEvent::Disconnect,
                    _ = tokio::time::sleep(retry_delay) => ConnectionEvent::RetryDue,
                }
            }
            ConnectionState::Closed => break,
        };

        pending = machine.handle(event);
    }

    *state.write() = ConnectionState::Closed;
    debug!(instrument = %instrument, "Push feed task finished");
}

/// Pump one open connection until it drops or a disconnect is requested.
async fn run_session(
    conn: &mut dyn FeedConnection,
    keepalive: Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    subscribers: &Subscribers,
) -> ConnectionEvent {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
    let mut received: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cmd_rx.recv() => return ConnectionEvent::Disconnect,
            _ = ticker.tick() => {
                if let Err(e) = conn.send_text(FeedMessage::ping_frame()).await {
                    warn!(error = %e, "Keepalive ping failed");
                    return ConnectionEvent::Dropped(e.to_string());
                }
            }
            frame = conn.next_text() => match frame {
                Some(Ok(text)) => {
                    received += 1;
                    if let Some(message) = FeedMessage::parse(&text) {
                        broadcast(subscribers, &StreamEvent::Message(message));
                    }
                    if received % 1000 == 0 {
                        debug!(count = received, "Push feed messages received");
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Push feed error");
                    return ConnectionEvent::Dropped(e.to_string());
                }
                None => {
                    info!("Push feed stream ended");
                    return ConnectionEvent::Dropped("connection closed by peer".to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Refuses every connection.
    struct RefusingTransport {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl FeedTransport for RefusingTransport {
        async fn connect(&self, _instrument: &str) -> Result<Box<dyn FeedConnection>, StreamError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StreamError::Transport("connection refused".into()))
        }
    }

    /// Accepts a connection that never sends frames and records what it is sent.
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingConnection {
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl FeedTransport for RecordingTransport {
        async fn connect(&self, _instrument: &str) -> Result<Box<dyn FeedConnection>, StreamError> {
            Ok(Box::new(RecordingConnection {
                sent: self.sent.clone(),
            }))
        }
    }

    #[async_trait]
    impl FeedConnection for RecordingConnection {
        async fn send_text(&mut self, text: String) -> Result<(), StreamError> {
            self.sent.lock().push(text);
            Ok(())
        }

        async fn next_text(&mut self) -> Option<Result<String, StreamError>> {
            std::future::pending().await
        }
    }

    fn fast_settings() -> StreamSettings {
        StreamSettings {
            keepalive: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(200),
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(4),
                max_attempts: 5,
            },
        }
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_surface_terminal_error() {
        let transport = Arc::new(RefusingTransport {
            attempts: AtomicUsize::new(0),
        });
        let client = StreamClient::new("600519", transport.clone(), fast_settings());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        client.subscribe(move |event| sink.lock().push(event.clone()));

        assert!(client.connect());
        assert!(!client.connect());
        client.join().await;

        let events = events.lock();
        // initial attempt plus five retries
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 6);
        assert_eq!(events.iter().filter(|e| matches!(e, StreamEvent::Disconnected(_))).count(), 5);
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Closed(StreamError::ReconnectExhausted { attempts: 5 }))
        );
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_disconnect_clear_callbacks() {
        let transport = Arc::new(RefusingTransport {
            attempts: AtomicUsize::new(0),
        });
        let client = StreamClient::new("AAPL", transport, fast_settings());
        let first = client.subscribe(|_| {});
        let _second = client.subscribe(|_| {});
        assert_eq!(client.subscriber_count(), 2);

        let id = first.id();
        assert!(first.unsubscribe());
        assert_eq!(client.subscriber_count(), 1);
        assert!(!client.subscribers.read().contains_key(&id));

        client.connect();
        client.disconnect();
        assert_eq!(client.subscriber_count(), 0);
        assert!(client.is_closed());
        client.join().await;
        assert!(client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_every_interval_until_disconnect() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = Arc::new(RecordingTransport { sent: sent.clone() });
        let client = StreamClient::new("AAPL", transport, fast_settings());
        client.connect();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(sent.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*sent.lock(), vec![FeedMessage::ping_frame(), FeedMessage::ping_frame()]);

        client.disconnect();
        client.join().await;
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(sent.lock().len(), 2);
        assert!(client.is_closed());
    }
}
