use crate::config::StreamConfig;
use crate::error::StreamError;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Inputs driving the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connect,
    Opened,
    /// The socket closed, errored, or failed to open.
    Dropped(String),
    /// The reconnect delay elapsed.
    RetryDue,
    Disconnect,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    OpenSocket,
    ScheduleReconnect(Duration),
    NotifyConnected,
    NotifyDisconnected(String),
    NotifyClosed(StreamError),
    Shutdown,
}

/// Exponential backoff: `min(base * 2^attempt, cap)`, at most `max_attempts` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(16000),
            max_attempts: 5,
        }
    }
}

impl From<&StreamConfig> for BackoffPolicy {
    fn from(config: &StreamConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            cap: Duration::from_millis(config.cap_delay_ms),
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^31 already saturates any sane cap
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Reconnect state machine. Pure: no I/O, no timers; the driver feeds it events
/// and carries out the returned actions.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    next_delay: Option<Duration>,
    policy: BackoffPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempts: 0,
            next_delay: None,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_delay(&self) -> Option<Duration> {
        self.next_delay
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<ConnectionAction> {
        use ConnectionAction as A;
        use ConnectionState as S;

        match (self.state, event) {
            (S::Closed, _) => Vec::new(),
            (_, ConnectionEvent::Disconnect) => {
                self.state = S::Closed;
                self.next_delay = None;
                self.attempts = 0;
                vec![A::Shutdown]
            }
            (S::Idle, ConnectionEvent::Connect) => {
                self.state = S::Connecting;
                vec![A::OpenSocket]
            }
            (S::Connecting, ConnectionEvent::Opened) => {
                self.state = S::Connected;
                self.attempts = 0;
                self.next_delay = None;
                vec![A::NotifyConnected]
            }
            (S::Connecting, ConnectionEvent::Dropped(reason)) | (S::Connected, ConnectionEvent::Dropped(reason)) => {
                if self.attempts >= self.policy.max_attempts {
                    warn!(attempts = self.attempts, "Reconnect attempts exhausted");
                    self.state = S::Closed;
                    self.next_delay = None;
                    vec![A::NotifyClosed(StreamError::ReconnectExhausted {
                        attempts: self.attempts,
                    })]
                } else {
                    let delay = self.policy.delay(self.attempts);
                    self.attempts += 1;
                    self.state = S::Reconnecting;
                    self.next_delay = Some(delay);
                    info!(
                        attempt = self.attempts,
                        max = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling reconnect"
                    );
                    vec![A::NotifyDisconnected(reason), A::ScheduleReconnect(delay)]
                }
            }
            (S::Reconnecting, ConnectionEvent::RetryDue) => {
                self.state = S::Connecting;
                self.next_delay = None;
                vec![A::OpenSocket]
            }
            (state, event) => {
                debug!(%state, ?event, "Ignoring event");
                Vec::new()
            }
        }
    }
}
