//! Pure reconnection decisions for the event loop driver
//!
//! rumqttc reconnects whenever its event loop is polled after an error. The
//! driver asks [`SessionRules`] whether to keep polling, and how long to wait
//! first, every time a connection error surfaces.

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{debug, error, info, warn};

/// Facts about a session needed to decide on reconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// A CONNACK was received at least once on this session
    pub ever_connected: bool,
    pub automatic_reconnect: bool,
    pub shutdown_requested: bool,
}

/// Stateless rules applied by the driver after every connection event
pub struct SessionRules;

impl SessionRules {
    /// Keep polling after a connection error, and after how long
    pub fn after_connection_error(
        current_attempts: u32,
        config: &ReconnectConfig,
        status: SessionStatus,
    ) -> RetryDecision {
        if status.shutdown_requested {
            return RetryDecision::StopShuttingDown;
        }

        // the initial connect is reported to the caller instead of retried
        if !status.ever_connected {
            return RetryDecision::StopNeverConnected;
        }

        if !status.automatic_reconnect {
            return RetryDecision::StopReconnectDisabled;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return RetryDecision::StopAttemptsExhausted;
            }
        }

        RetryDecision::Retry {
            attempt: current_attempts + 1,
            delay_ms: config.calculate_backoff_delay(current_attempts + 1),
        }
    }

    /// State a client moves to on `event`
    pub fn next_state(event: SessionEvent) -> ConnectionState {
        match event {
            SessionEvent::ConnAck => ConnectionState::Connected,
            SessionEvent::BrokerDisconnect => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            SessionEvent::ClientDisconnect => {
                ConnectionState::Disconnected("Client disconnected".to_string())
            }
            SessionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            SessionEvent::Reconnecting(attempt) => ConnectionState::Reconnecting(attempt),
            SessionEvent::GaveUp(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Only a connected client accepts requests
    pub fn accepts_requests(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn log_transition(client_id: &str, from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(client_id = %client_id, "Broker accepted connection");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!(client_id = %client_id, "Reconnected to broker");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(client_id = %client_id, reason = %reason, "Lost connection to broker");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(client_id = %client_id, attempt, "Reconnecting");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(client_id = %client_id, reason = %reason, "Giving up on broker connection");
            }
            _ => {
                debug!(target: "mqtt_transport", client_id = %client_id, ?from, ?to, "Connection state changed");
            }
        }
    }
}

/// Outcome of [`SessionRules::after_connection_error`]
#[derive(Debug, PartialEq)]
pub enum RetryDecision {
    /// Sleep `delay_ms`, then poll again
    Retry { attempt: u32, delay_ms: u64 },
    /// The client is being disconnected or closed
    StopShuttingDown,
    /// The first connect failed; the caller of connect sees the error
    StopNeverConnected,
    /// Options turned automatic reconnect off
    StopReconnectDisabled,
    /// `max_attempts` used up
    StopAttemptsExhausted,
}

/// Inputs to [`SessionRules::next_state`]
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnAck,
    BrokerDisconnect,
    ClientDisconnect,
    NetworkError(String),
    Reconnecting(u32),
    GaveUp(String),
}
