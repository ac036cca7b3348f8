//! Reconnection policy of the MQTT supervisor
//!
//! No I/O here: the supervisor task in [`super::client`] reports what the
//! broker did and applies the returned decision.

use super::connection::ReconnectConfig;
use crate::transport::ConnectionState;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Broker-side happenings that move the connection state
#[derive(Debug, Clone)]
pub enum BrokerSignal {
    ConnAck,
    BrokerDisconnect,
    NetworkError(String),
    Retrying(u32),
    GaveUp(String),
}

impl BrokerSignal {
    pub fn into_state(self) -> ConnectionState {
        match self {
            BrokerSignal::ConnAck => ConnectionState::Connected,
            BrokerSignal::BrokerDisconnect => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            BrokerSignal::NetworkError(error) => ConnectionState::Disconnected(error),
            BrokerSignal::Retrying(attempt) => ConnectionState::Reconnecting(attempt),
            BrokerSignal::GaveUp(reason) => ConnectionState::PermanentlyDisconnected(reason),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectStep {
    Retry { attempt: u32, delay: Duration },
    Stop,
    GiveUp,
}

/// Next step after `attempts` failed reconnections
pub fn next_step(attempts: u32, config: &ReconnectConfig, stopping: bool) -> ReconnectStep {
    if stopping {
        return ReconnectStep::Stop;
    }
    if config.max_attempts.is_some_and(|max| attempts >= max) {
        return ReconnectStep::GiveUp;
    }
    let attempt = attempts + 1;
    ReconnectStep::Retry {
        attempt,
        delay: Duration::from_millis(config.calculate_backoff_delay(attempt)),
    }
}

/// How long `connect()` waits for the first ConnAck
pub fn connect_deadline(config: &ReconnectConfig) -> Duration {
    config
        .calculate_max_total_time()
        .map_or(Duration::from_secs(60), |total| {
            Duration::from_millis(total + 30_000)
        })
}

pub fn check_policy(config: &ReconnectConfig) -> Result<(), String> {
    if config.max_attempts == Some(0) {
        return Err("max_attempts must be positive, or absent for unlimited retries".to_string());
    }
    if config.sustained_delay == 0 {
        return Err("sustained_delay must be positive".to_string());
    }
    Ok(())
}

pub fn log_transition(agent: &str, from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
            info!(agent, attempt, "Broker session restored");
        }
        (_, ConnectionState::Connected) => info!(agent, "Broker session established"),
        (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
            warn!(agent, reason = %reason, "Broker session lost");
        }
        (_, ConnectionState::PermanentlyDisconnected(reason)) => {
            error!(agent, reason = %reason, "Giving up on broker");
        }
        _ => debug!(agent, ?from, ?to, "Broker connection state changed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounded(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: Some(max_attempts),
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }

    #[test]
    fn test_next_step_follows_backoff() {
        let config = bounded(5);
        assert_eq!(
            next_step(0, &config, false),
            ReconnectStep::Retry {
                attempt: 1,
                delay: Duration::from_millis(25)
            }
        );
        assert_eq!(
            next_step(4, &config, false),
            ReconnectStep::Retry {
                attempt: 5,
                delay: Duration::from_millis(250)
            }
        );
        assert_eq!(next_step(5, &config, false), ReconnectStep::GiveUp);
        assert_eq!(next_step(0, &config, true), ReconnectStep::Stop);
    }

    #[test]
    fn test_unbounded_policy_keeps_retrying() {
        assert!(matches!(
            next_step(10_000, &ReconnectConfig::default(), false),
            ReconnectStep::Retry { attempt: 10_001, .. }
        ));
    }

    #[test]
    fn test_connect_deadline() {
        assert_eq!(
            connect_deadline(&ReconnectConfig::default()),
            Duration::from_secs(60)
        );
        assert_eq!(
            connect_deadline(&bounded(4)),
            Duration::from_millis(25 + 50 + 100 + 250 + 30_000)
        );
    }

    #[test]
    fn test_signal_states() {
        assert_eq!(BrokerSignal::ConnAck.into_state(), ConnectionState::Connected);
        assert_eq!(
            BrokerSignal::NetworkError("timeout".into()).into_state(),
            ConnectionState::Disconnected("timeout".to_string())
        );
        assert_eq!(
            BrokerSignal::Retrying(3).into_state(),
            ConnectionState::Reconnecting(3)
        );
        assert_eq!(
            BrokerSignal::GaveUp("max".into()).into_state(),
            ConnectionState::PermanentlyDisconnected("max".to_string())
        );
    }

    #[test]
    fn test_check_policy() {
        assert!(check_policy(&ReconnectConfig::default()).is_ok());
        assert!(check_policy(&bounded(0)).is_err());
        let zero_delay = ReconnectConfig {
            sustained_delay: 0,
            ..ReconnectConfig::default()
        };
        assert!(check_policy(&zero_delay).is_err());
    }
}
