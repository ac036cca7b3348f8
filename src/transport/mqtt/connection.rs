//! Pure connection configuration for the MQTT transport
//!
//! This module contains pure functions for reconnection policy, broker option
//! construction and topic mapping between bus topics and broker topics.

use crate::config::BusSection;
use crate::protocol::canonicalize_topic;
use crate::transport::TransportError;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use serde_json::json;
use std::time::Duration;
use url::Url;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds, one entry per attempt
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250, 1000, 2500],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Upper bound of time spent across all attempts, None when unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Backoff delay for a 1-based attempt number
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Maps bus topics to broker topics under an optional prefix
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicMapper {
    prefix: String,
}

impl TopicMapper {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: canonicalize_topic(prefix),
        }
    }

    /// Broker topic for a bus topic or filter
    pub fn to_broker(&self, topic: &str) -> String {
        let topic = canonicalize_topic(topic);
        if self.prefix.is_empty() {
            topic
        } else {
            format!("{}/{}", self.prefix, topic)
        }
    }

    /// Bus topic for a broker topic, None if outside the prefix
    pub fn from_broker(&self, broker_topic: &str) -> Option<String> {
        if self.prefix.is_empty() {
            return Some(broker_topic.to_string());
        }
        broker_topic
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
    }

    /// Topic carrying the agent's availability, also used as Last Will
    pub fn status_topic(&self, agent_name: &str) -> String {
        self.to_broker(&format!("status/{agent_name}"))
    }
}

/// Availability payload published on the status topic
pub fn status_payload(agent_name: &str, available: bool) -> Vec<u8> {
    let status = if available { "available" } else { "unavailable" };
    json!({
        "agent": agent_name,
        "status": status,
        "timestamp": chrono::Utc::now(),
    })
    .to_string()
    .into_bytes()
}

/// Pure function to configure MQTT options from the bus section
pub fn configure_mqtt_options(
    agent_name: &str,
    config: &BusSection,
) -> Result<MqttOptions, TransportError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| TransportError::InvalidBrokerUrl(config.broker_url.clone()))?;

    if url.scheme() != "mqtt" && url.scheme() != "mqtts" {
        return Err(TransportError::InvalidBrokerUrl(config.broker_url.clone()));
    }

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    // Unique client id per attempt so the broker never confuses sessions
    let timestamp = chrono::Utc::now().timestamp_millis();
    let client_id = format!("agentbus-{agent_name}-{timestamp}");
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    let mapper = TopicMapper::new(&config.topic_prefix);
    let lwt = LastWill::new(
        mapper.status_topic(agent_name),
        status_payload(agent_name, false),
        QoS::AtLeastOnce,
        true,
        None,
    );
    mqtt_options.set_last_will(lwt);

    Ok(mqtt_options)
}
