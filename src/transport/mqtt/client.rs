//! Impure I/O for the MQTT transport
//!
//! This module owns the rumqttc client and event loop, the reconnection
//! supervisor task and the table of inbound subscription channels.

use super::connection::{configure_mqtt_options, status_payload, ReconnectConfig, TopicMapper};
use super::supervision::{self, BrokerSignal, ReconnectStep};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::BusSection;
use crate::observability::metrics::metrics;
use crate::protocol::{canonicalize_topic, validate_publish_topic, validate_topic_filter};
use crate::transport::{
    ConnectionState, DeliveryHandle, Inbound, InboundMessage, Transport, TransportError,
    INBOUND_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type SharedClient = Arc<Mutex<Option<AsyncClient>>>;
type SubscriptionMap = Arc<Mutex<HashMap<String, mpsc::Sender<InboundMessage>>>>;

/// Broker transport over MQTT v5
pub struct MqttTransport {
    agent_name: String,
    config: BusSection,
    mapper: TopicMapper,
    reconnect_config: ReconnectConfig,
    client: SharedClient,
    subscriptions: SubscriptionMap,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    pub fn new(agent_name: &str, config: BusSection) -> Result<Self, TransportError> {
        Self::with_reconnect_config(agent_name, config, ReconnectConfig::default())
    }

    pub fn with_reconnect_config(
        agent_name: &str,
        config: BusSection,
        reconnect_config: ReconnectConfig,
    ) -> Result<Self, TransportError> {
        // Fail fast on a bad URL instead of at connect time
        configure_mqtt_options(agent_name, &config)?;
        supervision::check_policy(&reconnect_config)
            .map_err(TransportError::ConnectionFailed)?;

        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Disconnected("Not connected".to_string()));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            agent_name: agent_name.to_string(),
            mapper: TopicMapper::new(&config.topic_prefix),
            config,
            reconnect_config,
            client: Arc::new(Mutex::new(None)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx,
            supervisor: Mutex::new(None),
        })
    }

    fn create_connection(
        agent_name: &str,
        config: &BusSection,
    ) -> Result<(AsyncClient, EventLoop), TransportError> {
        let mqtt_options = configure_mqtt_options(agent_name, config)?;
        Ok(AsyncClient::new(mqtt_options, 64))
    }

    /// Wait until the state reaches Connected, failing on disconnection
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(TransportError::ConnectionFailed(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(TransportError::ConnectionFailed(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    /// Start the session and wait for the broker's ConnAck
    ///
    /// When the first attempt fails the supervisor keeps retrying in the
    /// background; the error returned here only reports that the session is
    /// not up yet.
    async fn connect(&self) -> Result<(), TransportError> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            drop(supervisor);
            let timeout = supervision::connect_deadline(&self.reconnect_config);
            return Self::wait_for_connection_confirmation(self.state_rx.clone(), timeout).await;
        }

        self.shutdown_tx.send_replace(false);
        let (client, event_loop) = Self::create_connection(&self.agent_name, &self.config)?;
        *self.client.lock().await = Some(client);
        self.state_tx.send_replace(ConnectionState::Connecting);
        metrics().connection_attempt();

        let task = Supervisor {
            agent_name: self.agent_name.clone(),
            config: self.config.clone(),
            mapper: self.mapper.clone(),
            reconnect_config: self.reconnect_config.clone(),
            client: self.client.clone(),
            subscriptions: self.subscriptions.clone(),
            state_tx: self.state_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            attempts: 0,
        };
        *supervisor = Some(tokio::spawn(task.run(event_loop)));
        drop(supervisor);

        let timeout = supervision::connect_deadline(&self.reconnect_config);
        Self::wait_for_connection_confirmation(self.state_rx.clone(), timeout).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let status_topic = self.mapper.status_topic(&self.agent_name);
        if self.is_connected() {
            if let Some(client) = self.client.lock().await.as_ref() {
                // Best effort, the Last Will covers the crash case
                let _ = client
                    .publish(
                        status_topic,
                        QoS::AtLeastOnce,
                        true,
                        status_payload(&self.agent_name, false),
                    )
                    .await;
            }
        }

        self.shutdown_tx.send_replace(true);

        let disconnect_result = match self.client.lock().await.take() {
            Some(client) if self.is_connected() => client
                .disconnect()
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string())),
            _ => Ok(()),
        };

        self.state_tx
            .send_replace(ConnectionState::Disconnected("Client disconnected".to_string()));
        self.subscriptions.lock().await.clear();

        if let Some(handle) = self.supervisor.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("MQTT supervisor shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "MQTT supervisor ended with error"),
                Err(_) => warn!("MQTT supervisor did not stop in time"),
                _ => {}
            }
        }

        info!(agent = %self.agent_name, "MQTT transport disconnected");
        disconnect_result
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<DeliveryHandle, TransportError> {
        validate_publish_topic(topic).map_err(|e| TransportError::PublishFailed(Box::new(e)))?;

        let state = self.connection_state();
        if !state.is_connected() {
            return Err(TransportError::NotConnected { state });
        }

        let broker_topic = self.mapper.to_broker(topic);
        let bytes = payload.len();
        let guard = self.client.lock().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| TransportError::NotConnected {
                state: self.connection_state(),
            })?;

        client
            .publish(broker_topic.clone(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::PublishFailed(Box::new(e)))?;

        debug!(topic = %broker_topic, bytes, "Published to broker");
        Ok(DeliveryHandle {
            address: broker_topic,
            bytes,
            qos: 1,
            sent_at: chrono::Utc::now(),
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<Inbound, TransportError> {
        let filter = canonicalize_topic(topic);
        validate_topic_filter(&filter)
            .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        self.subscriptions.lock().await.insert(filter.clone(), tx);

        // Otherwise the supervisor subscribes on the next ConnAck
        if self.is_connected() {
            if let Some(client) = self.client.lock().await.as_ref() {
                if let Err(e) = client
                    .subscribe(self.mapper.to_broker(&filter), QoS::AtLeastOnce)
                    .await
                {
                    self.subscriptions.lock().await.remove(&filter);
                    return Err(TransportError::SubscriptionFailed(e.to_string()));
                }
            }
        }

        info!(topic = %filter, "Subscribed");
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let filter = canonicalize_topic(topic);
        if self.subscriptions.lock().await.remove(&filter).is_none() {
            return Ok(());
        }

        if self.is_connected() {
            if let Some(client) = self.client.lock().await.as_ref() {
                client
                    .unsubscribe(self.mapper.to_broker(&filter))
                    .await
                    .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))?;
            }
        }

        info!(topic = %filter, "Unsubscribed");
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

/// Background task polling the event loop and reconnecting on failure
struct Supervisor {
    agent_name: String,
    config: BusSection,
    mapper: TopicMapper,
    reconnect_config: ReconnectConfig,
    client: SharedClient,
    subscriptions: SubscriptionMap,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_rx: watch::Receiver<bool>,
    attempts: u32,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!(agent = %self.agent_name, "Starting MQTT supervisor");

        loop {
            let keep_running = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    changed.is_ok() && !*self.shutdown_rx.borrow()
                }
                event = event_loop.poll() => match event {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        self.process_event_route(route, &mut event_loop).await
                    }
                    Err(e) => {
                        error!(agent = %self.agent_name, error = %e, "MQTT event loop error");
                        metrics().connection_failed();
                        self.set_state(BrokerSignal::NetworkError(e.to_string()));
                        self.reconnect(&mut event_loop).await
                    }
                },
            };

            if !keep_running {
                break;
            }
        }

        info!(agent = %self.agent_name, "MQTT supervisor stopped");
    }

    fn set_state(&self, signal: BrokerSignal) {
        let next = signal.into_state();
        let previous = self.state_tx.send_replace(next.clone());
        supervision::log_transition(&self.agent_name, &previous, &next);
    }

    async fn process_event_route(&mut self, route: EventRoute, event_loop: &mut EventLoop) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.attempts = 0;
                metrics().connection_established();
                self.set_state(BrokerSignal::ConnAck);
                self.on_connected().await;
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                if MessageHandler::should_process_message(&topic, retain) {
                    self.forward(&topic, payload).await;
                }
                true
            }
            EventRoute::Disconnected => {
                metrics().connection_lost();
                self.set_state(BrokerSignal::BrokerDisconnect);
                self.reconnect(event_loop).await
            }
            EventRoute::SubscriptionConfirmed { packet_id, success } => {
                if success {
                    debug!(packet_id, "Subscription confirmed");
                } else {
                    warn!(packet_id, "Broker rejected subscription");
                }
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                tracing::trace!(event = %event, "MQTT event");
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Re-subscribe every known filter and announce availability
    async fn on_connected(&self) {
        let filters: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        let guard = self.client.lock().await;
        let Some(client) = guard.as_ref() else {
            return;
        };

        for filter in &filters {
            match client
                .subscribe(self.mapper.to_broker(filter), QoS::AtLeastOnce)
                .await
            {
                Ok(()) => debug!(topic = %filter, "Re-subscribed"),
                Err(e) => error!(topic = %filter, error = %e, "Failed to re-subscribe"),
            }
        }

        if let Err(e) = client
            .publish(
                self.mapper.status_topic(&self.agent_name),
                QoS::AtLeastOnce,
                true,
                status_payload(&self.agent_name, true),
            )
            .await
        {
            warn!(error = %e, "Failed to publish availability");
        }
    }

    async fn forward(&self, broker_topic: &str, payload: bytes::Bytes) {
        let senders: Vec<(String, mpsc::Sender<InboundMessage>)> = {
            let subscriptions = self.subscriptions.lock().await;
            let Some((_, matched)) =
                MessageHandler::resolve_subscribers(&self.mapper, broker_topic, subscriptions.keys())
            else {
                debug!(topic = %broker_topic, "Message outside topic prefix");
                return;
            };
            matched
                .into_iter()
                .filter_map(|filter| subscriptions.get(&filter).cloned().map(|tx| (filter, tx)))
                .collect()
        };

        let Some(topic) = self.mapper.from_broker(broker_topic) else {
            return;
        };

        for (filter, tx) in senders {
            let message = InboundMessage::new(topic.clone(), payload.clone());
            if tx.send(message).await.is_err() {
                debug!(topic = %filter, "Inbound receiver dropped, removing subscription");
                self.subscriptions.lock().await.remove(&filter);
            }
        }
    }

    /// Returns false when the supervisor should stop
    async fn reconnect(&mut self, event_loop: &mut EventLoop) -> bool {
        let step = supervision::next_step(
            self.attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match step {
            ReconnectStep::Retry { attempt, delay } => {
                self.attempts = attempt;
                self.set_state(BrokerSignal::Retrying(attempt));
                metrics().connection_attempt();
                info!(attempt, delay_ms = delay.as_millis() as u64, "Attempting reconnection");

                let mut shutdown_rx = self.shutdown_rx.clone();
                let interrupted = tokio::select! {
                    changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
                    _ = tokio::time::sleep(delay) => false,
                };
                if interrupted || *self.shutdown_rx.borrow() {
                    info!("Shutdown requested, aborting reconnection");
                    return false;
                }

                match MqttTransport::create_connection(&self.agent_name, &self.config) {
                    Ok((client, new_event_loop)) => {
                        *event_loop = new_event_loop;
                        *self.client.lock().await = Some(client);
                    }
                    Err(e) => error!(error = %e, "Failed to create new connection"),
                }
                true
            }
            ReconnectStep::Stop => false,
            ReconnectStep::GiveUp => {
                let max = self.reconnect_config.max_attempts.unwrap_or(self.attempts);
                self.set_state(BrokerSignal::GaveUp(format!(
                    "Max reconnection attempts ({max}) exceeded"
                )));
                false
            }
        }
    }
}
