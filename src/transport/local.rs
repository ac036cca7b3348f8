//! Group-chat style room transport
//!
//! Every topic is a room addressed as `{topic}@{domain}`, with `/` replaced by
//! `.` since room names are flat. Agents sharing a [`RoomHub`] see every
//! message posted to the rooms they joined, their own included. Rooms have no
//! wildcard addressing.
//!
//! The hub lives in-process, which makes this transport the natural choice for
//! single-host deployments and for tests that need several agents talking to
//! each other. [`RoomTransport::simulate_disconnect`] drops the session while
//! keeping subscriptions, exactly like a network failure would, and the
//! session comes back on its own following the same backoff policy as the
//! broker transport.

use crate::protocol::{canonicalize_topic, is_wildcard, validate_publish_topic, validate_topic_filter};
use crate::transport::mqtt::supervision::{next_step, ReconnectStep};
use crate::transport::mqtt::ReconnectConfig;
use crate::transport::{
    ConnectionState, DeliveryHandle, Inbound, InboundMessage, Transport, TransportError,
    INBOUND_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ROOM_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct RoomFrame {
    topic: String,
    payload: Bytes,
}

/// Shared set of rooms
#[derive(Clone)]
pub struct RoomHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    domain: String,
    reachable: AtomicBool,
    rooms: std::sync::Mutex<HashMap<String, broadcast::Sender<RoomFrame>>>,
}

impl RoomHub {
    pub fn new(domain: &str) -> Self {
        Self {
            inner: Arc::new(HubInner {
                domain: domain.to_string(),
                reachable: AtomicBool::new(true),
                rooms: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn domain(&self) -> &str {
        &self.inner.domain
    }

    /// While unreachable, sessions cannot be opened; open sessions are kept
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Room address for a bus topic
    pub fn room_address(&self, topic: &str) -> String {
        format!(
            "{}@{}",
            canonicalize_topic(topic).replace('/', "."),
            self.inner.domain
        )
    }

    /// Addresses of every room created so far
    pub fn rooms(&self) -> Vec<String> {
        let rooms = self.inner.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let mut addresses: Vec<String> = rooms.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    fn room(&self, topic: &str) -> broadcast::Sender<RoomFrame> {
        let address = self.room_address(topic);
        let mut rooms = self.inner.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms
            .entry(address)
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone()
    }
}

struct Membership {
    tx: mpsc::Sender<InboundMessage>,
    pump: Option<JoinHandle<()>>,
}

struct Session {
    nick: String,
    hub: RoomHub,
    reconnect: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    memberships: Mutex<HashMap<String, Membership>>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    /// Rejoin every room still subscribed and mark the session connected
    async fn open(&self) -> Result<usize, TransportError> {
        if !self.hub.is_reachable() {
            return Err(TransportError::ConnectionFailed(format!(
                "room hub {} unreachable",
                self.hub.domain()
            )));
        }
        let mut memberships = self.memberships.lock().await;
        for (topic, membership) in memberships.iter_mut() {
            if membership.pump.is_none() {
                membership.pump = Some(self.join(topic, membership.tx.clone()));
            }
        }
        self.state_tx.send_replace(ConnectionState::Connected);
        Ok(memberships.len())
    }

    fn join(&self, topic: &str, tx: mpsc::Sender<InboundMessage>) -> JoinHandle<()> {
        // Joined before spawning so nothing posted after subscribe() is missed
        let mut room = self.hub.room(topic).subscribe();
        let address = self.hub.room_address(topic);
        let nick = self.nick.clone();

        tokio::spawn(async move {
            loop {
                match room.recv().await {
                    Ok(frame) => {
                        let message = InboundMessage::new(frame.topic, frame.payload);
                        if tx.send(message).await.is_err() {
                            debug!(room = %address, "Inbound receiver dropped, leaving room");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(room = %address, nick = %nick, missed, "Room receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn stop_supervisor(&self) {
        if let Some(supervisor) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            supervisor.abort();
        }
    }
}

/// Retry opening the session with the configured backoff until it is open,
/// the transport is dropped or the attempts run out
async fn reconnect_loop(session: Weak<Session>) {
    let mut attempts = 0;
    loop {
        let Some(current) = session.upgrade() else {
            return;
        };
        match next_step(attempts, &current.reconnect, current.is_connected()) {
            ReconnectStep::Stop => return,
            ReconnectStep::GiveUp => {
                let reason = format!("Room session not restored after {attempts} attempts");
                error!(nick = %current.nick, attempts, "Giving up on room hub");
                current
                    .state_tx
                    .send_replace(ConnectionState::PermanentlyDisconnected(reason));
                return;
            }
            ReconnectStep::Retry { attempt, delay } => {
                current
                    .state_tx
                    .send_replace(ConnectionState::Reconnecting(attempt));
                drop(current);
                tokio::time::sleep(delay).await;

                let Some(current) = session.upgrade() else {
                    return;
                };
                if current.is_connected() {
                    return;
                }
                match current.open().await {
                    Ok(rooms) => {
                        info!(nick = %current.nick, attempt, rooms, "Room session restored");
                        return;
                    }
                    Err(e) => {
                        debug!(nick = %current.nick, attempt, error = %e, "Room reconnection failed");
                        attempts = attempt;
                    }
                }
            }
        }
    }
}

/// One agent's session on a [`RoomHub`]
pub struct RoomTransport {
    session: Arc<Session>,
}

impl RoomTransport {
    pub fn new(nick: &str, hub: RoomHub) -> Self {
        Self::with_reconnect_config(nick, hub, ReconnectConfig::default())
    }

    pub fn with_reconnect_config(nick: &str, hub: RoomHub, reconnect: ReconnectConfig) -> Self {
        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Disconnected("Not connected".to_string()));
        Self {
            session: Arc::new(Session {
                nick: nick.to_string(),
                hub,
                reconnect,
                state_tx,
                state_rx,
                memberships: Mutex::new(HashMap::new()),
                supervisor: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn hub(&self) -> &RoomHub {
        &self.session.hub
    }

    /// Drop the session as a network failure would, keeping subscriptions
    ///
    /// The session is then restored in the background with the reconnection
    /// backoff.
    pub async fn simulate_disconnect(&self, reason: &str) {
        let session = &self.session;
        let mut memberships = session.memberships.lock().await;
        for membership in memberships.values_mut() {
            if let Some(pump) = membership.pump.take() {
                pump.abort();
            }
        }
        drop(memberships);
        session
            .state_tx
            .send_replace(ConnectionState::Disconnected(reason.to_string()));
        warn!(nick = %session.nick, reason = %reason, "Room session lost");

        session.stop_supervisor();
        let supervisor = tokio::spawn(reconnect_loop(Arc::downgrade(session)));
        *session
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(supervisor);
    }
}

impl Drop for RoomTransport {
    fn drop(&mut self) {
        self.session.stop_supervisor();
    }
}

#[async_trait]
impl Transport for RoomTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let rooms = self.session.open().await?;
        info!(nick = %self.session.nick, domain = %self.session.hub.domain(), rooms, "Joined room hub");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let session = &self.session;
        session.stop_supervisor();
        let mut memberships = session.memberships.lock().await;
        for (_, membership) in memberships.drain() {
            if let Some(pump) = membership.pump {
                pump.abort();
            }
        }
        session
            .state_tx
            .send_replace(ConnectionState::Disconnected("Client disconnected".to_string()));
        info!(nick = %session.nick, "Left room hub");
        Ok(())
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

        let hub = &self.session.hub;
        let topic = canonicalize_topic(topic);
        let bytes = payload.len();
        let frame = RoomFrame {
            topic: topic.clone(),
            payload: Bytes::from(payload),
        };
        // An empty room is not an error
        if hub.room(&topic).send(frame).is_err() {
            debug!(topic = %topic, "Posted to an empty room");
        }

        Ok(DeliveryHandle {
            address: hub.room_address(&topic),
            bytes,
            qos: 1,
            sent_at: chrono::Utc::now(),
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<Inbound, TransportError> {
        let session = &self.session;
        let topic = canonicalize_topic(topic);
        validate_topic_filter(&topic)
            .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))?;
        if is_wildcard(&topic) {
            return Err(TransportError::SubscriptionFailed(format!(
                "rooms cannot be joined with wildcards: {topic}"
            )));
        }

        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let pump = if session.is_connected() {
            Some(session.join(&topic, tx.clone()))
        } else {
            None
        };

        let previous = session
            .memberships
            .lock()
            .await
            .insert(topic.clone(), Membership { tx, pump });
        if let Some(Membership {
            pump: Some(old), ..
        }) = previous
        {
            old.abort();
        }

        info!(room = %session.hub.room_address(&topic), "Joined room");
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let topic = canonicalize_topic(topic);
        if let Some(membership) = self.session.memberships.lock().await.remove(&topic) {
            if let Some(pump) = membership.pump {
                pump.abort();
            }
            info!(room = %self.session.hub.room_address(&topic), "Left room");
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.session.state_rx.borrow().clone()
    }

    fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.session.state_rx.clone()
    }
}
