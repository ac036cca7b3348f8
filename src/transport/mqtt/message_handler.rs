//! Pure routing of MQTT events
//!
//! Broker events are classified here before the supervisor in
//! [`super::client`] acts on them.

use super::connection::TopicMapper;
use crate::protocol::topic_matches;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use tracing::debug;

pub struct MessageHandler;

impl MessageHandler {
    /// Classify a broker event
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    success: suback
                        .return_codes
                        .iter()
                        .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Retained messages are broker state, not bus events
    pub fn should_process_message(topic: &str, retain: bool) -> bool {
        if retain {
            debug!(topic = %topic, "Ignoring retained message");
            return false;
        }
        true
    }

    /// Resolve a broker topic to its bus topic and the subscription filters
    /// it matches
    pub fn resolve_subscribers<'a, I>(
        mapper: &TopicMapper,
        broker_topic: &str,
        filters: I,
    ) -> Option<(String, Vec<String>)>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let topic = mapper.from_broker(broker_topic)?;
        let matched: Vec<String> = filters
            .into_iter()
            .filter(|filter| topic_matches(filter, &topic))
            .cloned()
            .collect();
        Some((topic, matched))
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: bytes::Bytes,
        retain: bool,
    },
    Disconnected,
    SubscriptionConfirmed { packet_id: u16, success: bool },
    /// PingResp and other keep-alive traffic
    InfrastructureEvent(String),
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Publish};
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_route_publish() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("savanna/timon"),
            pkid: 1,
            payload: Bytes::from("{}"),
            properties: None,
        };
        let route = MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Publish(publish)));
        match route {
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                assert_eq!(topic, "savanna/timon");
                assert_eq!(payload, Bytes::from("{}"));
                assert!(!retain);
            }
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn test_route_connack() {
        let connack = ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        };
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::ConnAck(connack))),
            EventRoute::ConnectionAcknowledged
        ));
    }

    #[test]
    fn test_route_disconnect() {
        use rumqttc::v5::mqttbytes::v5::{Disconnect, DisconnectReasonCode};

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));
    }

    #[test]
    fn test_retained_messages_are_skipped() {
        assert!(MessageHandler::should_process_message("timon", false));
        assert!(!MessageHandler::should_process_message("status/timon", true));
    }

    #[test]
    fn test_resolve_subscribers() {
        let mapper = TopicMapper::new("savanna");
        let filters = vec![
            "timon".to_string(),
            "workflow/#".to_string(),
            "pumbaa".to_string(),
        ];

        let (topic, matched) =
            MessageHandler::resolve_subscribers(&mapper, "savanna/workflow/instances/1", &filters)
                .unwrap();
        assert_eq!(topic, "workflow/instances/1");
        assert_eq!(matched, vec!["workflow/#".to_string()]);

        let (_, matched) =
            MessageHandler::resolve_subscribers(&mapper, "savanna/timon", &filters).unwrap();
        assert_eq!(matched, vec!["timon".to_string()]);

        assert!(MessageHandler::resolve_subscribers(&mapper, "elsewhere/timon", &filters).is_none());
    }
}
