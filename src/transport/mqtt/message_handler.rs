//! Pure routing of rumqttc events
//!
//! The event loop driver polls rumqttc and hands every event to
//! [`MessageHandler::route_mqtt_event`]. The resulting [`EventRoute`] decides
//! what the driver does: update connection state, emit a
//! [`ClientEvent`](crate::transport::ClientEvent) or settle a waiting
//! acknowledgement in the [`AckTracker`].

use crate::transport::IncomingMessage;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    session_present: connack.session_present,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(IncomingMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    retained: publish.retain,
                    duplicate: publish.dup,
                }),
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    packet_id: puback.pkid,
                },
                Packet::PubComp(pubcomp) => EventRoute::PublishAcknowledged {
                    packet_id: pubcomp.pkid,
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    accepted: Self::subscription_accepted(&suback.return_codes),
                },
                Packet::UnsubAck(unsuback) => EventRoute::UnsubscriptionAcknowledged {
                    packet_id: unsuback.pkid,
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(packet_id) => EventRoute::RequestSent {
                    kind: AckKind::Publish,
                    packet_id: *packet_id,
                },
                Outgoing::Subscribe(packet_id) => EventRoute::RequestSent {
                    kind: AckKind::Subscribe,
                    packet_id: *packet_id,
                },
                Outgoing::Unsubscribe(packet_id) => EventRoute::RequestSent {
                    kind: AckKind::Unsubscribe,
                    packet_id: *packet_id,
                },
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// A SUBACK is accepted when no filter was refused (pure function)
    pub fn subscription_accepted(return_codes: &[SubscribeReasonCode]) -> bool {
        !return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged { session_present: bool },
    /// Message received on a subscribed topic
    MessageReceived(IncomingMessage),
    /// PUBACK (QoS 1) or PUBCOMP (QoS 2)
    PublishAcknowledged { packet_id: u16 },
    SubscriptionAcknowledged { packet_id: u16, accepted: bool },
    UnsubscriptionAcknowledged { packet_id: u16 },
    /// Broker sent DISCONNECT
    Disconnected,
    /// A request left the client with this packet id
    RequestSent { kind: AckKind, packet_id: u16 },
    /// Our DISCONNECT went out; the session is over
    DisconnectSent,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Request types that expect an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

impl AckKind {
    pub fn label(&self) -> &'static str {
        match self {
            AckKind::Publish => "publish acknowledgement",
            AckKind::Subscribe => "subscribe acknowledgement",
            AckKind::Unsubscribe => "unsubscribe acknowledgement",
        }
    }
}

/// Waiter side of an acknowledgement; resolves to whether the broker accepted
pub type AckReceiver = oneshot::Receiver<bool>;

/// Matches waiting callers to broker acknowledgements
///
/// rumqttc assigns packet ids when a request is written, so waiters queue in
/// request order per kind and are bound to a packet id when the matching
/// outgoing event is seen. Requests must be queued in the same order they are
/// handed to rumqttc.
#[derive(Debug, Default)]
pub struct AckTracker {
    queued: HashMap<AckKind, VecDeque<oneshot::Sender<bool>>>,
    in_flight: HashMap<(AckKind, u16), oneshot::Sender<bool>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a waiter for the next request of this kind
    pub fn enqueue(&mut self, kind: AckKind) -> AckReceiver {
        let (tx, rx) = oneshot::channel();
        self.queued.entry(kind).or_default().push_back(tx);
        rx
    }

    /// Bind the oldest queued waiter to the packet id rumqttc just sent
    pub fn assign(&mut self, kind: AckKind, packet_id: u16) {
        // retransmissions reuse their packet id
        if self.in_flight.contains_key(&(kind, packet_id)) {
            return;
        }

        let Some(waiter) = self.queued.get_mut(&kind).and_then(VecDeque::pop_front) else {
            return;
        };

        if packet_id == 0 {
            // QoS 0 publish: nothing further will arrive
            let _ = waiter.send(true);
        } else {
            self.in_flight.insert((kind, packet_id), waiter);
        }
    }

    /// Settle the waiter bound to this packet id; false if none was waiting
    pub fn complete(&mut self, kind: AckKind, packet_id: u16, accepted: bool) -> bool {
        match self.in_flight.remove(&(kind, packet_id)) {
            Some(waiter) => waiter.send(accepted).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; their receivers observe a closed channel
    pub fn fail_all(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }

    pub fn pending(&self) -> usize {
        self.queued.values().map(VecDeque::len).sum::<usize>() + self.in_flight.len()
    }
}
