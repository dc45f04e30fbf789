//! Packet processing
//!
//! Interprets one decoded packet against the subscription registry. A call
//! may append to the registry, enqueue replies on the originating
//! connection, enqueue PUBLISH copies on subscriber connections and push
//! client messages into the broker inbox.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::ClientHandle;
use crate::protocol::{DecodeError, Packet, PacketType, ProtocolError, PublishedMessage, QoS};
use crate::topic::SubscriptionRegistry;

/// Shared, stateless-per-call packet handler
pub struct PacketProcessor {
    registry: Arc<SubscriptionRegistry<ClientHandle>>,
    /// Messages published by clients, consumed by `Broker::receive`
    inbox: mpsc::Sender<PublishedMessage>,
}

impl PacketProcessor {
    pub fn new(
        registry: Arc<SubscriptionRegistry<ClientHandle>>,
        inbox: mpsc::Sender<PublishedMessage>,
    ) -> Self {
        Self { registry, inbox }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry<ClientHandle>> {
        &self.registry
    }

    /// Route an inbound packet to its handler
    pub async fn dispatch(
        &self,
        packet: Packet,
        origin: &ClientHandle,
    ) -> Result<(), ProtocolError> {
        match packet.packet_type() {
            PacketType::Connect => self.process_connect(&packet),
            PacketType::Publish => self.process_publish(packet).await,
            PacketType::PubAck => self.process_puback(&packet),
            PacketType::PubRec => self.process_pubrec(&packet),
            PacketType::PubRel => self.process_pubrel(&packet),
            PacketType::PubComp => self.process_pubcomp(&packet),
            PacketType::Subscribe => self.process_subscribe(packet, origin).await,
            PacketType::Unsubscribe => self.process_unsubscribe(&packet),
            PacketType::PingReq => self.process_pingreq(&packet),
            PacketType::Disconnect => self.process_disconnect(&packet),
            other @ (PacketType::ConnAck
            | PacketType::SubAck
            | PacketType::UnsubAck
            | PacketType::PingResp) => Err(ProtocolError::UnexpectedPacket(other)),
        }
    }

    /// Handle PUBLISH packet
    ///
    /// QoS 0: hand the message to the broker inbox (waiting while it is
    /// full), then copy the packet to every connection subscribed at
    /// `(topic, QoS 0)`. QoS 1 and 2 are accepted and dropped.
    pub async fn process_publish(&self, packet: Packet) -> Result<(), ProtocolError> {
        let flags = packet.flags();
        let qos_bits = flags.qos_bits();
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        if qos != QoS::AtMostOnce {
            debug!("QoS {} PUBLISH is not supported, dropping", qos_bits);
            return Ok(());
        }

        if flags.dup() {
            return Err(DecodeError::InvalidFlags.into());
        }

        let topic = packet.publish_topic()?;
        let message = PublishedMessage {
            topic: topic.to_string(),
            payload: packet.payload().clone(),
        };
        if self.inbox.send(message).await.is_err() {
            debug!("Broker inbox closed, message on {} not delivered locally", topic);
        }

        let outbound = Packet::publish(flags, topic, packet.payload().clone())?;
        self.fan_out(topic, outbound).await;
        Ok(())
    }

    /// Enqueue `packet` on every connection subscribed at `(topic, QoS 0)`,
    /// in subscribe order
    pub async fn fan_out(&self, topic: &str, packet: Packet) -> usize {
        let subscribers = self.registry.lookup(topic, QoS::AtMostOnce);
        let mut delivered = 0;

        for subscriber in subscribers {
            match subscriber.send(packet.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(
                    "Skipping subscriber {} on {}: {}",
                    subscriber.addr(),
                    topic,
                    e
                ),
            }
        }

        trace!("PUBLISH on {} enqueued to {} subscribers", topic, delivered);
        delivered
    }

    /// Handle SUBSCRIBE packet
    ///
    /// Every requested (topic, QoS) is registered as-is and granted as
    /// requested; the SUBACK echoes the packet identifier and the requested
    /// QoS values in request order.
    pub async fn process_subscribe(
        &self,
        packet: Packet,
        origin: &ClientHandle,
    ) -> Result<(), ProtocolError> {
        let request = packet.subscribe_request()?;
        let mut return_codes = Vec::with_capacity(request.entries.len());

        for (topic, qos) in &request.entries {
            self.registry.append(topic, *qos, origin.clone());
            return_codes.push(*qos as u8);
            debug!("SUBSCRIBE {} to {} (QoS {})", origin.addr(), topic, *qos as u8);
        }

        let suback = Packet::suback(request.packet_id, &return_codes)?;
        if origin.send(suback).await.is_err() {
            debug!("SUBACK to {} dropped, output closed", origin.addr());
        }
        Ok(())
    }

    pub fn process_connect(&self, _packet: &Packet) -> Result<(), ProtocolError> {
        Ok(())
    }

    pub fn process_puback(&self, _packet: &Packet) -> Result<(), ProtocolError> {
        Ok(())
    }

    pub fn process_pubrec(&self, _packet: &Packet) -> Result<(), ProtocolError> {
        Ok(())
    }

    pub fn process_pubrel(&self, _packet: &Packet) -> Result<(), ProtocolError> {
        Ok(())
    }

    pub fn process_pubcomp(&self, _packet: &Packet) -> Result<(), ProtocolError> {
        Ok(())
    }

    pub fn process_unsubscribe(&self, _packet: &Packet) -> Result<(), ProtocolError> {
        Ok(())
    }

    pub fn process_pingreq(&self, _packet: &Packet) -> Result<(), ProtocolError> {
        Ok(())
    }

    pub fn process_disconnect(&self, _packet: &Packet) -> Result<(), ProtocolError> {
        Ok(())
    }
}
