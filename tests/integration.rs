//! Integration Tests for the mqrelay broker
//!
//! These tests run a real broker on a loopback listener and drive it with
//! raw MQTT clients built on the crate's own codec.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use mqrelay::broker::{Broker, BrokerConfig};
use mqrelay::codec::{Decoder, Encoder};
use mqrelay::protocol::{Flags, Packet, PacketType, ProtocolError, QoS, Severity};

/// Start a broker on an ephemeral port
async fn start_broker(config: BrokerConfig) -> (Arc<Broker>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Arc::new(Broker::new(config));

    let serving = broker.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    (broker, addr)
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Helper struct for MQTT client operations in tests
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Failed to write");
    }

    /// Next packet from the broker, `None` on timeout or close
    async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.buf).expect("bad frame") {
                self.buf.advance(consumed);
                return Some(packet);
            }
            match timeout(wait, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => return None,
            }
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(5)).await
    }

    async fn subscribe(&mut self, packet_id: u16, topic: &str, qos: QoS) {
        let subscribe = Packet::subscribe(packet_id, &[(topic, qos)]).unwrap();
        self.send(&subscribe).await;

        match self.recv().await {
            Some(ack) if ack.packet_type() == PacketType::SubAck => {
                assert_eq!(ack, Packet::suback(packet_id, &[qos as u8]).unwrap());
            }
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &'static [u8]) {
        self.send(&publish_packet(topic, payload)).await;
    }

    /// True once the broker has closed the connection
    async fn closed_by_peer(&mut self) -> bool {
        let mut scratch = [0u8; 64];
        matches!(
            timeout(Duration::from_secs(5), self.stream.read(&mut scratch)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}

fn publish_packet(topic: &str, payload: &'static [u8]) -> Packet {
    Packet::publish(Flags::default(), topic, Bytes::from_static(payload)).unwrap()
}

#[tokio::test]
async fn test_subscribe_returns_suback_with_requested_qos() {
    let (_broker, addr) = start_broker(BrokerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;

    let subscribe =
        Packet::subscribe(0x0001, &[("a/b", QoS::AtLeastOnce), ("c", QoS::ExactlyOnce)]).unwrap();
    client.send(&subscribe).await;

    let ack = client.recv().await.expect("no SUBACK");
    assert_eq!(ack, Packet::suback(0x0001, &[1, 2]).unwrap());
}

#[tokio::test]
async fn test_fan_out_in_subscribe_order() {
    let (broker, addr) = start_broker(BrokerConfig::default()).await;

    let mut c1 = TestClient::connect(addr).await;
    let mut c2 = TestClient::connect(addr).await;
    let mut c3 = TestClient::connect(addr).await;

    c1.subscribe(1, "t", QoS::AtMostOnce).await;
    c2.subscribe(1, "t", QoS::AtMostOnce).await;

    let subscribers = broker.registry().lookup("t", QoS::AtMostOnce);
    assert_eq!(subscribers.len(), 2);
    assert!(subscribers[0].id() < subscribers[1].id());

    c3.publish("t", b"hi").await;

    assert_eq!(c1.recv().await, Some(publish_packet("t", b"hi")));
    assert_eq!(c2.recv().await, Some(publish_packet("t", b"hi")));

    let message = timeout(Duration::from_secs(5), broker.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.topic, "t");
    assert_eq!(message.payload, Bytes::from_static(b"hi"));

    // The publisher itself is not subscribed
    assert_eq!(c3.recv_within(Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_qos1_subscription_does_not_match_qos0_publish() {
    let (broker, addr) = start_broker(BrokerConfig::default()).await;

    let mut subscriber = TestClient::connect(addr).await;
    let mut publisher = TestClient::connect(addr).await;

    subscriber.subscribe(7, "t", QoS::AtLeastOnce).await;
    publisher.publish("t", b"x").await;

    let message = timeout(Duration::from_secs(5), broker.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.topic, "t");
    assert_eq!(
        subscriber.recv_within(Duration::from_millis(200)).await,
        None
    );
}

#[tokio::test]
async fn test_framing_error_only_closes_offending_connection() {
    let (broker, addr) = start_broker(BrokerConfig::default()).await;

    let mut subscriber = TestClient::connect(addr).await;
    let mut faulty = TestClient::connect(addr).await;
    let mut publisher = TestClient::connect(addr).await;

    subscriber.subscribe(1, "t", QoS::AtMostOnce).await;
    wait_until(|| broker.connection_count() == 3).await;

    // Remaining length field with a fifth continuation byte
    faulty.send_raw(&[0x30, 0x80, 0x80, 0x80, 0x80, 0x01]).await;
    assert!(faulty.closed_by_peer().await);
    wait_until(|| broker.connection_count() == 2).await;

    publisher.publish("t", b"still here").await;
    assert_eq!(
        subscriber.recv().await,
        Some(publish_packet("t", b"still here"))
    );
}

#[tokio::test]
async fn test_unexpected_packet_closes_connection() {
    let (_broker, addr) = start_broker(BrokerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;

    // PINGRESP is server-to-client only
    client.send_raw(&[0xD0, 0x00]).await;
    assert!(client.closed_by_peer().await);
}

#[tokio::test]
async fn test_noop_packets_keep_connection_open() {
    let (broker, addr) = start_broker(BrokerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;

    client
        .send(&Packet::empty(PacketType::PingReq, Flags::default()))
        .await;
    client
        .send(&Packet::empty(PacketType::Disconnect, Flags::default()))
        .await;
    assert_eq!(client.recv_within(Duration::from_millis(200)).await, None);

    client.subscribe(3, "still/open", QoS::AtMostOnce).await;
    assert_eq!(broker.registry().lookup("still/open", QoS::AtMostOnce).len(), 1);
}

#[tokio::test]
async fn test_server_publish_reaches_subscribers() {
    let (broker, addr) = start_broker(BrokerConfig::default()).await;
    let mut subscriber = TestClient::connect(addr).await;
    subscriber.subscribe(1, "news", QoS::AtMostOnce).await;

    broker
        .publish("news", Bytes::from_static(b"extra"), 0, false)
        .await
        .unwrap();
    assert_eq!(subscriber.recv().await, Some(publish_packet("news", b"extra")));

    broker
        .publish("news", Bytes::from_static(b"kept?"), 0, true)
        .await
        .unwrap();
    let retained = subscriber.recv().await.unwrap();
    assert!(retained.flags().retain());

    let err = broker
        .publish("news", Bytes::new(), 5, false)
        .await
        .unwrap_err();
    assert_eq!(err, ProtocolError::InvalidQoS(5));
    assert_eq!(err.severity(), Severity::Warning);
}

#[tokio::test]
async fn test_messages_delivered_in_publish_order() {
    let (broker, addr) = start_broker(BrokerConfig::default()).await;
    let mut subscriber = TestClient::connect(addr).await;
    let mut publisher = TestClient::connect(addr).await;
    subscriber.subscribe(1, "seq", QoS::AtMostOnce).await;

    for i in 0..100u32 {
        let packet =
            Packet::publish(Flags::default(), "seq", Bytes::from(i.to_be_bytes().to_vec()))
                .unwrap();
        publisher.send(&packet).await;
    }

    for i in 0..100u32 {
        let packet = subscriber.recv().await.expect("missing message");
        assert_eq!(&packet.payload()[..], &i.to_be_bytes());
        let message = broker.receive().await.unwrap();
        assert_eq!(&message.payload[..], &i.to_be_bytes());
    }
}

#[tokio::test]
async fn test_registry_keeps_entries_after_disconnect_by_default() {
    let (broker, addr) = start_broker(BrokerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;
    client.subscribe(1, "t", QoS::AtMostOnce).await;

    drop(client);
    wait_until(|| broker.connection_count() == 0).await;
    assert_eq!(broker.registry().subscriber_count(), 1);

    // Publishing to the stale handle is skipped silently
    broker
        .publish("t", Bytes::from_static(b"x"), 0, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_prune_on_disconnect() {
    let config = BrokerConfig {
        prune_on_disconnect: true,
        ..BrokerConfig::default()
    };
    let (broker, addr) = start_broker(config).await;

    let mut leaving = TestClient::connect(addr).await;
    let mut staying = TestClient::connect(addr).await;
    leaving.subscribe(1, "t", QoS::AtMostOnce).await;
    staying.subscribe(1, "t", QoS::AtMostOnce).await;

    drop(leaving);
    let registry = broker.registry();
    wait_until(|| registry.subscriber_count() == 1).await;
    assert_eq!(registry.lookup("t", QoS::AtMostOnce).len(), 1);
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let (broker, addr) = start_broker(BrokerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;
    wait_until(|| broker.connection_count() == 1).await;

    broker.shutdown();
    assert!(client.closed_by_peer().await);
    wait_until(|| broker.connection_count() == 0).await;
}
