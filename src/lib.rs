//! mqrelay - lightweight MQTT 3.1.1 relay broker
//!
//! A small broker implementing the PUBLISH/SUBSCRIBE subset of MQTT 3.1.1
//! over TCP, with exact-match topics, per-connection ordered delivery and
//! an embedding API to publish from and receive into the host process.

pub mod broker;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod topic;

pub use broker::{Broker, BrokerConfig, ClientHandle};
pub use config::Config;
pub use protocol::{Packet, PacketType, PublishedMessage, QoS};
pub use topic::SubscriptionRegistry;
