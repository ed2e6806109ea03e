//! Cross-node coordination: topic fan-out and cluster membership

pub mod bridge;
pub mod bus;
pub mod error;
pub mod hub;
pub mod node_registry;
pub mod topics;

pub use bridge::{PublishRequest, RedisBridge};
pub use bus::EventBus;
pub use error::{Error, Result};
pub use hub::{BusMessage, PubSubHub, Subscription};
pub use node_registry::{default_node_id, NodeInfo, NodeRegistry, NODE_TTL_SECS};
