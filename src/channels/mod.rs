pub mod bridge;
pub mod traits;

pub use bridge::BridgeConnector;
pub use traits::{CloseReason, Connector, InboundMessage, Transport, TransportEvent};
