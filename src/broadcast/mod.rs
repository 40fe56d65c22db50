//! Real-time fan-out of vehicle updates to subscribed connections.

mod fanout;
mod gateway;
mod message;
mod session;

pub use fanout::{BroadcastFanout, BroadcastReport};
pub use gateway::{ConnectionGateway, DeliveryError, HttpGateway, LocalGateway};
pub use message::{ClientAction, WsMessage};
pub use session::SessionHandler;
