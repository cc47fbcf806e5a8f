//! Broker gateway: the trait the engine trades through, its wire types,
//! and the HTTP bridge and paper implementations.

mod gateway;
mod http_bridge;
mod paper;
mod types;

pub use gateway::{BrokerGateway, TimedGateway};
pub use http_bridge::HttpGateway;
pub use paper::PaperGateway;
pub use types::*;
