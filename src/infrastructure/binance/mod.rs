pub mod common;
pub mod fleet;
pub mod rest;
pub mod websocket;

pub use fleet::{WsFleet, WsFleetConfig};
pub use rest::{BinanceApiConfig, BinanceRestClient};
