pub mod client;
pub mod context;
pub mod filter;
pub mod gateway;
mod handler;

pub use client::{HyperUpstreamClient, UpstreamClient};
pub use context::{BoxBody, GatewayRequest, GatewayResponse};
pub use gateway::{ApiGateway, GatewayStats};
pub use handler::handle_request;
