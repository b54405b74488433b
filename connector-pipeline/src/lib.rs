pub mod api;
pub mod config;
pub mod handshake;
pub mod inbound;
pub mod outbound;
pub mod signature;
