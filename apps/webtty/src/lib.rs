pub mod client;
pub mod host;
pub mod mock;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod terminal;
pub mod transport;
