pub mod connection;
pub mod diagnostics;
pub mod directory;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod lifecycle;
pub mod outbox;
pub mod probe;
pub mod router;
pub mod transport;
pub mod worker;

pub use error::GatewayError;
