//! Crate-level error type.
//!
//! Each concern owns its own error enum next to the code that raises it;
//! this module only stitches them together for callers that want a single
//! `Result`.

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::geo::GeoError;
pub use crate::protocol::ProtocolError;
pub use crate::status::StatusError;
pub use crate::transport::TransportError;

/// Main error type for the tracker.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Geolocation error: {0}")]
    Geo(#[from] GeoError),

    #[error("Status generation error: {0}")]
    Status(#[from] StatusError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session is no longer running")]
    SessionClosed,
}

/// Result type alias for the tracker.
pub type Result<T> = std::result::Result<T, Error>;
