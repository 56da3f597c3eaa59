//! Error types for trackio

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// trackio error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP side-channel error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration file parse error
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration file write error
    #[error("Configuration error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// Malformed CAN frame
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Remote end closed the connection
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Command issued without an established connection
    #[error("Not connected to command station")]
    NotConnected,

    /// Command issued while track power is off
    #[error("Track power is off")]
    PowerOff,

    /// Device discovery did not fully resolve a device
    #[error("Device incomplete: uid {0:#010x}")]
    DeviceIncomplete(u32),

    /// Catalog file could not be parsed
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}
