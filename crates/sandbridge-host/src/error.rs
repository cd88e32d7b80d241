use thiserror::Error;

/// Errors from the reference host.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WASM compilation, linking or execution error.
    #[error("WASM error: {0}")]
    Wasm(String),

    /// Error from the bridge itself.
    #[error("Bridge error: {0}")]
    Core(#[from] sandbridge_core::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input parameter.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for sandbridge-host operations.
pub type Result<T> = std::result::Result<T, Error>;
