//! Call-related error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    /// The controller loop has exited (disposed or shut down).
    #[error("call controller is no longer running")]
    ControllerStopped,

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}
