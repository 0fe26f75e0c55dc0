//! camodiff error types

/// camodiff result type
pub type Result<T> = std::result::Result<T, Error>;

/// camodiff errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from candle tensor operations
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Model construction or forward-pass error
    #[error("model error: {reason}")]
    ModelError {
        /// Description of what went wrong
        reason: String,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Diffusion schedule or sampling error
    #[error("diffusion error: {reason}")]
    DiffusionError {
        /// Description of what went wrong
        reason: String,
    },

    /// Dataset loading or batching error
    #[error("data error: {reason}")]
    DataError {
        /// Description of what went wrong
        reason: String,
    },

    /// Training/optimizer error
    #[error("training error: {reason}")]
    TrainingError {
        /// Description of what went wrong
        reason: String,
    },
}
