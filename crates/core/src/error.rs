use thiserror::Error;

/// Failures the core can observe. Permission and validation outcomes are not errors;
/// they come back as [`crate::drag::Rejection`] / [`crate::leash::PanOutcome`] values.
#[derive(Error, Debug)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A queue or roll was requested with nothing to order.
    #[error("data error: {0}")]
    Data(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::Decode(e.to_string())
        } else {
            Error::Network(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
