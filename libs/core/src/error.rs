use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid correlation id: {0}")]
    InvalidCorrelationId(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
