use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected at construction; the message names the offending field.
    #[error("invalid configuration: {0}")]
    Configuration(&'static str),

    #[error("input has {actual} values but the input layer holds {expected}")]
    InputSize { expected: usize, actual: usize },

    #[error("target index {target} is outside the {outputs} output classes")]
    TargetOutOfRange { target: usize, outputs: usize },

    #[error("persistence: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("consensus requires at least one member output")]
    EmptyEnsemble,
}

impl Error {
    pub(crate) fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }
}
