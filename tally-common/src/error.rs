use bincode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TallyError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Consensus Error: {0}")]
    Consensus(String),
}

pub type Result<T> = std::result::Result<T, TallyError>;

impl From<bincode::Error> for TallyError {
    fn from(err: bincode::Error) -> Self {
        TallyError::Codec(format!("Bincode Error: {}", err))
    }
}
