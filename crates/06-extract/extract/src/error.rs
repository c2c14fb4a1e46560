use thiserror::Error;

pub type ExtractResult<T> = Result<T, ExtractError>;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("source {source_id} is missing its onset entry")]
    MissingOnset { source_id: u8 },

    #[error("malformed orchestrator record: {0}")]
    MalformedAnnotation(&'static str),

    #[error(transparent)]
    Archive(#[from] eventlog::LogError),

    #[error("table output failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("extraction i/o failure: {0}")]
    Io(#[from] std::io::Error),
}
