use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The input is not a well-formed alignment file.
    #[error("Format error: {0}")]
    Format(String),
    /// The aligner cannot be built from the given parameters and alleles.
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Unknown allele: {0}")]
    UnknownAllele(String),
    #[error("Invalid parameters: {0}")]
    Parameters(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}
