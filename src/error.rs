use thiserror::Error;

/// Error kinds surfaced by the engine.
///
/// `NotFound` is deliberately distinct from `Storage`: a missing token at
/// query time means "skip", a missing record at scoring time means the row
/// was tombstoned. Callers branch on it with [`Error::is_not_found`].
#[derive(Debug, Error)]
pub enum Error {
    /// A requested row id, token, or metadata key is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A failure of the underlying KV engine or of file I/O.
    #[error("storage error: {0}")]
    Storage(String),

    /// Unknown URL scheme, unknown featurizer name, malformed input.
    #[error("configuration error: {0}")]
    Config(String),

    /// An error raised inside a parallel query worker. One failing query
    /// does not abort the batch; the payload is delivered in its slot.
    #[error("worker error: {0}")]
    Worker(String),

    /// A builder stage failed; the build is aborted.
    #[error("build error: {0}")]
    Build(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for Error {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        Error::Build(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
