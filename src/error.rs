//! Error types for the cache engine

use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error types that can occur in the cache engine
///
/// Payloads are kept as strings so an error can be cloned and fanned out to
/// every waiter of a deduplicated download.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// Metadata or part is not present in storage
    #[error("object does not exist")]
    NotExist,

    /// Metadata or part is already stored
    #[error("object already exists")]
    AlreadyExists,

    /// Index is already tracked by the eviction algorithm
    #[error("object is already in cache")]
    AlreadyInCache,

    #[error("inconsistent cache state: {0}")]
    InconsistentState(String),

    #[error("upstream fetch error: {0}")]
    UpstreamFetch(String),

    /// Stream length differs from the declared content length
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The task that owned the request went away before answering
    #[error("cache component is shut down")]
    Shutdown,

    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Composite(Vec<CacheError>),
}

fn join_errors(errors: &[CacheError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => CacheError::NotExist,
            std::io::ErrorKind::AlreadyExists => CacheError::AlreadyExists,
            _ => CacheError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<CacheError> for std::io::Error {
    fn from(err: CacheError) -> Self {
        let kind = match err {
            CacheError::NotExist => std::io::ErrorKind::NotFound,
            CacheError::AlreadyExists => std::io::ErrorKind::AlreadyExists,
            CacheError::LengthMismatch { .. } => std::io::ErrorKind::UnexpectedEof,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

impl CacheError {
    /// Whether this error only means "not cached"
    pub fn is_not_exist(&self) -> bool {
        matches!(self, CacheError::NotExist)
    }

    /// Fold a list of errors into one result
    ///
    /// Returns `Ok(())` for an empty list, the error itself for a single one,
    /// and a [`CacheError::Composite`] otherwise.
    pub fn combine(mut errors: Vec<CacheError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(CacheError::Composite(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_exist() {
        let err: CacheError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(err.is_not_exist());
    }

    #[test]
    fn test_combine() {
        assert!(CacheError::combine(vec![]).is_ok());
        assert_eq!(
            CacheError::combine(vec![CacheError::NotExist]),
            Err(CacheError::NotExist)
        );

        let err = CacheError::combine(vec![
            CacheError::Io("disk full".to_string()),
            CacheError::Shutdown,
        ])
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "2 errors: IO error: disk full; cache component is shut down"
        );
    }

    #[test]
    fn test_into_io_error_kind() {
        let err: std::io::Error = CacheError::NotExist.into();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
