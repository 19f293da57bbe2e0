//! Error types shared by the snapshot engine and its platform backends.

use thiserror::Error;

/// Failure reported by an operating-system data source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// An OS call returned a failure status.
    #[error("{api} failed (status 0x{code:08X})")]
    Os { api: &'static str, code: i32 },

    /// Reading a kernel-provided file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The query has no implementation for the current platform.
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// Errors that abort a single snapshot cycle.
///
/// Every variant is fatal for the cycle only: the caller skips this interval
/// and tries again on the next one. Engine state is left untouched.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The kernel kept reporting "buffer too small" past the retry bound.
    #[error(
        "process snapshot unavailable after {attempts} attempts (kernel wanted {required} bytes)"
    )]
    SnapshotUnavailable { attempts: u32, required: usize },

    /// The process listing itself could not be queried.
    #[error(transparent)]
    Source(#[from] SourceError),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_formats_status_as_hex() {
        let err = SourceError::Os {
            api: "NtQuerySystemInformation",
            code: 0xC000_0004_u32 as i32,
        };
        assert_eq!(
            err.to_string(),
            "NtQuerySystemInformation failed (status 0xC0000004)"
        );
    }

    #[test]
    fn source_error_converts_into_engine_error() {
        let err: EngineError = SourceError::Unsupported("service enumeration").into();
        assert!(matches!(err, EngineError::Source(SourceError::Unsupported(_))));
    }
}
