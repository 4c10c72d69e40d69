use std::fmt;
use std::time::Duration;

use humantime_serde::re::humantime::format_duration;
use thiserror::Error;

/// The coarse classification of a failed request, as seen by the display layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network error, timeout or a non-success response.
    TransportFailure,
    /// The payload was received but cannot be interpreted.
    DecodeFailure,
    /// The resource identifier itself is unusable.
    NoResource,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TransportFailure => "transport failure",
            Self::DecodeFailure => "decode failure",
            Self::NoResource => "no resource",
        })
    }
}

/// An error that happens while resolving a resource.
///
/// The same error value is fanned out to every waiter of a failed download, so it is cheap to
/// clone and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The resource key could not be parsed into an absolute URL.
    #[error("no resource: {0}")]
    NoResource(String),
    /// The resource could not be fetched in time.
    #[error("download timed out after {}", display_duration(.0))]
    Timeout(Duration),
    /// The resource could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or an error status.
    ///
    /// The attached string contains the transport's description of the problem.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The resource was fetched successfully, but its payload was rejected.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in fetchcache itself.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Maps this error onto the [`ErrorKind`] reported to result sinks.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoResource(_) => ErrorKind::NoResource,
            Self::Malformed(_) => ErrorKind::DecodeFailure,
            Self::Timeout(_) | Self::DownloadError(_) | Self::InternalError => {
                ErrorKind::TransportFailure
            }
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

fn display_duration(duration: &Duration) -> impl fmt::Display {
    format_duration(*duration)
}

/// The contents of a cache lookup or download: either `Ok(T)` or the reason why the resource
/// is unavailable.
pub type CacheContents<T = ()> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            CacheError::NoResource("::".into()).kind(),
            ErrorKind::NoResource
        );
        assert_eq!(
            CacheError::Malformed("not an image".into()).kind(),
            ErrorKind::DecodeFailure
        );
        assert_eq!(
            CacheError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::TransportFailure
        );
        assert_eq!(
            CacheError::DownloadError("404 Not Found".into()).kind(),
            ErrorKind::TransportFailure
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            CacheError::Timeout(Duration::from_secs(273)).to_string(),
            "download timed out after 4m 33s"
        );
        assert_eq!(
            CacheError::DownloadError("connection reset".into()).to_string(),
            "download failed: connection reset"
        );
    }
}
