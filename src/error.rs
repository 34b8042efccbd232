//! Error types for mirrorwatch

/// Result type alias for mirrorwatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for mirrorwatch
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Store command failed
    #[error("store error: {0}")]
    Store(String),
    /// The store is still loading its dataset into memory
    #[error("store is loading its dataset")]
    StoreLoading,
    /// The mirror has no known file yet, a content scan must run first
    #[error("mirror has not been scanned yet")]
    MirrorNotScanned,
    /// A redirect was returned while redirects are disallowed
    #[error("redirect not allowed")]
    RedirectNotAllowed,
    /// The mirror exposes neither an rsync nor an FTP endpoint
    #[error("no scan method available")]
    NoSyncMethod,
    /// Another peer already holds the scan lease for this mirror
    #[error("scan already in progress")]
    ScanInProgress,
    /// The scan was interrupted by a stop request
    #[error("scan aborted")]
    ScanAborted,
    /// Download event without a mirror identifier
    #[error("stats: unknown mirror")]
    UnknownMirror,
    /// Download event without a file path
    #[error("stats: file parameter is empty")]
    EmptyFilePath,
    /// The stats ingestion queue is full
    #[error("stats queue is full")]
    StatsBacklog,
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
    /// HTTP probe errors
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the error is the store's transient loading state.
    ///
    /// Loading is expected right after a store restart and is handled by
    /// skipping the current tick, so callers use this to suppress logs and
    /// side effects that only make sense for real failures.
    pub fn is_loading(&self) -> bool {
        matches!(self, Error::StoreLoading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_is_recognized() {
        assert!(Error::StoreLoading.is_loading());
        assert!(!Error::Store("down".to_string()).is_loading());
        assert!(!Error::MirrorNotScanned.is_loading());
    }
}
