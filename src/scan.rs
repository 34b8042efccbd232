//! Content-scan seam
//!
//! The actual rsync/FTP inventory transfer runs in external collaborators;
//! the scheduler only drives them through the [`Scanner`] trait. The
//! distributed scan lease lives in the store (`Store::is_scanning`) so two
//! peers never scan the same mirror concurrently.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Transport used for a content scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMethod {
    Rsync,
    Ftp,
}

impl std::fmt::Display for ScanMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ScanMethod::Rsync => "rsync",
            ScanMethod::Ftp => "ftp",
        })
    }
}

/// Driver for mirror content scans and local repository scans.
///
/// Implementations must return [`Error::ScanAborted`] when interrupted by
/// the stop token and [`Error::ScanInProgress`] when they lose the
/// distributed lease race mid-scan.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Refresh the file inventory of one mirror over the given transport.
    async fn scan(
        &self,
        method: ScanMethod,
        url: &str,
        mirror_id: &str,
        stop: &CancellationToken,
    ) -> Result<()>;

    /// Scan the local repository the mirrors are compared against.
    async fn scan_source(&self, stop: &CancellationToken) -> Result<()>;
}

/// Scanner used when content scanning runs out of process: every mirror
/// scan reports no usable method and the repository scan is a no-op.
pub struct NullScanner;

#[async_trait]
impl Scanner for NullScanner {
    async fn scan(
        &self,
        _method: ScanMethod,
        _url: &str,
        _mirror_id: &str,
        _stop: &CancellationToken,
    ) -> Result<()> {
        Err(Error::NoSyncMethod)
    }

    async fn scan_source(&self, _stop: &CancellationToken) -> Result<()> {
        Ok(())
    }
}
