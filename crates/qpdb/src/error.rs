//! Error types for the qpdb crate.

use thiserror::Error;

/// Identity, download, PDB decoding and query errors.
#[derive(Debug, Error)]
pub enum QpdbError {
    #[error("Unsupported machine type: {0:#06x}")]
    UnsupportedImage(u16),

    #[error("Malformed image: {0}")]
    MalformedImage(String),

    #[error("Invalid debug identity (missing PDB name or GUID)")]
    InvalidIdentity,

    #[error("Unsafe archive path component: {0:?}")]
    UnsafePath(String),

    #[error("Download failed for {url}: {msg}")]
    Download { url: String, msg: String },

    #[error("Malformed PDB: {0}")]
    MalformedPdb(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl QpdbError {
    /// Create a Download error.
    pub fn download(url: impl Into<String>, msg: impl Into<String>) -> Self {
        QpdbError::Download {
            url: url.into(),
            msg: msg.into(),
        }
    }

    /// Create a MalformedImage error.
    pub fn malformed_image(msg: impl Into<String>) -> Self {
        QpdbError::MalformedImage(msg.into())
    }
}

impl From<pdb::Error> for QpdbError {
    fn from(e: pdb::Error) -> Self {
        QpdbError::MalformedPdb(e.to_string())
    }
}

pub type QpdbResult<T> = Result<T, QpdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_image_display() {
        let err = QpdbError::UnsupportedImage(0x01c4);
        assert_eq!(err.to_string(), "Unsupported machine type: 0x01c4");
    }

    #[test]
    fn test_download_error_display() {
        let err = QpdbError::download("http://host/a.pdb/ABC1/a.pdb", "HTTP 404");
        assert!(err.to_string().contains("http://host/a.pdb/ABC1/a.pdb"));
        assert!(err.to_string().contains("HTTP 404"));
    }
}
