//! Error types for obs-client

use thiserror::Error;

/// Errors that can occur while talking to the build service
#[derive(Error, Debug)]
pub enum ObsError {
    /// Transport-level failure (connect, TLS, timeout)
    #[error("HTTP error: {0}")]
    Http(String),

    /// The service answered with a non-success status
    #[error("{url} returned {status}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// Response body could not be decoded
    #[error("XML error: {0}")]
    Xml(String),

    /// Local file error while storing a download
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObsError {
    /// Whether the service reported the resource as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ObsError::Status { status: 404, .. })
    }
}

impl From<reqwest::Error> for ObsError {
    fn from(err: reqwest::Error) -> Self {
        ObsError::Http(err.to_string())
    }
}

impl From<quick_xml::DeError> for ObsError {
    fn from(err: quick_xml::DeError) -> Self {
        ObsError::Xml(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_only_for_404() {
        let missing = ObsError::Status {
            status: 404,
            url: "https://obs/source/home:me".to_string(),
            body: String::new(),
        };
        assert!(missing.is_not_found());

        let server = ObsError::Status {
            status: 500,
            url: "https://obs/source/home:me".to_string(),
            body: "conflict".to_string(),
        };
        assert!(!server.is_not_found());
        assert!(server.to_string().contains("500"));
    }
}
