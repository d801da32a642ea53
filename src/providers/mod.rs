//! Providers each inspect one aspect of an image and extend the metadata
//! document with what they find.

pub mod base;
pub mod dpkg;
pub mod git;
pub mod kpack;

use thiserror::Error;
use tracing::debug;

use crate::config::RunParams;
use crate::image::{AccessorError, Image};
use crate::metadata::Metadata;

/// A provider takes the document built so far and returns an extended copy.
pub type Provider = fn(&dyn Image, &RunParams, &Metadata) -> Result<Contribution, ProviderError>;

/// A provider's extended document, plus the recoverable failures it stepped
/// around while still contributing the rest.
#[derive(Debug)]
pub struct Contribution {
    pub metadata: Metadata,
    pub skipped: Vec<ProviderError>,
}

impl From<Metadata> for Contribution {
    fn from(metadata: Metadata) -> Self {
        Self {
            metadata,
            skipped: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Content was retrieved but could not be understood.
    #[error("{provider}: could not decode {what}: {message}")]
    Decode {
        provider: &'static str,
        what: String,
        message: String,
    },

    /// The provider found something but not enough to describe it.
    #[error("{provider}: {message}")]
    Incomplete {
        provider: &'static str,
        message: String,
    },

    #[error("{provider}: image access failed: {source}")]
    Accessor {
        provider: &'static str,
        #[source]
        source: AccessorError,
    },

    #[error("{provider}: cannot read git repository {path}: {source}")]
    Git {
        provider: &'static str,
        path: String,
        #[source]
        source: git2::Error,
    },
}

impl ProviderError {
    pub fn provider(&self) -> &'static str {
        match self {
            ProviderError::Decode { provider, .. }
            | ProviderError::Incomplete { provider, .. }
            | ProviderError::Accessor { provider, .. }
            | ProviderError::Git { provider, .. } => *provider,
        }
    }

    /// Fatal errors abort the whole run; the rest only drop this provider's
    /// contribution.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProviderError::Decode { .. } | ProviderError::Incomplete { .. } => false,
            ProviderError::Accessor { source, .. } => !source.is_recoverable(),
            ProviderError::Git { .. } => true,
        }
    }

    pub fn accessor(provider: &'static str) -> impl FnOnce(AccessorError) -> ProviderError {
        move |source| ProviderError::Accessor { provider, source }
    }
}

/// How a file's content was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalPath {
    /// Read from the image filesystem.
    Direct,
    /// Printed by `cat` running inside the image.
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    pub content: String,
    pub via: RetrievalPath,
}

/// Read `path` from the image, first directly and then with `cat` inside the
/// image. `Ok(None)` means neither path produced the file.
///
/// Only a non-recoverable accessor failure is an error; an unavailable
/// capability moves on to the next path.
pub fn read_with_fallback(image: &dyn Image, path: &str) -> Result<Option<Retrieved>, AccessorError> {
    match image.read_file(path) {
        Ok(Some(bytes)) => {
            return Ok(Some(Retrieved {
                content: String::from_utf8_lossy(&bytes).into_owned(),
                via: RetrievalPath::Direct,
            }));
        }
        Ok(None) => debug!("{path} not found by direct read"),
        Err(err) if err.is_recoverable() => debug!("direct read of {path} unavailable: {err}"),
        Err(err) => return Err(err),
    }

    match image.run_command(&["cat", path]) {
        Ok(output) if output.success() => Ok(Some(Retrieved {
            content: output.stdout,
            via: RetrievalPath::Command,
        })),
        Ok(output) => {
            debug!("cat {path} exited with {}", output.exit_code);
            Ok(None)
        }
        Err(err) if err.is_recoverable() => {
            debug!("cat {path} unavailable: {err}");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::fake::FakeImage;

    #[test]
    fn test_direct_read_wins() {
        let image = FakeImage::new()
            .with_file("/etc/os-release", "NAME=direct\n")
            .with_command(&["cat", "/etc/os-release"], "NAME=cat\n", 0);

        let got = read_with_fallback(&image, "/etc/os-release").unwrap().unwrap();
        assert_eq!(got.via, RetrievalPath::Direct);
        assert_eq!(got.content, "NAME=direct\n");
        assert!(!image.calls.borrow().iter().any(|c| c.starts_with("run")));
    }

    #[test]
    fn test_falls_back_to_cat_when_direct_read_unavailable() {
        let image = FakeImage::new()
            .without_direct_read()
            .with_command(&["cat", "/etc/os-release"], "NAME=cat\n", 0);

        let got = read_with_fallback(&image, "/etc/os-release").unwrap().unwrap();
        assert_eq!(got.via, RetrievalPath::Command);
        assert_eq!(got.content, "NAME=cat\n");
    }

    #[test]
    fn test_absent_when_file_missing_and_cat_fails() {
        let image = FakeImage::new().with_command(&["cat", "/etc/os-release"], "", 1);
        assert_eq!(read_with_fallback(&image, "/etc/os-release").unwrap(), None);
    }

    #[test]
    fn test_absent_when_file_missing_and_no_runtime() {
        let image = FakeImage::new().without_runtime();
        assert_eq!(read_with_fallback(&image, "/etc/os-release").unwrap(), None);
    }

    #[test]
    fn test_broken_channel_is_an_error() {
        let image = FakeImage::new().broken();
        let err = read_with_fallback(&image, "/etc/os-release").unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_classification() {
        let decode = ProviderError::Decode {
            provider: "kpack",
            what: "label".to_string(),
            message: "eof".to_string(),
        };
        assert!(!decode.is_fatal());
        assert_eq!(decode.provider(), "kpack");

        let unavailable = ProviderError::accessor("deb")(AccessorError::Unavailable {
            capability: "command execution",
            reason: "no runtime".to_string(),
        });
        assert!(!unavailable.is_fatal());

        let broken = ProviderError::accessor("deb")(AccessorError::Archive("truncated".to_string()));
        assert!(broken.is_fatal());
    }
}
