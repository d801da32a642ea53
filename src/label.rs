//! Stores the finished metadata document as an image label.

use thiserror::Error;
use tracing::info;

use crate::image::{AccessorError, Image};
use crate::metadata::{Metadata, canonical_json};

/// Label key the metadata document is stored under.
pub const METADATA_LABEL: &str = "io.pivotal.metadata";

const DIGEST_PREFIX: &str = "sha256:";

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("failed to serialize metadata")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to commit labelled image")]
    Commit(#[source] AccessorError),

    #[error("commit returned an invalid image digest: {0:?}")]
    InvalidDigest(String),
}

/// Store `metadata` on the image under [`METADATA_LABEL`] and return the new
/// image's `sha256:<hex>` digest.
pub fn write(image: &dyn Image, metadata: &Metadata) -> Result<String, LabelError> {
    let value = String::from_utf8_lossy(&canonical_json(metadata)?).into_owned();

    let digest = image
        .commit_with_label(METADATA_LABEL, &value)
        .map_err(LabelError::Commit)?;
    let digest = digest.trim().to_string();
    if !is_digest(&digest) {
        return Err(LabelError::InvalidDigest(digest));
    }

    info!("labelled image {digest} ({} bytes of metadata)", value.len());
    Ok(digest)
}

/// `sha256:` followed by 64 lowercase hex characters.
pub fn is_digest(s: &str) -> bool {
    s.strip_prefix(DIGEST_PREFIX).is_some_and(|hex| {
        hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    })
}
