//! Source provenance recorded by kpack/buildpacks in the image config.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info};

use super::{Contribution, ProviderError};
use crate::config::RunParams;
use crate::image::Image;
use crate::metadata::{Dependency, GitSourceMetadata, GitVersion, Metadata, Source};

pub const NAME: &str = "kpack";

/// Label written by kpack builds.
pub const PROJECT_METADATA_LABEL: &str = "io.buildpacks.project.metadata";

#[derive(Debug, Deserialize)]
struct RepoSource {
    source: ProjectSource,
}

#[derive(Debug, Deserialize)]
struct ProjectSource {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    version: HashMap<String, String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

pub fn provider(image: &dyn Image, _params: &RunParams, md: &Metadata) -> Result<Contribution, ProviderError> {
    let labels = image.config_labels().map_err(ProviderError::accessor(NAME))?;

    let Some(raw) = labels.get(PROJECT_METADATA_LABEL).filter(|v| !v.is_empty()) else {
        debug!("no {PROJECT_METADATA_LABEL} label");
        return Ok(md.clone().into());
    };

    Ok(md.with_dependency(parse_project_metadata(raw)?).into())
}

/// Turn the kpack label value into a git dependency.
pub fn parse_project_metadata(raw: &str) -> Result<Dependency, ProviderError> {
    let parsed: RepoSource = serde_json::from_str(raw).map_err(|e| ProviderError::Decode {
        provider: NAME,
        what: PROJECT_METADATA_LABEL.to_string(),
        message: e.to_string(),
    })?;
    let source = parsed.source;
    if !source.kind.is_empty() && source.kind != "git" {
        debug!("kpack source type is {:?}, recording it as git", source.kind);
    }

    let commit = source.version.get("commit").cloned().unwrap_or_default();
    let url = source.metadata.get("repository").cloned().unwrap_or_default();
    info!("kpack built from {url} at {commit}");

    Ok(Dependency::package(Source::Git {
        version: GitVersion { commit },
        metadata: GitSourceMetadata {
            url,
            refs: Vec::new(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::fake::FakeImage;

    const LABEL: &str = r#"{"source":{"type":"git","version":{"commit":"abc123"},"metadata":{"repository":"https://example.com/r.git"}}}"#;

    #[test]
    fn test_label_becomes_git_dependency() {
        let image = FakeImage::new().with_label(PROJECT_METADATA_LABEL, LABEL);
        let md = Metadata::new();
        let next = provider(&image, &RunParams::default(), &md).unwrap().metadata;

        assert_eq!(
            next.dependencies,
            vec![Dependency::package(Source::Git {
                version: GitVersion {
                    commit: "abc123".to_string()
                },
                metadata: GitSourceMetadata {
                    url: "https://example.com/r.git".to_string(),
                    refs: vec![],
                },
            })]
        );
        assert!(next.extends(&md));
    }

    #[test]
    fn test_serialized_shape() {
        let dep = parse_project_metadata(LABEL).unwrap();
        assert_eq!(
            serde_json::to_value(&dep).unwrap(),
            serde_json::json!({
                "type": "package",
                "source": {
                    "type": "git",
                    "version": {"commit": "abc123"},
                    "metadata": {"url": "https://example.com/r.git", "refs": []}
                }
            })
        );
    }

    #[test]
    fn test_absent_label_leaves_metadata_unchanged() {
        let image = FakeImage::new().with_label("maintainer", "someone");
        let md = Metadata::new();
        assert_eq!(provider(&image, &RunParams::default(), &md).unwrap().metadata, md);
    }

    #[test]
    fn test_malformed_label_is_a_decode_error() {
        let image = FakeImage::new().with_label(PROJECT_METADATA_LABEL, "{not json");
        let err = provider(&image, &RunParams::default(), &Metadata::new()).unwrap_err();

        assert!(matches!(err, ProviderError::Decode { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let dep = parse_project_metadata(r#"{"source":{"type":"git"}}"#).unwrap();
        let Source::Git { version, metadata } = dep.source else {
            panic!("expected git source");
        };
        assert_eq!(version.commit, "");
        assert_eq!(metadata.url, "");
    }

    #[test]
    fn test_unreadable_config_is_fatal() {
        let err = provider(&FakeImage::new().broken(), &RunParams::default(), &Metadata::new())
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
