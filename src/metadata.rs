//! The metadata document written into the image label.
//!
//! Providers receive the document built so far and return an extended copy;
//! see [`Metadata::extends`] for what "extended" means.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Placeholder for any OS identity field that could not be discovered.
pub const UNKNOWN: &str = "unknown";

/// Tag for every dependency entry currently produced.
pub const PACKAGE_DEPENDENCY: &str = "package";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub base: BaseMetadata,
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub provenance: Vec<Provenance>,
}

impl Metadata {
    /// An empty document: unknown base, no dependencies.
    pub fn new() -> Self {
        Self {
            base: BaseMetadata::default(),
            dependencies: Vec::new(),
            provenance: Vec::new(),
        }
    }

    /// Copy of this document with `dependency` appended.
    pub fn with_dependency(&self, dependency: Dependency) -> Self {
        let mut next = self.clone();
        next.dependencies.push(dependency);
        next
    }

    /// Whether `self` only adds to `earlier`: earlier dependencies and
    /// provenance entries are kept as a prefix, and base fields only change
    /// away from `"unknown"`.
    pub fn extends(&self, earlier: &Metadata) -> bool {
        self.dependencies.starts_with(&earlier.dependencies)
            && self.provenance.starts_with(&earlier.provenance)
            && earlier
                .base
                .entries()
                .iter()
                .zip(self.base.entries())
                .all(|((_, before), (_, after))| *before == UNKNOWN || before == &after)
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

/// OS identity of the image, as found in `os-release`.
///
/// Every field is always present; undiscovered values are `"unknown"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseMetadata {
    #[serde(default = "unknown")]
    pub name: String,
    #[serde(default = "unknown")]
    pub version: String,
    #[serde(default = "unknown")]
    pub version_id: String,
    #[serde(default = "unknown")]
    pub id_like: String,
    #[serde(default = "unknown")]
    pub version_codename: String,
    #[serde(default = "unknown")]
    pub pretty_name: String,
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

impl Default for BaseMetadata {
    fn default() -> Self {
        Self {
            name: unknown(),
            version: unknown(),
            version_id: unknown(),
            id_like: unknown(),
            version_codename: unknown(),
            pretty_name: unknown(),
        }
    }
}

impl BaseMetadata {
    /// Keys in document order, paired with their values.
    pub fn entries(&self) -> [(&'static str, &str); 6] {
        [
            ("name", self.name.as_str()),
            ("version", self.version.as_str()),
            ("version_id", self.version_id.as_str()),
            ("id_like", self.id_like.as_str()),
            ("version_codename", self.version_codename.as_str()),
            ("pretty_name", self.pretty_name.as_str()),
        ]
    }

    /// Set a field by its document key. Returns false for unrecognized keys.
    pub fn set(&mut self, key: &str, value: String) -> bool {
        let slot = match key {
            "name" => &mut self.name,
            "version" => &mut self.version,
            "version_id" => &mut self.version_id,
            "id_like" => &mut self.id_like,
            "version_codename" => &mut self.version_codename,
            "pretty_name" => &mut self.pretty_name,
            _ => return false,
        };
        *slot = value;
        true
    }

    pub fn is_unknown(&self) -> bool {
        self.entries().iter().all(|(_, v)| *v == UNKNOWN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: Source,
}

impl Dependency {
    pub fn package(source: Source) -> Self {
        Self {
            kind: PACKAGE_DEPENDENCY.to_string(),
            source,
        }
    }
}

/// Where a dependency comes from; the `type` field selects the payload shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    Deb {
        version: DebianVersion,
        metadata: DebianPackageListMetadata,
    },
    Git {
        version: GitVersion,
        metadata: GitSourceMetadata,
    },
}

impl Source {
    pub fn type_name(&self) -> &'static str {
        match self {
            Source::Deb { .. } => "deb",
            Source::Git { .. } => "git",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebianVersion {
    /// Hex SHA-256 of the canonical JSON of the package list metadata.
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebianPackageListMetadata {
    pub packages: Vec<DebianPackage>,
    pub apt_sources: Vec<String>,
}

impl DebianPackageListMetadata {
    /// Content digest used as this payload's version.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        sha256_hex(self)
    }
}

/// One installed package from the dpkg database.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DebianPackage {
    pub package: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    pub source: PackageSource,
}

/// The source package a binary package was built from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageSource {
    pub package: String,
    pub version: String,
    pub upstream_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitVersion {
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSourceMetadata {
    pub url: String,
    pub refs: Vec<String>,
}

/// The tool that produced the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub name: String,
    pub version: String,
    pub url: String,
}

impl Provenance {
    pub fn deplab() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            url: env!("CARGO_PKG_REPOSITORY").to_string(),
        }
    }
}

/// Compact JSON with object keys sorted, so equal values always serialize
/// to equal bytes.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    // `serde_json::Value` objects are BTreeMap-backed, which sorts keys.
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

pub fn sha256_hex<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = canonical_json(value)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(name: &str, version: &str) -> DebianPackage {
        DebianPackage {
            package: name.to_string(),
            version: version.to_string(),
            architecture: Some("amd64".to_string()),
            source: PackageSource {
                package: name.to_string(),
                version: version.to_string(),
                upstream_version: version.to_string(),
            },
        }
    }

    fn deb_metadata() -> DebianPackageListMetadata {
        DebianPackageListMetadata {
            packages: vec![package("apt", "1.6.11"), package("bash", "4.4.18")],
            apt_sources: vec!["deb http://archive.ubuntu.com/ubuntu/ bionic main".to_string()],
        }
    }

    #[test]
    fn test_new_metadata_has_every_base_key_unknown() {
        let md = Metadata::new();
        let json = serde_json::to_value(&md).unwrap();
        let base = json["base"].as_object().unwrap();

        let mut keys: Vec<&str> = base.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["id_like", "name", "pretty_name", "version", "version_codename", "version_id"]
        );
        assert!(base.values().all(|v| v == UNKNOWN));
        assert_eq!(json["dependencies"], serde_json::json!([]));
    }

    #[test]
    fn test_missing_base_keys_deserialize_as_unknown() {
        let md: Metadata =
            serde_json::from_str(r#"{"base":{"name":"Alpine Linux"},"dependencies":[]}"#).unwrap();
        assert_eq!(md.base.name, "Alpine Linux");
        assert_eq!(md.base.version_codename, UNKNOWN);
        assert!(md.provenance.is_empty());
    }

    #[test]
    fn test_source_serializes_with_type_tag() {
        let dep = Dependency::package(Source::Git {
            version: GitVersion {
                commit: "abc123".to_string(),
            },
            metadata: GitSourceMetadata {
                url: "https://example.com/r.git".to_string(),
                refs: vec![],
            },
        });

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

        let back: Dependency = serde_json::from_value(serde_json::to_value(&dep).unwrap()).unwrap();
        assert_eq!(back, dep);
        assert_eq!(back.source.type_name(), "git");
    }

    #[test]
    fn test_canonical_json_sorts_keys_and_has_no_whitespace() {
        let bytes = canonical_json(&package("apt", "1.6.11")).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            r#"{"architecture":"amd64","package":"apt","source":{"package":"apt","upstream_version":"1.6.11","version":"1.6.11"},"version":"1.6.11"}"#
        );
    }

    #[test]
    fn test_digest_is_stable_and_content_sensitive() {
        let md = deb_metadata();
        let digest = md.digest().unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(md.clone().digest().unwrap(), digest);

        let mut changed = md.clone();
        changed.packages[1].version = "4.4.19".to_string();
        assert_ne!(changed.digest().unwrap(), digest);

        let mut changed = md;
        changed.apt_sources[0].push(' ');
        assert_ne!(changed.digest().unwrap(), digest);
    }

    #[test]
    fn test_extends_accepts_appends_and_base_discovery() {
        let earlier = Metadata::new();
        let mut later = earlier.with_dependency(Dependency::package(Source::Deb {
            version: DebianVersion {
                sha256: "0".repeat(64),
            },
            metadata: deb_metadata(),
        }));
        later.base.name = "Ubuntu".to_string();

        assert!(later.extends(&earlier));
        assert!(!earlier.extends(&later));
    }

    #[test]
    fn test_extends_rejects_overwriting_discovered_base() {
        let mut earlier = Metadata::new();
        earlier.base.name = "Ubuntu".to_string();
        let mut later = earlier.clone();
        later.base.name = "Debian".to_string();

        assert!(!later.extends(&earlier));
    }

    #[test]
    fn test_base_set_rejects_unknown_keys() {
        let mut base = BaseMetadata::default();
        assert!(base.set("version_id", "18.04".to_string()));
        assert!(!base.set("home_url", "https://ubuntu.com".to_string()));
        assert_eq!(base.version_id, "18.04");
        assert!(!base.is_unknown());
        assert!(BaseMetadata::default().is_unknown());
    }
}
