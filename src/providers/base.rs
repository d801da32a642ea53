//! OS identity from `os-release`.

use tracing::{debug, info};

use super::{Contribution, ProviderError, RetrievalPath, read_with_fallback};
use crate::config::RunParams;
use crate::image::{AccessorError, Image};
use crate::metadata::{BaseMetadata, Metadata};

pub const NAME: &str = "base";

/// Checked in order; the second is the fallback location from os-release(5).
pub const OS_RELEASE_PATHS: [&str; 2] = ["/etc/os-release", "/usr/lib/os-release"];

/// os-release keys we record, and the metadata key each maps to.
const KEY_MAP: [(&str, &str); 6] = [
    ("NAME", "name"),
    ("VERSION", "version"),
    ("VERSION_ID", "version_id"),
    ("ID_LIKE", "id_like"),
    ("VERSION_CODENAME", "version_codename"),
    ("PRETTY_NAME", "pretty_name"),
];

pub fn provider(image: &dyn Image, _params: &RunParams, md: &Metadata) -> Result<Contribution, ProviderError> {
    let base = detect(image).map_err(ProviderError::accessor(NAME))?;
    let mut next = md.clone();
    next.base = base;
    Ok(next.into())
}

/// Detect the image's OS identity. Missing or unreadable `os-release` yields
/// all-`"unknown"` fields; only a broken access channel is an error.
pub fn detect(image: &dyn Image) -> Result<BaseMetadata, AccessorError> {
    for path in OS_RELEASE_PATHS {
        if let Some(found) = read_with_fallback(image, path)? {
            let base = parse_os_release(&found.content);
            let via = match found.via {
                RetrievalPath::Direct => "direct read",
                RetrievalPath::Command => "cat",
            };
            info!("read {path} via {via}: {}", base.pretty_name);
            return Ok(base);
        }
    }

    debug!("no os-release found, base is unknown");
    Ok(BaseMetadata::default())
}

/// Parse `KEY=VALUE` lines. Unrecognized keys, comments and malformed lines
/// are ignored; keys not present stay `"unknown"`.
pub fn parse_os_release(content: &str) -> BaseMetadata {
    let mut base = BaseMetadata::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };
        let Some((_, field)) = KEY_MAP.iter().find(|(k, _)| *k == key.trim()) else {
            continue;
        };
        base.set(field, unquote(raw.trim()));
    }

    base
}

fn unquote(raw: &str) -> String {
    if raw.len() >= 2 {
        if let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else {
                    out.push(c);
                }
            }
            return out;
        }
        if let Some(inner) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
            return inner.to_string();
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::fake::FakeImage;
    use crate::metadata::UNKNOWN;

    const BIONIC: &str = r#"NAME="Ubuntu"
VERSION="18.04.2 LTS (Bionic Beaver)"
ID=ubuntu
ID_LIKE=debian
PRETTY_NAME="Ubuntu 18.04.2 LTS"
VERSION_ID="18.04"
HOME_URL="https://www.ubuntu.com/"
VERSION_CODENAME=bionic
UBUNTU_CODENAME=bionic
"#;

    const ALPINE: &str = r#"NAME="Alpine Linux"
ID=alpine
VERSION_ID=3.10.1
PRETTY_NAME="Alpine Linux v3.10"
HOME_URL="https://alpinelinux.org/"
"#;

    #[test]
    fn test_ubuntu_bionic() {
        let image = FakeImage::new().with_file("/etc/os-release", BIONIC);
        let base = detect(&image).unwrap();

        assert_eq!(
            base,
            BaseMetadata {
                name: "Ubuntu".to_string(),
                version: "18.04.2 LTS (Bionic Beaver)".to_string(),
                version_id: "18.04".to_string(),
                id_like: "debian".to_string(),
                version_codename: "bionic".to_string(),
                pretty_name: "Ubuntu 18.04.2 LTS".to_string(),
            }
        );
    }

    #[test]
    fn test_partial_file_defaults_per_key() {
        let image = FakeImage::new().with_file("/etc/os-release", ALPINE);
        let base = detect(&image).unwrap();

        assert_eq!(base.name, "Alpine Linux");
        assert_eq!(base.version_id, "3.10.1");
        assert_eq!(base.version_codename, UNKNOWN);
        assert_eq!(base.id_like, UNKNOWN);
        assert_eq!(base.version, UNKNOWN);
    }

    #[test]
    fn test_no_os_release_anywhere() {
        let image = FakeImage::new().with_command(&["cat", "/etc/os-release"], "", 1);
        let base = detect(&image).unwrap();
        assert!(base.is_unknown());
    }

    #[test]
    fn test_file_present_without_cat() {
        let image = FakeImage::new()
            .without_runtime()
            .with_file("/etc/os-release", BIONIC);

        let base = detect(&image).unwrap();
        assert_eq!(base.name, "Ubuntu");
        assert_eq!(base.version_codename, "bionic");
        assert_eq!(base.version_id, "18.04");
    }

    #[test]
    fn test_cat_without_direct_read() {
        let image = FakeImage::new()
            .without_direct_read()
            .with_command(&["cat", "/etc/os-release"], BIONIC, 0);

        let base = detect(&image).unwrap();
        assert_eq!(base.pretty_name, "Ubuntu 18.04.2 LTS");
    }

    #[test]
    fn test_usr_lib_fallback() {
        let image = FakeImage::new()
            .without_runtime()
            .with_file("/usr/lib/os-release", ALPINE);

        assert_eq!(detect(&image).unwrap().name, "Alpine Linux");
    }

    #[test]
    fn test_garbage_yields_unknown() {
        let image = FakeImage::new().with_file("/etc/os-release", "this is not\nan os-release file\n");
        assert!(detect(&image).unwrap().is_unknown());
    }

    #[test]
    fn test_broken_channel_is_fatal_for_the_provider() {
        let image = FakeImage::new().broken();
        let err = provider(&image, &RunParams::default(), &Metadata::new()).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.provider(), NAME);
    }

    #[test]
    fn test_provider_only_touches_base() {
        let image = FakeImage::new().with_file("/etc/os-release", BIONIC);
        let md = Metadata::new();
        let next = provider(&image, &RunParams::default(), &md).unwrap().metadata;

        assert_eq!(next.base.name, "Ubuntu");
        assert_eq!(next.dependencies, md.dependencies);
        assert!(next.extends(&md));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote(r#""a \"quoted\" value""#), r#"a "quoted" value"#);
        assert_eq!(unquote("'single'"), "single");
        assert_eq!(unquote("bare"), "bare");
        assert_eq!(unquote("\""), "\"");
        assert_eq!(unquote(r#""""#), "");
    }
}
