//! Installed Debian packages and configured apt sources.

use tracing::{debug, info};

use super::{Contribution, ProviderError, read_with_fallback};
use crate::collation::BritishCollator;
use crate::config::RunParams;
use crate::image::{AccessorError, Image};
use crate::metadata::{
    DebianPackage, DebianPackageListMetadata, DebianVersion, Dependency, Metadata, PackageSource,
    Source,
};

pub const NAME: &str = "deb";

pub const STATUS_FILE: &str = "/var/lib/dpkg/status";
/// Per-package status files used by distroless-style images.
pub const STATUS_DIR: &str = "/var/lib/dpkg/status.d";
pub const SOURCES_LIST: &str = "/etc/apt/sources.list";
pub const SOURCES_DIR: &str = "/etc/apt/sources.list.d";

pub fn provider(image: &dyn Image, _params: &RunParams, md: &Metadata) -> Result<Contribution, ProviderError> {
    let next = match detect(image)? {
        Some(dependency) => md.with_dependency(dependency),
        None => md.clone(),
    };
    Ok(next.into())
}

/// The dpkg dependency for this image, or `None` when it has no dpkg database.
pub fn detect(image: &dyn Image) -> Result<Option<Dependency>, ProviderError> {
    let accessor = ProviderError::accessor;

    let Some(mut packages) = read_packages(image).map_err(accessor(NAME))? else {
        debug!("no dpkg database found");
        return Ok(None);
    };
    let mut apt_sources = read_sources(image).map_err(accessor(NAME))?;

    let mut collator = BritishCollator::new();
    collator.sort_by_key(&mut packages, |p| p.package.as_str());
    collator.sort_strings(&mut apt_sources);

    let metadata = DebianPackageListMetadata {
        packages,
        apt_sources,
    };
    let sha256 = metadata.digest().map_err(|e| ProviderError::Decode {
        provider: NAME,
        what: "package list".to_string(),
        message: e.to_string(),
    })?;
    info!(
        "found {} packages and {} apt sources",
        metadata.packages.len(),
        metadata.apt_sources.len()
    );

    Ok(Some(Dependency::package(Source::Deb {
        version: DebianVersion { sha256 },
        metadata,
    })))
}

/// Packages from the status file and the status directory. `None` when
/// neither exists.
fn read_packages(image: &dyn Image) -> Result<Option<Vec<DebianPackage>>, AccessorError> {
    let mut found = false;
    let mut packages = Vec::new();

    if let Some(status) = read_with_fallback(image, STATUS_FILE)? {
        found = true;
        packages.extend(parse_status(&status.content));
    }

    if let Some(entries) = list_dir_if_available(image, STATUS_DIR)? {
        for entry in entries.iter().filter(|e| !e.ends_with(".md5sums")) {
            let path = format!("{STATUS_DIR}/{entry}");
            if let Some(bytes) = image.read_file(&path)? {
                found = true;
                packages.extend(parse_status(&String::from_utf8_lossy(&bytes)));
            }
        }
    }

    Ok(found.then_some(packages))
}

fn list_dir_if_available(image: &dyn Image, path: &str) -> Result<Option<Vec<String>>, AccessorError> {
    match image.list_dir(path) {
        Ok(entries) => Ok(entries),
        Err(err) if err.is_recoverable() => {
            debug!("cannot list {path}: {err}");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Every active source line across `sources.list` and `sources.list.d/*.list`.
fn read_sources(image: &dyn Image) -> Result<Vec<String>, AccessorError> {
    let mut sources = Vec::new();

    if let Some(list) = read_with_fallback(image, SOURCES_LIST)? {
        sources.extend(parse_sources(&list.content));
    }

    match image.list_dir(SOURCES_DIR) {
        Ok(Some(entries)) => {
            for entry in entries.iter().filter(|e| e.ends_with(".list")) {
                let path = format!("{SOURCES_DIR}/{entry}");
                if let Some(list) = read_with_fallback(image, &path)? {
                    sources.extend(parse_sources(&list.content));
                }
            }
        }
        Ok(None) => debug!("{SOURCES_DIR} not present"),
        Err(err) if err.is_recoverable() => {
            debug!("cannot list {SOURCES_DIR} ({err}), globbing in the image");
            let glob = format!("cat {SOURCES_DIR}/*.list 2>/dev/null");
            match image.run_command(&["sh", "-c", &glob]) {
                Ok(output) => sources.extend(parse_sources(&output.stdout)),
                Err(err) if err.is_recoverable() => debug!("no shell to glob with: {err}"),
                Err(err) => return Err(err),
            }
        }
        Err(err) => return Err(err),
    }

    Ok(sources)
}

/// Uncommented, non-empty lines, kept verbatim apart from surrounding
/// whitespace.
pub fn parse_sources(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Parse a dpkg status database (or a single status.d entry) into installed
/// packages, in file order.
pub fn parse_status(content: &str) -> Vec<DebianPackage> {
    content
        .split("\n\n")
        .filter_map(|stanza| {
            let fields = StatusFields::parse(stanza);
            let package = fields.to_package();
            if package.is_none() && !stanza.trim().is_empty() {
                debug!("skipping dpkg stanza: {}", stanza.lines().next().unwrap_or_default());
            }
            package
        })
        .collect()
}

#[derive(Default)]
struct StatusFields<'a> {
    package: Option<&'a str>,
    version: Option<&'a str>,
    architecture: Option<&'a str>,
    source: Option<&'a str>,
    status: Option<&'a str>,
}

impl<'a> StatusFields<'a> {
    fn parse(stanza: &'a str) -> Self {
        let mut fields = Self::default();
        for line in stanza.lines() {
            // Continuation lines belong to multi-line fields we do not keep.
            if line.starts_with(' ') || line.starts_with('\t') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "Package" => fields.package = Some(value),
                "Version" => fields.version = Some(value),
                "Architecture" => fields.architecture = Some(value),
                "Source" => fields.source = Some(value),
                "Status" => fields.status = Some(value),
                _ => {}
            }
        }
        fields
    }

    /// Status is `want flag state`; only `installed` counts. Entries without
    /// a Status field (status.d) are installed by definition.
    fn is_installed(&self) -> bool {
        match self.status {
            Some(status) => status.split_whitespace().nth(2) == Some("installed"),
            None => true,
        }
    }

    fn to_package(&self) -> Option<DebianPackage> {
        let package = self.package.filter(|p| !p.is_empty())?;
        let version = self.version.filter(|v| !v.is_empty())?;
        if !self.is_installed() {
            return None;
        }

        // `Source: name` or `Source: name (version)`.
        let (source_package, source_version) = match self.source {
            Some(source) => match source.split_once('(') {
                Some((name, rest)) => (name.trim(), rest.trim_end_matches(')').trim()),
                None => (source.trim(), version),
            },
            None => (package, version),
        };

        Some(DebianPackage {
            package: package.to_string(),
            version: version.to_string(),
            architecture: self.architecture.map(str::to_string),
            source: PackageSource {
                package: source_package.to_string(),
                version: source_version.to_string(),
                upstream_version: upstream_version(source_version).to_string(),
            },
        })
    }
}

/// `[epoch:]upstream[-revision]` to `upstream`.
pub fn upstream_version(version: &str) -> &str {
    let without_epoch = match version.split_once(':') {
        Some((epoch, rest)) if epoch.chars().all(|c| c.is_ascii_digit()) => rest,
        _ => version,
    };
    match without_epoch.rsplit_once('-') {
        Some((upstream, _)) => upstream,
        None => without_epoch,
    }
}
