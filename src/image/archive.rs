//! Images saved as tarballs, in Docker or OCI layout.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{debug, info};

use super::rootfs;
use super::{AccessorError, CommandOutput, Image};

// ---- Docker-format archive structs (manifest.json) ----

#[derive(Deserialize, Serialize)]
struct DockerManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

// ---- OCI-layout archive structs (index.json) ----

#[derive(Deserialize)]
struct OciIndex {
    manifests: Vec<OciDescriptor>,
}

#[derive(Deserialize)]
struct OciDescriptor {
    digest: String,
}

#[derive(Deserialize)]
struct OciManifest {
    config: OciDescriptor,
    layers: Vec<OciDescriptor>,
}

#[derive(Debug)]
enum ArchiveFormat {
    Docker,
    Oci,
}

/// Where the config and layers live inside the input tarball.
struct ArchiveLayout {
    config_path: String,
    layer_paths: Vec<String>,
}

/// An image read from a tarball (`docker save`, `podman save`, or an
/// OCI-layout tar), unpacked into a temporary rootfs.
pub struct ArchiveImage {
    archive_path: PathBuf,
    output_path: PathBuf,
    tag: Option<String>,
    layout: ArchiveLayout,
    raw_config: Vec<u8>,
    labels: HashMap<String, String>,
    rootfs: TempDir,
}

impl ArchiveImage {
    /// Open and unpack `archive_path`. Commits are written to `output_path`.
    pub fn open(
        archive_path: &Path,
        output_path: PathBuf,
        tag: Option<String>,
    ) -> Result<Self, AccessorError> {
        let format = detect_format(archive_path)?;
        debug!("{} is a {format:?} archive", archive_path.display());

        let mut small_files = read_json_entries(archive_path)?;
        let layout = match format {
            ArchiveFormat::Docker => docker_layout(&small_files)?,
            ArchiveFormat::Oci => oci_layout(&small_files)?,
        };

        let raw_config = small_files.remove(&layout.config_path).ok_or_else(|| {
            AccessorError::Archive(format!("config {} not found in archive", layout.config_path))
        })?;
        let config: ImageConfiguration =
            serde_json::from_slice(&raw_config).map_err(|source| AccessorError::Decode {
                what: "image config".to_string(),
                source,
            })?;
        let labels = config
            .config()
            .as_ref()
            .and_then(|c| c.labels().clone())
            .unwrap_or_default();

        let rootfs = tempfile::Builder::new()
            .prefix("deplab-rootfs-")
            .tempdir()
            .map_err(|source| AccessorError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        unpack_layers(archive_path, &layout.layer_paths, rootfs.path())?;
        info!(
            "unpacked {} layers from {}",
            layout.layer_paths.len(),
            archive_path.display()
        );

        Ok(Self {
            archive_path: archive_path.to_path_buf(),
            output_path,
            tag,
            layout,
            raw_config,
            labels,
            rootfs,
        })
    }

    /// Default output location: `<stem>-deplab.tar` next to the input.
    pub fn default_output_path(archive_path: &Path) -> PathBuf {
        let mut stem = archive_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());
        for ext in [".tar.gz", ".tgz", ".tar", ".gz"] {
            if let Some(stripped) = stem.strip_suffix(ext) {
                stem = stripped.to_string();
                break;
            }
        }
        archive_path.with_file_name(format!("{stem}-deplab.tar"))
    }

    fn write_archive(&self, config_name: &str, config_bytes: &[u8]) -> Result<(), AccessorError> {
        let io_err = |source: std::io::Error| AccessorError::Io {
            path: self.output_path.clone(),
            source,
        };

        let manifest = vec![DockerManifestEntry {
            config: config_name.to_string(),
            repo_tags: self.tag.iter().cloned().collect(),
            layers: self.layout.layer_paths.clone(),
        }];
        let manifest_bytes = serde_json::to_vec(&manifest).map_err(|source| AccessorError::Decode {
            what: "manifest.json".to_string(),
            source,
        })?;

        let out = File::create(&self.output_path).map_err(io_err)?;
        let mut builder = tar::Builder::new(out);
        append_bytes(&mut builder, "manifest.json", &manifest_bytes).map_err(io_err)?;
        append_bytes(&mut builder, config_name, config_bytes).map_err(io_err)?;

        let input = File::open(&self.archive_path).map_err(|source| AccessorError::Io {
            path: self.archive_path.clone(),
            source,
        })?;
        let mut archive = tar::Archive::new(input);
        let mut copied = Vec::new();
        for entry_result in archive.entries().map_err(io_err)? {
            let mut entry = entry_result.map_err(io_err)?;
            let entry_path = entry_path(&entry)?;
            if self.layout.layer_paths.contains(&entry_path) && !copied.contains(&entry_path) {
                let mut header = entry.header().clone();
                builder
                    .append_data(&mut header, &entry_path, &mut entry)
                    .map_err(io_err)?;
                copied.push(entry_path);
            }
        }

        builder.into_inner().map_err(io_err)?;
        Ok(())
    }
}

impl Image for ArchiveImage {
    fn config_labels(&self) -> Result<HashMap<String, String>, AccessorError> {
        Ok(self.labels.clone())
    }

    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, AccessorError> {
        let Some(host_path) = rootfs::resolve(self.rootfs.path(), path) else {
            return Ok(None);
        };
        if !host_path.is_file() {
            return Ok(None);
        }
        std::fs::read(&host_path)
            .map(Some)
            .map_err(|source| AccessorError::Io {
                path: host_path,
                source,
            })
    }

    fn list_dir(&self, path: &str) -> Result<Option<Vec<String>>, AccessorError> {
        let Some(host_path) = rootfs::resolve(self.rootfs.path(), path) else {
            return Ok(None);
        };
        if !host_path.is_dir() {
            return Ok(None);
        }
        let entries = std::fs::read_dir(&host_path).map_err(|source| AccessorError::Io {
            path: host_path.clone(),
            source,
        })?;
        let mut names: Vec<String> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(Some(names))
    }

    fn run_command(&self, argv: &[&str]) -> Result<CommandOutput, AccessorError> {
        Err(AccessorError::Unavailable {
            capability: "command execution",
            reason: format!(
                "cannot run '{}' from an image archive",
                argv.first().copied().unwrap_or_default()
            ),
        })
    }

    fn commit_with_label(&self, key: &str, value: &str) -> Result<String, AccessorError> {
        let config_bytes = relabel_config(&self.raw_config, key, value)?;
        let hex = format!("{:x}", Sha256::digest(&config_bytes));
        self.write_archive(&format!("{hex}.json"), &config_bytes)?;
        info!("wrote labelled image to {}", self.output_path.display());
        Ok(format!("sha256:{hex}"))
    }
}

/// Set `config.Labels[key] = value`, keeping every other field as-is.
fn relabel_config(raw: &[u8], key: &str, value: &str) -> Result<Vec<u8>, AccessorError> {
    let decode = |source: serde_json::Error| AccessorError::Decode {
        what: "image config".to_string(),
        source,
    };
    let mut doc: Value = serde_json::from_slice(raw).map_err(decode)?;
    let root = doc
        .as_object_mut()
        .ok_or_else(|| AccessorError::Archive("image config is not a JSON object".to_string()))?;

    let config = root
        .entry("config")
        .or_insert_with(|| Value::Object(Map::new()));
    if !config.is_object() {
        *config = Value::Object(Map::new());
    }
    let labels = config
        .as_object_mut()
        .map(|c| c.entry("Labels").or_insert_with(|| Value::Object(Map::new())))
        .ok_or_else(|| AccessorError::Archive("image config has no config section".to_string()))?;
    if !labels.is_object() {
        *labels = Value::Object(Map::new());
    }
    if let Some(labels) = labels.as_object_mut() {
        labels.insert(key.to_string(), Value::String(value.to_string()));
    }

    serde_json::to_vec(&doc).map_err(decode)
}

fn append_bytes<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data)
}

fn open_archive(path: &Path) -> Result<tar::Archive<File>, AccessorError> {
    let file = File::open(path).map_err(|source| AccessorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(tar::Archive::new(file))
}

fn entry_path<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String, AccessorError> {
    let path = entry
        .path()
        .map_err(|e| AccessorError::Archive(format!("bad entry path: {e}")))?;
    Ok(path
        .to_string_lossy()
        .trim_start_matches("./")
        .to_string())
}

fn archive_err(path: &Path) -> impl Fn(std::io::Error) -> AccessorError + '_ {
    move |source: std::io::Error| AccessorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn detect_format(path: &Path) -> Result<ArchiveFormat, AccessorError> {
    let mut archive = open_archive(path)?;

    for entry_result in archive.entries().map_err(archive_err(path))? {
        let entry = entry_result.map_err(archive_err(path))?;
        match entry_path(&entry)?.as_str() {
            "manifest.json" => return Ok(ArchiveFormat::Docker),
            "index.json" => return Ok(ArchiveFormat::Oci),
            _ => {}
        }
    }

    Err(AccessorError::Archive(
        "unrecognized archive format: no manifest.json or index.json found".to_string(),
    ))
}

/// Collect the JSON documents and small blobs (manifests, configs).
fn read_json_entries(path: &Path) -> Result<HashMap<String, Vec<u8>>, AccessorError> {
    let mut archive = open_archive(path)?;
    let mut files = HashMap::new();

    for entry_result in archive.entries().map_err(archive_err(path))? {
        let mut entry = entry_result.map_err(archive_err(path))?;
        let entry_path = entry_path(&entry)?;
        let wanted = entry_path.ends_with(".json")
            || (entry_path.starts_with("blobs/sha256/") && entry.size() < 1_000_000);
        if wanted {
            let mut data = Vec::new();
            entry.read_to_end(&mut data).map_err(archive_err(path))?;
            files.insert(entry_path, data);
        }
    }

    Ok(files)
}

fn docker_layout(files: &HashMap<String, Vec<u8>>) -> Result<ArchiveLayout, AccessorError> {
    let data = files
        .get("manifest.json")
        .ok_or_else(|| AccessorError::Archive("manifest.json not found in archive".to_string()))?;
    let entries: Vec<DockerManifestEntry> =
        serde_json::from_slice(data).map_err(|source| AccessorError::Decode {
            what: "manifest.json".to_string(),
            source,
        })?;
    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| AccessorError::Archive("empty manifest in archive".to_string()))?;

    Ok(ArchiveLayout {
        config_path: entry.config,
        layer_paths: entry.layers,
    })
}

fn oci_layout(files: &HashMap<String, Vec<u8>>) -> Result<ArchiveLayout, AccessorError> {
    let blob_path = |digest: &str| format!("blobs/sha256/{}", digest.trim_start_matches("sha256:"));
    let decode = |what: &str| {
        let what = what.to_string();
        move |source: serde_json::Error| AccessorError::Decode { what, source }
    };

    let index: OciIndex = serde_json::from_slice(
        files
            .get("index.json")
            .ok_or_else(|| AccessorError::Archive("index.json not found in OCI archive".to_string()))?,
    )
    .map_err(decode("index.json"))?;

    let manifest_desc = index
        .manifests
        .first()
        .ok_or_else(|| AccessorError::Archive("no manifests in index.json".to_string()))?;
    let manifest_path = blob_path(&manifest_desc.digest);
    let manifest: OciManifest = serde_json::from_slice(files.get(&manifest_path).ok_or_else(|| {
        AccessorError::Archive(format!("manifest blob {} not found", manifest_desc.digest))
    })?)
    .map_err(decode("OCI manifest"))?;

    Ok(ArchiveLayout {
        config_path: blob_path(&manifest.config.digest),
        layer_paths: manifest.layers.iter().map(|l| blob_path(&l.digest)).collect(),
    })
}

/// Unpack layers in manifest order. A layer stored in the tarball right when
/// it is needed is applied straight from the tar stream; one that arrives
/// early, or is listed more than once, is spooled to disk until its turn.
fn unpack_layers(archive_path: &Path, layer_paths: &[String], root: &Path) -> Result<(), AccessorError> {
    let spool = tempfile::Builder::new()
        .prefix("deplab-layers-")
        .tempdir()
        .map_err(archive_err(archive_path))?;
    let mut spooled: HashMap<String, PathBuf> = HashMap::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut next = 0;

    let mut archive = open_archive(archive_path)?;
    for entry_result in archive.entries().map_err(archive_err(archive_path))? {
        if next == layer_paths.len() {
            break;
        }
        let mut entry = entry_result.map_err(archive_err(archive_path))?;
        let entry_path = entry_path(&entry)?;
        if !layer_paths.contains(&entry_path) || !seen.insert(entry_path.clone()) {
            continue;
        }

        let needed_again = layer_paths[next + 1..].contains(&entry_path);
        if layer_paths[next] == entry_path && !needed_again {
            debug!("applying layer {entry_path} from the archive stream");
            rootfs::apply_layer_reader(root, &mut entry)?;
            next += 1;
        } else {
            let file = spool.path().join(format!("layer-{}", spooled.len()));
            let mut out = File::create(&file).map_err(archive_err(&file))?;
            io::copy(&mut entry, &mut out).map_err(archive_err(&file))?;
            debug!("spooled layer {entry_path}");
            spooled.insert(entry_path, file);
        }

        next = apply_spooled(root, layer_paths, next, &spooled)?;
    }

    match layer_paths.get(next) {
        Some(missing) => Err(AccessorError::Archive(format!(
            "layer {missing} not found in archive"
        ))),
        None => Ok(()),
    }
}

/// Apply spooled layers from `next` onward for as long as they are available.
fn apply_spooled(
    root: &Path,
    layer_paths: &[String],
    mut next: usize,
    spooled: &HashMap<String, PathBuf>,
) -> Result<usize, AccessorError> {
    while let Some(file) = layer_paths.get(next).and_then(|path| spooled.get(path)) {
        debug!("applying layer {} from spool", layer_paths[next]);
        let reader = File::open(file).map_err(archive_err(file))?;
        rootfs::apply_layer_reader(root, reader)?;
        next += 1;
    }
    Ok(next)
}
