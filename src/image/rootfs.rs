//! Layer unpacking into a scratch directory and in-image path resolution.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use tar::EntryType;
use tracing::{debug, warn};

use super::AccessorError;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const MAX_SYMLINK_HOPS: usize = 40;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Apply one layer (plain or gzip-compressed tar) read from `reader` on top
/// of `root`.
pub fn apply_layer_reader<R: Read>(root: &Path, reader: R) -> Result<(), AccessorError> {
    let mut reader = BufReader::new(reader);
    let is_gzip = reader
        .fill_buf()
        .map_err(|source| AccessorError::Io {
            path: root.to_path_buf(),
            source,
        })?
        .starts_with(&GZIP_MAGIC);

    if is_gzip {
        apply_layer(root, flate2::bufread::GzDecoder::new(reader))
    } else {
        apply_layer(root, reader)
    }
}

fn apply_layer<R: Read>(root: &Path, reader: R) -> Result<(), AccessorError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|source| AccessorError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    for entry_result in entries {
        let mut entry = match entry_result {
            Ok(e) => e,
            Err(err) => {
                debug!("skipping unreadable layer entry: {err}");
                continue;
            }
        };

        let path = match entry.path() {
            Ok(p) => p.to_path_buf(),
            Err(_) => continue,
        };
        let Some(relative) = sanitize(&path) else {
            debug!("skipping layer entry outside the rootfs: {}", path.display());
            continue;
        };

        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if name == OPAQUE_WHITEOUT {
            if let Some(dir) = whiteout_dir(root, &relative) {
                clear_dir(&dir);
            }
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            if matches!(hidden, "" | "." | "..") {
                debug!("ignoring malformed whiteout {}", relative.display());
                continue;
            }
            if let Some(dir) = whiteout_dir(root, &relative) {
                remove_path(&dir.join(hidden));
            }
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Char | EntryType::Block | EntryType::Fifo => continue,
            _ => {}
        }

        if let Err(err) = entry.unpack_in(root) {
            debug!("failed to unpack {}: {err}", relative.display());
        }
    }

    Ok(())
}

/// The directory a whiteout entry applies to, with symlinks resolved as the
/// image would see them. `None` when it does not exist or would land outside
/// `root`.
fn whiteout_dir(root: &Path, relative: &Path) -> Option<PathBuf> {
    let parent = relative.parent().unwrap_or(Path::new(""));
    let dir = resolve(root, &format!("/{}", parent.to_string_lossy()))?;
    if !dir.starts_with(root) {
        warn!("ignoring whiteout {} that escapes the rootfs", relative.display());
        return None;
    }
    Some(dir)
}

/// Strip leading `/` and `./`, rejecting paths that climb out with `..`.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn clear_dir(dir: &Path) {
    let Ok(children) = fs::read_dir(dir) else {
        return;
    };
    for child in children.flatten() {
        remove_path(&child.path());
    }
}

fn remove_path(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(err) = result {
        debug!("failed to apply whiteout for {}: {err}", path.display());
    }
}

/// Resolve an absolute in-image path to a host path under `root`, following
/// symlinks as if `root` were `/`. Returns `None` when any component is missing.
pub fn resolve(root: &Path, path: &str) -> Option<PathBuf> {
    let mut pending: Vec<String> = path.split('/').rev().map(str::to_string).collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        match part.as_str() {
            "" | "." => continue,
            ".." => {
                resolved.pop();
                continue;
            }
            _ => {}
        }

        let candidate = resolved.join(&part);
        let meta = fs::symlink_metadata(root.join(&candidate)).ok()?;

        if meta.file_type().is_symlink() {
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return None;
            }
            let target = fs::read_link(root.join(&candidate)).ok()?;
            let target = target.to_string_lossy();
            if target.starts_with('/') {
                resolved = PathBuf::new();
            }
            pending.extend(target.split('/').rev().map(str::to_string));
        } else {
            resolved = candidate;
        }
    }

    Some(root.join(resolved))
}
