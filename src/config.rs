//! Run configuration from command-line flags and the environment.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

/// Environment override for the container CLI.
pub const DOCKER_ENV: &str = "DEPLAB_DOCKER";
const DEFAULT_DOCKER: &str = "docker";

/// What to label: an image known to the daemon, or a tarball on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Reference(String),
    Archive(PathBuf),
}

/// The part of the configuration providers see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParams {
    /// Local git working trees describing the image's own source.
    pub git_paths: Vec<PathBuf>,
    /// Abort on recoverable provider errors instead of skipping them.
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub source: ImageSource,
    pub params: RunParams,
    /// Repository tag for the labelled image.
    pub tag: Option<String>,
    /// Destination archive when labelling a tarball.
    pub output_tar: Option<PathBuf>,
    /// Also write the metadata document here.
    pub metadata_file: Option<PathBuf>,
    /// Container CLI binary.
    pub docker: String,
}

/// Raw command-line values, before validation.
#[derive(Debug, Default)]
pub struct CliOptions {
    pub image: Option<String>,
    pub image_tar: Option<PathBuf>,
    pub git: Vec<PathBuf>,
    pub tag: Option<String>,
    pub output_tar: Option<PathBuf>,
    pub metadata_file: Option<PathBuf>,
    pub docker: Option<String>,
    pub strict: bool,
}

/// Build the run configuration from CLI flags, falling back to the
/// environment for the container CLI.
pub fn init_from_cli(opts: CliOptions) -> Result<AppConfig> {
    resolve(opts, std::env::var(DOCKER_ENV).ok())
}

fn resolve(opts: CliOptions, docker_env: Option<String>) -> Result<AppConfig> {
    let source = match (opts.image, opts.image_tar) {
        (Some(reference), None) => ImageSource::Reference(reference),
        (None, Some(path)) => ImageSource::Archive(path),
        (Some(_), Some(_)) => bail!("--image and --image-tar are mutually exclusive"),
        (None, None) => bail!("one of --image or --image-tar is required"),
    };

    if opts.output_tar.is_some() && matches!(source, ImageSource::Reference(_)) {
        bail!("--output-tar only applies to --image-tar inputs");
    }
    if let (ImageSource::Archive(input), Some(output)) = (&source, &opts.output_tar) {
        if same_file(input, output) {
            bail!(
                "--output-tar {} would overwrite the --image-tar input",
                output.display()
            );
        }
    }

    let docker = opts
        .docker
        .or(docker_env)
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DOCKER.to_string());

    Ok(AppConfig {
        source,
        params: RunParams {
            git_paths: opts.git,
            strict: opts.strict,
        },
        tag: opts.tag,
        output_tar: opts.output_tar,
        metadata_file: opts.metadata_file,
        docker,
    })
}

/// Compare canonical paths when both exist, the paths as given otherwise.
fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
