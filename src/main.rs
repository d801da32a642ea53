mod cmd;
mod collation;
mod config;
mod image;
mod label;
mod metadata;
mod pipeline;
mod progress;
mod providers;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::CliOptions;

#[derive(Parser)]
#[command(name = "deplab")]
#[command(about = "Label a container image with the dependencies it was built from")]
#[command(version)]
struct Cli {
    /// Image reference known to (or pullable by) the container daemon
    #[arg(long, conflicts_with = "image_tar", required_unless_present = "image_tar")]
    image: Option<String>,

    /// Path to an image tarball (docker save or OCI layout)
    #[arg(long)]
    image_tar: Option<PathBuf>,

    /// Local git working tree the image was built from (repeatable)
    #[arg(long)]
    git: Vec<PathBuf>,

    /// Repository tag for the labelled image
    #[arg(long)]
    tag: Option<String>,

    /// Where to write the labelled tarball (only with --image-tar)
    #[arg(long, requires = "image_tar")]
    output_tar: Option<PathBuf>,

    /// Also write the metadata document to this file
    #[arg(long)]
    metadata_file: Option<PathBuf>,

    /// Container CLI to use [env: DEPLAB_DOCKER, default: docker]
    #[arg(long)]
    docker: Option<String>,

    /// Fail instead of skipping providers that hit recoverable errors
    #[arg(long)]
    strict: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::init_from_cli(CliOptions {
        image: cli.image,
        image_tar: cli.image_tar,
        git: cli.git,
        tag: cli.tag,
        output_tar: cli.output_tar,
        metadata_file: cli.metadata_file,
        docker: cli.docker,
        strict: cli.strict,
    })?;

    cmd::label::run(&cfg)
}
