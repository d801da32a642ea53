use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use crossterm::style::{self, Stylize};

use crate::config::{AppConfig, ImageSource, RunParams};
use crate::image::Image;
use crate::image::archive::ArchiveImage;
use crate::image::daemon::DaemonImage;
use crate::label;
use crate::metadata::Metadata;
use crate::pipeline::{Outcome, Pipeline};
use crate::progress::Spinner;

pub fn run(cfg: &AppConfig) -> Result<()> {
    let spinner = Spinner::new("Opening image...");
    let image = match open_image(cfg) {
        Ok(image) => image,
        Err(err) => {
            spinner.fail("Could not open image");
            return Err(err);
        }
    };

    spinner.set_message("Collecting dependency metadata...");
    let outcome = match collect(image.as_ref(), &cfg.params) {
        Ok(outcome) => outcome,
        Err(err) => {
            spinner.fail("Metadata collection aborted");
            return Err(err);
        }
    };
    spinner.finish(summary(&outcome));

    if let Some(path) = &cfg.metadata_file {
        write_metadata_file(path, &outcome.metadata)?;
        eprintln!(
            "{} Wrote {}",
            "✔".green(),
            style::style(path.display()).cyan()
        );
    }

    let spinner = Spinner::new("Writing label...");
    let digest = match label::write(image.as_ref(), &outcome.metadata) {
        Ok(digest) => digest,
        Err(err) => {
            spinner.fail("Labelling failed");
            return Err(err).context("Failed to label image");
        }
    };
    spinner.finish(format!("Labelled {}", describe(cfg)));

    println!("{digest}");
    Ok(())
}

fn open_image(cfg: &AppConfig) -> Result<Box<dyn Image>> {
    let image: Box<dyn Image> = match &cfg.source {
        ImageSource::Reference(reference) => Box::new(
            DaemonImage::open(cfg.docker.clone(), reference.clone(), cfg.tag.clone())
                .with_context(|| format!("Failed to open image {reference}"))?,
        ),
        ImageSource::Archive(path) => {
            let output = cfg
                .output_tar
                .clone()
                .unwrap_or_else(|| ArchiveImage::default_output_path(path));
            Box::new(
                ArchiveImage::open(path, output, cfg.tag.clone())
                    .with_context(|| format!("Failed to open image archive {}", path.display()))?,
            )
        }
    };
    Ok(image)
}

/// Run the standard providers against `image`.
pub fn collect(image: &dyn Image, params: &RunParams) -> Result<Outcome> {
    Pipeline::standard()
        .run(image, params)
        .context("Failed to collect image metadata")
}

/// Pretty-printed copy of the document, for humans and CI artifacts.
pub fn write_metadata_file(path: &Path, metadata: &Metadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    fs::write(path, json + "\n")
        .with_context(|| format!("Failed to write metadata to {}", path.display()))
}

fn summary(outcome: &Outcome) -> String {
    let base = &outcome.metadata.base;
    let mut line = format!(
        "Collected {} dependencies ({})",
        outcome.metadata.dependencies.len(),
        if base.is_unknown() {
            "unknown base"
        } else {
            base.pretty_name.as_str()
        }
    );
    if !outcome.errors.is_empty() {
        line.push_str(&format!(", {} providers skipped", outcome.errors.len()));
    }
    line
}

fn describe(cfg: &AppConfig) -> String {
    match &cfg.source {
        ImageSource::Reference(reference) => reference.clone(),
        ImageSource::Archive(path) => cfg
            .output_tar
            .clone()
            .unwrap_or_else(|| ArchiveImage::default_output_path(path))
            .display()
            .to_string(),
    }
}
