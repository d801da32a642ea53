//! Runs the providers in order over one image and collects their errors.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RunParams;
use crate::image::Image;
use crate::metadata::{Metadata, Provenance};
use crate::providers::{self, Contribution, Provider, ProviderError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{} provider failed", .0.provider())]
    Provider(#[source] ProviderError),

    #[error("{provider} provider removed or rewrote existing metadata")]
    NonMonotonic { provider: &'static str },
}

/// Final document plus the provider errors that were skipped over.
#[derive(Debug)]
pub struct Outcome {
    pub metadata: Metadata,
    pub errors: Vec<ProviderError>,
}

/// Providers run one at a time, in registration order, each seeing the
/// document produced by the ones before it.
pub struct Pipeline {
    providers: Vec<(&'static str, Provider)>,
}

impl Pipeline {
    /// Base image first, then package listings, then source control and
    /// build-system provenance.
    pub fn standard() -> Self {
        Self::new(vec![
            (providers::base::NAME, providers::base::provider as Provider),
            (providers::dpkg::NAME, providers::dpkg::provider),
            (providers::git::NAME, providers::git::provider),
            (providers::kpack::NAME, providers::kpack::provider),
        ])
    }

    pub fn new(providers: Vec<(&'static str, Provider)>) -> Self {
        Self { providers }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|(name, _)| *name).collect()
    }

    pub fn run(&self, image: &dyn Image, params: &RunParams) -> Result<Outcome, PipelineError> {
        let mut metadata = Metadata::new();
        metadata.provenance.push(Provenance::deplab());
        let mut errors = Vec::new();
        debug!("providers: {}", self.names().join(", "));

        for &(name, provider) in &self.providers {
            info!("running {name} provider");
            match provider(image, params, &metadata) {
                Ok(Contribution { metadata: next, skipped }) => {
                    if !next.extends(&metadata) {
                        return Err(PipelineError::NonMonotonic { provider: name });
                    }
                    if let Some(added) = next.dependencies.get(metadata.dependencies.len()..) {
                        for dep in added {
                            debug!("{name} added a {} dependency", dep.source.type_name());
                        }
                    }
                    metadata = next;

                    for err in skipped {
                        if err.is_fatal() || params.strict {
                            return Err(PipelineError::Provider(err));
                        }
                        warn!("{name} provider skipped part of its input: {err}");
                        errors.push(err);
                    }
                }
                Err(err) if err.is_fatal() || params.strict => {
                    return Err(PipelineError::Provider(err));
                }
                Err(err) => {
                    warn!("skipping {name} provider: {err}");
                    errors.push(err);
                }
            }
        }

        Ok(Outcome { metadata, errors })
    }
}
