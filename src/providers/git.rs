//! The image's own source code, from local git working trees.

use std::collections::HashMap;
use std::path::Path;

use git2::{Oid, Repository, Sort};
use tracing::{info, warn};

use super::{Contribution, ProviderError};
use crate::config::RunParams;
use crate::image::Image;
use crate::metadata::{Dependency, GitSourceMetadata, GitVersion, Metadata, Source};

pub const NAME: &str = "git";

const PREFERRED_REMOTE: &str = "origin";

/// One dependency per working tree. A tree that cannot be fully described
/// is skipped without dropping the others; an unusable repository aborts.
pub fn provider(_image: &dyn Image, params: &RunParams, md: &Metadata) -> Result<Contribution, ProviderError> {
    let mut contribution = Contribution::from(md.clone());
    for path in &params.git_paths {
        match detect(path) {
            Ok(dependency) => contribution.metadata.dependencies.push(dependency),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!("skipping {}: {err}", path.display());
                contribution.skipped.push(err);
            }
        }
    }
    Ok(contribution)
}

/// Describe the repository at `path`: HEAD commit, remote URL, and the tags
/// on the nearest tagged ancestor of HEAD.
pub fn detect(path: &Path) -> Result<Dependency, ProviderError> {
    let git_err = |source: git2::Error| ProviderError::Git {
        provider: NAME,
        path: path.display().to_string(),
        source,
    };

    let repo = Repository::discover(path).map_err(git_err)?;
    let head = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(git_err)?
        .id();

    let url = remote_url(&repo).map_err(git_err)?.ok_or_else(|| ProviderError::Incomplete {
        provider: NAME,
        message: format!("{} has no remote configured", path.display()),
    })?;
    let refs = nearest_tags(&repo, head).map_err(git_err)?;
    info!("{} at {head} ({url}), tags {refs:?}", path.display());

    Ok(Dependency::package(Source::Git {
        version: GitVersion {
            commit: head.to_string(),
        },
        metadata: GitSourceMetadata { url, refs },
    }))
}

/// URL of `origin`, or of the first remote when there is no `origin`.
fn remote_url(repo: &Repository) -> Result<Option<String>, git2::Error> {
    let remotes = repo.remotes()?;
    let name = remotes
        .iter()
        .flatten()
        .find(|n| *n == PREFERRED_REMOTE)
        .or_else(|| remotes.iter().flatten().next());

    match name {
        Some(name) => Ok(repo.find_remote(name)?.url().map(String::from)),
        None => Ok(None),
    }
}

/// Sorted tag names on the first commit reachable from `head` (in
/// topological order) that carries any tag.
fn nearest_tags(repo: &Repository, head: Oid) -> Result<Vec<String>, git2::Error> {
    let mut tags_by_commit: HashMap<Oid, Vec<String>> = HashMap::new();
    for name in repo.tag_names(None)?.iter().flatten() {
        let target = repo
            .revparse_single(&format!("refs/tags/{name}"))
            .and_then(|obj| obj.peel_to_commit());
        if let Ok(commit) = target {
            tags_by_commit
                .entry(commit.id())
                .or_default()
                .push(name.to_string());
        }
    }
    if tags_by_commit.is_empty() {
        return Ok(Vec::new());
    }

    let mut walk = repo.revwalk()?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
    walk.push(head)?;
    for oid in walk {
        if let Some(mut tags) = tags_by_commit.remove(&oid?) {
            tags.sort();
            return Ok(tags);
        }
    }
    Ok(Vec::new())
}
