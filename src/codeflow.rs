//! # Flow Records
//!
//! A [`Codeflow`] is the pair of commits at which a repository and the VMR
//! were last in agreement, together with the direction changes went in:
//!
//! - **forward flow**: repository → VMR. The VMR records it in
//!   `src/source-manifest.json` (the mapping's `commitSha`).
//! - **backflow**: VMR → repository. The repository records it in the
//!   `<Source>` tag of its `eng/Version.Details.xml`.
//!
//! The commit on the *other* side of each record is the commit that last
//! touched that line, found with `git blame`.
//!
//! [`get_last_flows`] works out which of the two most recent flows happened
//! last, which is the base every new flow builds on.

use std::fmt;

use log::{debug, warn};

use crate::config::{SourceManifest, SOURCE_MANIFEST_PATH, VERSION_DETAILS_XML};
use crate::error::{Error, Result};
use crate::git::{short_sha, GitObjectType, LocalGitRepo};
use crate::version_details::VersionDetailsParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowDirection {
    Forward,
    Backflow,
}

impl fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowDirection::Forward => write!(f, "forward"),
            FlowDirection::Backflow => write!(f, "backflow"),
        }
    }
}

/// One synchronization between a repository and the VMR
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codeflow {
    ForwardFlow { repo_sha: String, vmr_sha: String },
    Backflow { vmr_sha: String, repo_sha: String },
}

impl Codeflow {
    pub fn forward(repo_sha: impl Into<String>, vmr_sha: impl Into<String>) -> Self {
        Codeflow::ForwardFlow {
            repo_sha: repo_sha.into(),
            vmr_sha: vmr_sha.into(),
        }
    }

    pub fn backflow(vmr_sha: impl Into<String>, repo_sha: impl Into<String>) -> Self {
        Codeflow::Backflow {
            vmr_sha: vmr_sha.into(),
            repo_sha: repo_sha.into(),
        }
    }

    pub fn direction(&self) -> FlowDirection {
        match self {
            Codeflow::ForwardFlow { .. } => FlowDirection::Forward,
            Codeflow::Backflow { .. } => FlowDirection::Backflow,
        }
    }

    pub fn repo_sha(&self) -> &str {
        match self {
            Codeflow::ForwardFlow { repo_sha, .. } | Codeflow::Backflow { repo_sha, .. } => repo_sha,
        }
    }

    pub fn vmr_sha(&self) -> &str {
        match self {
            Codeflow::ForwardFlow { vmr_sha, .. } | Codeflow::Backflow { vmr_sha, .. } => vmr_sha,
        }
    }

    /// Commit changes were taken from.
    pub fn source_sha(&self) -> &str {
        match self {
            Codeflow::ForwardFlow { repo_sha, .. } => repo_sha,
            Codeflow::Backflow { vmr_sha, .. } => vmr_sha,
        }
    }

    /// Commit changes were applied on top of.
    pub fn target_sha(&self) -> &str {
        match self {
            Codeflow::ForwardFlow { vmr_sha, .. } => vmr_sha,
            Codeflow::Backflow { repo_sha, .. } => repo_sha,
        }
    }

    /// Name of the work branch used while flowing, e.g. `forward/abc1234-def5678`.
    pub fn branch_name(&self) -> String {
        format!(
            "{}/{}-{}",
            self.direction(),
            short_sha(self.source_sha()),
            short_sha(self.target_sha())
        )
    }
}

impl fmt::Display for Codeflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codeflow::ForwardFlow { repo_sha, vmr_sha } => {
                write!(f, "forward flow {} → {}", short_sha(repo_sha), short_sha(vmr_sha))
            }
            Codeflow::Backflow { vmr_sha, repo_sha } => {
                write!(f, "backflow {} → {}", short_sha(vmr_sha), short_sha(repo_sha))
            }
        }
    }
}

/// The most recent flows of a mapping in each direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastFlows {
    /// Whichever of the two happened last
    pub last_flow: Codeflow,
    pub last_backflow: Option<Codeflow>,
    pub last_forward_flow: Codeflow,
    /// A flow in the opposite direction that crossed the last flow
    pub crossing_flow: Option<Codeflow>,
}

impl LastFlows {
    fn new(last_flow: Codeflow, last_backflow: Option<Codeflow>, last_forward_flow: Codeflow) -> Self {
        Self {
            last_flow,
            last_backflow,
            last_forward_flow,
            crossing_flow: None,
        }
    }
}

/// The last forward flow, from the VMR's source manifest at `vmr_ref`.
pub fn get_last_forward_flow(vmr: &dyn LocalGitRepo, mapping: &str, vmr_ref: Option<&str>) -> Result<Codeflow> {
    let content = vmr
        .get_file_from_git(SOURCE_MANIFEST_PATH, vmr_ref.unwrap_or("HEAD"))?
        .ok_or_else(|| Error::InvalidSynchronization {
            message: format!("{} not found in {}", SOURCE_MANIFEST_PATH, vmr.path().display()),
        })?;

    let manifest = SourceManifest::parse(&content)?;
    let repo_sha = manifest.repo_version(mapping)?.commit_sha.clone();
    let vmr_sha = vmr.blame_line(SOURCE_MANIFEST_PATH, &repo_sha, vmr_ref)?;

    Ok(Codeflow::forward(repo_sha, vmr_sha))
}

/// The last backflow, from the `<Source>` tag of the repository's
/// `Version.Details.xml`. `None` when the repository has never received one.
pub fn get_last_backflow(
    repo: &dyn LocalGitRepo,
    parser: &dyn VersionDetailsParser,
) -> Result<Option<Codeflow>> {
    let Some(content) = repo.get_file_from_git(VERSION_DETAILS_XML, "HEAD")? else {
        return Ok(None);
    };

    let Some(source) = parser.parse(&content, true)?.source else {
        return Ok(None);
    };

    // The <Source> tag precedes all dependencies, so its line is found first
    let repo_sha = repo.blame_line(VERSION_DETAILS_XML, &source.sha, None)?;
    Ok(Some(Codeflow::backflow(source.sha, repo_sha)))
}

/// Finds the last flows of a mapping and decides which one was the last.
///
/// SHAs are compared in the repository changes are about to flow from: the
/// VMR for a backflow, the repository for a forward flow.
pub fn get_last_flows(
    mapping: &str,
    repo: &dyn LocalGitRepo,
    vmr: &dyn LocalGitRepo,
    current_direction: FlowDirection,
    parser: &dyn VersionDetailsParser,
) -> Result<LastFlows> {
    let last_forward_flow = get_last_forward_flow(vmr, mapping, None)?;
    let Some(last_backflow) = get_last_backflow(repo, parser)? else {
        debug!("No backflow recorded for {}, the last flow was {}", mapping, last_forward_flow);
        return Ok(LastFlows::new(last_forward_flow.clone(), None, last_forward_flow));
    };

    let (source_repo, backward_sha, forward_sha) = match current_direction {
        FlowDirection::Backflow => (vmr, last_backflow.vmr_sha(), last_forward_flow.vmr_sha()),
        FlowDirection::Forward => (repo, last_backflow.repo_sha(), last_forward_flow.repo_sha()),
    };
    let source_repo_is_repo = current_direction == FlowDirection::Forward;

    let both_exist = source_repo.get_object_type(backward_sha)? == GitObjectType::Commit
        && source_repo.get_object_type(forward_sha)? == GitObjectType::Commit;
    if !both_exist {
        return Err(Error::InvalidSynchronization {
            message: format!(
                "Failed to find one or both commits {}, {} in {}",
                backward_sha,
                forward_sha,
                source_repo.path().display()
            ),
        });
    }

    if backward_sha == forward_sha {
        let last_flow = if source_repo_is_repo {
            last_forward_flow.clone()
        } else {
            last_backflow.clone()
        };
        return Ok(LastFlows::new(last_flow, Some(last_backflow), last_forward_flow));
    }

    let is_backward_older = source_repo.is_ancestor_commit(backward_sha, forward_sha)?;
    let is_forward_older = source_repo.is_ancestor_commit(forward_sha, backward_sha)?;
    if is_backward_older == is_forward_older {
        return Err(Error::InvalidSynchronization {
            message: format!(
                "Failed to determine which commit of {} is older ({}, {})",
                source_repo.path().display(),
                backward_sha,
                forward_sha
            ),
        });
    }

    if current_direction == FlowDirection::Forward
        && is_forward_older
        && !vmr.is_ancestor_commit(last_backflow.vmr_sha(), "HEAD")?
    {
        warn!(
            "The last backflow of {} ({}) is not part of the current VMR history, ignoring it",
            mapping, last_backflow
        );
        return Ok(LastFlows::new(last_forward_flow.clone(), Some(last_backflow), last_forward_flow));
    }

    let last_flow = if is_backward_older {
        last_forward_flow.clone()
    } else {
        last_backflow.clone()
    };
    Ok(LastFlows::new(last_flow, Some(last_backflow), last_forward_flow))
}
