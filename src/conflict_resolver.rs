//! # Conflict Resolvers
//!
//! After a flow has been applied to the head branch, the target branch is
//! merged into it so that the pull request can be merged cleanly. Conflicts
//! in the well-known version files are expected whenever flows cross, and are
//! resolved by picking a side:
//!
//! - the head branch's version (`--ours`) when the head branch already
//!   existed, since it carries the updates of the previous flow,
//! - the target branch's version (`--theirs`) otherwise.
//!
//! Any other conflict aborts the merge and is reported back to the caller.
//!
//! The version files are then merged semantically (see [`crate::merge`]) and
//! the result is committed as a dependency update.

use std::collections::HashSet;

use glob::Pattern;
use log::{debug, error, info};

use crate::build::{Asset, Build};
use crate::codeflow::Codeflow;
use crate::comments::CommentCollector;
use crate::config::{
    repo_sources_path, SourceMapping, DEPENDENCY_FILES, DOTNET_TOOLS_JSON, GLOBAL_JSON,
    SOURCE_MANIFEST_PATH, VERSION_DETAILS_XML,
};
use crate::conflict::{abort_merge, try_merging_branch, BranchMergeOutcome};
use crate::error::{Error, Result};
use crate::filesystem::FileSystem;
use crate::git::LocalGitRepo;
use crate::merge::json::JsonFileMerger;
use crate::merge::version_details::VersionDetailsFileMerger;
use crate::merge::{compare_versions, FileRevisions};
use crate::version_details::{
    build_dependency_update_commit_message, compute_changes, DependencyDetail, DependencyUpdate,
    SourceDependency, VersionDetails, VersionDetailsParser,
};

/// Everything a resolver needs to know about the flow being finished
pub struct ResolverRequest<'a> {
    pub mapping: &'a SourceMapping,
    pub vmr: &'a dyn LocalGitRepo,
    pub repo: &'a dyn LocalGitRepo,
    pub last_flow: &'a Codeflow,
    pub current_flow: &'a Codeflow,
    pub build: &'a Build,
    pub head_branch: &'a str,
    pub target_branch: &'a str,
    /// Glob patterns of asset names that must not be updated
    pub excluded_assets: &'a [String],
    pub head_branch_existed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictResolution {
    /// Files whose conflicts could not be resolved. The merge of the target
    /// branch was aborted when this is not empty.
    pub conflicted_files: Vec<String>,
    pub dependency_updates: Vec<DependencyUpdate>,
}

/// Merges the target branch into the head branch of `repo`, resolving
/// conflicts in `known_files`. Returns the conflicted files when anything
/// else conflicted.
fn merge_target_branch(
    repo: &dyn LocalGitRepo,
    request: &ResolverRequest<'_>,
    known_files: &[String],
) -> Result<Vec<String>> {
    let conflicted = match try_merging_branch(repo, request.head_branch, request.target_branch)? {
        BranchMergeOutcome::Merged => return Ok(Vec::new()),
        BranchMergeOutcome::Conflicted(files) => files,
    };

    let side = if request.head_branch_existed {
        "--ours"
    } else {
        "--theirs"
    };

    for file in &conflicted {
        if !known_files.iter().any(|known| known.eq_ignore_ascii_case(file)) {
            info!(
                "Failed to merge the branch {} into {} due to an unresolvable conflict in {}",
                request.target_branch, request.head_branch, file
            );
            abort_merge(repo)?;
            return Ok(conflicted);
        }

        repo.run_git(
            &["checkout", side, "--", file],
            &format!("Failed to resolve a conflict in {}", file),
        )?;
    }

    let paths: Vec<&str> = conflicted.iter().map(String::as_str).collect();
    repo.stage(&paths)?;
    repo.commit(
        &format!(
            "Merge {} into {}\nAuto-resolved conflicts:\n- {}",
            request.target_branch,
            request.head_branch,
            conflicted.join("\n- ")
        ),
        true,
        None,
    )?;

    info!(
        "Successfully auto-resolved {} conflicts between {} and {}",
        conflicted.len(),
        request.target_branch,
        request.head_branch
    );
    Ok(Vec::new())
}

fn parse_or_default(
    parser: &dyn VersionDetailsParser,
    content: Option<String>,
    include_pinned: bool,
) -> Result<VersionDetails> {
    match content {
        Some(text) => parser.parse(&text, include_pinned),
        None => Ok(VersionDetails::default()),
    }
}

/// Writes a manifest into the working tree and stages it. Returns false when
/// the file already had this content.
fn write_version_details(
    fs: &dyn FileSystem,
    repo: &dyn LocalGitRepo,
    relative_path: &str,
    details: &VersionDetails,
) -> Result<bool> {
    let full_path = repo.path().join(relative_path);
    let content = details.to_xml();
    if fs.read_to_string(&full_path)?.as_deref() == Some(content.as_str()) {
        return Ok(false);
    }

    fs.write(&full_path, &content)?;
    repo.stage(&[relative_path])?;
    Ok(true)
}

fn dependency_commit_message(build: &Build, updates: &[DependencyUpdate]) -> String {
    format!(
        "Update dependencies from {} build {}\n{}",
        build.repository_name(),
        build.id,
        build_dependency_update_commit_message(updates)
    )
}

/// Resolves version file conflicts of a forward flow, where the VMR is the
/// target repository.
pub struct ForwardFlowConflictResolver<'a> {
    parser: &'a dyn VersionDetailsParser,
    comments: &'a dyn CommentCollector,
    fs: &'a dyn FileSystem,
}

impl<'a> ForwardFlowConflictResolver<'a> {
    pub fn new(
        parser: &'a dyn VersionDetailsParser,
        comments: &'a dyn CommentCollector,
        fs: &'a dyn FileSystem,
    ) -> Self {
        Self {
            parser,
            comments,
            fs,
        }
    }

    pub fn try_merging_branch_and_update_dependencies(
        &self,
        request: &ResolverRequest<'_>,
    ) -> Result<ConflictResolution> {
        let sources = repo_sources_path(&request.mapping.name);
        let mut known_files = vec![SOURCE_MANIFEST_PATH.to_string()];
        known_files.extend(DEPENDENCY_FILES.iter().map(|f| format!("{}/{}", sources, f)));

        let conflicted_files = merge_target_branch(request.vmr, request, &known_files)?;
        let dependency_updates = self.merge_dependencies(request)?;

        Ok(ConflictResolution {
            conflicted_files,
            dependency_updates,
        })
    }

    /// Replays the repository's version file changes since the last flow onto
    /// the VMR's copies under `src/{mapping}` and commits the result.
    pub fn merge_dependencies(&self, request: &ResolverRequest<'_>) -> Result<Vec<DependencyUpdate>> {
        let sources = repo_sources_path(&request.mapping.name);
        let vmr_global_json = format!("{}/{}", sources, GLOBAL_JSON);
        let vmr_dotnet_tools = format!("{}/{}", sources, DOTNET_TOOLS_JSON);
        let vmr_version_details = format!("{}/{}", sources, VERSION_DETAILS_XML);

        let last_vmr_sha = request.last_flow.vmr_sha();
        let last_repo_sha = request.last_flow.repo_sha();
        let current_repo_sha = request.current_flow.repo_sha();

        let json = JsonFileMerger::new(self.fs);
        for (vmr_path, repo_path, allow_missing) in [
            (&vmr_global_json, GLOBAL_JSON, false),
            (&vmr_dotnet_tools, DOTNET_TOOLS_JSON, true),
        ] {
            json.merge_jsons(
                FileRevisions::new(request.vmr, vmr_path, last_vmr_sha, request.target_branch),
                FileRevisions::new(request.repo, repo_path, last_repo_sha, current_repo_sha),
                allow_missing,
            )?;
        }

        let changes = VersionDetailsFileMerger::new(self.parser, self.comments, self.fs).merge_version_details(
            FileRevisions::new(request.vmr, &vmr_version_details, last_vmr_sha, request.target_branch),
            FileRevisions::new(request.repo, VERSION_DETAILS_XML, last_repo_sha, current_repo_sha),
            Some(&request.mapping.name),
        )?;

        if !request.vmr.has_working_tree_changes()? {
            debug!("No dependency changes to commit for {}", request.mapping.name);
            return Ok(Vec::new());
        }

        // The VMR copy mirrors the repository's own <Source> tag
        let repo_details = parse_or_default(
            self.parser,
            request.repo.get_file_from_git(VERSION_DETAILS_XML, current_repo_sha)?,
            true,
        )?;
        if let Some(source) = repo_details.source {
            let full_path = request.vmr.path().join(&vmr_version_details);
            let mut merged = parse_or_default(self.parser, self.fs.read_to_string(&full_path)?, true)?;
            if merged.source.as_ref() != Some(&source) {
                merged.source = Some(source);
                write_version_details(self.fs, request.vmr, &vmr_version_details, &merged)?;
            }
        }

        let previous = parse_or_default(
            self.parser,
            request.vmr.get_file_from_git(&vmr_version_details, request.target_branch)?,
            true,
        )?;
        let updates = changes.to_updates(&previous);

        request.vmr.commit(&dependency_commit_message(request.build, &updates), false, None)?;
        Ok(updates)
    }
}

/// Asset name globs excluded from dependency updates
struct AssetFilter {
    patterns: Vec<Pattern>,
}

impl AssetFilter {
    fn new(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            patterns: patterns
                .iter()
                .map(|p| Pattern::new(p))
                .collect::<std::result::Result<_, _>>()?,
        })
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    fn changes(&self, before: &VersionDetails, after: &VersionDetails) -> Vec<DependencyUpdate> {
        compute_changes(before, after)
            .into_iter()
            .filter(|c| !self.is_excluded(c.name()))
            .collect()
    }
}

/// Decisions of a backflow dependency update, before they are applied
#[derive(Debug, Default, PartialEq, Eq)]
struct BackflowPlan {
    /// Asset name and the version the build produced
    build_updates: Vec<(String, String)>,
    version_updates: Vec<DependencyDetail>,
    removals: Vec<String>,
    additions: Vec<DependencyDetail>,
}

/// Picks the newer of two versions, `None` when they cannot be ordered.
fn newer_of<'d>(repo: &'d DependencyDetail, vmr: &'d DependencyDetail) -> Option<&'d DependencyDetail> {
    compare_versions(&repo.version, &vmr.version).map(|ordering| {
        if ordering == std::cmp::Ordering::Greater {
            repo
        } else {
            vmr
        }
    })
}

fn plan_backflow_updates(
    names: &[String],
    build_assets: &[&Asset],
    repo_changes: &[DependencyUpdate],
    vmr_changes: &[DependencyUpdate],
) -> Result<BackflowPlan> {
    let mut plan = BackflowPlan::default();

    for name in names {
        if let Some(asset) = build_assets.iter().find(|a| &a.name == name) {
            info!("Asset {} contained in build, updating to {}", name, asset.version);
            plan.build_updates.push((name.clone(), asset.version.clone()));
            continue;
        }

        let repo_change = repo_changes.iter().find(|c| c.name() == name);
        let vmr_change = vmr_changes.iter().find(|c| c.name() == name);
        let repo_to = repo_change.and_then(|c| c.to.as_ref());
        let vmr_to = vmr_change.and_then(|c| c.to.as_ref());

        let repo_addition = repo_change.is_some_and(DependencyUpdate::is_addition);
        let vmr_addition = vmr_change.is_some_and(DependencyUpdate::is_addition);
        let repo_removal = repo_change.is_some_and(DependencyUpdate::is_removal);
        let vmr_removal = vmr_change.is_some_and(DependencyUpdate::is_removal);
        let repo_updated = repo_change.is_some_and(|c| c.from.is_some() && c.to.is_some());
        let vmr_updated = vmr_change.is_some_and(|c| c.from.is_some() && c.to.is_some());

        let conflict = |repo_change: &DependencyUpdate, vmr_change: &DependencyUpdate| {
            Error::ConflictingDependencyUpdate {
                name: name.clone(),
                repo_change: repo_change.describe(),
                vmr_change: vmr_change.describe(),
            }
        };

        match (repo_to, vmr_to) {
            (Some(repo_to), Some(vmr_to)) if repo_updated && vmr_updated => {
                let chosen = newer_of(repo_to, vmr_to).unwrap_or(repo_to);
                info!(
                    "Asset {} updated to {} in the repo and {} in the VMR, choosing {}",
                    name, repo_to.version, vmr_to.version, chosen.version
                );
                plan.version_updates.push(chosen.clone());
            }
            _ if repo_removal => {
                if let (Some(repo_change), Some(vmr_change)) = (repo_change, vmr_change) {
                    if vmr_addition {
                        return Err(conflict(repo_change, vmr_change));
                    }
                }
                info!("Asset {} was removed from the repo", name);
            }
            _ if vmr_removal => {
                if let (Some(repo_change), Some(vmr_change)) = (repo_change, vmr_change) {
                    if repo_addition {
                        return Err(conflict(repo_change, vmr_change));
                    }
                }
                info!("Asset {} was removed from the VMR, removing from repo too", name);
                plan.removals.push(name.clone());
            }
            (Some(repo_to), Some(vmr_to)) if repo_addition && vmr_addition => {
                let chosen = newer_of(repo_to, vmr_to).unwrap_or(repo_to);
                info!(
                    "Asset {} added in both the repo ({}) and the VMR ({}), choosing {}",
                    name, repo_to.version, vmr_to.version, chosen.version
                );
                plan.additions.push(chosen.clone());
            }
            (Some(repo_to), _) if repo_addition => {
                info!("Asset {} was added in the repo", name);
                plan.additions.push(repo_to.clone());
            }
            (_, Some(vmr_to)) if vmr_addition => {
                info!("Asset {} version {} was added in the VMR, adding it to the repo too", name, vmr_to.version);
                plan.additions.push(vmr_to.clone());
            }
            _ if repo_updated => {
                debug!("Asset {} was updated in the repo, keeping it", name);
            }
            (_, Some(vmr_to)) if vmr_updated => {
                info!("Asset {} updated to {} in the VMR, updating in the repo too", name, vmr_to.version);
                plan.version_updates.push(vmr_to.clone());
            }
            _ => {
                debug!("Asset {} is not part of the build and did not change, skipping", name);
            }
        }
    }

    Ok(plan)
}

/// Resolves version file conflicts of a backflow, where the repository is
/// the target and the build being flown is a VMR build.
pub struct BackflowConflictResolver<'a> {
    parser: &'a dyn VersionDetailsParser,
    fs: &'a dyn FileSystem,
}

impl<'a> BackflowConflictResolver<'a> {
    pub fn new(parser: &'a dyn VersionDetailsParser, fs: &'a dyn FileSystem) -> Self {
        Self { parser, fs }
    }

    pub fn try_merging_branch_and_update_dependencies(
        &self,
        request: &ResolverRequest<'_>,
    ) -> Result<ConflictResolution> {
        let known_files: Vec<String> = DEPENDENCY_FILES.iter().map(|f| f.to_string()).collect();
        let conflicted_files = merge_target_branch(request.repo, request, &known_files)?;

        let dependency_updates = self.backflow_dependencies_and_toolset(request).map_err(|e| {
            error!(
                "Failed to update dependencies after merging {} into {} in {}: {}",
                request.target_branch,
                request.head_branch,
                request.repo.path().display(),
                e
            );
            e
        })?;

        Ok(ConflictResolution {
            conflicted_files,
            dependency_updates,
        })
    }

    fn dependencies_at(&self, repo: &dyn LocalGitRepo, path: &str, r#ref: &str) -> Result<VersionDetails> {
        parse_or_default(self.parser, repo.get_file_from_git(path, r#ref)?, false)
    }

    fn merge_toolset(&self, request: &ResolverRequest<'_>) -> Result<()> {
        let sources = repo_sources_path(&request.mapping.name);
        let last_repo_sha = request.last_flow.repo_sha();
        let last_vmr_sha = request.last_flow.vmr_sha();
        let current_vmr_sha = request.current_flow.vmr_sha();

        let json = JsonFileMerger::new(self.fs);
        for (file, allow_missing) in [(GLOBAL_JSON, false), (DOTNET_TOOLS_JSON, true)] {
            let vmr_path = format!("{}/{}", sources, file);
            json.merge_jsons(
                FileRevisions::new(request.repo, file, last_repo_sha, request.target_branch),
                FileRevisions::new(request.vmr, &vmr_path, last_vmr_sha, current_vmr_sha),
                allow_missing,
            )?;
        }
        Ok(())
    }

    /// Updates the repository's version files to the build being flown and
    /// commits them. Returns the dependency changes relative to the head
    /// branch.
    pub fn backflow_dependencies_and_toolset(
        &self,
        request: &ResolverRequest<'_>,
    ) -> Result<Vec<DependencyUpdate>> {
        let last_flow = request.last_flow;
        info!(
            "Resolving backflow dependency updates between VMR {}..{} and {} {}..{}",
            last_flow.vmr_sha(),
            request.current_flow.vmr_sha(),
            request.mapping.name,
            last_flow.repo_sha(),
            request.target_branch
        );

        self.merge_toolset(request)?;

        let filter = AssetFilter::new(request.excluded_assets)?;
        let vmr_version_details = format!("{}/{}", repo_sources_path(&request.mapping.name), VERSION_DETAILS_XML);

        let previous_repo = self.dependencies_at(request.repo, VERSION_DETAILS_XML, last_flow.repo_sha())?;
        let current_repo = self.dependencies_at(request.repo, VERSION_DETAILS_XML, request.target_branch)?;
        let previous_vmr = match last_flow {
            Codeflow::Backflow { vmr_sha, .. } => {
                self.dependencies_at(request.vmr, &vmr_version_details, vmr_sha)?
            }
            Codeflow::ForwardFlow { .. } => previous_repo.clone(),
        };
        let current_vmr =
            self.dependencies_at(request.vmr, &vmr_version_details, request.current_flow.vmr_sha())?;

        let repo_changes = filter.changes(&previous_repo, &current_repo);
        let vmr_changes = filter.changes(&previous_vmr, &current_vmr);
        let build_assets: Vec<&Asset> = request
            .build
            .assets
            .iter()
            .filter(|a| !filter.is_excluded(&a.name))
            .collect();

        let head_path = request.repo.path().join(VERSION_DETAILS_XML);
        let head = parse_or_default(self.parser, self.fs.read_to_string(&head_path)?, true)?;

        let mut seen = HashSet::new();
        let names: Vec<String> = head
            .dependencies
            .iter()
            .map(|d| d.name.as_str())
            .chain(vmr_changes.iter().map(DependencyUpdate::name))
            .chain(repo_changes.iter().map(DependencyUpdate::name))
            .filter(|name| !filter.is_excluded(name))
            .filter(|name| seen.insert(name.to_string()))
            .map(str::to_string)
            .collect();

        let plan = plan_backflow_updates(&names, &build_assets, &repo_changes, &vmr_changes)?;

        let mut updated = head.clone();
        for name in &plan.removals {
            updated.remove(name);
        }
        for addition in &plan.additions {
            updated.upsert(addition);
        }

        let mut updates: Vec<DependencyDetail> = Vec::new();
        for (name, version) in &plan.build_updates {
            let Some(existing) = updated.find(name).cloned() else {
                continue;
            };
            if existing.version == *version && existing.commit == request.build.commit {
                continue;
            }
            let new = DependencyDetail {
                version: version.clone(),
                commit: request.build.commit.clone(),
                repo_uri: request.build.repository.clone(),
                ..existing
            };
            updated.upsert(&new);
            updates.push(new);
        }
        for update in &plan.version_updates {
            updated.upsert(update);
            updates.push(update.clone());
        }

        updated.source = Some(SourceDependency {
            uri: request.build.repository.clone(),
            mapping: request.mapping.name.clone(),
            sha: request.build.commit.clone(),
            bar_id: Some(request.build.id),
        });
        write_version_details(self.fs, request.repo, VERSION_DETAILS_XML, &updated)?;

        if !request.repo.has_working_tree_changes()? {
            info!("No changes to dependencies in this backflow update");
            return Ok(Vec::new());
        }

        let in_head = |name: &str| head.find(name).is_some();
        let mut result: Vec<DependencyUpdate> = plan
            .additions
            .iter()
            .filter(|a| !in_head(&a.name))
            .map(|a| DependencyUpdate {
                from: None,
                to: Some(a.clone()),
            })
            .collect();
        result.extend(plan.removals.iter().filter_map(|name| {
            head.find(name).map(|d| DependencyUpdate {
                from: Some(d.clone()),
                to: None,
            })
        }));
        result.extend(updates.into_iter().filter_map(|update| {
            head.find(&update.name)
                .or_else(|| plan.additions.iter().find(|a| a.name == update.name))
                .map(|from| DependencyUpdate {
                    from: Some(from.clone()),
                    to: Some(update.clone()),
                })
        }));

        request.repo.stage(&["."])?;
        request
            .repo
            .commit(&dependency_commit_message(request.build, &result), false, None)?;

        Ok(result)
    }
}
