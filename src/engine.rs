//! # CodeFlow Engine
//!
//! Flows one build of a repository into the VMR (forward flow) or one VMR
//! build into a repository (backflow).
//!
//! ## Overview
//!
//! 1. The source and target repositories are prepared in parallel.
//! 2. The last flows of the mapping are discovered and the head branch is
//!    checked out, or created at the last point of synchronization.
//! 3. [`flow_code`] drives the direction-specific [`CodeflowHooks`]: changes
//!    made in the source since the last flow are applied to the target,
//!    either directly or through a work branch.
//! 4. The target branch is merged into the head branch and the version files
//!    are reconciled by the conflict resolvers.
//! 5. Forward flows that only carry build metadata are reported as having no
//!    updates, unless forced.
//!
//! A patch conflict on a head branch left over by a previous flow rewinds the
//! head branch to the flow before it and flows again, once.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use regex::Regex;

use crate::build::{Build, BuildClient};
use crate::cancellation::CancellationToken;
use crate::change_analyzer::CodeflowChangeAnalyzer;
use crate::clone_cache::{CloneLease, CloneManager};
use crate::codeflow::{get_last_flows, Codeflow, FlowDirection, LastFlows};
use crate::comments::{CommentCollector, CommentSeverity};
use crate::config::{repo_sources_path, SourceManifest, SourceMapping, VmrInfo, DEPENDENCY_FILES, SOURCE_MANIFEST_PATH};
use crate::conflict::conflict_in_target_branch;
use crate::conflict_resolver::{
    BackflowConflictResolver, ConflictResolution, ForwardFlowConflictResolver, ResolverRequest,
};
use crate::error::{Error, Result};
use crate::filesystem::FileSystem;
use crate::git::{short_sha, LocalGitRepo};
use crate::version_details::{DependencyUpdate, VersionDetailsParser};
use crate::work_branch::create_work_branch;

/// What to flow and where
#[derive(Debug, Clone)]
pub struct CodeflowOptions {
    pub mapping: SourceMapping,
    /// Build of the source repository being flown
    pub build: Build,
    pub target_branch: String,
    pub head_branch: String,
    /// Glob patterns of assets never updated by a backflow
    pub excluded_assets: Vec<String>,
    /// Report forward flows carrying only build metadata as updates
    pub force_update: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeflowResult {
    pub had_updates: bool,
    /// Files conflicting with the target branch, left for a human to resolve
    pub conflicted_files: Vec<String>,
    pub dependency_updates: Vec<DependencyUpdate>,
    pub recreated_previous_flows: bool,
    pub repo_path: PathBuf,
}

impl CodeflowResult {
    pub fn had_conflicts(&self) -> bool {
        !self.conflicted_files.is_empty()
    }
}

/// Changes between two commits of the source repository, to be applied to the
/// target repository's working tree
pub struct ChangeRequest<'a> {
    pub direction: FlowDirection,
    pub mapping: &'a SourceMapping,
    pub source: &'a dyn LocalGitRepo,
    pub target: &'a dyn LocalGitRepo,
    pub from_sha: &'a str,
    pub to_sha: &'a str,
    pub target_branch: &'a str,
}

pub trait ChangeApplier: Send + Sync {
    /// Applies and stages the changes. Returns false when there was nothing
    /// to apply. Version files are left to the conflict resolvers.
    fn apply_changes(&self, request: &ChangeRequest<'_>) -> Result<bool>;
}

/// Applies changes as a binary `git diff` patch
pub struct GitDiffChangeApplier {
    fs: Arc<dyn FileSystem>,
    tmp_path: PathBuf,
}

impl GitDiffChangeApplier {
    pub fn new(fs: Arc<dyn FileSystem>, tmp_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            tmp_path: tmp_path.into(),
        }
    }

    /// Files changed in the range that the mapping synchronizes, version
    /// files aside.
    fn included_files(request: &ChangeRequest<'_>) -> Result<Vec<String>> {
        let range = format!("{}..{}", request.from_sha, request.to_sha);
        let changed = request.source.run_git(
            &["diff", "--name-only", "--no-renames", &range],
            &format!(
                "Failed to list the changes of {} in {}",
                range,
                request.source.path().display()
            ),
        )?;

        Ok(changed
            .output_lines()
            .into_iter()
            .filter(|path| !DEPENDENCY_FILES.contains(&path.as_str()))
            .filter(|path| request.mapping.is_included(path))
            .collect())
    }

    fn diff_args(request: &ChangeRequest<'_>, files: &[String]) -> Vec<String> {
        let sources = repo_sources_path(&request.mapping.name);
        let mut args = vec![
            "diff".to_string(),
            "--binary".to_string(),
            "--no-color".to_string(),
            format!("{}..{}", request.from_sha, request.to_sha),
        ];

        match request.direction {
            FlowDirection::Forward => {
                args.push("--".to_string());
                args.extend(files.iter().cloned());
            }
            FlowDirection::Backflow => {
                args.push(format!("--relative={}", sources));
                args.push("--".to_string());
                args.push(sources.clone());
                args.extend(DEPENDENCY_FILES.iter().map(|f| format!(":(exclude){}/{}", sources, f)));
            }
        }
        args
    }
}

impl ChangeApplier for GitDiffChangeApplier {
    fn apply_changes(&self, request: &ChangeRequest<'_>) -> Result<bool> {
        let files = match request.direction {
            FlowDirection::Forward => {
                let files = Self::included_files(request)?;
                if files.is_empty() {
                    debug!(
                        "No synchronized files changed between {} and {}",
                        request.from_sha, request.to_sha
                    );
                    return Ok(false);
                }
                files
            }
            FlowDirection::Backflow => Vec::new(),
        };

        let args = Self::diff_args(request, &files);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let diff = request.source.run_git(
            &args,
            &format!(
                "Failed to create a diff of {}..{} in {}",
                request.from_sha,
                request.to_sha,
                request.source.path().display()
            ),
        )?;

        if diff.stdout.trim().is_empty() {
            debug!("No changes between {} and {}", request.from_sha, request.to_sha);
            return Ok(false);
        }

        let patch_path = self.tmp_path.join(format!(
            "{}-{}-{}.patch",
            request.mapping.name,
            short_sha(request.from_sha),
            short_sha(request.to_sha)
        ));
        self.fs.write(&patch_path, &diff.stdout)?;

        let patch = patch_path.display().to_string();
        let directory = format!("--directory={}", repo_sources_path(&request.mapping.name));
        let mut apply = vec!["apply", "--index", "--whitespace=nowarn"];
        if request.direction == FlowDirection::Forward {
            apply.push(&directory);
        }
        apply.push(&patch);

        info!("Applying {} to {}", patch, request.target.path().display());
        let result = request.target.execute_git(&apply)?;
        if !result.succeeded() {
            return Err(conflict_in_target_branch(
                &result.stderr,
                request.direction,
                &request.mapping.name,
                request.target_branch,
            )?);
        }
        Ok(true)
    }
}

/// Mutable state of one flow, shared between the driver and the hooks
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub mapping: String,
    pub last_flows: LastFlows,
    pub current_flow: Codeflow,
    pub head_branch_existed: bool,
    pub recreated_previous_flows: bool,
}

/// Direction-specific steps of a flow
pub trait CodeflowHooks {
    /// The last flow went the same way as the current one.
    fn same_direction_flow(&self, ctx: &FlowContext) -> Result<bool>;

    fn opposite_direction_flow(&self, ctx: &FlowContext) -> Result<bool>;

    fn detect_crossing_flow(&self, last_flows: &LastFlows) -> Result<Option<Codeflow>>;

    /// Recreates the head branch at the flow preceding the last one and
    /// returns the flows as seen from there.
    fn rewind_to_previous_flow(&self, ctx: &FlowContext) -> Result<LastFlows>;
}

/// The current flow moved onto the target side of `last_flow`.
fn retarget(current_flow: &Codeflow, last_flow: &Codeflow) -> Codeflow {
    match current_flow {
        Codeflow::ForwardFlow { repo_sha, .. } => Codeflow::forward(repo_sha.clone(), last_flow.vmr_sha()),
        Codeflow::Backflow { vmr_sha, .. } => Codeflow::backflow(vmr_sha.clone(), last_flow.repo_sha()),
    }
}

/// Runs a flow through `hooks`. Returns whether anything was flown.
///
/// Fails with `EmptySync` when the source has not moved since the last flow.
pub fn flow_code(hooks: &dyn CodeflowHooks, ctx: &mut FlowContext) -> Result<bool> {
    let direction = ctx.current_flow.direction();
    if source_side_sha(direction, &ctx.last_flows.last_flow) == ctx.current_flow.source_sha() {
        info!("No new commits to flow for {}", ctx.mapping);
        return Err(Error::EmptySync {
            mapping: ctx.mapping.clone(),
        });
    }

    ctx.last_flows.crossing_flow = hooks.detect_crossing_flow(&ctx.last_flows)?;
    if let Some(crossing) = &ctx.last_flows.crossing_flow {
        info!("Detected a crossing {}", crossing);
    }

    loop {
        info!("Last flow was {}, flowing {}", ctx.last_flows.last_flow, ctx.current_flow);
        let outcome = if ctx.last_flows.last_flow.direction() == ctx.current_flow.direction() {
            hooks.same_direction_flow(ctx)
        } else {
            hooks.opposite_direction_flow(ctx)
        };

        match outcome {
            Err(Error::ConflictInTargetBranch { files, .. })
                if ctx.head_branch_existed && !ctx.recreated_previous_flows =>
            {
                warn!(
                    "Failed to apply changes on top of the previous flow (conflicts in {:?}), recreating the previous flows",
                    files
                );
                ctx.last_flows = hooks.rewind_to_previous_flow(ctx)?;
                ctx.current_flow = retarget(&ctx.current_flow, &ctx.last_flows.last_flow);
                ctx.head_branch_existed = false;
                ctx.recreated_previous_flows = true;
            }
            Ok(had_changes) => {
                if !had_changes {
                    info!("Nothing to flow for {}", ctx.mapping);
                }
                return Ok(had_changes);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Commit of a flow on the side changes are read from in `direction`.
fn source_side_sha(direction: FlowDirection, flow: &Codeflow) -> &str {
    match direction {
        FlowDirection::Forward => flow.repo_sha(),
        FlowDirection::Backflow => flow.vmr_sha(),
    }
}

/// Commit of a flow on the side changes are written to in `direction`.
fn target_side_sha(direction: FlowDirection, flow: &Codeflow) -> &str {
    match direction {
        FlowDirection::Forward => flow.vmr_sha(),
        FlowDirection::Backflow => flow.repo_sha(),
    }
}

/// Pull request links for commit titles ending in `(#123)`
pub fn extract_pull_request_uris(titles: &[String], repo_uri: &str) -> Result<Vec<String>> {
    let regex = Regex::new(r"\(#(\d+)\)").map_err(Error::Regex)?;
    let base = repo_uri.trim_end_matches('/');
    let base = base.strip_suffix(".git").unwrap_or(base);

    let mut uris: Vec<String> = Vec::new();
    for title in titles {
        for captures in regex.captures_iter(title) {
            let uri = format!("{}/pull/{}", base, &captures[1]);
            if !uris.contains(&uri) {
                uris.push(uri);
            }
        }
    }
    Ok(uris)
}

fn is_remote_uri(uri: &str) -> bool {
    url::Url::parse(uri)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

pub struct CodeflowEngine {
    vmr_info: VmrInfo,
    clone_manager: Arc<CloneManager>,
    applier: Arc<dyn ChangeApplier>,
    parser: Arc<dyn VersionDetailsParser>,
    build_client: Arc<dyn BuildClient>,
    comments: Arc<dyn CommentCollector>,
    fs: Arc<dyn FileSystem>,
}

impl CodeflowEngine {
    pub fn new(
        vmr_info: VmrInfo,
        clone_manager: Arc<CloneManager>,
        applier: Arc<dyn ChangeApplier>,
        parser: Arc<dyn VersionDetailsParser>,
        build_client: Arc<dyn BuildClient>,
        comments: Arc<dyn CommentCollector>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            vmr_info,
            clone_manager,
            applier,
            parser,
            build_client,
            comments,
            fs,
        }
    }

    pub fn vmr_info(&self) -> &VmrInfo {
        &self.vmr_info
    }

    /// Flows `options.build` of the repository at `repo_uri` into the VMR.
    pub fn flow_forward(
        &self,
        options: &CodeflowOptions,
        repo_uri: &str,
        vmr_uri: &str,
        cancellation: &CancellationToken,
    ) -> Result<CodeflowResult> {
        ensure_enabled(&options.mapping)?;
        info!(
            "Flowing {} at {} into {} of the VMR",
            options.mapping.name,
            short_sha(&options.build.commit),
            options.head_branch
        );

        let _lease = self.lease_clones(&options.mapping)?;
        let (repo, vmr) = rayon::join(
            || {
                self.clone_manager.prepare_clone_for_mapping(
                    &options.mapping,
                    &[repo_uri.to_string()],
                    &options.build.commit,
                    cancellation,
                )
            },
            || self.prepare_target_vmr(options, vmr_uri, cancellation),
        );

        self.flow(FlowDirection::Forward, options, repo?, vmr?, cancellation)
    }

    /// Flows the VMR build `options.build` into the repository at `repo_uri`.
    pub fn flow_backward(
        &self,
        options: &CodeflowOptions,
        repo_uri: &str,
        vmr_uri: &str,
        cancellation: &CancellationToken,
    ) -> Result<CodeflowResult> {
        ensure_enabled(&options.mapping)?;
        info!(
            "Flowing VMR build {} ({}) into {} of {}",
            options.build.id,
            short_sha(&options.build.commit),
            options.head_branch,
            options.mapping.name
        );

        let _lease = self.lease_clones(&options.mapping)?;
        let (vmr, repo) = rayon::join(
            || {
                self.clone_manager.prepare_vmr_clone(
                    &[vmr_uri.to_string()],
                    &[options.build.commit.as_str()],
                    &options.build.commit,
                    cancellation,
                )
            },
            || {
                self.clone_manager
                    .prepare_clone_for_mapping(
                        &options.mapping,
                        &[repo_uri.to_string()],
                        &options.target_branch,
                        cancellation,
                    )
                    .map_err(|e| target_branch_not_found(e, &options.target_branch, repo_uri))
            },
        );

        self.flow(FlowDirection::Backflow, options, repo?, vmr?, cancellation)
    }

    /// Keeps other flows off the working trees of this flow's clones until
    /// the flow is done.
    fn lease_clones(&self, mapping: &SourceMapping) -> Result<CloneLease> {
        self.clone_manager.lease(&[
            self.clone_manager.mapping_clone_path(mapping),
            self.clone_manager.vmr_clone_path(),
        ])
    }

    fn prepare_target_vmr(
        &self,
        options: &CodeflowOptions,
        vmr_uri: &str,
        cancellation: &CancellationToken,
    ) -> Result<Arc<dyn LocalGitRepo>> {
        self.clone_manager
            .prepare_vmr_clone(
                &[vmr_uri.to_string()],
                &[options.target_branch.as_str()],
                &options.target_branch,
                cancellation,
            )
            .map_err(|e| target_branch_not_found(e, &options.target_branch, vmr_uri))
    }

    fn flow(
        &self,
        direction: FlowDirection,
        options: &CodeflowOptions,
        repo: Arc<dyn LocalGitRepo>,
        vmr: Arc<dyn LocalGitRepo>,
        cancellation: &CancellationToken,
    ) -> Result<CodeflowResult> {
        let flow = DirectionalFlow {
            engine: self,
            direction,
            options,
            repo,
            vmr,
            cancellation,
        };
        let target = flow.target();
        let mapping = &options.mapping;

        cancellation.check()?;
        let head_branch_existed = target.execute_git(&["checkout", &options.head_branch])?.succeeded();
        let last_flows = get_last_flows(
            &mapping.name,
            flow.repo.as_ref(),
            flow.vmr.as_ref(),
            direction,
            self.parser.as_ref(),
        )?;

        if head_branch_existed {
            info!("Head branch {} already exists, flowing on top of it", options.head_branch);
        } else {
            let sha = target_side_sha(direction, &last_flows.last_flow);
            info!("Creating head branch {} at {}", options.head_branch, short_sha(sha));
            target.checkout(sha)?;
            target.create_branch(&options.head_branch, true)?;
        }

        let current_flow = match direction {
            FlowDirection::Forward => Codeflow::forward(options.build.commit.clone(), last_flows.last_flow.vmr_sha()),
            FlowDirection::Backflow => Codeflow::backflow(options.build.commit.clone(), last_flows.last_flow.repo_sha()),
        };
        flow.ensure_linearity(&current_flow, &last_flows)?;

        let mut ctx = FlowContext {
            mapping: mapping.name.clone(),
            last_flows,
            current_flow,
            head_branch_existed,
            recreated_previous_flows: false,
        };
        let had_updates = flow_code(&flow, &mut ctx)?;

        let mut result = CodeflowResult {
            had_updates,
            recreated_previous_flows: ctx.recreated_previous_flows,
            repo_path: flow.repo.path().to_path_buf(),
            ..Default::default()
        };

        if had_updates {
            cancellation.check()?;
            let resolution = flow.resolve_conflicts(&ctx, head_branch_existed)?;
            result.conflicted_files = resolution.conflicted_files;
            result.dependency_updates = resolution.dependency_updates;

            if direction == FlowDirection::Forward {
                self.comment_included_prs(
                    flow.repo.as_ref(),
                    ctx.last_flows.last_forward_flow.repo_sha(),
                    &options.build.commit,
                    &mapping.default_remote,
                )?;
            }
        }

        if direction == FlowDirection::Forward
            && result.had_updates
            && !result.had_conflicts()
            && !options.force_update
            && !head_branch_existed
        {
            let analyzer = CodeflowChangeAnalyzer::new(self.parser.clone(), self.build_client.clone());
            result.had_updates = analyzer.forward_flow_has_meaningful_changes(
                flow.vmr.as_ref(),
                &mapping.name,
                &options.head_branch,
                &options.target_branch,
            )?;
            if !result.had_updates {
                info!("The flow of {} only carries build metadata", mapping.name);
            }
        }

        Ok(result)
    }

    fn comment_included_prs(
        &self,
        repo: &dyn LocalGitRepo,
        last_commit: &str,
        current_commit: &str,
        repo_uri: &str,
    ) -> Result<()> {
        if !is_remote_uri(repo_uri) {
            return Ok(());
        }

        let range = format!("{}..{}", last_commit, current_commit);
        let log = repo.run_git(
            &["log", "--pretty=%s", &range],
            &format!(
                "Failed to get the list of commits between {} and {} in {}",
                last_commit,
                current_commit,
                repo.path().display()
            ),
        )?;

        let uris = extract_pull_request_uris(&log.output_lines(), repo_uri)?;
        if uris.is_empty() {
            info!("No PR numbers were found in the commit messages of {}", range);
            return Ok(());
        }

        let mut text = String::from("PRs from original repository included in this codeflow update:");
        for uri in uris {
            text.push_str("\n- ");
            text.push_str(&uri);
        }
        self.comments.add_comment(&text, CommentSeverity::Information);
        Ok(())
    }
}

fn ensure_enabled(mapping: &SourceMapping) -> Result<()> {
    if mapping.disable_synchronization {
        return Err(Error::InvalidSynchronization {
            message: format!("Synchronization of {} is disabled", mapping.name),
        });
    }
    Ok(())
}

fn target_branch_not_found(error: Error, branch: &str, uri: &str) -> Error {
    match error {
        Error::MissingRefs { .. } | Error::ProcessFailed { .. } => {
            error!("Failed to find branch {} in {}: {}", branch, uri, error);
            Error::TargetBranchNotFound {
                branch: branch.to_string(),
                uri: uri.to_string(),
            }
        }
        other => other,
    }
}

/// The engine bound to one flow and its repositories
struct DirectionalFlow<'e> {
    engine: &'e CodeflowEngine,
    direction: FlowDirection,
    options: &'e CodeflowOptions,
    repo: Arc<dyn LocalGitRepo>,
    vmr: Arc<dyn LocalGitRepo>,
    cancellation: &'e CancellationToken,
}

impl DirectionalFlow<'_> {
    fn source(&self) -> &Arc<dyn LocalGitRepo> {
        match self.direction {
            FlowDirection::Forward => &self.repo,
            FlowDirection::Backflow => &self.vmr,
        }
    }

    fn target(&self) -> &Arc<dyn LocalGitRepo> {
        match self.direction {
            FlowDirection::Forward => &self.vmr,
            FlowDirection::Backflow => &self.repo,
        }
    }

    /// The flown commit must descend from the last flow read from the same
    /// source.
    fn ensure_linearity(&self, current_flow: &Codeflow, last_flows: &LastFlows) -> Result<()> {
        let (repo, last_flow_sha) = match self.direction {
            FlowDirection::Forward => (&self.repo, last_flows.last_forward_flow.repo_sha()),
            FlowDirection::Backflow => match &last_flows.last_backflow {
                Some(backflow) => (&self.vmr, backflow.vmr_sha()),
                None => return Ok(()),
            },
        };

        let current_sha = current_flow.source_sha();
        if !repo.is_ancestor_commit(last_flow_sha, current_sha)? {
            return Err(Error::NonLinearCodeflow {
                current_sha: current_sha.to_string(),
                last_flow_sha: last_flow_sha.to_string(),
            });
        }
        Ok(())
    }

    /// Applies the source changes since the last flow onto the target,
    /// through a work branch cut at `checkout_sha` when requested.
    fn flow_changes(&self, ctx: &FlowContext, checkout_sha: &str, use_work_branch: bool) -> Result<bool> {
        let target = self.target();
        let mapping = &self.options.mapping;
        let head_branch = self.options.head_branch.as_str();

        let work_branch = if use_work_branch {
            target.checkout(checkout_sha)?;
            Some(create_work_branch(
                target.clone(),
                &ctx.current_flow.branch_name(),
                Some(head_branch),
            )?)
        } else {
            None
        };

        self.cancellation.check()?;
        let from_sha = source_side_sha(self.direction, &ctx.last_flows.last_flow);
        let to_sha = ctx.current_flow.source_sha();
        let applied = self.engine.applier.apply_changes(&ChangeRequest {
            direction: self.direction,
            mapping,
            source: self.source().as_ref(),
            target: target.as_ref(),
            from_sha,
            to_sha,
            target_branch: &self.options.target_branch,
        })?;

        if !applied {
            if let Some(work_branch) = &work_branch {
                target.checkout(work_branch.original_branch())?;
            }
            return Ok(false);
        }

        if self.direction == FlowDirection::Forward {
            self.update_source_manifest()?;
        }

        let message = format!(
            "[{}] Source update {}..{}",
            mapping.name,
            short_sha(from_sha),
            short_sha(to_sha)
        );
        target.commit(&message, false, None)?;

        if let Some(work_branch) = work_branch {
            match work_branch.merge_back(&message) {
                Ok(()) => {}
                Err(Error::WorkBranchInConflict { stderr, .. }) => {
                    return Err(conflict_in_target_branch(
                        &stderr,
                        self.direction,
                        &mapping.name,
                        &self.options.target_branch,
                    )?);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(true)
    }

    /// Records the flown build in the VMR's source manifest.
    fn update_source_manifest(&self) -> Result<()> {
        let mapping = &self.options.mapping;
        let build = &self.options.build;
        let path = self.vmr.path().join(SOURCE_MANIFEST_PATH);

        let content = self
            .engine
            .fs
            .read_to_string(&path)?
            .ok_or_else(|| Error::InvalidSynchronization {
                message: format!("Failed to find {}", path.display()),
            })?;
        let mut manifest = SourceManifest::parse(&content)?;
        let remote_uri = manifest
            .repo_version(&mapping.name)
            .map(|r| r.remote_uri.clone())
            .unwrap_or_else(|_| mapping.default_remote.clone());

        manifest.update_repo(&mapping.name, &remote_uri, &build.commit, Some(build.id));
        self.engine.fs.write(&path, &manifest.to_json()?)?;
        self.vmr.stage(&[SOURCE_MANIFEST_PATH])
    }

    fn resolve_conflicts(&self, ctx: &FlowContext, head_branch_existed: bool) -> Result<ConflictResolution> {
        let request = ResolverRequest {
            mapping: &self.options.mapping,
            vmr: self.vmr.as_ref(),
            repo: self.repo.as_ref(),
            last_flow: &ctx.last_flows.last_flow,
            current_flow: &ctx.current_flow,
            build: &self.options.build,
            head_branch: &self.options.head_branch,
            target_branch: &self.options.target_branch,
            excluded_assets: &self.options.excluded_assets,
            head_branch_existed,
        };

        let engine = self.engine;
        match self.direction {
            FlowDirection::Forward => ForwardFlowConflictResolver::new(
                engine.parser.as_ref(),
                engine.comments.as_ref(),
                engine.fs.as_ref(),
            )
            .try_merging_branch_and_update_dependencies(&request),
            FlowDirection::Backflow => {
                BackflowConflictResolver::new(engine.parser.as_ref(), engine.fs.as_ref())
                    .try_merging_branch_and_update_dependencies(&request)
            }
        }
    }
}

impl CodeflowHooks for DirectionalFlow<'_> {
    fn same_direction_flow(&self, ctx: &FlowContext) -> Result<bool> {
        let checkout_sha = target_side_sha(self.direction, &ctx.last_flows.last_flow);
        self.flow_changes(ctx, checkout_sha, ctx.head_branch_existed)
    }

    fn opposite_direction_flow(&self, ctx: &FlowContext) -> Result<bool> {
        let flows = &ctx.last_flows;
        let checkout_flow = if ctx.head_branch_existed {
            match self.direction {
                FlowDirection::Forward => &flows.last_forward_flow,
                FlowDirection::Backflow => flows.last_backflow.as_ref().unwrap_or(&flows.last_flow),
            }
        } else {
            &flows.last_flow
        };
        self.flow_changes(ctx, target_side_sha(self.direction, checkout_flow), true)
    }

    fn detect_crossing_flow(&self, last_flows: &LastFlows) -> Result<Option<Codeflow>> {
        match (self.direction, &last_flows.last_flow) {
            (FlowDirection::Forward, Codeflow::Backflow { vmr_sha, .. }) => {
                let forward = &last_flows.last_forward_flow;
                Ok(self
                    .vmr
                    .is_ancestor_commit(vmr_sha, forward.vmr_sha())?
                    .then(|| forward.clone()))
            }
            (FlowDirection::Backflow, Codeflow::ForwardFlow { repo_sha, .. }) => {
                let Some(backflow) = &last_flows.last_backflow else {
                    return Ok(None);
                };
                Ok(self
                    .repo
                    .is_ancestor_commit(repo_sha, backflow.repo_sha())?
                    .then(|| backflow.clone()))
            }
            _ => Ok(None),
        }
    }

    fn rewind_to_previous_flow(&self, ctx: &FlowContext) -> Result<LastFlows> {
        let previous = match self.direction {
            FlowDirection::Forward => ctx.last_flows.last_forward_flow.clone(),
            FlowDirection::Backflow => {
                ctx.last_flows
                    .last_backflow
                    .clone()
                    .ok_or_else(|| Error::InvalidSynchronization {
                        message: format!("No previous backflow of {} to recreate", ctx.mapping),
                    })?
            }
        };

        info!("Recreating {} from {}", self.options.head_branch, previous);
        let target = self.target();
        target.reset_working_tree()?;
        self.vmr.force_checkout(previous.vmr_sha())?;
        self.repo.force_checkout(previous.repo_sha())?;

        let last_flows = get_last_flows(
            &ctx.mapping,
            self.repo.as_ref(),
            self.vmr.as_ref(),
            self.direction,
            self.engine.parser.as_ref(),
        )?;

        target.checkout(target_side_sha(self.direction, &last_flows.last_flow))?;
        target.create_branch(&self.options.head_branch, true)?;
        Ok(last_flows)
    }
}
