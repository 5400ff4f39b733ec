//! Forward flow and backflow commands
//!
//! Both commands:
//! 1. Load the mapping from the VMR's `src/source-mappings.json`
//! 2. Load the build being flown from a JSON file
//! 3. Run the code flow engine with process-backed git
//! 4. Print the outcome

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use vmr_codeflow::build::StaticBuildClient;
use vmr_codeflow::cancellation::CancellationToken;
use vmr_codeflow::clone_cache::CloneManager;
use vmr_codeflow::codeflow::FlowDirection;
use vmr_codeflow::comments::CommentLog;
use vmr_codeflow::config::{find_mapping, load_source_mappings, VmrInfo};
use vmr_codeflow::engine::{CodeflowEngine, CodeflowOptions, CodeflowResult, GitDiffChangeApplier};
use vmr_codeflow::error::Error;
use vmr_codeflow::filesystem::{FileSystem, RealFileSystem};
use vmr_codeflow::git::{ProcessGitRepoFactory, ProcessRepoCloner};
use vmr_codeflow::version_details::XotVersionDetailsParser;

/// Arguments shared by the `forward` and `backflow` commands
#[derive(Args, Debug)]
pub struct FlowArgs {
    /// Name of the source mapping to flow
    #[arg(short, long, value_name = "NAME")]
    pub mapping: String,

    /// URI (or local path) of the repository
    #[arg(short, long, value_name = "URI")]
    pub repo: String,

    /// Path of the local VMR checkout
    #[arg(long, value_name = "PATH", env = "VMR_PATH")]
    pub vmr: PathBuf,

    /// URI of the VMR remote
    #[arg(long, value_name = "URI", default_value = "https://github.com/dotnet/dotnet")]
    pub vmr_uri: String,

    /// Directory for clones and patches (defaults to the user cache directory)
    #[arg(long, value_name = "PATH", env = "VMR_TMP_PATH")]
    pub tmp: Option<PathBuf>,

    /// JSON file describing the build being flown
    #[arg(short, long, value_name = "PATH")]
    pub build_file: PathBuf,

    /// Branch the pull request targets
    #[arg(short, long, value_name = "BRANCH", default_value = "main")]
    pub target_branch: String,

    /// Branch the flow is committed to
    #[arg(long, value_name = "BRANCH")]
    pub head_branch: String,

    /// Glob of asset names never updated by a backflow (repeatable)
    #[arg(long, value_name = "GLOB")]
    pub exclude_asset: Vec<String>,

    /// Report forward flows which only carry build metadata as updates
    #[arg(short, long)]
    pub force: bool,
}

/// Execute a flow in the given direction
pub fn execute(args: FlowArgs, direction: FlowDirection) -> Result<()> {
    let start_time = Instant::now();

    let vmr_info = match &args.tmp {
        Some(tmp) => VmrInfo::new(&args.vmr, tmp),
        None => VmrInfo::with_default_tmp(&args.vmr),
    };

    let mappings = load_source_mappings(&args.vmr)
        .with_context(|| format!("Failed to load source mappings from {}", args.vmr.display()))?;
    let mapping = find_mapping(&mappings, &args.mapping)?.clone();

    let builds = StaticBuildClient::from_file(&args.build_file)
        .with_context(|| format!("Failed to load build from {}", args.build_file.display()))?;
    let build = builds
        .single()
        .cloned()
        .context("The build file must describe exactly one build")?;

    println!("🔄 Flowing {} ({}) of {}", direction, build.commit, mapping.name);

    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let clone_manager = Arc::new(CloneManager::new(
        vmr_info.clone(),
        Arc::new(ProcessRepoCloner),
        Arc::new(ProcessGitRepoFactory),
        fs.clone(),
    ));
    let comments = Arc::new(CommentLog::new());
    let engine = CodeflowEngine::new(
        vmr_info.clone(),
        clone_manager,
        Arc::new(GitDiffChangeApplier::new(fs.clone(), vmr_info.tmp_path.clone())),
        Arc::new(XotVersionDetailsParser),
        Arc::new(builds),
        comments.clone(),
        fs,
    );

    let options = CodeflowOptions {
        mapping,
        build,
        target_branch: args.target_branch,
        head_branch: args.head_branch,
        excluded_assets: args.exclude_asset,
        force_update: args.force,
    };

    let token = CancellationToken::new();
    let result = match direction {
        FlowDirection::Forward => engine.flow_forward(&options, &args.repo, &args.vmr_uri, &token),
        FlowDirection::Backflow => engine.flow_backward(&options, &args.repo, &args.vmr_uri, &token),
    };

    match result {
        Ok(result) => {
            print_outcome(&result, &options);
            for (text, _) in comments.comments() {
                println!("   {}", text.replace('\n', "\n   "));
            }
            println!("   Done in {:.2}s", start_time.elapsed().as_secs_f64());
            Ok(())
        }
        Err(e) if e.is_empty_sync() => {
            println!("✅ {}", e);
            Ok(())
        }
        Err(Error::ConflictInTargetBranch { target_branch, files }) => {
            println!("❌ Changes conflict with {}:", target_branch);
            for file in &files {
                println!("   {}", file);
            }
            anyhow::bail!("Failed to flow changes due to conflicts in the target branch ({})", target_branch)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_outcome(result: &CodeflowResult, options: &CodeflowOptions) {
    if !result.had_updates {
        println!("✅ No meaningful changes to flow");
        return;
    }

    println!("✅ Flowed changes to {}", options.head_branch);
    if result.recreated_previous_flows {
        println!("   The head branch was recreated from the previous flow");
    }
    if !result.dependency_updates.is_empty() {
        println!("   {} dependency updates:", result.dependency_updates.len());
        for update in &result.dependency_updates {
            println!("   - {} {}", update.name(), update.describe());
        }
    }
    if result.had_conflicts() {
        println!("⚠️  Conflicts with {} need manual resolution:", options.target_branch);
        for file in &result.conflicted_files {
            println!("   {}", file);
        }
    }
}
