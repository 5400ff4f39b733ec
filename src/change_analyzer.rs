//! Decides whether a forward flow brought anything besides the metadata the
//! VMR stamps on every update.
//!
//! A forward flow that only touched the mapping's version files, the source
//! manifest and `eng/common` is not worth a pull request when the version
//! changes are explained by the builds recorded in the manifest's `<Source>`
//! tag.

use std::sync::Arc;

use log::{debug, info};

use crate::build::{Build, BuildClient};
use crate::config::{repo_sources_path, DEPENDENCY_FILES, ENG_COMMON_DIR, SOURCE_MANIFEST_PATH, VERSION_DETAILS_XML};
use crate::error::Result;
use crate::git::LocalGitRepo;
use crate::version_details::{compute_changes, VersionDetails, VersionDetailsParser};

/// Diff lines of `Version.Details.xml` that only carry build metadata
const METADATA_LINE_PREFIXES: [&str; 4] = ["<Source ", "<Dependency ", "<Sha>", "<Uri>"];

pub struct CodeflowChangeAnalyzer {
    parser: Arc<dyn VersionDetailsParser>,
    build_client: Arc<dyn BuildClient>,
}

impl CodeflowChangeAnalyzer {
    pub fn new(parser: Arc<dyn VersionDetailsParser>, build_client: Arc<dyn BuildClient>) -> Self {
        Self {
            parser,
            build_client,
        }
    }

    pub fn forward_flow_has_meaningful_changes(
        &self,
        vmr: &dyn LocalGitRepo,
        mapping: &str,
        head_branch: &str,
        target_branch: &str,
    ) -> Result<bool> {
        let base = vmr.merge_base(target_branch, head_branch)?;
        let range = format!("{}..{}", base, head_branch);

        let changed = vmr
            .run_git(
                &["diff", "--name-only", &range],
                &format!("Failed to list files changed between {} and {}", base, head_branch),
            )?
            .output_lines();

        let sources = repo_sources_path(mapping);
        let eng_common = format!("{}/{}/", sources, ENG_COMMON_DIR);
        let allowed: Vec<String> = std::iter::once(SOURCE_MANIFEST_PATH.to_string())
            .chain(DEPENDENCY_FILES.iter().map(|f| format!("{}/{}", sources, f)))
            .collect();

        if let Some(unexpected) = changed
            .iter()
            .find(|path| !path.starts_with(&eng_common) && !allowed.contains(path))
        {
            info!("Forward flow of {} changed {}, the flow is meaningful", mapping, unexpected);
            return Ok(true);
        }

        let version_details = format!("{}/{}", sources, VERSION_DETAILS_XML);
        if !changed.contains(&version_details) {
            debug!("Forward flow of {} only changed expected files", mapping);
            return Ok(false);
        }

        let diff = vmr.run_git(
            &["diff", "-U0", "-w", &range, "--", &version_details],
            &format!("Failed to diff {} between {} and {}", version_details, base, head_branch),
        )?;
        if has_non_metadata_changes(&diff.stdout) {
            info!("{} has changes besides build metadata", version_details);
            return Ok(true);
        }

        let before = self.parse_at(vmr, &version_details, &base)?;
        let after = self.parse_at(vmr, &version_details, head_branch)?;
        self.has_unexplained_dependency_changes(&before, &after)
    }

    fn parse_at(&self, vmr: &dyn LocalGitRepo, path: &str, r#ref: &str) -> Result<VersionDetails> {
        match vmr.get_file_from_git(path, r#ref)? {
            Some(text) => self.parser.parse(&text, true),
            None => Ok(VersionDetails::default()),
        }
    }

    /// Version changes are explained when both manifests point at builds and
    /// every changed dependency moved from an asset of the old build to an
    /// asset of the new one.
    fn has_unexplained_dependency_changes(&self, before: &VersionDetails, after: &VersionDetails) -> Result<bool> {
        let bar_id = |details: &VersionDetails| details.source.as_ref().and_then(|s| s.bar_id);
        let (Some(before_id), Some(after_id)) = (bar_id(before), bar_id(after)) else {
            info!("Version.Details.xml does not record the builds it came from");
            return Ok(true);
        };

        let before_build = self.build_client.get_build(before_id)?;
        let after_build = self.build_client.get_build(after_id)?;
        if before_build.is_equivalent_to(&after_build) {
            return Ok(false);
        }

        for change in compute_changes(before, after) {
            let explained = match (&change.from, &change.to) {
                (Some(from), Some(to)) => produced_by(&before_build, &from.name, &from.version)
                    && produced_by(&after_build, &to.name, &to.version),
                _ => false,
            };
            if !explained {
                info!(
                    "Dependency {} {} outside of builds {} and {}",
                    change.name(),
                    change.describe(),
                    before_id,
                    after_id
                );
                return Ok(true);
            }
        }

        debug!("Dependency changes are explained by builds {} and {}", before_id, after_id);
        Ok(false)
    }
}

fn produced_by(build: &Build, name: &str, version: &str) -> bool {
    build
        .assets
        .iter()
        .any(|a| a.name == name && a.version == version)
}

/// Looks at the added and removed lines of a `-U0` diff for anything but
/// dependency metadata.
fn has_non_metadata_changes(diff: &str) -> bool {
    diff.lines()
        .filter(|line| !line.starts_with("+++") && !line.starts_with("---"))
        .filter_map(|line| line.strip_prefix('+').or_else(|| line.strip_prefix('-')))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .any(|line| !METADATA_LINE_PREFIXES.iter().any(|p| line.starts_with(p)))
}
