//! Four-way merge of `eng/Version.Details.xml`
//!
//! The changes the VMR made to a repository's dependency manifest are replayed
//! onto the target's current manifest. When the target changed the same
//! dependency independently, the greater version wins; versions that cannot be
//! ordered keep the target's value and leave a warning for a human.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use log::{info, warn};

use super::{compare_versions, FileRevisions};
use crate::comments::{CommentCollector, CommentSeverity};
use crate::config::{repo_sources_path, VERSION_DETAILS_XML};
use crate::error::Result;
use crate::filesystem::FileSystem;
use crate::version_details::{
    compute_changes, DependencyUpdate, VersionDetails, VersionDetailsParser, VersionFileChanges,
};

pub struct VersionDetailsFileMerger<'a> {
    parser: &'a dyn VersionDetailsParser,
    comments: &'a dyn CommentCollector,
    fs: &'a dyn FileSystem,
}

impl<'a> VersionDetailsFileMerger<'a> {
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

    /// Merges the VMR's manifest changes into the target repository.
    ///
    /// The result is written to `src/{mapping}/eng/Version.Details.xml` when
    /// `mapping` is given (the target is the VMR), to `eng/Version.Details.xml`
    /// otherwise, and staged.
    pub fn merge_version_details(
        &self,
        target: FileRevisions<'_>,
        vmr: FileRevisions<'_>,
        mapping: Option<&str>,
    ) -> Result<VersionFileChanges> {
        let target_previous = self.parse(target.read_previous()?)?;
        let target_current = self.parse(target.read_current()?)?;
        let vmr_previous = self.parse(vmr.read_previous()?)?;
        let vmr_current = self.parse(vmr.read_current()?)?;

        let (merged, changes) =
            self.merge(&target_previous, &target_current, &vmr_previous, &vmr_current);

        if changes.is_empty() {
            return Ok(changes);
        }

        let relative_path = match mapping {
            Some(mapping) => format!("{}/{}", repo_sources_path(mapping), VERSION_DETAILS_XML),
            None => VERSION_DETAILS_XML.to_string(),
        };

        info!(
            "Merged {} additions, {} removals and {} updates into {}",
            changes.additions.len(),
            changes.removals.len(),
            changes.updates.len(),
            relative_path
        );

        self.fs.write(
            &target.repo.path().join(Path::new(&relative_path)),
            &merged.to_xml(),
        )?;
        target.repo.stage(&[relative_path.as_str()])?;

        Ok(changes)
    }

    fn parse(&self, content: Option<String>) -> Result<VersionDetails> {
        match content {
            Some(text) => self.parser.parse(&text, true),
            None => Ok(VersionDetails::default()),
        }
    }

    /// Computes the merged manifest without touching any repository.
    pub fn merge(
        &self,
        target_previous: &VersionDetails,
        target_current: &VersionDetails,
        vmr_previous: &VersionDetails,
        vmr_current: &VersionDetails,
    ) -> (VersionDetails, VersionFileChanges) {
        let target_changes: HashMap<String, DependencyUpdate> =
            compute_changes(target_previous, target_current)
                .into_iter()
                .map(|c| (c.name().to_string(), c))
                .collect();

        let mut selected: Vec<DependencyUpdate> = Vec::new();
        for vmr_change in compute_changes(vmr_previous, vmr_current) {
            match target_changes.get(vmr_change.name()) {
                None => selected.push(vmr_change),
                Some(target_change) => {
                    if let Some(change) = self.resolve_conflicting_change(target_change, vmr_change) {
                        selected.push(change);
                    }
                }
            }
        }

        apply_changes(target_current, selected)
    }

    /// Both sides changed the same dependency. Returns the change to apply,
    /// if any.
    fn resolve_conflicting_change(
        &self,
        target_change: &DependencyUpdate,
        vmr_change: DependencyUpdate,
    ) -> Option<DependencyUpdate> {
        let (Some(target_to), Some(vmr_to)) = (&target_change.to, &vmr_change.to) else {
            // A removal on either side keeps what the target has
            return None;
        };

        if target_to.version == vmr_to.version {
            return None;
        }

        match compare_versions(&target_to.version, &vmr_to.version) {
            Some(Ordering::Less) => Some(vmr_change),
            Some(_) => None,
            None => {
                let name = vmr_change.name();
                warn!(
                    "Dependency {} has incomparable versions {} and {}",
                    name, target_to.version, vmr_to.version
                );
                self.comments.add_comment(
                    &format!(
                        "A conflict was detected when merging dependency files.\n\
                         The dependency {} has conflicting incomparable version values `{}` and `{}`.\n\n\
                         Please verify and/or update the dependency version manually.",
                        name, target_to.version, vmr_to.version
                    ),
                    CommentSeverity::Warning,
                );
                None
            }
        }
    }
}

/// Applies removals, then additions, then updates to a copy of `current`.
fn apply_changes(
    current: &VersionDetails,
    selected: Vec<DependencyUpdate>,
) -> (VersionDetails, VersionFileChanges) {
    let mut merged = current.clone();
    let mut changes = VersionFileChanges::default();

    let (removals, rest): (Vec<_>, Vec<_>) = selected.into_iter().partition(|c| c.is_removal());
    let (additions, updates): (Vec<_>, Vec<_>) = rest.into_iter().partition(|c| c.is_addition());

    for removal in removals {
        let name = removal.name().to_string();
        if merged.remove(&name).is_some() {
            changes.removals.push(name);
        }
    }

    for addition in additions {
        if let Some(new) = addition.to {
            merged.upsert(&new);
            changes.additions.push(new);
        }
    }

    for update in updates {
        let Some(new) = update.to else {
            continue;
        };
        // An update of a dependency the target does not have adds it
        match merged.upsert(&new) {
            Some(previous) => changes.updates.push(DependencyUpdate {
                from: Some(previous),
                to: Some(new),
            }),
            None => changes.additions.push(new),
        }
    }

    (merged, changes)
}
