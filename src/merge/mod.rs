//! Structured merges of the version files a code flow keeps in sync
//!
//! Plain git merges of dependency files conflict constantly because both sides
//! bump versions independently. Instead, each tracked file is merged
//! semantically, four-way: the changes the source side made since the last
//! flow are replayed onto the target side's current content, using the
//! target's previous content to detect where the target changed the same
//! value on its own.
//!
//! ## Formats
//!
//! - JSON (json.rs) - `global.json` and `.config/dotnet-tools.json`
//! - Version.Details.xml (version_details.rs) - the dependency manifest
//!
//! ## Common Types
//!
//! [`FileRevisions`] names one side of a four-way merge: a repository, a file
//! inside it and the previous/current revisions to compare.

pub mod json;
pub mod version_details;

use std::cmp::Ordering;

use semver::Version;

use crate::error::Result;
use crate::git::LocalGitRepo;

/// One side of a four-way merge
#[derive(Clone, Copy)]
pub struct FileRevisions<'a> {
    pub repo: &'a dyn LocalGitRepo,
    /// Path of the file relative to the repository root
    pub path: &'a str,
    pub previous_ref: &'a str,
    pub current_ref: &'a str,
}

impl<'a> FileRevisions<'a> {
    pub fn new(
        repo: &'a dyn LocalGitRepo,
        path: &'a str,
        previous_ref: &'a str,
        current_ref: &'a str,
    ) -> Self {
        Self {
            repo,
            path,
            previous_ref,
            current_ref,
        }
    }

    pub fn read_previous(&self) -> Result<Option<String>> {
        self.repo.get_file_from_git(self.path, self.previous_ref)
    }

    pub fn read_current(&self) -> Result<Option<String>> {
        self.repo.get_file_from_git(self.path, self.current_ref)
    }
}

/// Parses a version, tolerating a leading `v`.
pub fn parse_version(value: &str) -> Option<Version> {
    let value = value.trim();
    let value = value.strip_prefix('v').unwrap_or(value);
    Version::parse(value).ok()
}

/// Orders two version strings. `None` when either is not a semantic version.
pub fn compare_versions(first: &str, second: &str) -> Option<Ordering> {
    match (parse_version(first), parse_version(second)) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => None,
    }
}
