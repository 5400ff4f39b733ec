//! # Error Handling
//!
//! This module defines the centralized error type for the code flow engine.
//! It uses `thiserror` to derive a single `Error` enum whose variants follow
//! the failure modes of a synchronization run:
//!
//! - **Process failures**: a git invocation exited with a non-zero code. The
//!   variant keeps the exit code and captured stderr. These are surfaced and
//!   never retried, apart from the single whitespace retry in `work_branch`.
//! - **Merge conflicts**: a squash merge of a work branch hit a content
//!   conflict. This is terminal and needs a human.
//! - **Conflicts in the target branch**: a failed merge whose output was parsed
//!   into a list of conflicted files (see `conflict`).
//! - **Invalid synchronization state**: the recorded last flow does not match
//!   what the repositories contain.
//! - **Empty sync**: nothing worth flowing. It is raised so callers can stop
//!   early, but it is not a failure in spirit.
//!
//! `Result<T>` is the alias used throughout the crate.

use thiserror::Error;

/// Main error type for code flow operations
#[derive(Error, Debug)]
pub enum Error {
    /// A git process ran but returned a non-zero exit code.
    #[error("{message} (exit code {exit_code}): {stderr}")]
    ProcessFailed {
        message: String,
        exit_code: i32,
        stderr: String,
    },

    /// The git executable could not be started at all.
    #[error("Git command failed in {path}: {command} - {stderr}")]
    GitCommand {
        command: String,
        path: String,
        stderr: String,
    },

    /// Squash-merging a work branch back failed on a content conflict.
    #[error("Failed to merge back the work branch {branch} into {target}: {stderr}")]
    WorkBranchInConflict {
        branch: String,
        target: String,
        stderr: String,
    },

    /// A merge failed and the conflicting files were extracted from its output.
    #[error("Failed to flow changes due to conflicts in the target branch ({target_branch})")]
    ConflictInTargetBranch {
        target_branch: String,
        /// Deduplicated, direction-normalized paths.
        files: Vec<String>,
    },

    /// The recorded last flow is inconsistent with repository contents.
    #[error("Invalid synchronization state: {message}")]
    InvalidSynchronization { message: String },

    /// The commit being flown does not descend from the last flown commit.
    #[error("Cannot flow commit {current_sha} as it's not a descendant of the last flown commit {last_flow_sha}")]
    NonLinearCodeflow {
        current_sha: String,
        last_flow_sha: String,
    },

    /// A flow found nothing to synchronize.
    #[error("No changes to synchronize for {mapping}")]
    EmptySync { mapping: String },

    /// A dependency was removed on one side and added on the other.
    #[error("Conflicting updates of dependency {name}: {repo_change} in the repository, {vmr_change} in the VMR")]
    ConflictingDependencyUpdate {
        name: String,
        repo_change: String,
        vmr_change: String,
    },

    /// A work branch would be created on top of itself.
    #[error("You are already on branch {branch}. Previous sync probably failed and left the branch unmerged. To complete the sync checkout the original branch and try again.")]
    AlreadyOnBranch { branch: String },

    /// Some refs requested from a clone could not be found in any remote.
    #[error("Failed to find all requested refs ({}) in {path}", refs.join(", "))]
    MissingRefs { refs: Vec<String>, path: String },

    /// The branch a flow targets does not exist in the remote.
    #[error("Failed to find target branch {branch} in {uri}")]
    TargetBranchNotFound { branch: String, uri: String },

    /// A mapping name is not present in the source mappings.
    #[error("No source mapping named {name} found")]
    MappingNotFound { name: String },

    /// The operation observed a cancellation request.
    #[error("Operation was cancelled")]
    Cancelled,

    /// An error occurred while parsing configuration such as the source
    /// mappings or the source manifest.
    #[error("Configuration parsing error: {message}{}", hint.as_ref().map(|h| format!("\n  hint: {}", h)).unwrap_or_default())]
    ConfigParse {
        message: String,
        /// Optional hint for how to fix the configuration issue
        hint: Option<String>,
    },

    /// A dependency manifest could not be parsed.
    #[error("Failed to parse {file}: {message}")]
    ManifestParse { file: String, message: String },

    /// An error occurred during a structured merge.
    #[error("Merge operation error: {operation} - {message}")]
    Merge { operation: String, message: String },

    /// A mutex guarding shared state was poisoned.
    #[error("Lock poisoned: {context}")]
    LockPoisoned { context: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),
}

impl Error {
    /// Helper for building a `ProcessFailed` out of a failure message and the
    /// captured process output.
    pub fn process_failed(message: impl Into<String>, exit_code: i32, stderr: &str) -> Self {
        Error::ProcessFailed {
            message: message.into(),
            exit_code,
            stderr: stderr.trim().to_string(),
        }
    }

    /// True for conditions that mean "stop here, nothing is wrong".
    pub fn is_empty_sync(&self) -> bool {
        matches!(self, Error::EmptySync { .. })
    }
}

/// A convenient type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
