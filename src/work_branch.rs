//! Work branches: short-lived branches a flow writes its changes to before
//! squashing them back onto the branch it started from.
//!
//! Squash merges regularly fail on changes that only differ in whitespace or
//! line endings. Such a failure is retried exactly once after staging
//! everything; a genuine content conflict is terminal.

use std::sync::Arc;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::git::{LocalGitRepo, ProcessResult};

const CONTENT_CONFLICT_MARKER: &str = "CONFLICT (content): Merge conflict";

/// A branch cut from `original_branch` that will be merged back into it
pub struct WorkBranch {
    repo: Arc<dyn LocalGitRepo>,
    work_branch: String,
    original_branch: String,
}

/// Outcome of one squash merge attempt
#[derive(Debug)]
enum MergeAttempt {
    Success,
    ConflictFailure(ProcessResult),
    RecoverableFailure(ProcessResult),
}

/// Creates `branch_name` off `base_branch` (the current branch when `None`)
/// and checks it out.
pub fn create_work_branch(
    repo: Arc<dyn LocalGitRepo>,
    branch_name: &str,
    base_branch: Option<&str>,
) -> Result<WorkBranch> {
    let original_branch = match base_branch {
        Some(base) => base.to_string(),
        None => {
            let result = repo.run_git(
                &["rev-parse", "--abbrev-ref", "HEAD"],
                "Failed to determine the current branch",
            )?;
            result.stdout.trim_end().to_string()
        }
    };

    if original_branch == branch_name {
        return Err(Error::AlreadyOnBranch {
            branch: branch_name.to_string(),
        });
    }

    info!(
        "Creating a branch {} for changes based on {} in {}",
        branch_name,
        original_branch,
        repo.path().display()
    );
    repo.create_branch(branch_name, true)?;

    Ok(WorkBranch {
        repo,
        work_branch: branch_name.to_string(),
        original_branch,
    })
}

impl WorkBranch {
    pub fn work_branch(&self) -> &str {
        &self.work_branch
    }

    pub fn original_branch(&self) -> &str {
        &self.original_branch
    }

    /// Checks out the original branch and squashes the work branch into it
    /// as a single commit, recorded even when nothing changed.
    pub fn merge_back(&self, commit_message: &str) -> Result<()> {
        self.repo.checkout(&self.original_branch)?;

        let mut attempt = self.attempt_merge()?;
        let mut retried = false;
        loop {
            attempt = match attempt {
                MergeAttempt::Success => break,
                MergeAttempt::ConflictFailure(result) => {
                    return Err(Error::WorkBranchInConflict {
                        branch: self.work_branch.clone(),
                        target: self.original_branch.clone(),
                        stderr: result.stderr.trim().to_string(),
                    });
                }
                MergeAttempt::RecoverableFailure(result) if retried => {
                    return Err(Error::process_failed(
                        format!(
                            "Failed to merge back the work branch {} into {}",
                            self.work_branch, self.original_branch
                        ),
                        result.exit_code,
                        &result.stderr,
                    ));
                }
                MergeAttempt::RecoverableFailure(_) => {
                    warn!(
                        "Merging {} into {} failed on whitespace changes, staging and retrying",
                        self.work_branch, self.original_branch
                    );
                    self.repo
                        .run_git(&["add", "-A"], "Failed to stage whitespace-only EOL changes")?;
                    retried = true;
                    Self::classify(self.run_merge()?)
                }
            };
        }

        self.repo.commit(commit_message, true, None)
    }

    fn run_merge(&self) -> Result<ProcessResult> {
        self.repo.execute_git(&[
            "merge",
            &self.work_branch,
            "--no-commit",
            "--no-edit",
            "--squash",
            "-q",
        ])
    }

    /// First attempt: on failure, a whitespace-insensitive diff confirms
    /// whether the failure can be recovered from.
    fn attempt_merge(&self) -> Result<MergeAttempt> {
        let result = self.run_merge()?;
        if result.succeeded() {
            return Ok(MergeAttempt::Success);
        }

        let diff = self.repo.execute_git(&["diff", "-w"])?;
        let attempt = Self::classify(result);
        if matches!(attempt, MergeAttempt::RecoverableFailure(_)) && !diff.succeeded() {
            diff.ensure_success(format!(
                "Failed to check whether {} and {} differ only in whitespace",
                self.work_branch, self.original_branch
            ))?;
        }
        Ok(attempt)
    }

    fn classify(result: ProcessResult) -> MergeAttempt {
        if result.succeeded() {
            MergeAttempt::Success
        } else if result.stderr.contains(CONTENT_CONFLICT_MARKER)
            || result.stdout.contains(CONTENT_CONFLICT_MARKER)
        {
            MergeAttempt::ConflictFailure(result)
        } else {
            MergeAttempt::RecoverableFailure(result)
        }
    }
}
