//! # Local Repository Capability
//!
//! Everything the engine does to a repository goes through [`LocalGitRepo`].
//! Implementors only provide [`LocalGitRepo::path`] and
//! [`LocalGitRepo::execute_git`]; every higher level operation (checkout,
//! commit, blame, ancestry checks, ...) is a provided method expressed as a
//! git invocation. Test doubles therefore only need to script process
//! results, and assertions can be made on the exact argument lists.
//!
//! [`ProcessGitRepo`] is the production implementation which shells out to the
//! system `git`, so SSH keys, credential helpers and any other configuration
//! from `~/.gitconfig` apply as usual.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};

/// Exit code and captured output of one git invocation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Turns a non-zero exit into `Error::ProcessFailed` with the given message.
    pub fn ensure_success(&self, failure_message: impl Into<String>) -> Result<()> {
        if self.succeeded() {
            Ok(())
        } else {
            Err(Error::process_failed(
                failure_message,
                self.exit_code,
                &self.stderr,
            ))
        }
    }

    /// Non-empty, trimmed lines of stdout.
    pub fn output_lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Kind of object a revision resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
    Unknown,
}

impl GitObjectType {
    fn parse(value: &str) -> Self {
        match value.trim() {
            "commit" => GitObjectType::Commit,
            "tree" => GitObjectType::Tree,
            "blob" => GitObjectType::Blob,
            "tag" => GitObjectType::Tag,
            _ => GitObjectType::Unknown,
        }
    }
}

/// A local git working copy.
///
/// Implementations must be usable from several threads, but callers are
/// expected to serialize operations that touch the working tree of the same
/// path (see `clone_cache` and `work_branch`).
pub trait LocalGitRepo: Send + Sync {
    /// Root of the working tree.
    fn path(&self) -> &Path;

    /// Runs `git <args>` inside [`LocalGitRepo::path`] and reports the outcome.
    ///
    /// A non-zero exit code is not an error at this level.
    fn execute_git(&self, args: &[&str]) -> Result<ProcessResult>;

    /// Runs git and converts a non-zero exit into `Error::ProcessFailed`.
    fn run_git(&self, args: &[&str], failure_message: &str) -> Result<ProcessResult> {
        let result = self.execute_git(args)?;
        result.ensure_success(failure_message)?;
        Ok(result)
    }

    fn checkout(&self, r#ref: &str) -> Result<()> {
        self.run_git(
            &["checkout", r#ref],
            &format!("Failed to check out {} in {}", r#ref, self.path().display()),
        )?;
        Ok(())
    }

    /// Checks out a ref and discards local modifications.
    fn force_checkout(&self, r#ref: &str) -> Result<()> {
        self.run_git(
            &["checkout", "-f", r#ref],
            &format!("Failed to check out {} in {}", r#ref, self.path().display()),
        )?;
        Ok(())
    }

    /// Creates a branch at the current HEAD and checks it out.
    fn create_branch(&self, name: &str, overwrite: bool) -> Result<()> {
        let flag = if overwrite { "-B" } else { "-b" };
        self.run_git(
            &["checkout", flag, name],
            &format!("Failed to create branch {} in {}", name, self.path().display()),
        )?;
        Ok(())
    }

    fn commit(&self, message: &str, allow_empty: bool, author: Option<(&str, &str)>) -> Result<()> {
        let author_arg = author.map(|(name, email)| format!("--author={} <{}>", name, email));
        let mut args = vec!["commit", "-m", message];
        if allow_empty {
            args.push("--allow-empty");
        }
        if let Some(author_arg) = author_arg.as_deref() {
            args.push(author_arg);
        }
        self.run_git(
            &args,
            &format!("Failed to commit changes in {}", self.path().display()),
        )?;
        Ok(())
    }

    fn stage(&self, paths: &[&str]) -> Result<()> {
        let mut args = vec!["add", "-A", "--"];
        args.extend_from_slice(paths);
        self.run_git(
            &args,
            &format!("Failed to stage {:?} in {}", paths, self.path().display()),
        )?;
        Ok(())
    }

    fn has_working_tree_changes(&self) -> Result<bool> {
        let result = self.run_git(
            &["status", "--porcelain"],
            &format!("Failed to query status of {}", self.path().display()),
        )?;
        Ok(!result.stdout.trim().is_empty())
    }

    /// Reads a file at a given revision. Returns `None` when the file (or the
    /// revision) does not exist.
    fn get_file_from_git(&self, relative_path: &str, r#ref: &str) -> Result<Option<String>> {
        let spec = format!("{}:{}", r#ref, relative_path.trim_start_matches('/'));
        let result = self.execute_git(&["show", &spec])?;
        if result.succeeded() {
            Ok(Some(result.stdout))
        } else {
            Ok(None)
        }
    }

    /// Returns the name of a remote pointing at `remote_uri`, adding one if
    /// none exists yet.
    fn add_remote_if_missing(&self, remote_uri: &str) -> Result<String> {
        let remotes = self.run_git(
            &["remote", "-v"],
            &format!("Failed to list remotes of {}", self.path().display()),
        )?;

        for line in remotes.output_lines() {
            let mut parts = line.split_whitespace();
            if let (Some(name), Some(uri)) = (parts.next(), parts.next()) {
                if uri == remote_uri {
                    return Ok(name.to_string());
                }
            }
        }

        let name = remote_name(remote_uri);
        debug!("Adding remote {} ({}) to {}", name, remote_uri, self.path().display());
        self.run_git(
            &["remote", "add", &name, remote_uri],
            &format!("Failed to add remote {} to {}", remote_uri, self.path().display()),
        )?;
        Ok(name)
    }

    fn update_remote(&self, remote_name: &str) -> Result<()> {
        self.run_git(
            &["fetch", remote_name],
            &format!("Failed to update remote {} in {}", remote_name, self.path().display()),
        )?;
        Ok(())
    }

    fn get_object_type(&self, object: &str) -> Result<GitObjectType> {
        let result = self.execute_git(&["cat-file", "-t", object])?;
        if !result.succeeded() {
            return Ok(GitObjectType::Unknown);
        }
        Ok(GitObjectType::parse(&result.stdout))
    }

    /// True when `ancestor` is reachable from `descendant`.
    fn is_ancestor_commit(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let result = self.execute_git(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match result.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(Error::process_failed(
                format!(
                    "Failed to determine whether {} is an ancestor of {}",
                    ancestor, descendant
                ),
                result.exit_code,
                &result.stderr,
            )),
        }
    }

    fn merge_base(&self, first: &str, second: &str) -> Result<String> {
        let result = self.run_git(
            &["merge-base", first, second],
            &format!("Failed to find a merge base of {} and {}", first, second),
        )?;
        Ok(result.stdout.trim().to_string())
    }

    /// Finds the commit which last touched the first line containing `needle`.
    fn blame_line(&self, relative_path: &str, needle: &str, r#ref: Option<&str>) -> Result<String> {
        let mut args = vec!["blame", "--porcelain"];
        if let Some(r#ref) = r#ref {
            args.push(r#ref);
        }
        args.push("--");
        args.push(relative_path);

        let result = self.run_git(
            &args,
            &format!("Failed to blame {} in {}", relative_path, self.path().display()),
        )?;

        parse_blame_porcelain(&result.stdout, needle).ok_or_else(|| Error::InvalidSynchronization {
            message: format!(
                "Failed to find a line containing {} in {}",
                needle, relative_path
            ),
        })
    }

    fn reset_working_tree(&self) -> Result<()> {
        self.run_git(
            &["reset", "--hard"],
            &format!("Failed to reset the working tree of {}", self.path().display()),
        )?;
        Ok(())
    }
}

/// Walks `git blame --porcelain` output and returns the commit of the first
/// content line containing `needle`.
pub fn parse_blame_porcelain(output: &str, needle: &str) -> Option<String> {
    let mut current_commit: Option<&str> = None;
    for line in output.lines() {
        if let Some(content) = line.strip_prefix('\t') {
            if content.contains(needle) {
                return current_commit.map(str::to_string);
            }
            continue;
        }

        // Header lines are "<40 hex sha> <orig line> <final line> [<count>]"
        let mut parts = line.split(' ');
        if let Some(first) = parts.next() {
            if first.len() == 40 && first.chars().all(|c| c.is_ascii_hexdigit()) {
                current_commit = Some(first);
            }
        }
    }
    None
}

/// Stable hexadecimal hash used for remote names and clone directories.
pub fn stable_hash(value: &str) -> String {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:X}", hasher.finish())
}

fn remote_name(remote_uri: &str) -> String {
    stable_hash(remote_uri).to_lowercase()
}

/// First seven characters of a commit SHA.
pub fn short_sha(sha: &str) -> &str {
    match sha.char_indices().nth(7) {
        Some((index, _)) => &sha[..index],
        None => sha,
    }
}

/// [`LocalGitRepo`] backed by the system `git` executable
#[derive(Debug, Clone)]
pub struct ProcessGitRepo {
    path: PathBuf,
}

impl ProcessGitRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LocalGitRepo for ProcessGitRepo {
    fn path(&self) -> &Path {
        &self.path
    }

    fn execute_git(&self, args: &[&str]) -> Result<ProcessResult> {
        debug!("git {} (in {})", args.join(" "), self.path.display());
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .map_err(|e| Error::GitCommand {
                command: args.join(" "),
                path: self.path.display().to_string(),
                stderr: e.to_string(),
            })?;

        Ok(ProcessResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Creates repository handles for paths, so that components can be given a
/// factory instead of concrete repositories.
pub trait LocalGitRepoFactory: Send + Sync {
    fn create(&self, path: &Path) -> Arc<dyn LocalGitRepo>;
}

#[derive(Debug, Default, Clone)]
pub struct ProcessGitRepoFactory;

impl LocalGitRepoFactory for ProcessGitRepoFactory {
    fn create(&self, path: &Path) -> Arc<dyn LocalGitRepo> {
        Arc::new(ProcessGitRepo::new(path))
    }
}

/// Remote clone capability
pub trait RepoCloner: Send + Sync {
    /// Clones `remote_uri` into `target_dir` without checking out a working tree.
    fn clone_no_checkout(&self, remote_uri: &str, target_dir: &Path) -> Result<()>;
}

/// [`RepoCloner`] using `git clone --no-checkout`
#[derive(Debug, Default, Clone)]
pub struct ProcessRepoCloner;

impl RepoCloner for ProcessRepoCloner {
    fn clone_no_checkout(&self, remote_uri: &str, target_dir: &Path) -> Result<()> {
        if let Some(parent) = target_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let target = target_dir.display().to_string();
        debug!("Cloning {} into {}", remote_uri, target);
        let output = Command::new("git")
            .args(["clone", "--no-checkout", remote_uri, &target])
            .output()
            .map_err(|e| Error::GitCommand {
                command: "clone --no-checkout".to_string(),
                path: target.clone(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::process_failed(
                format!("Failed to clone {} into {}", remote_uri, target),
                output.status.code().unwrap_or(-1),
                &stderr,
            ));
        }

        Ok(())
    }
}
