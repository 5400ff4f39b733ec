//! Conflicts surfaced by git while flowing changes.
//!
//! Failed patch applications and merges are reported by git as free text. The
//! known phrasings are scanned for file paths, which are then normalized to be
//! relative to the target repository of the flow: paths inside the VMR lose
//! their `src/{mapping}/` prefix in a forward flow, repository paths gain it in
//! a backflow.

use log::{debug, info};
use regex::Regex;

use crate::codeflow::FlowDirection;
use crate::config::repo_sources_path;
use crate::error::{Error, Result};
use crate::git::LocalGitRepo;

/// git/patch failure lines naming a conflicted file; group 1 is the path
const CONFLICT_PATTERNS: [&str; 5] = [
    r"(?:error: )?patch failed: (.+): already exist in index",
    r"error: patch failed: (.+):\d*",
    r"error: (.+): patch does not apply",
    r"error: (.+): does not exist in index",
    r"CONFLICT \(content\): Merge conflict in (.+)",
];

fn conflict_regexes() -> Result<Vec<Regex>> {
    CONFLICT_PATTERNS
        .iter()
        .map(|p| Regex::new(&format!("^{}$", p)).map_err(Error::Regex))
        .collect()
}

/// Extracts the conflicted files from a failure message, deduplicated in
/// order of appearance and normalized for the flow direction.
pub fn parse_conflicted_files(
    message: &str,
    direction: FlowDirection,
    mapping: &str,
) -> Result<Vec<String>> {
    let regexes = conflict_regexes()?;
    let prefix = format!("{}/", repo_sources_path(mapping));

    let mut files: Vec<String> = Vec::new();
    for line in message.lines().map(str::trim) {
        let Some(path) = regexes
            .iter()
            .find_map(|r| r.captures(line))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim())
        else {
            continue;
        };

        let normalized = match direction {
            FlowDirection::Forward => path.strip_prefix(&prefix).unwrap_or(path).to_string(),
            FlowDirection::Backflow => path.to_string(),
        };
        if !files.contains(&normalized) {
            files.push(normalized);
        }
    }

    if direction == FlowDirection::Backflow {
        files = files.into_iter().map(|f| format!("{}{}", prefix, f)).collect();
    }

    Ok(files)
}

/// Builds the `ConflictInTargetBranch` error for a failure message.
pub fn conflict_in_target_branch(
    message: &str,
    direction: FlowDirection,
    mapping: &str,
    target_branch: &str,
) -> Result<Error> {
    Ok(Error::ConflictInTargetBranch {
        target_branch: target_branch.to_string(),
        files: parse_conflicted_files(message, direction, mapping)?,
    })
}

/// Result of merging a branch into the head branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchMergeOutcome {
    /// The merge was committed (or there was nothing to merge).
    Merged,
    /// The merge is in progress with these files in conflict.
    Conflicted(Vec<String>),
}

/// Merges `branch_to_merge` into `head_branch`, committing on success.
///
/// On conflicts the merge is left in progress for the caller to resolve.
pub fn try_merging_branch(
    repo: &dyn LocalGitRepo,
    head_branch: &str,
    branch_to_merge: &str,
) -> Result<BranchMergeOutcome> {
    info!("Checking if target branch {} has conflicts with {}", branch_to_merge, head_branch);
    repo.checkout(head_branch)?;

    let result = repo.execute_git(&["merge", "--no-commit", "--no-ff", branch_to_merge])?;
    if result.succeeded() {
        let message = format!("Merge {} into {}", branch_to_merge, head_branch);
        let commit = repo.execute_git(&["commit", "-m", &message])?;
        if !commit.succeeded()
            && !commit.stdout.contains("nothing to commit")
            && !commit.stderr.contains("nothing to commit")
        {
            commit.ensure_success(format!(
                "Failed to commit the merge of {} into {}",
                branch_to_merge, head_branch
            ))?;
        }
        debug!("Merged {} into {}", branch_to_merge, head_branch);
        return Ok(BranchMergeOutcome::Merged);
    }

    let conflicted = repo.execute_git(&["diff", "--name-only", "--diff-filter=U", "--relative"])?;
    if !conflicted.succeeded() {
        abort_merge(repo)?;
        return Err(Error::process_failed(
            "Failed to resolve version file conflicts - failed to get a list of conflicted files",
            conflicted.exit_code,
            &conflicted.stderr,
        ));
    }

    Ok(BranchMergeOutcome::Conflicted(conflicted.output_lines()))
}

pub fn abort_merge(repo: &dyn LocalGitRepo) -> Result<()> {
    repo.run_git(
        &["merge", "--abort"],
        "Failed to abort a merge when resolving version file conflicts",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::ProcessResult;
    use crate::test_support::ScriptedGitRepo;

    mod parse_tests {
        use super::*;

        fn failure_lines(path: &str) -> Vec<String> {
            vec![
                format!("error: patch failed: {}:12", path),
                format!("patch failed: {}: already exist in index", path),
                format!("error: {}: patch does not apply", path),
                format!("error: {}: does not exist in index", path),
                format!("CONFLICT (content): Merge conflict in {}", path),
            ]
        }

        #[test]
        fn test_forward_flow_strips_mapping_prefix() {
            for line in failure_lines("src/runtime/eng/Versions.props") {
                let files = parse_conflicted_files(&line, FlowDirection::Forward, "runtime").unwrap();
                assert_eq!(files, vec!["eng/Versions.props".to_string()], "line: {}", line);
            }
        }

        #[test]
        fn test_backflow_prefixes_mapping_path() {
            for line in failure_lines("eng/Versions.props") {
                let files = parse_conflicted_files(&line, FlowDirection::Backflow, "runtime").unwrap();
                assert_eq!(files, vec!["src/runtime/eng/Versions.props".to_string()], "line: {}", line);
            }
        }

        #[test]
        fn test_duplicates_across_formats_are_merged() {
            let message = failure_lines("global.json").join("\n");
            let files = parse_conflicted_files(&message, FlowDirection::Backflow, "sdk").unwrap();
            assert_eq!(files, vec!["src/sdk/global.json".to_string()]);
        }

        #[test]
        fn test_unrelated_lines_are_ignored() {
            let message = "Auto-merging global.json\nhint: see git help\n\
                           CONFLICT (content): Merge conflict in src/sdk/a.txt\n";
            let files = parse_conflicted_files(message, FlowDirection::Forward, "sdk").unwrap();
            assert_eq!(files, vec!["a.txt".to_string()]);
        }

        #[test]
        fn test_empty_message() {
            let error = conflict_in_target_branch("", FlowDirection::Forward, "sdk", "main").unwrap();
            match &error {
                Error::ConflictInTargetBranch { files, .. } => assert!(files.is_empty()),
                other => panic!("unexpected error {:?}", other),
            }
            assert_eq!(
                format!("{}", error),
                "Failed to flow changes due to conflicts in the target branch (main)"
            );
        }
    }

    mod merge_tests {
        use super::*;

        const MERGE: [&str; 4] = ["merge", "--no-commit", "--no-ff", "main"];
        const CONFLICTED: [&str; 4] = ["diff", "--name-only", "--diff-filter=U", "--relative"];

        #[test]
        fn test_clean_merge_is_committed() {
            let repo = ScriptedGitRepo::new("/vmr");

            let outcome = try_merging_branch(&repo, "pr-branch", "main").unwrap();

            assert_eq!(outcome, BranchMergeOutcome::Merged);
            assert_eq!(repo.count(&["checkout", "pr-branch"]), 1);
            assert_eq!(repo.count(&["commit", "-m", "Merge main into pr-branch"]), 1);
        }

        #[test]
        fn test_nothing_to_commit_is_success() {
            let repo = ScriptedGitRepo::new("/vmr");
            repo.respond(
                &["commit"],
                ProcessResult {
                    exit_code: 1,
                    stdout: "nothing to commit, working tree clean".to_string(),
                    stderr: String::new(),
                },
            );

            assert_eq!(
                try_merging_branch(&repo, "pr-branch", "main").unwrap(),
                BranchMergeOutcome::Merged
            );
        }

        #[test]
        fn test_conflicts_are_listed() {
            let repo = ScriptedGitRepo::new("/vmr");
            repo.respond(&MERGE, ProcessResult::failure(1, "Automatic merge failed"));
            repo.respond(
                &CONFLICTED,
                ProcessResult::success("src/source-manifest.json\nsrc/sdk/global.json\n"),
            );

            let outcome = try_merging_branch(&repo, "pr-branch", "main").unwrap();

            assert_eq!(
                outcome,
                BranchMergeOutcome::Conflicted(vec![
                    "src/source-manifest.json".to_string(),
                    "src/sdk/global.json".to_string()
                ])
            );
            assert_eq!(repo.count(&["commit"]), 0);
            assert_eq!(repo.count(&["merge", "--abort"]), 0);
        }

        #[test]
        fn test_listing_failure_aborts_the_merge() {
            let repo = ScriptedGitRepo::new("/vmr");
            repo.respond(&MERGE, ProcessResult::failure(1, "Automatic merge failed"));
            repo.respond(&CONFLICTED, ProcessResult::failure(128, "fatal"));

            let err = try_merging_branch(&repo, "pr-branch", "main").unwrap_err();

            assert!(format!("{}", err).contains("failed to get a list of conflicted files"));
            assert_eq!(repo.count(&["merge", "--abort"]), 1);
        }

        #[test]
        fn test_abort_merge_failure_message() {
            let repo = ScriptedGitRepo::new("/vmr");
            repo.respond(&["merge", "--abort"], ProcessResult::failure(128, "fatal: no merge"));

            let err = abort_merge(&repo).unwrap_err();
            assert!(format!("{}", err)
                .contains("Failed to abort a merge when resolving version file conflicts"));
        }
    }
}
