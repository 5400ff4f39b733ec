//! Test doubles shared by the unit tests of several modules.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::build::{Build, BuildClient};
use crate::comments::{CommentCollector, CommentSeverity};
use crate::error::{Error, Result};
use crate::filesystem::MemoryFileSystem;
use crate::git::{LocalGitRepo, LocalGitRepoFactory, ProcessResult, RepoCloner};

struct Rule {
    prefix: Vec<String>,
    responses: VecDeque<ProcessResult>,
}

/// A [`LocalGitRepo`] whose git invocations are recorded and answered from
/// scripted responses.
///
/// A call is answered by the rule with the longest matching argument prefix.
/// Queued responses are consumed in order, the last one sticks. Calls that no
/// rule matches succeed with empty output.
pub struct ScriptedGitRepo {
    path: PathBuf,
    calls: Mutex<Vec<Vec<String>>>,
    rules: Mutex<Vec<Rule>>,
}

impl ScriptedGitRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            calls: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(&self, prefix: &[&str], result: ProcessResult) {
        let prefix: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|r| r.prefix == prefix) {
            rule.responses.push_back(result);
        } else {
            rules.push(Rule {
                prefix,
                responses: VecDeque::from([result]),
            });
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls()
            .iter()
            .filter(|call| starts_with(call, prefix))
            .count()
    }
}

fn starts_with(call: &[String], prefix: &[&str]) -> bool {
    call.len() >= prefix.len() && call.iter().zip(prefix).all(|(a, b)| a == b)
}

impl LocalGitRepo for ScriptedGitRepo {
    fn path(&self) -> &Path {
        &self.path
    }

    fn execute_git(&self, args: &[&str]) -> Result<ProcessResult> {
        let call: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.calls.lock().unwrap().push(call.clone());

        let mut rules = self.rules.lock().unwrap();
        let best = rules
            .iter_mut()
            .filter(|rule| {
                let prefix: Vec<&str> = rule.prefix.iter().map(String::as_str).collect();
                starts_with(&call, &prefix)
            })
            .max_by_key(|rule| rule.prefix.len());

        Ok(match best {
            Some(rule) if rule.responses.len() > 1 => rule.responses.pop_front().unwrap(),
            Some(rule) => rule.responses.front().cloned().unwrap_or_default(),
            None => ProcessResult::success(""),
        })
    }
}

/// Hands out pre-registered repositories by path.
#[derive(Default)]
pub struct StaticRepoFactory {
    repos: Mutex<HashMap<PathBuf, Arc<ScriptedGitRepo>>>,
}

impl StaticRepoFactory {
    pub fn register(&self, repo: Arc<ScriptedGitRepo>) {
        self.repos
            .lock()
            .unwrap()
            .insert(repo.path().to_path_buf(), repo);
    }

    pub fn repo(&self, path: &str) -> Arc<ScriptedGitRepo> {
        self.repos.lock().unwrap()[Path::new(path)].clone()
    }
}

impl LocalGitRepoFactory for StaticRepoFactory {
    fn create(&self, path: &Path) -> Arc<dyn LocalGitRepo> {
        let mut repos = self.repos.lock().unwrap();
        let repo = repos
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(ScriptedGitRepo::new(path)))
            .clone();
        repo
    }
}

/// Records clone requests. With a filesystem, the clone directory is created
/// there like a real clone would.
#[derive(Default)]
pub struct RecordingCloner {
    pub clones: Mutex<Vec<(String, PathBuf)>>,
    fs: Option<Arc<MemoryFileSystem>>,
}

impl RecordingCloner {
    pub fn creating_directories(fs: Arc<MemoryFileSystem>) -> Self {
        Self {
            clones: Mutex::default(),
            fs: Some(fs),
        }
    }
}

impl RepoCloner for RecordingCloner {
    fn clone_no_checkout(&self, remote_uri: &str, target_dir: &Path) -> Result<()> {
        self.clones
            .lock()
            .unwrap()
            .push((remote_uri.to_string(), target_dir.to_path_buf()));
        if let Some(fs) = &self.fs {
            fs.add_directory(target_dir)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingComments {
    pub comments: Mutex<Vec<(String, CommentSeverity)>>,
}

impl CommentCollector for RecordingComments {
    fn add_comment(&self, text: &str, severity: CommentSeverity) {
        self.comments
            .lock()
            .unwrap()
            .push((text.to_string(), severity));
    }
}

#[derive(Default)]
pub struct FakeBuildClient {
    pub builds: Mutex<HashMap<i64, Build>>,
    pub requests: Mutex<Vec<i64>>,
}

impl FakeBuildClient {
    pub fn with_builds(builds: Vec<Build>) -> Self {
        let client = Self::default();
        for build in builds {
            client.builds.lock().unwrap().insert(build.id, build);
        }
        client
    }
}

impl BuildClient for FakeBuildClient {
    fn get_build(&self, build_id: i64) -> Result<Build> {
        self.requests.lock().unwrap().push(build_id);
        self.builds
            .lock()
            .unwrap()
            .get(&build_id)
            .cloned()
            .ok_or_else(|| Error::InvalidSynchronization {
                message: format!("Unknown build {}", build_id),
            })
    }
}
