//! Shared test utilities for integration and E2E tests.
//!
//! ## Usage
//!
//! Add `mod common;` to your test file, then use the helpers:
//!
//! ```rust,ignore
//! mod common;
//! use common::prelude::*;
//!
//! #[test]
//! fn test_example() {
//!     let fixture = TestFixture::new().with_mappings(configs::MAPPINGS);
//!     // ... test code
//! }
//! ```

#![allow(dead_code)]

use assert_fs::prelude::*;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use vmr_codeflow::error::Result;
use vmr_codeflow::git::{LocalGitRepo, ProcessResult};

/// Re-export commonly used test dependencies for convenience.
pub mod prelude {
    pub use assert_cmd::cargo::cargo_bin_cmd;
    pub use assert_fs::prelude::*;
    #[allow(unused_imports)]
    pub use assert_fs::TempDir;
    pub use predicates::prelude::*;

    #[allow(unused_imports)]
    pub use super::configs;
    #[allow(unused_imports)]
    pub use super::ScriptedRepo;
    pub use super::TestFixture;
}

/// Common configuration snippets for testing.
pub mod configs {
    /// Source mappings with a single enabled mapping.
    pub const MAPPINGS: &str = r#"{
  "defaults": { "defaultRef": "main", "exclude": ["**/*.dll"] },
  "mappings": [
    { "name": "runtime", "defaultRemote": "https://github.com/dotnet/runtime" }
  ]
}"#;

    /// A single build of the runtime repository.
    pub const BUILD: &str = r#"{
  "id": 100,
  "commit": "2222222222222222222222222222222222222222",
  "repository": "https://github.com/dotnet/runtime",
  "assets": [ { "name": "Microsoft.NETCore.App.Ref", "version": "10.0.0-preview.1" } ]
}"#;

    /// Two builds, which a single flow cannot choose between.
    pub const TWO_BUILDS: &str = r#"[
  { "id": 100, "commit": "2222222222222222222222222222222222222222", "repository": "https://github.com/dotnet/runtime" },
  { "id": 101, "commit": "3333333333333333333333333333333333333333", "repository": "https://github.com/dotnet/runtime" }
]"#;

    pub const VERSION_DETAILS: &str = r#"<Dependencies>
  <ProductDependencies>
    <Dependency Name="Microsoft.NETCore.App.Ref" Version="9.0.0">
      <Uri>https://github.com/dotnet/runtime</Uri>
      <Sha>1111111111111111111111111111111111111111</Sha>
    </Dependency>
  </ProductDependencies>
  <ToolsetDependencies />
</Dependencies>
"#;
}

/// A temporary directory laid out like a VMR checkout.
pub struct TestFixture {
    temp_dir: assert_fs::TempDir,
}

impl TestFixture {
    pub fn new() -> Self {
        Self {
            temp_dir: assert_fs::TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Add `src/source-mappings.json` with the given content.
    pub fn with_mappings(self, content: &str) -> Self {
        self.with_file("src/source-mappings.json", content)
    }

    /// Add a file with the given path and content.
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.temp_dir
            .child(path)
            .write_str(content)
            .expect("Failed to write file");
        self
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn child_path(&self, path: &str) -> PathBuf {
        self.temp_dir.path().join(path)
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A repository answering git calls from scripted responses.
///
/// The rule with the longest matching argument prefix answers; queued
/// responses are consumed in order and the last one sticks. Unmatched calls
/// succeed with empty output.
pub struct ScriptedRepo {
    path: PathBuf,
    calls: Mutex<Vec<Vec<String>>>,
    rules: Mutex<Vec<(Vec<String>, VecDeque<ProcessResult>)>>,
}

impl ScriptedRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            calls: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(&self, prefix: &[&str], result: ProcessResult) -> &Self {
        let prefix: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|(p, _)| *p == prefix) {
            Some((_, responses)) => responses.push_back(result),
            None => rules.push((prefix, VecDeque::from([result]))),
        }
        self
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

impl LocalGitRepo for ScriptedRepo {
    fn path(&self) -> &Path {
        &self.path
    }

    fn execute_git(&self, args: &[&str]) -> Result<ProcessResult> {
        let call: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.calls.lock().unwrap().push(call.clone());

        let mut rules = self.rules.lock().unwrap();
        let best = rules
            .iter_mut()
            .filter(|(prefix, _)| {
                let prefix: Vec<&str> = prefix.iter().map(String::as_str).collect();
                starts_with(&call, &prefix)
            })
            .max_by_key(|(prefix, _)| prefix.len());

        Ok(match best {
            Some((_, responses)) if responses.len() > 1 => responses.pop_front().unwrap_or_default(),
            Some((_, responses)) => responses.front().cloned().unwrap_or_default(),
            None => ProcessResult::success(""),
        })
    }
}
