//! # VMR CodeFlow Library
//!
//! This library keeps component repositories and a virtual monolithic
//! repository (VMR) in sync. Changes flow from a repository into the VMR's
//! `src/{mapping}` directory (forward flow) and from the VMR back into the
//! repository (backflow), with the dependency manifests of both sides merged
//! semantically instead of by plain git merges.
//!
//! It is designed to be used by the `vmr-codeflow` command-line tool, but every
//! collaborator (git, the filesystem, the build registry) sits behind a trait
//! so the engine can be embedded and tested without touching the disk.
//!
//! ## Quick Example
//!
//! ```
//! use vmr_codeflow::codeflow::Codeflow;
//! use vmr_codeflow::config::parse_source_mappings;
//!
//! let mappings = parse_source_mappings(r#"{
//!     "mappings": [
//!         { "name": "runtime", "defaultRemote": "https://github.com/dotnet/runtime" }
//!     ]
//! }"#).unwrap();
//! assert_eq!(mappings[0].default_ref, "main");
//!
//! let flow = Codeflow::forward(
//!     "1111111111111111111111111111111111111111",
//!     "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
//! );
//! assert_eq!(flow.branch_name(), "forward/1111111-aaaaaaa");
//! ```
//!
//! ## Core Concepts
//!
//! - **Flows (`codeflow`)**: A flow is a pair of commits, one per side. The last
//!   forward flow is recorded in the VMR's source manifest, the last backflow
//!   in the repository's `Version.Details.xml`.
//! - **Repositories (`git`, `clone_cache`)**: Local clones are prepared once per
//!   path and shared between concurrent callers.
//! - **Work branches (`work_branch`)**: Changes are committed on a temporary
//!   branch and squash-merged back into the branch they started from.
//! - **Structured merges (`merge`, `version_details`)**: Version files are
//!   merged four-way, keeping the newer version when both sides changed.
//! - **Conflict resolution (`conflict`, `conflict_resolver`)**: The target
//!   branch is merged into the head branch, with conflicts in version files
//!   resolved automatically.
//!
//! ## Execution Flow
//!
//! The main entry point is [`engine::CodeflowEngine`]:
//!
//! 1.  **Preparation**: Clone the repository and the VMR in parallel.
//! 2.  **Discovery**: Find the last flows and create or reuse the head branch.
//! 3.  **Flow**: Apply the source changes since the last flow to the target.
//! 4.  **Resolution**: Merge the target branch and reconcile version files.
//! 5.  **Analysis**: Decide whether a forward flow carries more than build
//!     metadata.

pub mod build;
pub mod cancellation;
pub mod change_analyzer;
pub mod clone_cache;
pub mod codeflow;
pub mod comments;
pub mod config;
pub mod conflict;
pub mod conflict_resolver;
pub mod engine;
pub mod error;
pub mod filesystem;
pub mod git;
pub mod merge;
pub mod version_details;
pub mod work_branch;

#[cfg(test)]
mod conflict_proptest;
#[cfg(test)]
mod test_support;
