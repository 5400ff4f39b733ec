//! # Configuration
//!
//! Loads the configuration a code flow needs:
//!
//! - **Source mappings** (`src/source-mappings.json` in the VMR): one entry per
//!   component repository, with its default remote, default ref and the glob
//!   sets selecting which files are synchronized.
//! - **Source manifest** (`src/source-manifest.json` in the VMR): the commit of
//!   each component repository that is currently synchronized into the VMR.
//!   This is the source of truth for the last forward flow.
//! - **`VmrInfo`**: where the VMR lives locally and where clones go, plus the
//!   well-known relative paths of the tracked version files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Directory of the VMR holding the component sources.
pub const SOURCES_DIR: &str = "src";
pub const SOURCE_MAPPINGS_PATH: &str = "src/source-mappings.json";
pub const SOURCE_MANIFEST_PATH: &str = "src/source-manifest.json";
pub const VERSION_DETAILS_XML: &str = "eng/Version.Details.xml";
pub const VERSIONS_PROPS: &str = "eng/Versions.props";
pub const GLOBAL_JSON: &str = "global.json";
pub const DOTNET_TOOLS_JSON: &str = ".config/dotnet-tools.json";
pub const ENG_COMMON_DIR: &str = "eng/common";

/// Version files whose conflicts are always resolvable by picking a side.
pub const DEPENDENCY_FILES: [&str; 4] = [
    VERSION_DETAILS_XML,
    VERSIONS_PROPS,
    GLOBAL_JSON,
    DOTNET_TOOLS_JSON,
];

/// `src/{mapping}`
pub fn repo_sources_path(mapping: &str) -> String {
    format!("{}/{}", SOURCES_DIR, mapping)
}

/// One component repository inside the VMR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMapping {
    pub name: String,
    pub default_remote: String,
    pub default_ref: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub disable_synchronization: bool,
    pub version: Option<String>,
}

impl SourceMapping {
    /// Whether a repo-relative path is synchronized by this mapping.
    pub fn is_included(&self, path: &str) -> bool {
        let matches = |patterns: &[String]| {
            patterns
                .iter()
                .filter_map(|p| Pattern::new(p).ok())
                .any(|p| p.matches(path))
        };
        matches(&self.include) && !matches(&self.exclude)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingDefaults {
    default_ref: Option<String>,
    #[serde(default)]
    exclude: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingEntry {
    name: String,
    default_remote: String,
    default_ref: Option<String>,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default)]
    disable_synchronization: bool,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SourceMappingsFile {
    #[serde(default)]
    defaults: MappingDefaults,
    mappings: Vec<MappingEntry>,
}

/// Parses the content of `source-mappings.json`, applying the defaults block
/// and validating names, remotes and glob patterns.
pub fn parse_source_mappings(json: &str) -> Result<Vec<SourceMapping>> {
    let file: SourceMappingsFile = serde_json::from_str(json).map_err(|e| Error::ConfigParse {
        message: format!("Invalid source mappings: {}", e),
        hint: None,
    })?;

    let default_ref = file
        .defaults
        .default_ref
        .clone()
        .unwrap_or_else(|| "main".to_string());

    let mut seen = HashSet::new();
    let mut mappings = Vec::with_capacity(file.mappings.len());

    for entry in file.mappings {
        if entry.name.trim().is_empty() {
            return Err(Error::ConfigParse {
                message: "Mapping with an empty name".to_string(),
                hint: Some("Every mapping needs a non-empty 'name'".to_string()),
            });
        }

        if !seen.insert(entry.name.clone()) {
            return Err(Error::ConfigParse {
                message: format!("Duplicate mapping {}", entry.name),
                hint: Some("Mapping names must be unique".to_string()),
            });
        }

        validate_remote(&entry.name, &entry.default_remote)?;

        let include = if entry.include.is_empty() {
            vec!["**/*".to_string()]
        } else {
            entry.include
        };

        let exclude: Vec<String> = file
            .defaults
            .exclude
            .iter()
            .cloned()
            .chain(entry.exclude)
            .collect();

        for pattern in include.iter().chain(exclude.iter()) {
            Pattern::new(pattern)?;
        }

        mappings.push(SourceMapping {
            name: entry.name,
            default_remote: entry.default_remote,
            default_ref: entry.default_ref.unwrap_or_else(|| default_ref.clone()),
            include,
            exclude,
            disable_synchronization: entry.disable_synchronization,
            version: entry.version,
        });
    }

    Ok(mappings)
}

/// Reads and parses `src/source-mappings.json` of a VMR checkout.
pub fn load_source_mappings(vmr_path: &Path) -> Result<Vec<SourceMapping>> {
    let content = std::fs::read_to_string(vmr_path.join(SOURCE_MAPPINGS_PATH))?;
    parse_source_mappings(&content)
}

pub fn find_mapping<'a>(mappings: &'a [SourceMapping], name: &str) -> Result<&'a SourceMapping> {
    mappings
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| Error::MappingNotFound {
            name: name.to_string(),
        })
}

fn validate_remote(mapping: &str, remote: &str) -> Result<()> {
    // Local paths are used for test and offline setups
    if Path::new(remote).is_absolute() {
        return Ok(());
    }

    Url::parse(remote).map_err(|e| Error::ConfigParse {
        message: format!("Invalid default remote '{}' of mapping {}: {}", remote, mapping, e),
        hint: Some("Use a full URL such as https://github.com/org/repo".to_string()),
    })?;
    Ok(())
}

/// A repository recorded in the VMR's source manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRecord {
    pub path: String,
    pub remote_uri: String,
    pub commit_sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bar_id: Option<i64>,
}

/// `src/source-manifest.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceManifest {
    #[serde(default)]
    pub repositories: Vec<ManifestRecord>,
    #[serde(default)]
    pub submodules: Vec<serde_json::Value>,
}

impl SourceManifest {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::ConfigParse {
            message: format!("Invalid source manifest: {}", e),
            hint: None,
        })
    }

    /// Records the synchronized version of a repository, adding a record
    /// when the mapping is new.
    pub fn update_repo(&mut self, mapping: &str, remote_uri: &str, commit_sha: &str, bar_id: Option<i64>) {
        match self.repositories.iter_mut().find(|r| r.path == mapping) {
            Some(record) => {
                record.remote_uri = remote_uri.to_string();
                record.commit_sha = commit_sha.to_string();
                record.bar_id = bar_id;
            }
            None => {
                self.repositories.push(ManifestRecord {
                    path: mapping.to_string(),
                    remote_uri: remote_uri.to_string(),
                    commit_sha: commit_sha.to_string(),
                    bar_id,
                });
                self.repositories.sort_by(|a, b| a.path.cmp(&b.path));
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn repo_version(&self, mapping: &str) -> Result<&ManifestRecord> {
        self.repositories
            .iter()
            .find(|r| r.path == mapping)
            .ok_or_else(|| Error::MappingNotFound {
                name: mapping.to_string(),
            })
    }
}

/// Locations of the local VMR and of the scratch directory used for clones
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmrInfo {
    pub vmr_path: PathBuf,
    pub tmp_path: PathBuf,
}

impl VmrInfo {
    pub fn new(vmr_path: impl Into<PathBuf>, tmp_path: impl Into<PathBuf>) -> Self {
        Self {
            vmr_path: vmr_path.into(),
            tmp_path: tmp_path.into(),
        }
    }

    /// Uses the user's cache directory for clones.
    pub fn with_default_tmp(vmr_path: impl Into<PathBuf>) -> Self {
        let tmp_path = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("vmr-codeflow");
        Self::new(vmr_path, tmp_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPINGS: &str = r#"{
        "defaults": { "defaultRef": "release/9.0", "exclude": ["**/*.dll"] },
        "mappings": [
            { "name": "arcade", "defaultRemote": "https://github.com/dotnet/arcade" },
            {
                "name": "runtime",
                "defaultRemote": "https://github.com/dotnet/runtime",
                "defaultRef": "main",
                "include": ["src/**"],
                "exclude": ["src/tests/**"],
                "version": "9.0.0"
            },
            { "name": "local", "defaultRemote": "/work/local-repo", "disableSynchronization": true }
        ]
    }"#;

    #[test]
    fn test_parse_source_mappings_applies_defaults() {
        let mappings = parse_source_mappings(MAPPINGS).unwrap();
        assert_eq!(mappings.len(), 3);

        let arcade = &mappings[0];
        assert_eq!(arcade.default_ref, "release/9.0");
        assert_eq!(arcade.include, vec!["**/*"]);
        assert_eq!(arcade.exclude, vec!["**/*.dll"]);
        assert!(!arcade.disable_synchronization);

        let runtime = &mappings[1];
        assert_eq!(runtime.default_ref, "main");
        assert_eq!(runtime.exclude, vec!["**/*.dll", "src/tests/**"]);
        assert_eq!(runtime.version.as_deref(), Some("9.0.0"));

        assert!(mappings[2].disable_synchronization);
    }

    #[test]
    fn test_parse_source_mappings_rejects_duplicates() {
        let json = r#"{ "mappings": [
            { "name": "sdk", "defaultRemote": "https://github.com/dotnet/sdk" },
            { "name": "sdk", "defaultRemote": "https://github.com/dotnet/sdk" }
        ] }"#;
        let err = parse_source_mappings(json).unwrap_err();
        assert!(format!("{}", err).contains("Duplicate mapping sdk"));
    }

    #[test]
    fn test_parse_source_mappings_rejects_bad_remote() {
        let json = r#"{ "mappings": [ { "name": "sdk", "defaultRemote": "not a url" } ] }"#;
        assert!(matches!(
            parse_source_mappings(json),
            Err(Error::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_parse_source_mappings_rejects_bad_glob() {
        let json = r#"{ "mappings": [
            { "name": "sdk", "defaultRemote": "https://github.com/dotnet/sdk", "exclude": ["[unclosed"] }
        ] }"#;
        assert!(matches!(parse_source_mappings(json), Err(Error::Glob(_))));
    }

    #[test]
    fn test_is_included() {
        let mappings = parse_source_mappings(MAPPINGS).unwrap();
        let runtime = find_mapping(&mappings, "runtime").unwrap();
        assert!(runtime.is_included("src/libraries/System.Runtime.cs"));
        assert!(!runtime.is_included("src/tests/Test.cs"));
        assert!(!runtime.is_included("src/native/lib.dll"));
        assert!(!runtime.is_included("docs/README.md"));
    }

    #[test]
    fn test_find_mapping_missing() {
        let mappings = parse_source_mappings(MAPPINGS).unwrap();
        assert!(matches!(
            find_mapping(&mappings, "aspnetcore"),
            Err(Error::MappingNotFound { .. })
        ));
    }

    #[test]
    fn test_source_manifest() {
        let manifest = SourceManifest::parse(
            r#"{
                "repositories": [
                    { "path": "arcade", "remoteUri": "https://github.com/dotnet/arcade", "commitSha": "abc123", "barId": 42 }
                ],
                "submodules": []
            }"#,
        )
        .unwrap();

        let arcade = manifest.repo_version("arcade").unwrap();
        assert_eq!(arcade.commit_sha, "abc123");
        assert_eq!(arcade.bar_id, Some(42));
        assert!(manifest.repo_version("runtime").is_err());
    }

    #[test]
    fn test_source_manifest_update() {
        let mut manifest = SourceManifest::default();
        manifest.update_repo("sdk", "https://github.com/dotnet/sdk", "def456", None);
        manifest.update_repo("arcade", "https://github.com/dotnet/arcade", "abc123", Some(1));
        manifest.update_repo("sdk", "https://github.com/dotnet/sdk", "fed789", Some(2));

        let paths: Vec<&str> = manifest.repositories.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["arcade", "sdk"]);
        assert_eq!(manifest.repo_version("sdk").unwrap().commit_sha, "fed789");

        let json = manifest.to_json().unwrap();
        assert!(json.contains("\"commitSha\": \"fed789\""));
        assert!(json.ends_with("}\n"));
        assert_eq!(SourceManifest::parse(&json).unwrap(), manifest);
    }

    #[test]
    fn test_repo_sources_path() {
        assert_eq!(repo_sources_path("sdk"), "src/sdk");
    }
}
