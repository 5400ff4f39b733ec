//! Build metadata and the build-query capability.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An artifact produced by a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub non_shipping: bool,
}

/// A build of one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: i64,
    pub commit: String,
    /// Repository the build was produced from
    pub repository: String,
    #[serde(default)]
    pub date_produced: Option<String>,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub released: bool,
    #[serde(default)]
    pub stable: bool,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl Build {
    /// Name to version of every asset, independent of asset order.
    pub fn asset_versions(&self) -> BTreeMap<&str, &str> {
        self.assets
            .iter()
            .map(|a| (a.name.as_str(), a.version.as_str()))
            .collect()
    }

    /// Two builds are equivalent when they are the same build and produced
    /// the same asset versions.
    pub fn is_equivalent_to(&self, other: &Build) -> bool {
        self.id == other.id && self.asset_versions() == other.asset_versions()
    }

    /// `owner/repo` style short name of the originating repository.
    pub fn repository_name(&self) -> &str {
        let trimmed = self.repository.trim_end_matches('/');
        let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
        let mut parts = trimmed.rsplitn(3, '/');
        match (parts.next(), parts.next()) {
            (Some(repo), Some(owner)) => {
                let start = trimmed.len() - repo.len() - owner.len() - 1;
                &trimmed[start..]
            }
            _ => trimmed,
        }
    }
}

/// Build-query capability
pub trait BuildClient: Send + Sync {
    fn get_build(&self, build_id: i64) -> Result<Build>;
}

/// [`BuildClient`] serving builds loaded up front, e.g. from a JSON file
#[derive(Debug, Default, Clone)]
pub struct StaticBuildClient {
    builds: HashMap<i64, Build>,
}

impl StaticBuildClient {
    pub fn new(builds: Vec<Build>) -> Self {
        Self {
            builds: builds.into_iter().map(|b| (b.id, b)).collect(),
        }
    }

    /// Accepts either a single build object or an array of builds.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let builds: Vec<Build> = if value.is_array() {
            serde_json::from_value(value)?
        } else {
            vec![serde_json::from_value(value)?]
        };
        Ok(Self::new(builds))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Any of the loaded builds; used when a single build is being flown.
    pub fn single(&self) -> Option<&Build> {
        if self.builds.len() == 1 {
            self.builds.values().next()
        } else {
            None
        }
    }
}

impl BuildClient for StaticBuildClient {
    fn get_build(&self, build_id: i64) -> Result<Build> {
        self.builds
            .get(&build_id)
            .cloned()
            .ok_or_else(|| Error::InvalidSynchronization {
                message: format!("Build {} was not found", build_id),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(name: &str, version: &str) -> Asset {
        Asset {
            id: 0,
            name: name.to_string(),
            version: version.to_string(),
            non_shipping: false,
        }
    }

    fn build(id: i64, assets: Vec<Asset>) -> Build {
        Build {
            id,
            commit: "abc".to_string(),
            repository: "https://github.com/dotnet/arcade".to_string(),
            date_produced: None,
            stale: false,
            released: false,
            stable: false,
            assets,
        }
    }

    #[test]
    fn test_equivalence_ignores_asset_order() {
        let a = build(1, vec![asset("A", "1.0.0"), asset("B", "2.0.0")]);
        let b = build(1, vec![asset("B", "2.0.0"), asset("A", "1.0.0")]);
        assert!(a.is_equivalent_to(&b));
    }

    #[test]
    fn test_equivalence_detects_differences() {
        let a = build(1, vec![asset("A", "1.0.0")]);
        assert!(!a.is_equivalent_to(&build(2, vec![asset("A", "1.0.0")])));
        assert!(!a.is_equivalent_to(&build(1, vec![asset("A", "1.0.1")])));
    }

    #[test]
    fn test_repository_name() {
        let mut b = build(1, vec![]);
        assert_eq!(b.repository_name(), "dotnet/arcade");
        b.repository = "https://github.com/dotnet/runtime.git".to_string();
        assert_eq!(b.repository_name(), "dotnet/runtime");
        b.repository = "runtime".to_string();
        assert_eq!(b.repository_name(), "runtime");
    }

    #[test]
    fn test_static_client_from_json() {
        let client = StaticBuildClient::from_json(
            r#"{ "id": 7, "commit": "def", "repository": "https://github.com/dotnet/sdk",
                 "assets": [ { "name": "Microsoft.NET.Sdk", "version": "9.0.100" } ] }"#,
        )
        .unwrap();

        let build = client.get_build(7).unwrap();
        assert_eq!(build.commit, "def");
        assert_eq!(build.assets[0].version, "9.0.100");
        assert_eq!(client.single().map(|b| b.id), Some(7));
        assert!(client.get_build(8).is_err());
    }
}
