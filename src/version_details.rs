//! # Dependency Manifest Model
//!
//! `eng/Version.Details.xml` lists the dependencies of a repository together
//! with the commit and repository each one was produced from. Repositories
//! participating in code flow also carry a `<Source>` tag recording the VMR
//! commit (and build) their sources were last synchronized from.
//!
//! ```xml
//! <Dependencies>
//!   <Source Uri="https://github.com/dotnet/dotnet" Mapping="runtime" Sha="abc" BarId="123" />
//!   <ProductDependencies>
//!     <Dependency Name="Microsoft.NET.Sdk" Version="9.0.100">
//!       <Uri>https://github.com/dotnet/sdk</Uri>
//!       <Sha>def</Sha>
//!     </Dependency>
//!   </ProductDependencies>
//!   <ToolsetDependencies />
//! </Dependencies>
//! ```
//!
//! Parsing goes through the [`VersionDetailsParser`] capability, backed by
//! `xot`. Writing is done by [`VersionDetails::to_xml`], which emits a stable
//! layout so that diffs of rewritten files stay minimal.

use std::collections::HashMap;

use xot::{Node, Xot};

use crate::error::{Error, Result};

pub const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyType {
    Product,
    Toolset,
}

/// One `<Dependency>` entry; `name` is the natural key within a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyDetail {
    pub name: String,
    pub version: String,
    pub commit: String,
    pub repo_uri: String,
    pub dependency_type: DependencyType,
    pub pinned: bool,
}

/// The `<Source>` tag: where the repository's sources were last flown from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDependency {
    pub uri: String,
    pub mapping: String,
    pub sha: String,
    pub bar_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionDetails {
    pub dependencies: Vec<DependencyDetail>,
    pub source: Option<SourceDependency>,
}

impl VersionDetails {
    pub fn find(&self, name: &str) -> Option<&DependencyDetail> {
        self.dependencies.iter().find(|d| d.name == name)
    }

    /// Replaces a dependency in place (keeping its section and pin) or
    /// appends it. Returns the replaced entry.
    pub fn upsert(&mut self, new: &DependencyDetail) -> Option<DependencyDetail> {
        match self.dependencies.iter_mut().find(|d| d.name == new.name) {
            Some(existing) => {
                let previous = existing.clone();
                existing.version = new.version.clone();
                existing.commit = new.commit.clone();
                existing.repo_uri = new.repo_uri.clone();
                Some(previous)
            }
            None => {
                self.dependencies.push(new.clone());
                None
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<DependencyDetail> {
        let index = self.dependencies.iter().position(|d| d.name == name)?;
        Some(self.dependencies.remove(index))
    }

    /// Serializes the manifest in a stable layout.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        out.push_str(XML_DECLARATION);
        out.push('\n');
        out.push_str("<Dependencies>\n");

        if let Some(source) = &self.source {
            out.push_str(&format!(
                "  <Source Uri=\"{}\" Mapping=\"{}\" Sha=\"{}\"",
                escape(&source.uri),
                escape(&source.mapping),
                escape(&source.sha)
            ));
            if let Some(bar_id) = source.bar_id {
                out.push_str(&format!(" BarId=\"{}\"", bar_id));
            }
            out.push_str(" />\n");
        }

        write_section(&mut out, "ProductDependencies", self.of_type(DependencyType::Product));
        write_section(&mut out, "ToolsetDependencies", self.of_type(DependencyType::Toolset));

        out.push_str("</Dependencies>\n");
        out
    }

    fn of_type(&self, dependency_type: DependencyType) -> impl Iterator<Item = &DependencyDetail> {
        self.dependencies
            .iter()
            .filter(move |d| d.dependency_type == dependency_type)
    }
}

fn write_section<'a>(
    out: &mut String,
    element: &str,
    dependencies: impl Iterator<Item = &'a DependencyDetail>,
) {
    out.push_str(&format!("  <{}>\n", element));
    for dependency in dependencies {
        out.push_str(&format!(
            "    <Dependency Name=\"{}\" Version=\"{}\"",
            escape(&dependency.name),
            escape(&dependency.version)
        ));
        if dependency.pinned {
            out.push_str(" Pinned=\"true\"");
        }
        out.push_str(">\n");
        out.push_str(&format!("      <Uri>{}</Uri>\n", escape(&dependency.repo_uri)));
        out.push_str(&format!("      <Sha>{}</Sha>\n", escape(&dependency.commit)));
        out.push_str("    </Dependency>\n");
    }
    out.push_str(&format!("  </{}>\n", element));
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Manifest parser capability
pub trait VersionDetailsParser: Send + Sync {
    /// Parses manifest content. Pinned dependencies are dropped unless
    /// `include_pinned` is set.
    fn parse(&self, text: &str, include_pinned: bool) -> Result<VersionDetails>;
}

/// [`VersionDetailsParser`] backed by `xot`
#[derive(Debug, Default, Clone)]
pub struct XotVersionDetailsParser;

impl VersionDetailsParser for XotVersionDetailsParser {
    fn parse(&self, text: &str, include_pinned: bool) -> Result<VersionDetails> {
        let mut xot = Xot::new();
        let names = Names::new(&mut xot);

        let doc = xot.parse(text).map_err(|e| manifest_error(e.to_string()))?;
        let root = xot
            .document_element(doc)
            .map_err(|e| manifest_error(e.to_string()))?;

        let mut details = VersionDetails::default();
        for child in element_children(&xot, root) {
            let tag = local_name(&xot, child);
            match tag {
                "Source" => details.source = Some(parse_source(&xot, &names, child)?),
                "ProductDependencies" | "ToolsetDependencies" => {
                    let dependency_type = if tag == "ProductDependencies" {
                        DependencyType::Product
                    } else {
                        DependencyType::Toolset
                    };
                    for node in element_children(&xot, child) {
                        if local_name(&xot, node) != "Dependency" {
                            continue;
                        }
                        let dependency = parse_dependency(&xot, &names, node, dependency_type)?;
                        if include_pinned || !dependency.pinned {
                            details.dependencies.push(dependency);
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(details)
    }
}

struct Names {
    name: xot::NameId,
    version: xot::NameId,
    pinned: xot::NameId,
    uri: xot::NameId,
    mapping: xot::NameId,
    sha: xot::NameId,
    bar_id: xot::NameId,
}

impl Names {
    fn new(xot: &mut Xot) -> Self {
        Self {
            name: xot.add_name("Name"),
            version: xot.add_name("Version"),
            pinned: xot.add_name("Pinned"),
            uri: xot.add_name("Uri"),
            mapping: xot.add_name("Mapping"),
            sha: xot.add_name("Sha"),
            bar_id: xot.add_name("BarId"),
        }
    }
}

fn manifest_error(message: impl Into<String>) -> Error {
    Error::ManifestParse {
        file: crate::config::VERSION_DETAILS_XML.to_string(),
        message: message.into(),
    }
}

fn element_children(xot: &Xot, node: Node) -> Vec<Node> {
    xot.children(node).filter(|n| xot.is_element(*n)).collect()
}

fn local_name(xot: &Xot, node: Node) -> &str {
    xot.element(node)
        .map(|element| xot.local_name_str(element.name()))
        .unwrap_or_default()
}

fn required_attribute(xot: &Xot, node: Node, name: xot::NameId, what: &str) -> Result<String> {
    xot.get_attribute(node, name)
        .map(str::to_string)
        .ok_or_else(|| {
            manifest_error(format!(
                "<{}> is missing the {} attribute",
                local_name(xot, node),
                what
            ))
        })
}

fn parse_source(xot: &Xot, names: &Names, node: Node) -> Result<SourceDependency> {
    let bar_id = match xot.get_attribute(node, names.bar_id) {
        Some(value) => Some(
            value
                .trim()
                .parse::<i64>()
                .map_err(|_| manifest_error(format!("Invalid BarId '{}'", value)))?,
        ),
        None => None,
    };

    Ok(SourceDependency {
        uri: required_attribute(xot, node, names.uri, "Uri")?,
        mapping: required_attribute(xot, node, names.mapping, "Mapping")?,
        sha: required_attribute(xot, node, names.sha, "Sha")?,
        bar_id,
    })
}

fn parse_dependency(
    xot: &Xot,
    names: &Names,
    node: Node,
    dependency_type: DependencyType,
) -> Result<DependencyDetail> {
    let mut repo_uri = String::new();
    let mut commit = String::new();
    for child in element_children(xot, node) {
        let text = xot.text_content_str(child).unwrap_or_default().trim().to_string();
        match local_name(xot, child) {
            "Uri" => repo_uri = text,
            "Sha" => commit = text,
            _ => {}
        }
    }

    let pinned = xot
        .get_attribute(node, names.pinned)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    Ok(DependencyDetail {
        name: required_attribute(xot, node, names.name, "Name")?,
        version: required_attribute(xot, node, names.version, "Version")?,
        commit,
        repo_uri,
        dependency_type,
        pinned,
    })
}

/// A single dependency change; `from` is `None` for additions and `to` is
/// `None` for removals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyUpdate {
    pub from: Option<DependencyDetail>,
    pub to: Option<DependencyDetail>,
}

impl DependencyUpdate {
    pub fn name(&self) -> &str {
        self.to
            .as_ref()
            .or(self.from.as_ref())
            .map(|d| d.name.as_str())
            .unwrap_or_default()
    }

    pub fn is_addition(&self) -> bool {
        self.from.is_none() && self.to.is_some()
    }

    pub fn is_removal(&self) -> bool {
        self.from.is_some() && self.to.is_none()
    }

    /// Short description used in conflict reports.
    pub fn describe(&self) -> String {
        match (&self.from, &self.to) {
            (Some(from), Some(to)) => format!("updated from {} to {}", from.version, to.version),
            (None, Some(to)) => format!("added as {}", to.version),
            (Some(from), None) => format!("removed ({})", from.version),
            (None, None) => "unchanged".to_string(),
        }
    }
}

/// Differences between two manifests, keyed by name.
///
/// Entries whose version, commit or repository differ are reported; anything
/// else (such as the `Pinned` flag or the section) does not count as a change.
pub fn compute_changes(before: &VersionDetails, after: &VersionDetails) -> Vec<DependencyUpdate> {
    let before_by_name: HashMap<&str, &DependencyDetail> = before
        .dependencies
        .iter()
        .map(|d| (d.name.as_str(), d))
        .collect();
    let after_by_name: HashMap<&str, &DependencyDetail> = after
        .dependencies
        .iter()
        .map(|d| (d.name.as_str(), d))
        .collect();

    let mut changes = Vec::new();
    for old in &before.dependencies {
        match after_by_name.get(old.name.as_str()) {
            None => changes.push(DependencyUpdate {
                from: Some(old.clone()),
                to: None,
            }),
            Some(new)
                if new.version != old.version
                    || new.commit != old.commit
                    || new.repo_uri != old.repo_uri =>
            {
                changes.push(DependencyUpdate {
                    from: Some(old.clone()),
                    to: Some((*new).clone()),
                })
            }
            Some(_) => {}
        }
    }

    for new in &after.dependencies {
        if !before_by_name.contains_key(new.name.as_str()) {
            changes.push(DependencyUpdate {
                from: None,
                to: Some(new.clone()),
            });
        }
    }

    changes
}

/// Outcome of a manifest merge. A name appears in at most one list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionFileChanges {
    pub additions: Vec<DependencyDetail>,
    pub removals: Vec<String>,
    pub updates: Vec<DependencyUpdate>,
}

impl VersionFileChanges {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty() && self.updates.is_empty()
    }

    /// All changes as [`DependencyUpdate`]s, e.g. for a commit message.
    pub fn to_updates(&self, previous: &VersionDetails) -> Vec<DependencyUpdate> {
        let mut updates: Vec<DependencyUpdate> = self.updates.clone();
        updates.extend(self.additions.iter().map(|a| DependencyUpdate {
            from: None,
            to: Some(a.clone()),
        }));
        updates.extend(self.removals.iter().filter_map(|name| {
            previous.find(name).map(|d| DependencyUpdate {
                from: Some(d.clone()),
                to: None,
            })
        }));
        updates
    }
}

/// Builds the body of a dependency update commit.
///
/// Dependencies sharing a version blurb are listed together, e.g.
/// `Microsoft.A, Microsoft.B (Version 1.0.0 -> 1.0.1)`.
pub fn build_dependency_update_commit_message(updates: &[DependencyUpdate]) -> String {
    if updates.is_empty() {
        return "No dependency updates to commit".to_string();
    }

    let mut updated: Vec<(String, Vec<String>)> = Vec::new();
    let mut added: Vec<(String, Vec<String>)> = Vec::new();
    let mut removed: Vec<(String, Vec<String>)> = Vec::new();

    for update in updates {
        let (group, blurb, name) = match (&update.from, &update.to) {
            (Some(from), Some(to)) => (
                &mut updated,
                format!("Version {} -> {}", from.version, to.version),
                &to.name,
            ),
            (None, Some(to)) => (&mut added, format!("Version {}", to.version), &to.name),
            (Some(from), None) => (&mut removed, format!("Version {}", from.version), &from.name),
            (None, None) => continue,
        };

        match group.iter_mut().find(|(b, _)| *b == blurb) {
            Some((_, names)) => names.push(name.clone()),
            None => group.push((blurb, vec![name.clone()])),
        }
    }

    let mut message = String::new();
    for (title, group) in [
        ("Updated Dependencies:", &updated),
        ("Added Dependencies:", &added),
        ("Removed Dependencies:", &removed),
    ] {
        if group.is_empty() {
            continue;
        }
        message.push_str(title);
        message.push('\n');
        for (blurb, names) in group {
            message.push_str(&format!("{} ({})\n", names.join(", "), blurb));
        }
        message.push('\n');
    }

    message
}
