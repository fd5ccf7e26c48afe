//! Coverage report parsing and mapping onto edited files.
//!
//! Four report dialects are supported, each selected by the test strategy
//! that produced it. Parsers are pure: they take report text plus a
//! [`PathResolver`] and return per-file aggregates keyed by
//! repository-relative path.

mod go_profile;
mod lcov;
mod xml;

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::types::{CoverageAggregate, CoverageMap, FileCoverage, coverage_percent};

pub use go_profile::parse_go_profile;
pub use lcov::parse_lcov;
pub use xml::{parse_cobertura, parse_jacoco};

/// Closed set of supported report formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageFormat {
    /// Line-coverage interchange format (`lcov.info`).
    Lcov,
    /// Native Go cover profile (`-coverprofile`).
    GoProfile,
    /// Cobertura-style XML, as written by coverage.py.
    CoberturaXml,
    /// JaCoCo XML report.
    JacocoXml,
}

impl CoverageFormat {
    pub fn parse(&self, content: &str, resolver: &PathResolver) -> Result<CoverageMap> {
        match self {
            CoverageFormat::Lcov => parse_lcov(content, resolver),
            CoverageFormat::GoProfile => parse_go_profile(content, resolver),
            CoverageFormat::CoberturaXml => parse_cobertura(content, resolver),
            CoverageFormat::JacocoXml => parse_jacoco(content, resolver),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageFormat::Lcov => "lcov",
            CoverageFormat::GoProfile => "go",
            CoverageFormat::CoberturaXml => "cobertura",
            CoverageFormat::JacocoXml => "jacoco",
        }
    }
}

impl std::str::FromStr for CoverageFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lcov" => Ok(CoverageFormat::Lcov),
            "go" | "go_profile" => Ok(CoverageFormat::GoProfile),
            "cobertura" | "cobertura_xml" => Ok(CoverageFormat::CoberturaXml),
            "jacoco" | "jacoco_xml" => Ok(CoverageFormat::JacocoXml),
            other => Err(anyhow::anyhow!("unknown coverage format '{other}'")),
        }
    }
}

/// Lexical resolution of report paths to repository-relative form.
#[derive(Debug, Clone)]
pub struct PathResolver {
    repo_root: String,
    report_dir: Option<String>,
    source_roots: Vec<String>,
    module_prefix: Option<String>,
}

impl PathResolver {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: clean(&slashes(&repo_root.to_string_lossy())),
            report_dir: None,
            source_roots: Vec::new(),
            module_prefix: None,
        }
    }

    /// Directory holding the report, used for `./` and `../` relative entries.
    pub fn with_report_dir(mut self, dir: &Path) -> Self {
        let dir = self.relativize(&slashes(&dir.to_string_lossy()));
        self.report_dir = Some(dir);
        self
    }

    /// Go module path stripped from profile entries.
    pub fn with_module_prefix(mut self, prefix: Option<String>) -> Self {
        self.module_prefix = prefix.map(|p| p.trim_end_matches('/').to_string());
        self
    }

    /// Source roots declared by the report (Cobertura `<source>`).
    pub fn with_source_roots(mut self, roots: Vec<String>) -> Self {
        let roots = roots
            .iter()
            .map(|root| self.relativize(&slashes(root.trim())))
            .filter(|root| !root.starts_with('/') && !root.starts_with(".."))
            .collect();
        self.source_roots = roots;
        self
    }

    pub fn source_roots(&self) -> &[String] {
        &self.source_roots
    }

    /// Resolve a raw report path to repository-relative form.
    pub fn resolve(&self, raw: &str) -> String {
        let path = slashes(raw.trim());
        if let Some(prefix) = &self.module_prefix
            && let Some(rest) = path.strip_prefix(&format!("{prefix}/"))
        {
            return clean(rest);
        }
        if is_absolute(&path) {
            return self.relativize(&path);
        }
        if (path.starts_with("./") || path.starts_with("../"))
            && let Some(dir) = &self.report_dir
        {
            return clean(&format!("{dir}/{path}"));
        }
        clean(&path)
    }

    /// Resolve a path that is relative to the first declared source root.
    pub fn resolve_in_source_root(&self, raw: &str) -> String {
        let path = slashes(raw.trim());
        if is_absolute(&path) {
            return self.relativize(&path);
        }
        match self.source_roots.first() {
            Some(root) if !root.is_empty() => clean(&format!("{root}/{path}")),
            _ => self.resolve(&path),
        }
    }

    fn relativize(&self, path: &str) -> String {
        let cleaned = clean(path);
        if !is_absolute(&cleaned) {
            return cleaned;
        }
        if cleaned == self.repo_root {
            return String::new();
        }
        match cleaned.strip_prefix(&format!("{}/", self.repo_root.trim_end_matches('/'))) {
            Some(rest) => rest.to_string(),
            None => cleaned,
        }
    }
}

fn slashes(path: &str) -> String {
    path.replace('\\', "/")
}

fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    let drive = bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && bytes[2] == b'/';
    path.starts_with('/') || drive
}

/// Lexically normalize `.` and `..` components, keeping `/` separators.
fn clean(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<String> = Vec::new();
    for component in PathBuf::from(path).components() {
        match component {
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if parts.last().is_some_and(|p| p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..".to_string());
                }
            }
            Component::Prefix(prefix) => {
                parts.push(prefix.as_os_str().to_string_lossy().into_owned());
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
        }
    }
    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

/// Add `aggregate` to the entry for `path`.
pub(crate) fn accumulate(map: &mut CoverageMap, path: String, aggregate: CoverageAggregate) {
    map.entry(path).or_default().add(aggregate);
}

/// Restrict `map` to exactly the edited files, in edit order.
///
/// A file matches its exact key first, then the single key that is a
/// path-suffix of it (or of which it is a suffix); ambiguous suffixes match
/// nothing. Files without a match get zero counts and a `None` percentage. The overall percentage covers edited
/// files only.
pub fn map_to_edited_files(
    map: &CoverageMap,
    edited_paths: &[String],
) -> (Vec<FileCoverage>, Option<f64>) {
    let mut seen = std::collections::BTreeSet::new();
    let mut files = Vec::new();
    let mut covered_sum = 0u64;
    let mut total_sum = 0u64;

    for raw in edited_paths {
        let path = clean(&slashes(raw));
        if !seen.insert(path.clone()) {
            continue;
        }
        let aggregate = lookup(map, &path).unwrap_or_default();
        covered_sum += aggregate.covered_lines;
        total_sum += aggregate.total_lines;
        files.push(FileCoverage {
            path,
            covered_lines: aggregate.covered_lines,
            total_lines: aggregate.total_lines,
            line_coverage_percent: coverage_percent(
                aggregate.covered_lines,
                aggregate.total_lines,
            ),
        });
    }

    (files, coverage_percent(covered_sum, total_sum))
}

fn lookup(map: &CoverageMap, path: &str) -> Option<CoverageAggregate> {
    if let Some(found) = map.get(path) {
        return Some(*found);
    }
    let mut candidates = map.iter().filter(|(key, _)| {
        !key.is_empty()
            && (path.ends_with(&format!("/{key}")) || key.ends_with(&format!("/{path}")))
    });
    match (candidates.next(), candidates.next()) {
        (Some((_, aggregate)), None) => Some(*aggregate),
        _ => None,
    }
}
