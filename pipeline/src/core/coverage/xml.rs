//! Cobertura and JaCoCo XML reports.
//!
//! Both dialects are flat enough that element matching with regexes is
//! sufficient; no DTDs are fetched and no namespaces are involved.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;

use super::{PathResolver, accumulate};
use crate::core::types::{CoverageAggregate, CoverageMap};

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});
static SOURCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<source>(.*?)</source>").unwrap());
static CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<class\b([^>]*?)(?:/>|>(.*?)</class>)").unwrap());
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<line\b([^>]*?)/?>").unwrap());
static PACKAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<package\b([^>]*?)>(.*?)</package>").unwrap());
static SOURCEFILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<sourcefile\b([^>]*?)(?:/>|>(.*?)</sourcefile>)").unwrap()
});
static COUNTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<counter\b([^>]*?)/?>").unwrap());

/// Cobertura: `<class filename=..>` elements with `<line number hits>` children.
///
/// Hits for the same line are merged by maximum, so a line listed under
/// several classes or methods counts once.
pub fn parse_cobertura(content: &str, resolver: &PathResolver) -> Result<CoverageMap> {
    if !content.contains("<coverage") {
        bail!("not a Cobertura report: missing <coverage> root");
    }
    let sources = SOURCE_RE
        .captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| decode_entities(m.as_str())))
        .filter(|source| !source.trim().is_empty())
        .collect();
    let resolver = resolver.clone().with_source_roots(sources);

    let mut lines_by_file: BTreeMap<String, BTreeMap<u64, u64>> = BTreeMap::new();
    for caps in CLASS_RE.captures_iter(content) {
        let attrs = attributes(caps.get(1).map_or("", |m| m.as_str()));
        let Some(filename) = attrs.get("filename") else {
            continue;
        };
        let path = resolver.resolve_in_source_root(filename);
        let lines = lines_by_file.entry(path).or_default();
        let Some(body) = caps.get(2) else {
            continue;
        };
        for line in LINE_RE.captures_iter(body.as_str()) {
            let attrs = attributes(line.get(1).map_or("", |m| m.as_str()));
            let number = number_attr(&attrs, "number");
            let hits = number_attr(&attrs, "hits");
            let (Some(number), Some(hits)) = (number, hits) else {
                continue;
            };
            let entry = lines.entry(number).or_insert(0);
            *entry = (*entry).max(hits);
        }
    }

    let mut map = CoverageMap::new();
    for (path, lines) in lines_by_file {
        let covered = lines.values().filter(|hits| **hits > 0).count() as u64;
        accumulate(
            &mut map,
            path,
            CoverageAggregate {
                covered_lines: covered,
                total_lines: lines.len() as u64,
            },
        );
    }
    Ok(map)
}

/// JaCoCo: `<package name>` / `<sourcefile name>` with a pre-aggregated
/// `LINE` counter, falling back to `<line nr mi ci>` elements.
pub fn parse_jacoco(content: &str, resolver: &PathResolver) -> Result<CoverageMap> {
    if !content.contains("<report") {
        bail!("not a JaCoCo report: missing <report> root");
    }
    let mut map = CoverageMap::new();
    for package in PACKAGE_RE.captures_iter(content) {
        let package_attrs = attributes(package.get(1).map_or("", |m| m.as_str()));
        let package_name = package_attrs.get("name").map_or("", String::as_str);
        let body = package.get(2).map_or("", |m| m.as_str());

        for source in SOURCEFILE_RE.captures_iter(body) {
            let attrs = attributes(source.get(1).map_or("", |m| m.as_str()));
            let Some(name) = attrs.get("name") else {
                continue;
            };
            let raw = if package_name.is_empty() {
                name.clone()
            } else {
                format!("{}/{name}", package_name.trim_end_matches('/'))
            };
            let body = source.get(2).map_or("", |m| m.as_str());
            accumulate(&mut map, resolver.resolve(&raw), sourcefile_aggregate(body));
        }
    }
    Ok(map)
}

fn sourcefile_aggregate(body: &str) -> CoverageAggregate {
    for counter in COUNTER_RE.captures_iter(body) {
        let attrs = attributes(counter.get(1).map_or("", |m| m.as_str()));
        if attrs.get("type").map(String::as_str) != Some("LINE") {
            continue;
        }
        let missed = number_attr(&attrs, "missed").unwrap_or(0);
        let covered = number_attr(&attrs, "covered").unwrap_or(0);
        return CoverageAggregate {
            covered_lines: covered,
            total_lines: missed + covered,
        };
    }

    let mut aggregate = CoverageAggregate::default();
    for line in LINE_RE.captures_iter(body) {
        let attrs = attributes(line.get(1).map_or("", |m| m.as_str()));
        if number_attr(&attrs, "nr").is_none() {
            continue;
        }
        aggregate.total_lines += 1;
        if number_attr(&attrs, "ci").unwrap_or(0) > 0 {
            aggregate.covered_lines += 1;
        }
    }
    aggregate
}

fn attributes(raw: &str) -> BTreeMap<String, String> {
    ATTR_RE
        .captures_iter(raw)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().to_string();
            let value = caps.get(2).or_else(|| caps.get(3))?.as_str();
            Some((name, decode_entities(value)))
        })
        .collect()
}

fn number_attr(attrs: &BTreeMap<String, String>, name: &str) -> Option<u64> {
    attrs.get(name)?.trim().parse().ok()
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
