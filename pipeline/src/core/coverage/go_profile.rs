use anyhow::Result;

use super::{PathResolver, accumulate};
use crate::core::types::{CoverageAggregate, CoverageMap};

/// Parse a Go cover profile.
///
/// Each block line is `path:startLine.startCol,endLine.endCol numStmt count`.
/// Statements stand in for lines: `numStmt` adds to the total, and to the
/// covered count when `count > 0`. Malformed lines are skipped.
pub fn parse_go_profile(content: &str, resolver: &PathResolver) -> Result<CoverageMap> {
    let mut map = CoverageMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("mode:") {
            continue;
        }
        let Some((location, counts)) = line.rsplit_once(':') else {
            continue;
        };
        let mut fields = counts.split_whitespace();
        let (Some(_range), Some(statements), Some(count), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let (Ok(statements), Ok(count)) = (statements.parse::<u64>(), count.parse::<u64>()) else {
            continue;
        };
        let covered = if count > 0 { statements } else { 0 };
        accumulate(
            &mut map,
            resolver.resolve(location),
            CoverageAggregate {
                covered_lines: covered,
                total_lines: statements,
            },
        );
    }

    Ok(map)
}
