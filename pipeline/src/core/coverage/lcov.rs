use anyhow::Result;

use super::{PathResolver, accumulate};
use crate::core::types::{CoverageAggregate, CoverageMap};

/// Parse LCOV tracefile text.
///
/// Only `SF:`, `DA:` and `end_of_record` are read; branch and function
/// records are ignored. A record still open at end of input is flushed.
pub fn parse_lcov(content: &str, resolver: &PathResolver) -> Result<CoverageMap> {
    let mut map = CoverageMap::new();
    let mut current: Option<(String, CoverageAggregate)> = None;

    for line in content.lines() {
        let line = line.trim();
        if let Some(path) = line.strip_prefix("SF:") {
            if let Some((path, aggregate)) = current.take() {
                accumulate(&mut map, path, aggregate);
            }
            current = Some((resolver.resolve(path), CoverageAggregate::default()));
        } else if let Some(data) = line.strip_prefix("DA:") {
            let Some((_, aggregate)) = current.as_mut() else {
                continue;
            };
            let mut fields = data.split(',');
            let (Some(_line_no), Some(hits)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(hits) = hits.trim().parse::<f64>() else {
                continue;
            };
            aggregate.total_lines += 1;
            if hits > 0.0 {
                aggregate.covered_lines += 1;
            }
        } else if line == "end_of_record"
            && let Some((path, aggregate)) = current.take()
        {
            accumulate(&mut map, path, aggregate);
        }
    }
    if let Some((path, aggregate)) = current.take() {
        accumulate(&mut map, path, aggregate);
    }

    Ok(map)
}
