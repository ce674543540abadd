//! Shared accumulator for per-file coverage observations, independent of the
//! report format that produced them. Both the Cobertura and JaCoCo pipelines
//! feed a `CoverageBuilder` and hand the finalized `FileMeasures` to the
//! caller's sink.

use std::collections::BTreeMap;

use crate::error::{GroocovError, Result};
use crate::resolve::ResolvedFile;

/// Sink both pipelines hand finalized measures to, invoked once per
/// resolved, non-test source file. Stands in for the host's measure store.
pub type MeasureSink<'s> = dyn FnMut(ResolvedFile, FileMeasures) -> Result<()> + 's;

/// Compute a coverage rate, returning 0.0 when the total is zero.
#[must_use]
pub fn rate(covered: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        covered as f64 / total as f64
    }
}

/// Mutable per-file accumulator. Lives for one parse pass of one file;
/// `build` consumes it, so a finalized measure set can never be mutated.
#[derive(Debug, Default)]
pub struct CoverageBuilder {
    hits: BTreeMap<u32, u64>,
    // line → (covered, total)
    conditions: BTreeMap<u32, (u32, u32)>,
}

impl CoverageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the hit count for a line. A later call for the same line
    /// overwrites the earlier one — reports may redeclare a class across
    /// multiple entries and the last declaration wins.
    pub fn set_hits(&mut self, line: u32, hits: u64) {
        self.hits.insert(line, hits);
    }

    /// Record branch data for a line. `conditions == 0` records nothing (a
    /// line with no conditions carries no branch record); `covered` is
    /// clamped to `conditions`. Overwrites like `set_hits`.
    pub fn set_conditions(&mut self, line: u32, conditions: u32, covered: u32) {
        if conditions == 0 {
            return;
        }
        self.conditions.insert(line, (covered.min(conditions), conditions));
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty() && self.conditions.is_empty()
    }

    /// Finalize into an immutable measure set.
    #[must_use]
    pub fn build(self) -> FileMeasures {
        let covered_lines = self.hits.values().filter(|&&h| h > 0).count() as u64;
        let lines_to_cover = self.hits.len() as u64;

        let mut conditions_to_cover = 0u64;
        let mut covered_conditions = 0u64;
        let mut line_conditions = Vec::with_capacity(self.conditions.len());
        for (&line, &(covered, total)) in &self.conditions {
            conditions_to_cover += u64::from(total);
            covered_conditions += u64::from(covered);
            line_conditions.push(LineConditions {
                line,
                covered,
                total,
            });
        }

        FileMeasures {
            lines_to_cover,
            covered_lines,
            conditions_to_cover,
            covered_conditions,
            line_hits: self.hits.into_iter().collect(),
            line_conditions,
        }
    }
}

/// Branch record for a single line: `covered <= total`, `total > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct LineConditions {
    pub line: u32,
    pub covered: u32,
    pub total: u32,
}

/// Immutable, finalized measure set for one source file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FileMeasures {
    pub lines_to_cover: u64,
    pub covered_lines: u64,
    pub conditions_to_cover: u64,
    pub covered_conditions: u64,
    /// Sparse (line, hits) pairs, sorted by line number.
    pub line_hits: Vec<(u32, u64)>,
    /// Sparse per-line branch records, sorted by line number.
    pub line_conditions: Vec<LineConditions>,
}

impl FileMeasures {
    #[must_use]
    pub fn line_rate(&self) -> f64 {
        rate(self.covered_lines, self.lines_to_cover)
    }

    #[must_use]
    pub fn condition_rate(&self) -> f64 {
        rate(self.covered_conditions, self.conditions_to_cover)
    }

    /// Compact `"line=hits"` encoding of the per-line hit data, e.g.
    /// `"1=2;2=0;6=1"`.
    #[must_use]
    pub fn line_hits_data(&self) -> String {
        encode_line_data(self.line_hits.iter().copied())
    }
}

/// Serialize sparse (line, value) pairs as `"line=value"` joined by `;`.
pub fn encode_line_data(pairs: impl IntoIterator<Item = (u32, u64)>) -> String {
    let mut out = String::new();
    for (line, value) in pairs {
        if !out.is_empty() {
            out.push(';');
        }
        out.push_str(&format!("{}={}", line, value));
    }
    out
}

/// Inverse of [`encode_line_data`]. The empty string decodes to no pairs.
pub fn decode_line_data(data: &str) -> Result<Vec<(u32, u64)>> {
    let mut pairs = Vec::new();
    if data.is_empty() {
        return Ok(pairs);
    }
    for entry in data.split(';') {
        let (line, value) = entry
            .split_once('=')
            .ok_or_else(|| GroocovError::Parse(format!("Bad line data entry: '{}'", entry)))?;
        let line = line
            .parse::<u32>()
            .map_err(|_| GroocovError::Parse(format!("Bad line number: '{}'", line)))?;
        let value = value
            .parse::<u64>()
            .map_err(|_| GroocovError::Parse(format!("Bad line value: '{}'", value)))?;
        pairs.push((line, value));
    }
    Ok(pairs)
}
