//! Combines class structure with merged execution data into per-line
//! coverage, grouped by the source file the classes were compiled from.

use std::collections::BTreeMap;
use std::collections::HashMap;

use fixedbitset::FixedBitSet;

use crate::jacoco::class_file::{ClassStructure, ProbeKind};
use crate::measures::CoverageBuilder;

/// Instruction-coverage status of one source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    FullyCovered,
    PartlyCovered,
    NotCovered,
    /// No executable code on the line; it carries no measure at all.
    Empty,
}

/// Probe tallies for one source line, possibly merged from several classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineTally {
    pub line_probes: u32,
    pub line_probes_hit: u32,
    pub branch_probes: u32,
    pub branch_probes_hit: u32,
}

impl LineTally {
    #[must_use]
    pub fn status(&self) -> LineStatus {
        let total = self.line_probes + self.branch_probes;
        let hit = self.line_probes_hit + self.branch_probes_hit;
        if total == 0 {
            LineStatus::Empty
        } else if hit == 0 {
            LineStatus::NotCovered
        } else if hit == total {
            LineStatus::FullyCovered
        } else {
            LineStatus::PartlyCovered
        }
    }
}

/// Per-line coverage of one source file, accumulated from every class that
/// declares it (top-level, nested and inner classes all map back to the same
/// `.groovy` file).
#[derive(Debug, Default)]
pub struct SourceFileTally {
    lines: BTreeMap<u32, LineTally>,
}

impl SourceFileTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one class's probe layout into the tally. `probes` is the merged
    /// hit vector for the class, or `None` when the class never appeared in
    /// the execution data (all probes unhit, explicit zero coverage).
    pub fn apply_class(&mut self, class: &ClassStructure, probes: Option<&FixedBitSet>) {
        for (index, site) in class.probes.iter().enumerate() {
            let hit = probes.is_some_and(|p| p.contains(index));
            let tally = self.lines.entry(site.line).or_default();
            match site.kind {
                ProbeKind::Line => {
                    tally.line_probes += 1;
                    if hit {
                        tally.line_probes_hit += 1;
                    }
                }
                ProbeKind::Branch => {
                    tally.branch_probes += 1;
                    if hit {
                        tally.branch_probes_hit += 1;
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Convert the tallies into measures. Covered (fully or partly) lines
    /// record a hit count of 1, uncovered lines 0; empty lines are omitted.
    /// Lines with branch outcomes also record a condition pair.
    #[must_use]
    pub fn into_builder(self) -> CoverageBuilder {
        let mut builder = CoverageBuilder::new();
        for (line, tally) in self.lines {
            let hits = match tally.status() {
                LineStatus::FullyCovered | LineStatus::PartlyCovered => 1,
                LineStatus::NotCovered => 0,
                LineStatus::Empty => continue,
            };
            builder.set_hits(line, hits);
            if tally.branch_probes > 0 {
                builder.set_conditions(line, tally.branch_probes, tally.branch_probes_hit);
            }
        }
        builder
    }
}

/// Tallies for every source file discovered during a class-directory walk,
/// keyed by `(package, source file name)`.
#[derive(Debug, Default)]
pub struct SourceFileTallies {
    files: HashMap<(String, String), SourceFileTally>,
}

impl SourceFileTallies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_class(&mut self, class: &ClassStructure, probes: Option<&FixedBitSet>) {
        let Some(source_file) = &class.source_file else {
            return;
        };
        let key = (class.package().to_string(), source_file.clone());
        self.files.entry(key).or_default().apply_class(class, probes);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Drain into `(report-relative key, tally)` pairs; the key joins the
    /// package and source file name the way coverage reports do.
    pub fn into_files(self) -> impl Iterator<Item = (String, SourceFileTally)> {
        self.files.into_iter().map(|((package, name), tally)| {
            let key = if package.is_empty() {
                name
            } else {
                format!("{}/{}", package, name)
            };
            (key, tally)
        })
    }
}
