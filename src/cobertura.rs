//! Parser for Cobertura XML coverage reports.
//!
//! Cobertura XML structure:
//!   <coverage>
//!     <sources><source>...</source></sources>
//!     <packages>
//!       <package name="...">
//!         <classes>
//!           <class name="..." filename="...">
//!             <methods>
//!               <method name="...">
//!                 <lines><line number="..." hits="..." .../></lines>
//!               </method>
//!             </methods>
//!             <lines>
//!               <line number="..." hits="..." branch="true|false"
//!                     condition-coverage="50% (1/2)" />
//!             </lines>
//!           </class>
//!         </classes>
//!       </package>
//!     </packages>
//!   </coverage>
//!
//! The report is streamed twice: a first pass collects every `<source>`
//! declaration (the ordered source roots filenames are resolved against),
//! a second pass walks packages and classes. Only the `<lines>` container
//! directly under `<class>` is read; per-method line lists repeat the same
//! data and are skipped.
//!
//! Accumulators are batched per package: class elements sharing a filename
//! within one `<package>` (inner classes) merge into a single builder, and
//! the batch is resolved and flushed at `</package>`. Existing report
//! producers rely on this scoping, so a filename recurring in a later
//! package starts a fresh builder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str;
use std::sync::LazyLock;

use log::{debug, info, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;

use crate::error::{GroocovError, Result};
use crate::measures::{CoverageBuilder, MeasureSink};
use crate::resolve::{self, FileIndex};

/// Pre-compiled regex for condition-coverage attributes like "75% (3/4)".
static CONDITION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((\d+)/(\d+)\)").unwrap());

pub struct CoberturaReportParser<'a> {
    index: &'a FileIndex,
}

impl<'a> CoberturaReportParser<'a> {
    pub fn new(index: &'a FileIndex) -> Self {
        Self { index }
    }

    /// Parse a Cobertura XML report file and emit measures for every
    /// filename that resolves to a real, non-test source file.
    pub fn parse_report(&self, report: &Path, emit: &mut MeasureSink) -> Result<()> {
        let content = std::fs::read(report)?;
        self.parse(&content, emit)
    }

    pub fn parse(&self, input: &[u8], emit: &mut MeasureSink) -> Result<()> {
        let source_roots = collect_source_roots(input)?;
        if source_roots.is_empty() {
            warn!("Cobertura report declares no source directories");
        }
        self.parse_packages(input, &source_roots, emit)
    }

    fn parse_packages(
        &self,
        input: &[u8],
        source_roots: &[PathBuf],
        emit: &mut MeasureSink,
    ) -> Result<()> {
        let mut reader = Reader::from_reader(input);
        reader.trim_text(true);
        let mut buf = Vec::new();

        // Builders for the package currently being read, keyed by the raw
        // `filename` attribute.
        let mut builders: HashMap<String, CoverageBuilder> = HashMap::new();
        let mut current_class: Option<String> = None;
        let mut in_methods = false;
        let mut in_class_lines = false;

        loop {
            let event = reader.read_event_into(&mut buf);
            let is_start = matches!(&event, Ok(Event::Start(_)));
            match event {
                Err(e) => return Err(xml_err(e, &reader)),
                Ok(Event::Eof) => break,
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                    b"package" if is_start => {
                        builders.clear();
                    }
                    b"class" => {
                        let attrs = attr_map(e);
                        if let Some(filename) = attrs.get("filename") {
                            builders.entry(filename.clone()).or_default();
                            if is_start {
                                current_class = Some(filename.clone());
                            }
                        }
                    }
                    b"methods" if is_start => {
                        in_methods = true;
                    }
                    b"lines" if is_start => {
                        if current_class.is_some() && !in_methods {
                            in_class_lines = true;
                        }
                    }
                    b"line" if in_class_lines => {
                        if let Some(filename) = &current_class {
                            // Builder inserted when the class started.
                            let builder = builders
                                .entry(filename.clone())
                                .or_default();
                            collect_line(e, builder)?;
                        }
                    }
                    _ => {}
                },
                Ok(Event::End(ref e)) => match e.name().as_ref() {
                    b"package" => {
                        self.flush_package(&mut builders, source_roots, emit)?;
                    }
                    b"class" => {
                        current_class = None;
                    }
                    b"methods" => {
                        in_methods = false;
                    }
                    b"lines" => {
                        in_class_lines = false;
                    }
                    _ => {}
                },
                _ => {}
            }
            buf.clear();
        }

        // A truncated document may leave an unflushed package behind.
        self.flush_package(&mut builders, source_roots, emit)?;

        Ok(())
    }

    fn flush_package(
        &self,
        builders: &mut HashMap<String, CoverageBuilder>,
        source_roots: &[PathBuf],
        emit: &mut MeasureSink,
    ) -> Result<()> {
        for (filename, builder) in builders.drain() {
            match resolve::resolve(self.index, source_roots, &filename) {
                Some(file) if file.is_test() => {
                    debug!("Ignoring coverage of test file: {}", file.path.display());
                }
                Some(file) => {
                    info!("Saving coverage measures for {}", file.path.display());
                    emit(file, builder.build())?;
                }
                None => {
                    warn!("File not found: {}", filename);
                }
            }
        }
        Ok(())
    }
}

/// Read one `<line>` element into the builder. Malformed numeric fields are
/// fatal for the whole report.
fn collect_line(e: &BytesStart, builder: &mut CoverageBuilder) -> Result<()> {
    let attrs = attr_map(e);

    let number = attrs
        .get("number")
        .ok_or_else(|| GroocovError::Parse("<line> without a number attribute".into()))?;
    let line = number
        .parse::<u32>()
        .map_err(|_| GroocovError::Parse(format!("Bad line number: '{}'", number)))?;

    let hits = attrs
        .get("hits")
        .ok_or_else(|| GroocovError::Parse(format!("Line {} has no hits attribute", line)))?;
    // Some producers emit decimal hit counts; parse with the invariant
    // decimal convention and truncate.
    let hits = hits
        .parse::<f64>()
        .map_err(|_| GroocovError::Parse(format!("Bad hits value: '{}'", hits)))?;
    builder.set_hits(line, hits.trunc() as u64);

    let is_branch = attrs.get("branch").map(|v| v == "true").unwrap_or(false);
    if let Some(text) = attrs.get("condition-coverage") {
        if is_branch && !text.trim().is_empty() {
            let caps = CONDITION_RE.captures(text).ok_or_else(|| {
                GroocovError::Parse(format!("Bad condition coverage: '{}'", text))
            })?;
            let covered = caps[1]
                .parse::<u32>()
                .map_err(|_| GroocovError::Parse(format!("Bad condition coverage: '{}'", text)))?;
            let total = caps[2]
                .parse::<u32>()
                .map_err(|_| GroocovError::Parse(format!("Bad condition coverage: '{}'", text)))?;
            builder.set_conditions(line, total, covered);
        }
    }

    Ok(())
}

/// First pass: collect the text of every `<source>` element anywhere in the
/// document, trimmed, blanks discarded, declaration order preserved.
fn collect_source_roots(input: &[u8]) -> Result<Vec<PathBuf>> {
    let mut reader = Reader::from_reader(input);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut roots = Vec::new();
    let mut in_source = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Err(e) => return Err(xml_err(e, &reader)),
            Ok(Event::Eof) => break,
            // Self-closing <source/> has no text content and no End event,
            // so only a Start event arms text capture.
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"source" => {
                in_source = true;
            }
            Ok(Event::Text(ref e)) => {
                if in_source {
                    if let Ok(text) = e.unescape() {
                        let dir = text.trim();
                        if !dir.is_empty() {
                            roots.push(PathBuf::from(dir));
                        }
                    }
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"source" => {
                in_source = false;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(roots)
}

fn xml_err(e: quick_xml::Error, reader: &Reader<&[u8]>) -> GroocovError {
    GroocovError::Xml {
        source: e,
        position: reader.buffer_position(),
    }
}

/// Extract attributes from an XML element into a HashMap.
fn attr_map(e: &BytesStart) -> HashMap<String, String> {
    e.attributes()
        .filter_map(|a| {
            let attr = a.ok()?;
            let key = str::from_utf8(attr.key.local_name().into_inner())
                .ok()?
                .to_string();
            let value = attr.unescape_value().ok()?.to_string();
            Some((key, value))
        })
        .collect()
}
