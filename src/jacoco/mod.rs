//! Coverage reconstruction from JaCoCo binary execution data plus compiled
//! class files.
//!
//! The analyzer reads the recorded probe hits (OR-merged across sessions),
//! walks every configured class directory, statically analyzes each `.class`
//! artifact, and combines the two into per-source-file line and branch
//! coverage. Resolution of `package/SourceFile.groovy` keys against real
//! source files uses the same source-root contract as the XML pipeline.

pub mod analysis;
pub mod class_file;
pub mod exec;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::{info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::measures::MeasureSink;
use crate::jacoco::analysis::SourceFileTallies;
use crate::jacoco::exec::ExecutionDataStore;
use crate::resolve::{self, FileIndex};

/// How an analysis run ended. Skipping is distinct from completing with
/// zero coverage: a project that was never compiled has no coverage to
/// report, not 0%.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// None of the configured class directories exist; nothing was analyzed.
    SkippedNoClassDirs,
    /// Analysis ran; `analyzed_files` source files produced measures.
    Completed { analyzed_files: usize },
}

pub struct JacocoAnalyzer<'a> {
    index: &'a FileIndex,
    source_roots: &'a [PathBuf],
    class_dirs: &'a [PathBuf],
    exec_file: Option<&'a Path>,
}

impl<'a> JacocoAnalyzer<'a> {
    pub fn new(
        index: &'a FileIndex,
        source_roots: &'a [PathBuf],
        class_dirs: &'a [PathBuf],
        exec_file: Option<&'a Path>,
    ) -> Self {
        Self {
            index,
            source_roots,
            class_dirs,
            exec_file,
        }
    }

    pub fn analyse(&self, emit: &mut MeasureSink) -> Result<Outcome> {
        if !self.at_least_one_class_dir_exists() {
            warn!("Coverage is not reported since there are no directories with classes.");
            return Ok(Outcome::SkippedNoClassDirs);
        }

        let store = self.read_execution_data();
        let tallies = self.analyze_class_dirs(&store);

        let mut analyzed = 0usize;
        for (raw_key, tally) in tallies.into_files() {
            match resolve::resolve(self.index, self.source_roots, &raw_key) {
                Some(file) if file.is_test() => {
                    // Test code is not instrumented for production coverage.
                    info!("Ignoring coverage of test file: {}", file.path.display());
                }
                Some(file) => {
                    emit(file, tally.into_builder().build())?;
                    analyzed += 1;
                }
                None => {
                    warn!("File not found: {}", raw_key);
                }
            }
        }

        if analyzed == 0 {
            warn!(
                "Coverage information was not collected. \
                 Perhaps the compiled classes are missing debug information?"
            );
        }
        Ok(Outcome::Completed {
            analyzed_files: analyzed,
        })
    }

    fn at_least_one_class_dir_exists(&self) -> bool {
        if self.class_dirs.is_empty() {
            warn!("No class directories configured.");
        }
        for dir in self.class_dirs {
            info!("Checking class directory: {}", dir.display());
            if dir.exists() {
                return true;
            }
        }
        false
    }

    /// Load and merge the execution data. Every failure mode here — no path
    /// configured, file missing, unreadable or corrupt stream — degrades to
    /// an empty store with a warning; structural analysis still runs and
    /// reports explicit zero coverage.
    fn read_execution_data(&self) -> ExecutionDataStore {
        let mut store = ExecutionDataStore::new();
        let Some(path) = self.exec_file else {
            warn!("Coverage is reported as 0% as no execution data file was configured.");
            return store;
        };
        if !path.is_file() {
            warn!(
                "Coverage is reported as 0% as no execution data has been dumped: {}",
                path.display()
            );
            return store;
        }

        info!("Analysing {}", path.display());
        let result = File::open(path)
            .map_err(Into::into)
            .and_then(|file| exec::read(&mut BufReader::new(file), &mut store));
        if let Err(e) = result {
            warn!(
                "Unable to read execution data from {}: {}",
                path.display(),
                e
            );
            return ExecutionDataStore::new();
        }

        info!(
            "Merged {} session(s) covering {} class(es)",
            store.session_count(),
            store.class_count()
        );
        store
    }

    /// Walk the class directories depth-first and analyze every `.class`
    /// file. Each artifact has its own failure boundary: a corrupt class is
    /// warned about and skipped so it cannot blank out the rest.
    fn analyze_class_dirs(&self, store: &ExecutionDataStore) -> SourceFileTallies {
        let mut tallies = SourceFileTallies::new();
        for dir in self.class_dirs {
            for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("class") {
                    continue;
                }
                if let Err(e) = analyze_class_file(path, store, &mut tallies) {
                    warn!("Exception during analysis of file {}: {}", path.display(), e);
                }
            }
        }
        tallies
    }
}

fn analyze_class_file(
    path: &Path,
    store: &ExecutionDataStore,
    tallies: &mut SourceFileTallies,
) -> Result<()> {
    let bytes = std::fs::read(path)?;
    let class = class_file::parse(&bytes)?;
    let probes = store
        .get(class_file::class_id(&bytes))
        .map(|data| &data.probes);
    tallies.apply_class(&class, probes);
    Ok(())
}
