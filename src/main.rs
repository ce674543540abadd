use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use groocov::cobertura::CoberturaReportParser;
use groocov::jacoco::{JacocoAnalyzer, Outcome};
use groocov::measures::FileMeasures;
use groocov::resolve::{FileIndex, ResolvedFile};

/// groocov — Cobertura XML and JaCoCo binary coverage ingestion into a
/// unified per-file line/branch model.
#[derive(Parser)]
#[command(name = "groocov", version, about)]
struct Cli {
    /// Emit results as JSON instead of a table.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a Cobertura XML coverage report.
    Cobertura {
        /// Path to the XML report.
        #[arg(long)]
        report: PathBuf,

        /// Project source directory (repeatable; also used to index files).
        #[arg(long = "source-dir", required = true)]
        source_dirs: Vec<PathBuf>,

        /// Test source directory (repeatable); coverage of files found here
        /// is suppressed.
        #[arg(long = "test-dir")]
        test_dirs: Vec<PathBuf>,
    },

    /// Reconstruct coverage from JaCoCo execution data and compiled classes.
    Jacoco {
        /// Path to the .exec execution data file.
        #[arg(long)]
        exec: Option<PathBuf>,

        /// Directory of compiled .class files (repeatable).
        #[arg(long = "class-dir", required = true)]
        class_dirs: Vec<PathBuf>,

        /// Project source directory (repeatable); doubles as the ordered
        /// source roots package/file keys are resolved against.
        #[arg(long = "source-dir", required = true)]
        source_dirs: Vec<PathBuf>,

        /// Test source directory (repeatable).
        #[arg(long = "test-dir")]
        test_dirs: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Cobertura {
            report,
            source_dirs,
            test_dirs,
        } => cmd_cobertura(&report, &source_dirs, &test_dirs, cli.json),
        Commands::Jacoco {
            exec,
            class_dirs,
            source_dirs,
            test_dirs,
        } => cmd_jacoco(exec.as_deref(), &class_dirs, &source_dirs, &test_dirs, cli.json),
    }
}

fn cmd_cobertura(
    report: &std::path::Path,
    source_dirs: &[PathBuf],
    test_dirs: &[PathBuf],
    json: bool,
) -> Result<()> {
    let index = FileIndex::from_dirs(source_dirs, test_dirs);
    let parser = CoberturaReportParser::new(&index);

    let mut results = Vec::new();
    parser
        .parse_report(report, &mut |file, measures| {
            results.push((file, measures));
            Ok(())
        })
        .with_context(|| format!("Failed to parse {}", report.display()))?;

    print_results(&results, json)
}

fn cmd_jacoco(
    exec: Option<&std::path::Path>,
    class_dirs: &[PathBuf],
    source_dirs: &[PathBuf],
    test_dirs: &[PathBuf],
    json: bool,
) -> Result<()> {
    let index = FileIndex::from_dirs(source_dirs, test_dirs);
    let analyzer = JacocoAnalyzer::new(&index, source_dirs, class_dirs, exec);

    let mut results = Vec::new();
    let outcome = analyzer
        .analyse(&mut |file, measures| {
            results.push((file, measures));
            Ok(())
        })
        .context("JaCoCo analysis failed")?;

    if outcome == Outcome::SkippedNoClassDirs {
        println!("Analysis skipped: no class directories exist.");
        return Ok(());
    }
    print_results(&results, json)
}

fn print_results(results: &[(ResolvedFile, FileMeasures)], json: bool) -> Result<()> {
    if json {
        let entries: Vec<serde_json::Value> = results
            .iter()
            .map(|(file, measures)| {
                serde_json::json!({
                    "path": file.path,
                    "measures": measures,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No coverage measures produced.");
        return Ok(());
    }

    println!(
        "{:<60} {:>8} {:>8} {:>10} {:>10}",
        "FILE", "LINES", "COVERED", "CONDS", "COVERED"
    );
    println!("{}", "-".repeat(100));
    for (file, measures) in results {
        println!(
            "{:<60} {:>8} {:>8} {:>10} {:>10}",
            file.path.display(),
            measures.lines_to_cover,
            measures.covered_lines,
            measures.conditions_to_cover,
            measures.covered_conditions,
        );
    }
    Ok(())
}
