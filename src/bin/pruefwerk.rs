use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use pruefwerk::{
    config::{default_config_yaml, example_case_yaml},
    EvaluationRunner, GradeStatus, PruefwerkConfig, RunResult, Trace,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pruefwerk")]
#[command(about = "Trace-based evaluation for LLM agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a new pruefwerk project
    Init {
        /// Overwrite existing files
        #[arg(short, long)]
        force: bool,
    },
    /// Parse the configuration and report the discovered test cases
    Validate {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Grade recorded trace JSON files against the configured suites
    Grade {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory of trace JSON files, one per test case (file stem =
        /// case name)
        #[arg(short, long)]
        traces: PathBuf,

        /// Run only the named suite(s)
        #[arg(short, long)]
        suite: Vec<String>,

        /// Filter test cases by tag(s)
        #[arg(long)]
        tag: Vec<String>,

        /// Write the full run result as JSON
        #[arg(short, long)]
        output_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("pruefwerk={default_level}"))),
        )
        .init();

    match cli.command {
        Command::Init { force } => init(force),
        Command::Validate { config } => validate(config.as_deref()),
        Command::Grade {
            config,
            traces,
            suite,
            tag,
            output_file,
        } => grade(config.as_deref(), &traces, &suite, &tag, output_file.as_deref()).await,
    }
}

fn init(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = Path::new("pruefwerk.yaml");
    if config_path.exists() && !force {
        println!("{}", "Config file already exists: pruefwerk.yaml".yellow());
        println!("Use --force to overwrite");
        return Ok(());
    }

    fs::write(config_path, default_config_yaml())?;
    println!("{} pruefwerk.yaml", "Created:".green());

    let test_dir = Path::new("tests/evals");
    fs::create_dir_all(test_dir)?;
    println!("{} tests/evals/", "Created:".green());

    let example = test_dir.join("example.yaml");
    if !example.exists() || force {
        fs::write(&example, example_case_yaml())?;
        println!("{} {}", "Created:".green(), example.display());
    }

    fs::create_dir_all(".pruefwerk")?;

    println!();
    println!("{}", "Project initialized!".bold());
    println!("Next steps:");
    println!("1. Edit pruefwerk.yaml");
    println!("2. Add test cases to tests/evals/");
    println!("3. Record agent traces, then run: pruefwerk grade --traces <dir>");
    Ok(())
}

fn validate(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = PruefwerkConfig::load(config_path)?;
    let runner = EvaluationRunner::new(config);
    let suites = runner.discover_suites()?;

    let total: usize = suites.iter().map(|suite| suite.test_cases.len()).sum();
    println!(
        "Found {} test case(s) in {} suite(s)",
        total.to_string().cyan(),
        suites.len().to_string().cyan()
    );
    for suite in &suites {
        println!("  {} ({} cases)", suite.name.bold(), suite.test_cases.len());
        for case in &suite.test_cases {
            let turns = if case.is_multi_turn() {
                format!(" [{} turns]", case.turns.len())
            } else {
                String::new()
            };
            println!("    - {}{turns}", case.name);
        }
    }
    Ok(())
}

async fn grade(
    config_path: Option<&Path>,
    traces_dir: &Path,
    suite_filter: &[String],
    tags: &[String],
    output_file: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = PruefwerkConfig::load(config_path)?;
    let min_pass_rate = config.thresholds.min_pass_rate;
    let runner = EvaluationRunner::new(config);

    let mut suites = runner.discover_suites()?;
    if !suite_filter.is_empty() {
        suites.retain(|suite| suite_filter.contains(&suite.name));
    }
    if !tags.is_empty() {
        suites = suites
            .iter()
            .map(|suite| suite.filter_by_tags(tags))
            .collect();
    }

    let traces = load_traces(traces_dir)?;
    println!(
        "Grading {} recorded trace(s) against {} suite(s)\n",
        traces.len().to_string().cyan(),
        suites.len().to_string().cyan()
    );

    let on_result = |result: &pruefwerk::EvaluationResult| {
        let marker = match result.status {
            GradeStatus::Pass => "PASS".green(),
            GradeStatus::Fail => "FAIL".red(),
            GradeStatus::Error => "ERROR".yellow(),
            GradeStatus::Skip => "SKIP".dimmed(),
        };
        println!("  [{marker}] {}", result.test_case);
    };

    let run = runner.grade_traces(&suites, &traces, Some(&on_result)).await;
    print_summary(&run);

    if let Some(path) = output_file {
        fs::write(path, serde_json::to_string_pretty(&run)?)?;
        println!("Report written to {}", path.display());
    }

    if !run.meets_threshold(min_pass_rate) {
        std::process::exit(1);
    }
    Ok(())
}

fn load_traces(dir: &Path) -> Result<HashMap<String, Trace>, Box<dyn std::error::Error>> {
    let mut traces = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let content = fs::read_to_string(&path)?;
        traces.insert(stem.to_string(), Trace::from_json(&content)?);
    }
    Ok(traces)
}

fn print_summary(run: &RunResult) {
    println!();
    for suite in &run.suites {
        println!(
            "{}: {}/{} passed ({:.0}%)",
            suite.suite.bold(),
            suite.passed(),
            suite.total(),
            suite.pass_rate() * 100.0
        );
        for result in &suite.results {
            if result.status == GradeStatus::Pass {
                continue;
            }
            println!("  {} {}", "failed:".red(), result.test_case);
            for grade in result.grades() {
                if !grade.passed() {
                    println!(
                        "    - {}: {}",
                        grade.grader,
                        grade.message.as_deref().unwrap_or("")
                    );
                }
            }
            if let Some(error) = &result.error {
                println!("    - {error}");
            }
        }
    }
    println!();
    let verdict = if run.all_passed() {
        "all tests passed".green()
    } else {
        format!(
            "{} passed, {} failed, {} errored",
            run.passed(),
            run.failed(),
            run.errored()
        )
        .normal()
    };
    println!(
        "Total: {} | {} | pass rate {:.0}%",
        run.total(),
        verdict,
        run.pass_rate() * 100.0
    );
}
