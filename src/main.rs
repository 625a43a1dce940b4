//! RuleRunner CLI Entry Point
//!
//! Provides command-line interface for pipeline execution.
//!
//! # Usage
//!
//! ```bash
//! # Build the pipeline's default targets
//! rulerunner pipeline.yaml
//!
//! # Build specific targets
//! rulerunner pipeline.yaml calls/S1.vcf calls/S2.vcf
//!
//! # Dry run mode (resolve the graph, log commands)
//! rulerunner pipeline.yaml --dry-run
//!
//! # Tighter budget and a JSON report
//! rulerunner pipeline.yaml --mem-mb 16000 --threads 4 --report run.json
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use rulerunner::execution::Engine;
use rulerunner::workflow::parser::load_pipeline;
use rulerunner::{APP_NAME, VERSION};

/// Default pipeline file used when none is specified.
const DEFAULT_PIPELINE: &str = "pipeline.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    pipeline_path: Option<String>,
    targets: Vec<String>,
    dry_run: bool,
    force: bool,
    working_dir: Option<PathBuf>,
    max_attempts: Option<u32>,
    mem_mb: Option<u64>,
    threads: Option<u32>,
    report_path: Option<PathBuf>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Rule-Based Genomics Workflow Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: rulerunner [OPTIONS] <PIPELINE_FILE> [TARGETS...]");
    println!();
    println!("Arguments:");
    println!("  <PIPELINE_FILE>     Path to pipeline YAML file (default: {})", DEFAULT_PIPELINE);
    println!("  [TARGETS...]        Files to build (default: the pipeline's targets)");
    println!();
    println!("Options:");
    println!("  --dry-run           Resolve the job graph and log commands without running them");
    println!("  --force             Rerun jobs even if their outputs are fresh");
    println!("  --working-dir PATH  Directory job paths are relative to");
    println!("  --max-attempts N    Attempts per job before it fails permanently");
    println!("  --mem-mb N          Memory budget in MB");
    println!("  --threads N         Thread budget");
    println!("  --report PATH       Write a JSON run report");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  rulerunner pipeline.yaml");
    println!("  rulerunner pipeline.yaml calls/S1.vcf --dry-run");
    println!("  rulerunner pipeline.yaml --working-dir /data/analysis --threads 16");
}

/// Returns the value following an option, advancing the cursor.
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", name))
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", name, value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" | "-n" => config.dry_run = true,
            "--force" | "-F" => config.force = true,
            "--verbose" | "-v" => config.verbose = true,
            "--working-dir" => {
                config.working_dir = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--report" => {
                config.report_path = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--max-attempts" => {
                let n: u32 = parse_number(option_value(args, &mut i, arg)?, "max-attempts")?;
                if n == 0 {
                    return Err("--max-attempts must be at least 1".to_string());
                }
                config.max_attempts = Some(n);
            }
            "--mem-mb" => {
                config.mem_mb = Some(parse_number(option_value(args, &mut i, arg)?, "mem-mb")?);
            }
            "--threads" => {
                config.threads = Some(parse_number(option_value(args, &mut i, arg)?, "threads")?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.pipeline_path.is_none() {
                    config.pipeline_path = Some(arg.clone());
                } else {
                    config.targets.push(arg.clone());
                }
            }
        }
        i += 1;
    }

    if config.mem_mb == Some(0) || config.threads == Some(0) {
        return Err("--mem-mb and --threads must be positive".to_string());
    }

    Ok(config)
}

/// Validates the working directory.
fn check_working_directory(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }

    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }

    Ok(())
}

/// Main application entry point. Returns whether every target was built.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let pipeline_path = config
        .pipeline_path
        .clone()
        .unwrap_or_else(|| DEFAULT_PIPELINE.to_string());

    info!("Loading pipeline: {}", pipeline_path);
    let pipeline = load_pipeline(&pipeline_path).map_err(|e| {
        error!("Failed to load pipeline: {}", e);
        format!("Could not load pipeline from '{}': {}", pipeline_path, e)
    })?;

    info!(
        "Pipeline loaded: {} rules, {} samples, {} runs",
        pipeline.registry.len(),
        pipeline.universe.sample_count(),
        pipeline.universe.run_count()
    );

    let mut engine = Engine::new(pipeline);
    {
        let engine_config = engine.config_mut();
        if let Some(dir) = config.working_dir {
            check_working_directory(&dir)?;
            engine_config.working_dir = dir;
        }
        if let Some(n) = config.max_attempts {
            engine_config.max_attempts = n;
        }
        if let Some(mem_mb) = config.mem_mb {
            engine_config.budget.mem_mb = mem_mb;
        }
        if let Some(threads) = config.threads {
            engine_config.budget.threads = threads;
        }
        engine_config.dry_run |= config.dry_run;
        engine_config.force |= config.force;
    }

    let engine_config = engine.config();
    info!("Working directory: {}", engine_config.working_dir.display());
    info!(
        "Budget: {} MB, {} threads, {} attempts per job",
        engine_config.budget.mem_mb, engine_config.budget.threads, engine_config.max_attempts
    );
    if engine_config.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
        println!();
    }

    let report = engine.run(&config.targets)?;

    if !report.dry_run {
        println!("{}", report.gantt_chart);
    }
    println!("{}", report.render_summary());

    if let Some(path) = &config.report_path {
        report.write(path)?;
        info!("Report written to {}", path.display());
    }

    if report.success() {
        println!("{}", "All targets are up to date".green().bold());
    } else {
        let failed = report.failed_targets().count();
        println!(
            "{}",
            format!("{} of {} targets failed", failed, report.targets.len())
                .red()
                .bold()
        );
    }

    Ok(report.success())
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
