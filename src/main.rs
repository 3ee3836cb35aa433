//! restfuzz CLI entrypoint.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;

use restfuzz::{
    ApiSpec, BatchSummary, Config, CorpusCommand, CrashesCommand, FuzzOptions, RestFuzzError, TimeBudget, Workspace,
};

#[derive(Debug, Parser)]
#[command(name = "restfuzz")]
#[command(about = "coverage-guided fuzzing of REST APIs from their OpenAPI descriptions")]
struct Cli {
    /// Path to config file. Missing configs are treated as "defaults".
    #[arg(long, global = true, default_value = "restfuzz.toml")]
    config: PathBuf,

    /// Working directory for execution.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Log level.
    #[arg(long, global = true, default_value = "info")]
    log: String,

    /// Machine-readable output to stdout (JSON).
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fuzz one or more API descriptions (paths or globs)
    Fuzz {
        #[arg(required = true)]
        specs: Vec<String>,

        /// Keep plans that improve coverage (defaults to the config value).
        #[arg(long, overrides_with = "no_guided")]
        guided: bool,

        /// Never grow the corpus past the generated seed plan.
        #[arg(long, overrides_with = "guided")]
        no_guided: bool,

        /// Dependency-aware mode (needs Token.yml and Dependency.yml in the workspace).
        #[arg(long, overrides_with = "no_strict")]
        strict: bool,

        /// Ignore dependency files even when the config enables strict mode.
        #[arg(long, overrides_with = "strict")]
        no_strict: bool,

        /// Seed for the mutation RNG.
        #[arg(long)]
        seed: Option<u64>,

        /// Stop after this many iterations.
        #[arg(long)]
        runs: Option<u64>,

        /// Stop after this much wall time (e.g. 30s, 5m).
        #[arg(long)]
        time: Option<TimeBudget>,

        /// Discard the stored corpus and regenerate the seed plan.
        #[arg(long)]
        fresh: bool,
    },

    /// Write Token.yml, Dependency.yml and Info.yml templates for a description
    Init { spec: PathBuf },

    /// Inspect or extend a corpus directory
    Corpus {
        #[command(subcommand)]
        command: CorpusCommand,
    },

    /// Inspect a crash archive
    Crashes {
        #[command(subcommand)]
        command: CrashesCommand,
    },

    /// Print version and build info
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_global_args(std::env::args()));

    if let Err(err) = init_tracing(&cli.log) {
        eprintln!("warning: failed to init tracing: {err:#}");
    }

    let cwd = cli.cwd.clone().unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    if let Err(err) = std::env::set_current_dir(&cwd) {
        return print_error_and_exit(&cli, anyhow::anyhow!(err).context(format!("failed to set cwd to {}", cwd.display())));
    }

    let config = Config::load_optional(&cli.config);

    match run_command(&cli, &config) {
        Ok(code) => code,
        Err(err) => print_error_and_exit(&cli, err),
    }
}

/// Moves global flags ahead of the subcommand so they are accepted anywhere.
fn normalize_global_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let all: Vec<String> = args.into_iter().collect();
    if all.is_empty() {
        return all;
    }

    let mut globals = Vec::new();
    let mut rest = Vec::new();

    let mut i = 1usize;
    while i < all.len() {
        let arg = &all[i];
        match arg.as_str() {
            "--json" => {
                globals.push(arg.clone());
                i += 1;
            }
            "--config" | "--cwd" | "--log" => {
                globals.push(arg.clone());
                if i + 1 < all.len() {
                    globals.push(all[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ if arg.starts_with("--config=") || arg.starts_with("--cwd=") || arg.starts_with("--log=") => {
                globals.push(arg.clone());
                i += 1;
            }
            _ => {
                rest.push(arg.clone());
                i += 1;
            }
        }
    }

    let mut normalized = Vec::with_capacity(all.len());
    normalized.push(all[0].clone());
    normalized.extend(globals);
    normalized.extend(rest);
    normalized
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn run_command(cli: &Cli, config: &Config) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Command::Fuzz {
            specs,
            guided,
            no_guided,
            strict,
            no_strict,
            seed,
            runs,
            time,
            fresh,
        } => {
            let paths = restfuzz::resolve_spec_args(specs)?;
            if paths.is_empty() {
                return Err(RestFuzzError::InvalidArgument(format!("no API description matched {}", specs.join(" "))).into());
            }
            let mut opt = FuzzOptions::from_config(config);
            if *guided {
                opt.guided = true;
            }
            if *no_guided {
                opt.guided = false;
            }
            if *strict {
                opt.strict = true;
            }
            if *no_strict {
                opt.strict = false;
            }
            opt.seed = *seed;
            opt.runs = *runs;
            opt.time = time.map(|d| d.0);
            opt.fresh = *fresh;

            let batch = restfuzz::fuzz_specs(config, &paths, &opt);
            print_batch(cli, &batch)?;
            if batch.failed() > 0 {
                Ok(ExitCode::from(1))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }

        Command::Init { spec } => {
            let spec = ApiSpec::load(spec)?;
            let workspace = Workspace::for_spec(config, &spec);
            let report = restfuzz::init_workspace(&spec, &workspace)?;
            print_json_or_text(cli, &report)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Corpus { command } => {
            let out = restfuzz::corpus_command(command)?;
            print_json_or_text(cli, &out)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Crashes { command } => {
            let out = restfuzz::crashes_command(command)?;
            print_json_or_text(cli, &out)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Version => {
            let info = restfuzz::version_info();
            print_json_or_text(cli, &info)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_batch(cli: &Cli, batch: &BatchSummary) -> anyhow::Result<()> {
    if cli.json {
        print_json_or_text(cli, batch)?;
    } else {
        println!("{}", batch.pretty());
    }
    Ok(())
}

fn print_json_or_text<T: serde::Serialize>(cli: &Cli, value: &T) -> anyhow::Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}

fn print_error_and_exit(cli: &Cli, err: anyhow::Error) -> ExitCode {
    let msg = format!("{err:#}");
    if cli.json {
        let out = serde_json::json!({
            "status": "error",
            "code": "error",
            "message": msg,
        });
        println!("{out}");
    } else {
        eprintln!("{msg}");
    }
    ExitCode::from(2)
}
