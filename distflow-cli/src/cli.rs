use clap::{Parser, Subcommand, ValueEnum};
use distflow::observability::parse_level;
use std::path::PathBuf;
use tracing::Level;

/// Fail-fast build-and-release pipeline for Python distributions
#[derive(Parser, Debug)]
#[command(
    name = "distflow",
    version,
    about = "Fail-fast build-and-release pipeline for Python distributions",
    long_about = "distflow provisions an isolated environment for a Python runtime version, \
                  installs dependencies, runs static checks and the test suite, builds \
                  versioned archives and publishes them under a per-version label. The \
                  first failing stage ends the run."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - only log errors"
    )]
    pub quiet: bool,

    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    pub log_json: bool,
}

impl CliArgs {
    /// Effective log level: `--log-level`, then `-v`/`-q`, then info.
    pub fn level(&self) -> Level {
        if let Some(level) = &self.log_level {
            parse_level(level)
        } else if self.verbose {
            Level::DEBUG
        } else if self.quiet {
            Level::ERROR
        } else {
            Level::INFO
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Run the pipeline for one or more runtime versions",
        long_about = "Runs provision, install, verify, test, build and publish in order for \
                      each requested runtime version. Versions run concurrently and \
                      independently.\n\n\
                      Examples:\n  \
                      distflow run --runtime-version 3.11\n  \
                      distflow run -r 3.11 -r 3.12 --format json\n  \
                      distflow run -r 3.12 --project ../traceguard --report run.json"
    )]
    Run(RunArgs),

    #[command(
        about = "Print the effective configuration",
        long_about = "Loads the configuration the same way `run` does, applies environment \
                      overrides and prints the result as TOML."
    )]
    Config(ConfigArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[arg(
        short = 'r',
        long = "runtime-version",
        value_name = "VERSION",
        required = true,
        help = "Runtime version to build for (repeatable)"
    )]
    pub runtime_versions: Vec<String>,

    #[arg(
        short = 'p',
        long,
        value_name = "DIR",
        default_value = ".",
        help = "Project directory containing pyproject.toml"
    )]
    pub project: PathBuf,

    #[arg(
        short = 'c',
        long,
        value_name = "FILE",
        help = "Configuration file (defaults to distflow.toml in the project)"
    )]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Write the JSON run report to a file")]
    pub report: Option<PathBuf>,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormat,

    #[arg(long, help = "Skip dependency pre-resolution against the package index")]
    pub no_index: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ConfigArgs {
    #[arg(
        short = 'p',
        long,
        value_name = "DIR",
        default_value = ".",
        help = "Project directory"
    )]
    pub project: PathBuf,

    #[arg(short = 'c', long, value_name = "FILE", help = "Configuration file")]
    pub config: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_requires_runtime_version() {
        let err = CliArgs::try_parse_from(["distflow", "run"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_repeated_runtime_versions() {
        let args = CliArgs::try_parse_from([
            "distflow", "run", "-r", "3.11", "--runtime-version", "3.12", "--format", "json",
        ])
        .unwrap();

        let Commands::Run(run) = args.command else {
            panic!("expected the run command");
        };
        assert_eq!(run.runtime_versions, vec!["3.11", "3.12"]);
        assert_eq!(run.format, OutputFormat::Json);
        assert_eq!(run.project, PathBuf::from("."));
        assert!(!run.no_index);
    }

    #[test]
    fn test_level_precedence() {
        let args = CliArgs::try_parse_from(["distflow", "-v", "config"]).unwrap();
        assert_eq!(args.level(), Level::DEBUG);

        let args = CliArgs::try_parse_from(["distflow", "-v", "--log-level", "warn", "config"]).unwrap();
        assert_eq!(args.level(), Level::WARN);

        let args = CliArgs::try_parse_from(["distflow", "config", "-q"]).unwrap();
        assert_eq!(args.level(), Level::ERROR);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(CliArgs::try_parse_from(["distflow", "-v", "-q", "config"]).is_err());
    }
}
