mod cli;
mod report;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{CliArgs, Commands, ConfigArgs, OutputFormat, RunArgs};
use distflow::config::PipelineConfig;
use distflow::observability::init_tracing;
use distflow::pipeline::PipelineBuilder;
use distflow::project::Project;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, error};

/// Exit code for usage and configuration errors, matching clap's.
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_tracing(args.level(), args.log_json);
    debug!("distflow v{} starting", env!("CARGO_PKG_VERSION"));

    let result = match &args.command {
        Commands::Run(run_args) => handle_run(run_args).await,
        Commands::Config(config_args) => handle_config(config_args),
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            EXIT_USAGE
        }
    };
    process::exit(exit_code);
}

fn project_dir(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("project directory {} is not accessible", path.display()))
}

fn load_config(project_dir: &Path, explicit: Option<&Path>) -> Result<PipelineConfig> {
    let config = PipelineConfig::discover(project_dir, explicit)
        .context("loading configuration")?
        .with_env_overrides();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn handle_run(args: &RunArgs) -> Result<i32> {
    let root = project_dir(&args.project)?;
    let project = Project::load(&root).context("loading project manifest")?;
    let config = load_config(&root, args.config.as_deref())?;

    let mut builder = PipelineBuilder::new(config, project);
    if args.no_index {
        builder = builder.without_index();
    }
    let pipeline = builder.build().context("building pipeline")?;

    let runs = pipeline.run_many(&args.runtime_versions).await;

    match args.format {
        OutputFormat::Human => print!("{}", report::render_human(&runs)),
        OutputFormat::Json => {
            let json = report::render_json(&runs)?;
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }
    if let Some(path) = &args.report {
        report::write_report(path, &runs)?;
    }

    Ok(if runs.iter().all(|r| r.succeeded()) { 0 } else { 1 })
}

fn handle_config(args: &ConfigArgs) -> Result<i32> {
    let root = project_dir(&args.project)?;
    let config = load_config(&root, args.config.as_deref())?;
    print!("{}", config.to_toml_string().context("rendering configuration")?);
    Ok(0)
}
