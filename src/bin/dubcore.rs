use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dubcore::compiler::compiler_for_id;
use dubcore::{create_generator, BuildError, BuildMode, BuildPlatform, GeneratorSettings, Project};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "dubcore")]
#[command(about = "Compile, cache and run package-based D projects")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BuildArgs {
    /// Resolved project description (JSON), produced by the resolver
    #[arg(long, default_value = "dub.resolved.json")]
    project: PathBuf,

    /// Configuration to build
    #[arg(short, long, default_value = "")]
    config: String,

    /// Build type (debug, release, unittest, unittest-cov, ...)
    #[arg(short, long, default_value = "debug")]
    build_type: String,

    /// Build mode (separate, allAtOnce, singleFile)
    #[arg(long, default_value = "separate")]
    build_mode: String,

    /// Compiler binary or id
    #[arg(long, default_value = "dmd")]
    compiler: String,

    /// Compiler frontend version
    #[arg(long, default_value_t = 2108)]
    frontend_version: u32,

    /// Rebuild even if the cached target is up to date
    #[arg(long)]
    force: bool,

    /// Build directly into the target path, bypassing the cache
    #[arg(long)]
    direct: bool,

    /// Build everything through rdmd
    #[arg(long)]
    rdmd: bool,

    /// Fold dependencies into a combined build of the root target
    #[arg(long)]
    combined: bool,

    /// Build in a temporary directory that is removed afterwards
    #[arg(long)]
    temp_build: bool,

    /// Compile single-file-mode sources in parallel
    #[arg(long)]
    parallel: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build(BuildArgs),
    /// Build and run the root executable
    Run {
        #[command(flatten)]
        build: BuildArgs,

        /// Rebuild and restart whenever a source file changes
        #[arg(long)]
        watch: bool,

        /// Arguments passed to the executed program
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

fn parse_build_mode(mode: &str) -> Result<BuildMode> {
    match mode {
        "separate" => Ok(BuildMode::Separate),
        "allAtOnce" => Ok(BuildMode::AllAtOnce),
        "singleFile" => Ok(BuildMode::SingleFile),
        other => anyhow::bail!("unknown build mode: {other}"),
    }
}

fn generator_settings(args: &BuildArgs) -> Result<GeneratorSettings> {
    let compiler = compiler_for_id(&args.compiler)?;
    let binary = which::which(&args.compiler).unwrap_or_else(|_| PathBuf::from(&args.compiler));
    let platform = BuildPlatform::host(compiler.name(), binary, args.frontend_version);
    let mut settings = GeneratorSettings::new(platform, compiler);
    settings.config = args.config.clone();
    settings.build_type = args.build_type.clone();
    settings.build_mode = parse_build_mode(&args.build_mode)?;
    settings.force = args.force;
    settings.direct = args.direct;
    settings.rdmd = args.rdmd;
    settings.combined = args.combined;
    settings.temp_build = args.temp_build;
    settings.parallel_build = args.parallel;
    Ok(settings)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            // A failed target run propagates the child's exit code.
            if let Some(BuildError::RunFailed { code, .. }) = e.downcast_ref::<BuildError>() {
                error!("{e}");
                *code
            } else {
                error!("{e:#}");
                1
            }
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let (args, run, watch, run_args) = match &cli.command {
        Commands::Build(args) => (args, false, false, Vec::new()),
        Commands::Run { build, watch, args } => (build, true, *watch, args.clone()),
    };

    let mut settings = generator_settings(args)?;
    settings.run = run;
    settings.watch = watch;
    settings.run_args = run_args;

    let project = Project::load(&args.project)
        .with_context(|| format!("failed to load {}", args.project.display()))?;

    let mut generator = create_generator("build")?;
    let code = generator.generate(&project, &settings).await?;
    Ok(code)
}
