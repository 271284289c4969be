//! Command-line front end for the sandpit execution engine
//!
//! Loads the engine configuration, connects to the local Docker daemon and
//! runs one-off programs, lists the language registry, or warms the pool.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use sandpit_core::{
    config::ConfigLoader, DockerRuntime, Engine, EngineConfig, LanguageRegistry,
    StaticLanguageRegistry, SubmissionRequest,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Sandpit - run untrusted programs in pooled sandboxes")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, help = "YAML configuration file; built-in defaults when omitted")]
    config: Option<PathBuf>,

    #[clap(long, short, help = "Log level; overrides logging.level from the configuration")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute one program and print the result as JSON
    Run {
        /// Source file, or a ZIP bundle for the multi-file language
        file: PathBuf,

        #[clap(long, short = 'L', default_value_t = 71)]
        language: u32,

        #[clap(long)]
        stdin: Option<String>,

        #[clap(long)]
        expected_output: Option<String>,

        #[clap(long, help = "CPU time limit in seconds")]
        time_limit: Option<f64>,

        #[clap(long, help = "Memory limit in kilobytes")]
        memory_limit: Option<u64>,

        #[clap(long)]
        compiler_options: Option<String>,

        #[clap(long)]
        args: Option<String>,
    },
    /// List the active languages
    Languages,
    /// Warm the pool to its minimum size, print pool statistics and exit
    Warm,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::from_file(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConfigLoader::from_str("")?,
    };

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(config.logging.level.as_str())
        .parse()
        .unwrap_or(LevelFilter::Info);
    env_logger::Builder::new().filter_level(level).init();

    match cli.command {
        Commands::Run {
            file,
            language,
            stdin,
            expected_output,
            time_limit,
            memory_limit,
            compiler_options,
            args,
        } => {
            let mut request = SubmissionRequest {
                language_id: language,
                stdin,
                expected_output,
                compiler_options,
                command_line_arguments: args,
                ..Default::default()
            };
            request.constraints.cpu_time_limit = time_limit;
            request.constraints.memory_limit = memory_limit;
            run_program(config, file, request).await
        }
        Commands::Languages => list_languages(&config),
        Commands::Warm => warm_pool(config).await,
    }
}

fn build_engine(config: EngineConfig) -> Result<Engine> {
    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    Ok(Engine::builder(config, Arc::new(runtime)).build()?)
}

async fn run_program(config: EngineConfig, file: PathBuf, mut request: SubmissionRequest) -> Result<()> {
    let registry = registry(&config);
    let language = registry.resolve(request.language_id)?;
    if language.is_project() {
        let bundle = tokio::fs::read(&file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        request.additional_files = Some(bundle);
    } else {
        let source = tokio::fs::read_to_string(&file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        request.source_code = Some(source);
    }

    let engine = build_engine(config)?;
    engine.start().await?;

    let outcome = async {
        let token = engine.create_submission(request).await?;
        log::info!("Running {} as {} ({})", file.display(), language.name, token);
        engine.execute_sync(&token).await
    }
    .await;
    engine.shutdown().await;

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn list_languages(config: &EngineConfig) -> Result<()> {
    for language in registry(config).list() {
        let kind = if language.supports_compilation() {
            "compiled"
        } else {
            "interpreted"
        };
        println!("{:>4}  {:<24} {}", language.id, language.name, kind);
    }
    Ok(())
}

async fn warm_pool(config: EngineConfig) -> Result<()> {
    let engine = build_engine(config)?;
    engine.start().await?;
    let stats = engine.pool_statistics().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    engine.shutdown().await;
    Ok(())
}

fn registry(config: &EngineConfig) -> StaticLanguageRegistry {
    match &config.languages {
        Some(languages) => StaticLanguageRegistry::new(languages.clone()),
        None => StaticLanguageRegistry::builtin(),
    }
}
