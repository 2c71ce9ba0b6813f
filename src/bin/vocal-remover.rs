use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vocal_remover_core::{
    config::{AppConfig, CliConfig, FileConfig, MemoryModeSetting, ProbeSetting},
    server::{run_server, RequestsLoggingLevel},
    ExtractOptions, ModelRegistry, ProcessedAudio, ProcessingMethod, ProcessingService,
};

#[derive(Parser)]
#[command(name = "vocal-remover")]
#[command(about = "Speech and vocal removal service backed by resident separation models", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service.
    Serve {
        #[command(flatten)]
        service: ServiceArgs,

        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(short, long, default_value_t = 8000)]
        port: u16,

        #[arg(long, default_value = "path")]
        logging_level: RequestsLoggingLevel,
    },

    /// Process one URL and write the result to a directory.
    Process {
        url: String,

        #[arg(short, long, default_value = "preserve_vocals")]
        method: ProcessingMethod,

        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Download and decode audio with minimal processing, for fingerprinting.
    Extract {
        url: String,

        #[arg(long)]
        sample_rate: Option<u32>,

        #[arg(long)]
        channels: Option<u16>,

        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// List the models in the registry.
    Models,
}

#[derive(Args, Debug)]
struct ServiceArgs {
    /// TOML config file. Its values override command line flags.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    temp_dir: Option<PathBuf>,

    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Keep a copy of every output here.
    #[arg(long)]
    save_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 6.0)]
    memory_threshold_gb: f64,

    #[arg(long, value_enum, default_value = "auto")]
    memory_mode: MemoryModeSetting,

    /// Stay in single-slot mode once pressure has been seen.
    #[arg(long)]
    memory_latch: bool,

    #[arg(long, value_enum, default_value = "nvidia-smi")]
    memory_probe: ProbeSetting,

    #[arg(long)]
    io_workers: Option<usize>,

    #[arg(long, default_value_t = 1)]
    inference_workers: usize,

    #[arg(long, default_value = "python3")]
    runner_program: String,

    #[arg(long)]
    runner_script: Option<PathBuf>,

    #[arg(long, default_value = "yt-dlp")]
    downloader_program: String,

    /// Model ids to load at startup.
    #[arg(long, value_delimiter = ',')]
    preload: Vec<String>,
}

impl ServiceArgs {
    fn resolve(self, host: String, port: u16, logging_level: RequestsLoggingLevel) -> Result<AppConfig> {
        let file_config = match &self.config {
            Some(path) => Some(FileConfig::load(path)?),
            None => None,
        };
        let cli = CliConfig {
            host,
            port,
            logging_level,
            temp_dir: self.temp_dir,
            model_dir: self.model_dir,
            save_dir: self.save_dir,
            memory_threshold_gb: self.memory_threshold_gb,
            memory_mode: self.memory_mode,
            memory_latch: self.memory_latch,
            memory_probe: self.memory_probe,
            io_workers: self.io_workers,
            inference_workers: self.inference_workers,
            runner_program: self.runner_program,
            runner_script: self.runner_script,
            downloader_program: self.downloader_program,
            preload: self.preload,
        };
        AppConfig::resolve(&cli, file_config)
    }

    fn resolve_offline(self) -> Result<AppConfig> {
        let defaults = CliConfig::default();
        self.resolve(defaults.host, defaults.port, defaults.logging_level)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            service,
            host,
            port,
            logging_level,
        } => {
            let config = service.resolve(host, port, logging_level)?;
            info!(
                model_dir = %config.model_dir.display(),
                temp_dir = %config.temp_dir.display(),
                "starting vocal-remover"
            );
            run_server(config).await
        }
        Commands::Process {
            url,
            method,
            output,
            service,
        } => {
            let config = service.resolve_offline()?;
            let service = build_service(&config).await?;
            let processed = service.process(&url, method).await?;
            write_output(&output, &processed)
        }
        Commands::Extract {
            url,
            sample_rate,
            channels,
            output,
            service,
        } => {
            let config = service.resolve_offline()?;
            let service = build_service(&config).await?;
            let options = ExtractOptions {
                sample_rate,
                channels,
            };
            let processed = service.extract(&url, options).await?;
            write_output(&output, &processed)
        }
        Commands::Models => list_models(),
    }
}

async fn build_service(config: &AppConfig) -> Result<Arc<ProcessingService>> {
    let service = Arc::new(ProcessingService::from_config(config).await?);
    service.preload(&config.preload).await?;
    Ok(service)
}

fn write_output(dir: &Path, processed: &ProcessedAudio) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {:?}", dir))?;
    let path = dir.join(&processed.filename);
    std::fs::write(&path, &processed.bytes)
        .with_context(|| format!("Failed to write {:?}", path))?;
    println!("{}", path.display());
    info!(
        task = %processed.task_id,
        models = %processed.models_used.join(","),
        secs = processed.processing_time_secs,
        "done"
    );
    Ok(())
}

fn list_models() -> Result<()> {
    let registry = ModelRegistry::builtin()?;
    for model in registry.iter() {
        println!(
            "{:<45} {:<10} {:<13} {}",
            model.id,
            format!("{:?}", model.architecture),
            model.primary_stem.to_string(),
            model.description
        );
    }
    Ok(())
}
