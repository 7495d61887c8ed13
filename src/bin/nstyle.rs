use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nstyle::{batch, config::NstConfig, run};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nstyle", version, about = "Neural style transfer by direct pixel optimization")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct RedisArgs {
    /// Redis host where the list of trials lives.
    #[arg(long, env = "NST_REDIS_HOST")]
    host: String,
    /// Redis port.
    #[arg(short, long, env = "NST_REDIS_PORT", default_value_t = 6379)]
    port: u16,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a single style transfer from a JSON config file.
    Run {
        /// Config file path.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Runs the five style configurations of Gatys et al. 2015 on vgg19.
    Gatys {
        /// Style image path.
        #[arg(long)]
        style_img: PathBuf,
        /// Directory for the generated images.
        #[arg(long, default_value = "generated")]
        output_dir: PathBuf,
        /// Outer optimization steps per configuration.
        #[arg(long, default_value_t = 200)]
        epochs: usize,
    },
    /// Pops trials from the queue and runs them until the queue is empty.
    Worker {
        #[command(flatten)]
        redis: RedisArgs,
        /// Redis list to pop trials from.
        #[arg(short, long, env = "NST_REDIS_NAME")]
        name: String,
    },
    /// Expands a parameter grid file and pushes one trial per grid point.
    Enqueue {
        /// Parameter grid file: a JSON object mapping config fields to
        /// arrays of candidate values.
        #[arg(short = 'f', long)]
        config_filepath: PathBuf,
        #[command(flatten)]
        redis: RedisArgs,
        /// Redis list to push trials onto.
        #[arg(short, long, env = "NST_REDIS_NAME")]
        name: String,
    },
    /// Flushes the queue database.
    Flush {
        #[command(flatten)]
        redis: RedisArgs,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    match Cli::parse().command {
        Command::Run { config } => {
            let config = load_config(&config)?;
            let (output, report) = run::run(&config)?;
            println!("{} ({} epochs, {} evaluations, loss {})",
                output.display(), report.epochs, report.evaluations, report.final_loss);
        }
        Command::Gatys {
            style_img,
            output_dir,
            epochs,
        } => {
            for config in NstConfig::gatys_presets(style_img, &output_dir, epochs) {
                let (output, _) = run::run(&config)?;
                println!("{}", output.display());
            }
        }
        Command::Worker { redis, name } => {
            let mut connection = batch::connect(&redis.host, redis.port)?;
            let processed = batch::process_from_queue(&mut connection, &name)?;
            println!("{processed}");
        }
        Command::Enqueue {
            config_filepath,
            redis,
            name,
        } => {
            let grid = std::fs::read_to_string(&config_filepath)
                .with_context(|| format!("failed to read {config_filepath:?}"))?;
            let grid = serde_json::from_str::<serde_json::Value>(&grid)?;
            let grid = grid
                .as_object()
                .context("parameter grid must be a JSON object")?;
            let mut connection = batch::connect(&redis.host, redis.port)?;
            let length = batch::send_to_queue(&mut connection, &name, grid)?;
            println!("{length}");
        }
        Command::Flush { redis } => {
            let mut connection = batch::connect(&redis.host, redis.port)?;
            batch::flush(&mut connection)?;
        }
    }
    Ok(())
}

fn load_config(path: &PathBuf) -> Result<NstConfig> {
    let payload = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {path:?}"))?;
    serde_json::from_str(&payload).with_context(|| format!("failed to parse config {path:?}"))
}
