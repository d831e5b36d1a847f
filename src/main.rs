mod archive;
mod autotune;
mod decoder;
mod deleter;
mod error;
mod index;
mod merger;
mod monitor;
mod pattern;
mod processor;
mod queue;
mod scanner;
mod tiff;
mod util;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use decoder::{DecodeConfig, RunMode};
use monitor::MonitorConfig;
use pattern::FilePattern;

#[derive(Parser)]
#[command(
    name = "framepack",
    version,
    about = "Continuous batching compressor for numbered instrument TIFF frames"
)]
struct Cli {
    /// Do not create a log file in the current directory
    #[arg(long, global = true)]
    no_log_file: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a staging directory and pack complete frame sets into archives
    Watch {
        watch_dir: PathBuf,
        output_dir: PathBuf,

        /// Filename prefix of incoming frames
        #[arg(long, default_value = "test")]
        prefix: String,

        /// Frames per archive
        #[arg(long, default_value_t = 100)]
        set_size: u32,

        /// Reader threads per set. Default: auto.
        #[arg(long)]
        threads: Option<usize>,

        /// Concurrent set workers. Default: auto.
        #[arg(long)]
        workers: Option<usize>,

        /// Keep originals instead of deleting them after verification
        #[arg(long)]
        keep_originals: bool,

        /// Process the existing backlog, then exit instead of watching
        #[arg(long)]
        once: bool,
    },

    /// Unpack archives, writing the member TIFFs back out unchanged
    Extract {
        #[command(flatten)]
        args: DecodeArgs,
    },

    /// Unpack archives and sum groups of consecutive frames into
    /// integrated TIFFs that keep the original frame header
    Merge {
        #[command(flatten)]
        args: DecodeArgs,

        /// Frames summed into each integrated output
        #[arg(long)]
        group_frames: u32,
    },
}

#[derive(Args)]
struct DecodeArgs {
    input_dir: PathBuf,
    output_dir: PathBuf,

    /// Filename prefix used when the archives were packed
    #[arg(long, default_value = "test")]
    prefix: String,

    #[arg(long, default_value_t = 1)]
    start_run: u16,

    #[arg(long, default_value_t = 1)]
    end_run: u16,

    #[arg(long, default_value_t = 1)]
    start_frame: u32,

    #[arg(long, default_value_t = 100)]
    end_frame: u32,

    /// Frames per archive, matching the compress side
    #[arg(long, default_value_t = 100)]
    set_size: u32,

    /// Archives processed concurrently
    #[arg(long, default_value_t = 3)]
    tasks: usize,
}

impl DecodeArgs {
    fn into_config(self, mode: RunMode) -> DecodeConfig {
        DecodeConfig {
            input_dir: self.input_dir,
            output_dir: self.output_dir,
            prefix: self.prefix,
            start_run: self.start_run,
            end_run: self.end_run,
            start_frame: self.start_frame,
            end_frame: self.end_frame,
            set_size: self.set_size,
            tasks: self.tasks,
            mode,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(!cli.no_log_file).context("failed to initialise logging")?;

    match cli.cmd {
        Commands::Watch {
            watch_dir,
            output_dir,
            prefix,
            set_size,
            threads,
            workers,
            keep_originals,
            once,
        } => {
            let tune = autotune::tune_for_watch(&watch_dir, &FilePattern::new(&prefix), set_size);
            let cfg = MonitorConfig {
                watch_dir,
                output_dir,
                prefix,
                set_size,
                read_threads: threads.unwrap_or(tune.read_threads).max(1),
                max_workers: workers.unwrap_or(tune.max_workers).max(1),
                delete_after: !keep_originals,
                once,
            };
            monitor::run_monitor(&cfg).context("monitor failed")?;
        }

        Commands::Extract { args } => {
            decoder::process_archives(&args.into_config(RunMode::Extract))
                .context("extraction failed")?;
        }

        Commands::Merge { args, group_frames } => {
            decoder::process_archives(&args.into_config(RunMode::Merge { group_frames }))
                .context("merge failed")?;
        }
    }

    Ok(())
}

fn init_logging(
    with_file: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stdout);
    let registry = tracing_subscriber::registry().with(filter).with(stdout_layer);

    if !with_file {
        registry.init();
        return Ok(None);
    }

    let log_path = std::env::current_dir()?.join(format!(
        "framepack_{}.log",
        util::timestamp_for_filename()
    ));
    let file = std::fs::File::create(&log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false);

    registry.with(file_layer).init();
    Ok(Some(guard))
}
