use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use pagefs::{
    fs::{
        storage::{AnonymousStore, HeapStore},
        MountConfig,
    },
    MountOptions, PageFs,
};
use std::path::PathBuf;
use tracing::trace;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount an empty in-memory filesystem. All data
    /// is lost on unmount.
    Mount {
        #[arg(index = 1)]
        target: PathBuf,
        #[arg(short = 'b', long, default_value_t = MountConfig::DEFAULT_BLOCK_SIZE)]
        block_size: usize,
        #[arg(short = 'c', long, default_value_t = MountConfig::DEFAULT_BLOCK_COUNT)]
        block_count: usize,
        #[arg(long, default_value_t = MountConfig::DEFAULT_MAX_NAME_LEN)]
        max_name_len: usize,
        /// Back blocks with heap buffers instead of anonymous mappings
        #[arg(long)]
        heap: bool,
        #[arg(long)]
        allow_other: bool,
        #[arg(long)]
        auto_unmount: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
    trace!("Starting up pagefs cli");
    match cli.command {
        Command::Mount {
            target,
            block_size,
            block_count,
            max_name_len,
            heap,
            allow_other,
            auto_unmount,
        } => {
            if !target.is_dir() {
                println!("mount target {target:?} is not a directory!");
                std::process::exit(1);
            }
            let is_empty = target.read_dir()?.next().is_none();
            if !is_empty {
                println!("mount target {target:?} is not empty!");
                std::process::exit(1);
            }
            let config = MountConfig {
                block_size,
                block_count,
                max_name_len,
            };
            config.validate().wrap_err_with(|| {
                format!("Invalid geometry: {block_count} blocks of {block_size} bytes")
            })?;
            let options = MountOptions {
                allow_other,
                auto_unmount,
            };
            if heap {
                PageFs::new(HeapStore::new(block_size, block_count), config)?
                    .mount(&target, &options)?;
            } else {
                PageFs::new(AnonymousStore::new(block_size, block_count), config)?
                    .mount(&target, &options)?;
            }
        }
    }
    Ok(())
}
