//! Command-line surface of the `tilefarm` binary.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "tilefarm=info";

/// Render a scene across a pool of machines and composite the result.
///
/// Nodes and transport options come from `TILEFARM_*` environment
/// variables (a `.env` file in the working directory is loaded first).
#[derive(Debug, Parser)]
#[command(name = "tilefarm", version)]
pub struct Cli {
    /// Scene file to render.
    #[arg(value_name = "SCENE")]
    pub scene: PathBuf,

    /// Final image; the format follows the extension.
    #[arg(value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Renderer scripting hook to run instead of the built-in one.
    #[arg(long, value_name = "PATH")]
    pub hook: Option<PathBuf>,

    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    pub json: bool,
}

/// Install the global subscriber, writing to `log_file` when given.
pub fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            let file = open_log(path)?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()?;
        }
        None => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
        }
    }
    Ok(())
}

fn open_log(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(file)
}
