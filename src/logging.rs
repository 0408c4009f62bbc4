use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogSettings {
    pub level: String,
    /// Directory for the per-run log file; stdout only when unset.
    pub path: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            path: None,
        }
    }
}

/// Accepts tracing level names plus `WARNING` and `CRITICAL`, case-insensitively.
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    let normalised = match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" => "error".to_string(),
        other => other.to_string(),
    };
    normalised
        .parse::<LevelFilter>()
        .map_err(|_| anyhow::anyhow!("unknown log level {level:?}"))
}

/// Installs the global subscriber: stdout plus, when configured, a plain-text
/// file `diavgeia.<timestamp>.log`. `RUST_LOG` overrides the configured level.
/// Returns the log file path, if any.
pub fn init_logging(settings: &LogSettings) -> Result<Option<PathBuf>> {
    let level = parse_level(&settings.level)?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let (file_layer, log_file) = match &settings.path {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let path = dir.join(format!(
                "diavgeia.{}.log",
                chrono::Local::now().format("%Y%m%dT%H%M%S")
            ));
            let file = File::create(&path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(log_file)
}
