use std::{fs::OpenOptions, path::PathBuf, sync::Mutex};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static INITIALIZED: OnceCell<()> = OnceCell::new();

/**
 * \brief Logging setup: filter directive plus optional append-only log file.
 */
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /** \brief Used when RUST_LOG is not set, e.g. "info" or "modelgate_core_sdk=debug" */
    pub filter: String,
    pub log_file: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            log_file: None,
        }
    }
}

/**
 * \brief Install the global tracing subscriber. Safe to call more than once.
 */
pub fn init(config: &TelemetryConfig) -> Result<()> {
    INITIALIZED.get_or_try_init(|| install(config))?;
    Ok(())
}

fn install(config: &TelemetryConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let stderr_layer = fmt::layer()
        .with_timer(UtcTime::new(Rfc3339))
        .with_writer(std::io::stderr);

    let file_layer = match &config.log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create log dir {}", dir.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_timer(UtcTime::new(Rfc3339))
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    // Another subscriber may already be installed (tests, embedding hosts).
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Ok(())
}

/**
 * \brief Render a secret for logs as `***` plus its last four characters.
 */
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 4 {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("***{tail}")
    } else {
        "***".to_string()
    }
}
