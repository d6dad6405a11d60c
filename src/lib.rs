//! Token-limit recovery for tool-calling chat agents.
//!
//! When a chat-completion request is rejected for exceeding the model's
//! context window, [`recovery::RecoveryOrchestrator`] compresses the
//! conversation and rebuilds a short message list that still satisfies the
//! tool-call pairing rules of the wire protocol.

pub mod config;
pub mod inference;
pub mod recovery;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use crate::config::LoggingConfig;

/// Log file name inside the configured log directory.
const LOG_FILE_NAME: &str = "recovery.log";

/// Rotated log files kept next to the active one.
const KEEP_ROTATED_LOGS: u32 = 3;

/// Install the global subscriber, writing to `<log dir>/recovery.log`.
///
/// The previous `recovery.log` generations shift to `.1` .. `.3` first. Each
/// event is written straight to the file (no user-space buffering), so a
/// host that dies mid-recovery still leaves its last lines on disk.
///
/// Later calls, or a host that already installed a global subscriber, are
/// left untouched.
pub fn init_tracing(config: &LoggingConfig) -> std::io::Result<()> {
    static INIT: OnceLock<()> = OnceLock::new();
    if INIT.get().is_some() {
        return Ok(());
    }

    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = config.resolved_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    shift_generations(&log_path, KEEP_ROTATED_LOGS);

    let log_file = File::options().create(true).append(true).open(&log_path)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    let _ = INIT.set(());

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            filter = %config.filter,
            json = config.json,
            log_file = %log_path.display(),
            "recovery logging started"
        );
    }
    Ok(())
}

/// `recovery.log` with a `.n` generation suffix.
fn generation(active: &Path, n: u32) -> PathBuf {
    let mut name = active.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Move `active` to generation 1, each generation `n` to `n + 1`, and discard
/// whatever would land past `keep`. Missing generations are skipped.
fn shift_generations(active: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(active);
        return;
    }
    let _ = std::fs::remove_file(generation(active, keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(generation(active, n), generation(active, n + 1));
    }
    let _ = std::fs::rename(active, generation(active, 1));
}

// ─── Tests ──────────────────────────────────────────────────────────────────
