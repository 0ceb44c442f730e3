//! Logger setup. Adapted from the teacher's `log.rs`, stripped of the
//! frontend/backend dual-file split (there is no embedded webview here) and
//! of the `open_log_folder` Tauri command.

use anyhow::{Context, Result};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use std::fs::File;
use std::path::Path;

/// Initialize terminal + file logging. `log_dir` is typically the current
/// working directory's `logs/` subfolder; the caller creates it.
pub fn setup_logger(log_dir: &Path, level: LevelFilter) -> Result<()> {
    std::fs::create_dir_all(log_dir).context("failed to create log directory")?;

    let log_file =
        File::create(log_dir.join("asoc.log")).context("failed to create log file")?;

    let config = ConfigBuilder::new()
        .set_time_offset_to_local()
        .unwrap_or_else(|builder| builder)
        .build();

    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(level, config.clone(), TerminalMode::Mixed, ColorChoice::Auto),
        WriteLogger::new(LevelFilter::Debug, config, log_file),
    ];

    CombinedLogger::init(loggers).ok();
    log::info!("logging initialized");
    Ok(())
}
