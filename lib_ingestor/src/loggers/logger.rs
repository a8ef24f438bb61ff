use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use log::{Level, LevelFilter};

/// Maps a level name to a filter. Unknown names fall back to `Info`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

fn paint(level: Level) -> ColoredString {
    let name = level.as_str();
    match level {
        Level::Error => name.bright_red(),
        Level::Warn => name.bright_yellow(),
        Level::Info => name.bright_green(),
        Level::Debug => name.bright_white(),
        Level::Trace => name.bright_cyan(),
    }
}

/// # Setup Logging
///
/// Installs the global logger. Console lines are colored by level; when
/// `log_dir` is given, a plain-text copy goes to `<app_name>_<timestamp>.log`
/// there and all but the newest previous log of the same application are removed.
///
/// Returns the path of the log file, if any. Fails if a logger is already set.
pub fn setup_logging(app_name: &str, log_dir: Option<&Path>, level: LevelFilter) -> Result<Option<PathBuf>> {
    let console = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]").to_string().truecolor(128, 128, 128),
                record.target(),
                paint(record.level()),
                message
            ))
        })
        .chain(std::io::stdout());

    let mut dispatch = fern::Dispatch::new()
        .level(level)
        .level_for("hyper", LevelFilter::Warn)
        .level_for("hyper_util", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .level_for("tungstenite", LevelFilter::Warn)
        .level_for("tokio_tungstenite", LevelFilter::Warn)
        .level_for("rustls", LevelFilter::Warn)
        .chain(console);

    let mut log_path = None;
    if let Some(dir) = log_dir {
        fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
        cleanup_old_logs(dir, app_name, 1)?;

        let path = dir.join(format!(
            "{}_{}.log",
            app_name,
            chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
        ));
        let file = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{}[{}][{}] {}",
                    chrono::Local::now().format("[%Y-%m-%d %H:%M:%S%.3f]"),
                    record.target(),
                    record.level(),
                    message
                ))
            })
            .chain(fern::log_file(&path).with_context(|| format!("opening log file {}", path.display()))?);
        dispatch = dispatch.chain(file);
        log_path = Some(path);
    }

    dispatch.apply().context("a global logger is already installed")?;
    Ok(log_path)
}

/// Deletes `<app_name>_*.log` files in `log_dir`, keeping the `keep` newest by
/// modification time. Returns how many files were removed.
pub fn cleanup_old_logs(log_dir: &Path, app_name: &str, keep: usize) -> Result<usize> {
    let prefix = format!("{app_name}_");
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(log_dir)
        .with_context(|| format!("reading log directory {}", log_dir.display()))?
        .filter_map(|res| res.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .filter_map(|p| {
            let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .collect();

    // Newest first.
    entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level("warning"), LevelFilter::Warn);
        assert_eq!(parse_level(" trace "), LevelFilter::Trace);
        assert_eq!(parse_level("nonsense"), LevelFilter::Info);
    }

    #[test]
    fn cleanup_only_touches_own_logs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ingestor_1.log", "ingestor_2.log", "ingestor_3.log", "other_1.log", "ingestor.txt"] {
            fs::write(dir.path().join(name), "x").unwrap();
        }

        let removed = cleanup_old_logs(dir.path(), "ingestor", 1).unwrap();
        assert_eq!(removed, 2);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left.len(), 3);
        assert!(left.contains(&"other_1.log".to_string()));
        assert!(left.contains(&"ingestor.txt".to_string()));
    }

    #[test]
    fn cleanup_with_keep_zero_empties_the_app_logs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("svc_a.log"), "a").unwrap();
        fs::write(dir.path().join("svc_b.log"), "b").unwrap();
        assert_eq!(cleanup_old_logs(dir.path(), "svc", 0).unwrap(), 2);
    }
}
