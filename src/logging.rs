use std::{
    io::{self, IsTerminal, Write},
    path::Path,
};

use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::cli::ColorChoice;

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init_logging(
    verbosity: u8,
    color: ColorChoice,
    project_dir: Option<&Path>,
    file_log_level: Option<tracing::level_filters::LevelFilter>,
    command_name: &str,
) -> LogGuard {
    tracing_log::LogTracer::init().expect("Failed to set log tracer");

    let console_filter = match verbosity {
        0 => "info",
        1 => "info,vibetree=debug",
        2 => "info,vibetree=trace",
        _ => "trace",
    };

    let console_env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(console_filter));

    let use_ansi = match color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => io::stderr().is_terminal(),
    };

    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(use_ansi)
        .without_time()
        .with_target(false)
        .with_thread_names(false)
        .with_level(true)
        .with_filter(console_env_filter);

    let mut file_guard: Option<tracing_appender::non_blocking::WorkerGuard> = None;

    let file_layer = if let (Some(dir), Some(level)) = (project_dir, file_log_level) {
        let log_dir = dir.join(".vibetree").join("logs");

        match std::fs::create_dir_all(&log_dir) {
            Ok(()) => {
                compress_old_logs(&log_dir, command_name);

                let file_appender = tracing_appender::rolling::Builder::new()
                    .rotation(tracing_appender::rolling::Rotation::DAILY)
                    .filename_prefix(command_name)
                    .filename_suffix("log")
                    .build(&log_dir)
                    .expect("Failed to create rolling file appender");

                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                file_guard = Some(guard);

                let file_filter = EnvFilter::new(level.to_string());

                let layer = fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_timer(UtcTime::rfc_3339())
                    .with_target(true)
                    .with_thread_names(true)
                    .with_level(true)
                    .with_filter(file_filter);

                Some(layer)
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not create log directory {}: {e}",
                    log_dir.display()
                );
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: file_guard,
    }
}

fn compress_old_logs(log_dir: &Path, command_name: &str) {
    let today = {
        let now = std::time::SystemTime::now();
        let since_epoch = now
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let days = since_epoch.as_secs() / 86400;
        days
    };

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_owned(),
            None => continue,
        };

        if file_name.ends_with(".log.gz") {
            if let Ok(meta) = entry.metadata() {
                if let Ok(modified) = meta.modified() {
                    let age_days = modified
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| today.saturating_sub(d.as_secs() / 86400))
                        .unwrap_or(0);
                    if age_days > 7 {
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
            continue;
        }

        if !file_name.ends_with(".log") {
            continue;
        }

        if !file_name.starts_with(command_name) {
            continue;
        }

        if let Ok(meta) = entry.metadata() {
            if let Ok(modified) = meta.modified() {
                let file_days = modified
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() / 86400)
                    .unwrap_or(today);
                if file_days >= today {
                    continue;
                }
            }
        }

        let gz_path = path.with_extension("log.gz");
        if let Ok(input) = std::fs::read(&path) {
            let gz_file = match std::fs::File::create(&gz_path) {
                Ok(f) => f,
                Err(_) => continue,
            };
            let mut encoder =
                flate2::write::GzEncoder::new(gz_file, flate2::Compression::default());
            if encoder.write_all(&input).is_ok() && encoder.finish().is_ok() {
                let _ = std::fs::remove_file(&path);
            } else {
                let _ = std::fs::remove_file(&gz_path);
            }
        }
    }
}

/// Lightweight pre-read of `<repoDir>/.vibetree/config.json` to extract the
/// `fileLogLevel` setting, without going through the store (the store isn't
/// open yet at the point logging is initialized). Accepts either the repo
/// directory or the config file itself. Returns `None` if no config is
/// found or the field is absent (caller defaults to trace). Returns
/// `Some(None)` when the value is `"none"`/`"off"` (file logging disabled).
pub fn quick_read_file_log_level(
    path: &Path,
) -> Option<Option<tracing::level_filters::LevelFilter>> {
    use tracing::level_filters::LevelFilter;

    let config_file = if path.is_file() {
        path.to_path_buf()
    } else {
        let candidate = path.join(".vibetree").join("config.json");
        if candidate.is_file() {
            candidate
        } else {
            return None;
        }
    };

    let contents = std::fs::read_to_string(&config_file).ok()?;
    let val: serde_json::Value = serde_json::from_str(&contents).ok()?;
    let level_str = val.get("fileLogLevel")?.as_str()?;

    Some(match level_str.to_lowercase().as_str() {
        "none" | "off" => None,
        "error" => Some(LevelFilter::ERROR),
        "warn" => Some(LevelFilter::WARN),
        "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        "trace" => Some(LevelFilter::TRACE),
        _ => Some(LevelFilter::TRACE),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn quick_read_file_log_level_trace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".vibetree")).unwrap();
        std::fs::write(
            dir.path().join(".vibetree").join("config.json"),
            r#"{ "fileLogLevel": "trace" }"#,
        )
        .unwrap();
        let result = quick_read_file_log_level(dir.path());
        assert_eq!(result, Some(Some(LevelFilter::TRACE)));
    }

    #[test]
    fn quick_read_file_log_level_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".vibetree")).unwrap();
        std::fs::write(
            dir.path().join(".vibetree").join("config.json"),
            r#"{ "fileLogLevel": "none" }"#,
        )
        .unwrap();
        let result = quick_read_file_log_level(dir.path());
        assert_eq!(result, Some(None));
    }

    #[test]
    fn quick_read_file_log_level_off() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".vibetree")).unwrap();
        std::fs::write(
            dir.path().join(".vibetree").join("config.json"),
            r#"{ "fileLogLevel": "off" }"#,
        )
        .unwrap();
        let result = quick_read_file_log_level(dir.path());
        assert_eq!(result, Some(None));
    }

    #[test]
    fn quick_read_file_log_level_warn() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".vibetree")).unwrap();
        std::fs::write(
            dir.path().join(".vibetree").join("config.json"),
            r#"{ "fileLogLevel": "warn" }"#,
        )
        .unwrap();
        let result = quick_read_file_log_level(dir.path());
        assert_eq!(result, Some(Some(LevelFilter::WARN)));
    }

    #[test]
    fn quick_read_file_log_level_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".vibetree")).unwrap();
        std::fs::write(
            dir.path().join(".vibetree").join("config.json"),
            r#"{ "fileLogLevel": "DEBUG" }"#,
        )
        .unwrap();
        let result = quick_read_file_log_level(dir.path());
        assert_eq!(result, Some(Some(LevelFilter::DEBUG)));
    }

    #[test]
    fn quick_read_file_log_level_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".vibetree")).unwrap();
        std::fs::write(
            dir.path().join(".vibetree").join("config.json"),
            r#"{ }"#,
        )
        .unwrap();
        let result = quick_read_file_log_level(dir.path());
        assert_eq!(result, None);
    }

    #[test]
    fn quick_read_file_log_level_no_config() {
        let dir = tempfile::tempdir().unwrap();
        let result = quick_read_file_log_level(dir.path());
        assert_eq!(result, None);
    }

    #[test]
    fn quick_read_file_log_level_direct_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("custom-config.json");
        std::fs::write(&file_path, r#"{ "fileLogLevel": "debug" }"#).unwrap();
        let result = quick_read_file_log_level(&file_path);
        assert_eq!(result, Some(Some(LevelFilter::DEBUG)));
    }

    #[test]
    fn quick_read_file_log_level_unknown_defaults_to_trace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".vibetree")).unwrap();
        std::fs::write(
            dir.path().join(".vibetree").join("config.json"),
            r#"{ "fileLogLevel": "banana" }"#,
        )
        .unwrap();
        let result = quick_read_file_log_level(dir.path());
        assert_eq!(result, Some(Some(LevelFilter::TRACE)));
    }

    #[test]
    fn compress_old_logs_compresses_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path();

        let old_file = log_dir.join("vibetree-serve.2020-01-01.log");
        std::fs::write(&old_file, "old log content").unwrap();

        let mtime =
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(86400 * 18262);
        filetime::set_file_mtime(&old_file, filetime::FileTime::from_system_time(mtime))
            .unwrap_or_default();

        compress_old_logs(log_dir, "vibetree-serve");

        assert!(!old_file.exists(), "original .log file should be deleted");
        let gz_file = log_dir.join("vibetree-serve.2020-01-01.log.gz");
        assert!(gz_file.exists(), ".log.gz file should be created");

        let gz_data = std::fs::read(&gz_file).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&gz_data[..]);
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, "old log content");
    }

    #[test]
    fn compress_old_logs_skips_other_commands() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path();

        let other_file = log_dir.join("vibetree-build.2020-01-01.log");
        std::fs::write(&other_file, "build log").unwrap();

        let mtime =
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(86400 * 18262);
        filetime::set_file_mtime(&other_file, filetime::FileTime::from_system_time(mtime))
            .unwrap_or_default();

        compress_old_logs(log_dir, "vibetree-serve");

        assert!(
            other_file.exists(),
            "other command's log should NOT be compressed"
        );
    }

    #[test]
    fn compress_old_logs_skips_today() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path();

        let today_file = log_dir.join("vibetree-serve.today.log");
        std::fs::write(&today_file, "today's log").unwrap();

        compress_old_logs(log_dir, "vibetree-serve");

        assert!(today_file.exists(), "today's log should NOT be compressed");
    }
}
