// Logging module, powered by tracing-subscriber
//
// The library crates log through the `log` facade; `tracing_log::LogTracer`
// routes those records into the subscriber installed here.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::Path;

use idtable_configs::LoggingSettings;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact text format: timestamp LEVEL target - message
    Compact,
    /// JSON Lines format for structured logging
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" | "jsonl" => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Filter directives: the base level, quiet third-party crates, then the
/// per-target overrides from config.
pub fn filter_directives(level: &str, target_levels: Option<&HashMap<String, String>>) -> String {
    let mut directives = vec![level.to_string()];

    let noisy: &[(&str, &str)] = &[("rocksdb", "warn"), ("tracing", "warn")];
    for (target, lvl) in noisy {
        directives.push(format!("{}={}", target, lvl));
    }

    if let Some(map) = target_levels {
        let mut targets: Vec<_> = map.iter().collect();
        targets.sort();
        for (target, lvl) in targets {
            directives.push(format!("{}={}", target, lvl));
        }
    }

    directives.join(",")
}

fn build_env_filter(
    level: &str,
    target_levels: Option<&HashMap<String, String>>,
) -> anyhow::Result<EnvFilter> {
    let filter_str = filter_directives(level, target_levels);
    EnvFilter::try_new(&filter_str)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{}': {}", filter_str, e))
}

/// Initialize logging based on configuration.
///
/// Sets up `tracing-subscriber` with:
///  - a console layer on stderr (when `log_to_console` is true), so command
///    output on stdout stays clean
///  - a file layer (compact text or JSON lines) when `file_path` is set
///  - the `tracing_log::LogTracer` bridge for `log::*` calls
pub fn init_logging(settings: &LoggingSettings, level_override: Option<&str>) -> anyhow::Result<()> {
    let level = level_override.unwrap_or(&settings.level);
    let targets = Some(&settings.targets);
    let log_format = LogFormat::parse(&settings.format);

    let console_layer = if settings.log_to_console {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_filter(build_env_filter(level, targets)?),
        )
    } else {
        None
    };

    let file_layer = if settings.file_path.is_empty() {
        None
    } else {
        if let Some(parent) = Path::new(&settings.file_path).parent() {
            fs::create_dir_all(parent)?;
        }
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.file_path)?;

        let layer = if log_format == LogFormat::Json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(log_file)
                .with_target(true)
                .with_thread_names(true)
                .with_filter(build_env_filter(level, targets)?)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(log_file)
                .with_target(true)
                .with_thread_names(true)
                .with_filter(build_env_filter(level, targets)?)
                .boxed()
        };
        Some(layer)
    };

    let subscriber = tracing_subscriber::registry().with(console_layer).with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;
    tracing_log::LogTracer::init()
        .map_err(|e| anyhow::anyhow!("Failed to bridge log records: {}", e))?;

    tracing::trace!(
        "Logging initialized: level={}, console={}, file={}",
        level,
        settings.log_to_console,
        settings.file_path
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("jsonl"), LogFormat::Json);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Compact);
    }

    #[test]
    fn test_filter_directives_order() {
        let mut targets = HashMap::new();
        targets.insert("idtable_store".to_string(), "trace".to_string());
        targets.insert("idtable_identity".to_string(), "debug".to_string());

        let directives = filter_directives("info", Some(&targets));
        assert_eq!(
            directives,
            "info,rocksdb=warn,tracing=warn,idtable_identity=debug,idtable_store=trace"
        );
        assert!(build_env_filter("info", Some(&targets)).is_ok());
    }
}
