//! Tracing subscriber setup from [`LoggingConfig`].

use tracing_subscriber::EnvFilter;

use tutor_relay_core::config::LoggingConfig;

/// Build the filter directive string: `--verbose` forces debug, otherwise the
/// configured level (default info), followed by per-crate filters.
pub fn filter_directives(config: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        config.level.as_deref().unwrap_or("info")
    };

    std::iter::once(level)
        .chain(config.filters.iter().map(String::as_str))
        .filter(|d| !d.trim().is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. `RUST_LOG` wins over the config.
pub fn init(config: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config, verbose)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let to_stdout = config.output == "stdout";

    match (config.format.as_str(), to_stdout) {
        ("json", true) => builder.json().with_writer(std::io::stdout).init(),
        ("json", false) => builder.json().with_writer(std::io::stderr).init(),
        (_, true) => builder.with_writer(std::io::stdout).init(),
        (_, false) => builder.with_writer(std::io::stderr).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level_is_info() {
        assert_eq!(filter_directives(&LoggingConfig::default(), false), "info");
    }

    #[test]
    fn test_verbose_overrides_level_and_keeps_filters() {
        let config = LoggingConfig {
            level: Some("warn".into()),
            filters: vec!["tutor_relay_media=trace".into(), " ".into()],
            ..LoggingConfig::default()
        };
        assert_eq!(filter_directives(&config, false), "warn,tutor_relay_media=trace");
        assert_eq!(filter_directives(&config, true), "debug,tutor_relay_media=trace");
    }
}
