use tracing_subscriber::{fmt, EnvFilter};

/// Output flavour for [`init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Parse the config spelling; anything other than `json` is pretty.
    pub fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Initialize logging in the requested format.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) {
    match format {
        LogFormat::Pretty => init_logging(service_name, default_level),
        LogFormat::Json => init_logging_json(service_name, default_level),
    }
}

/// Human-readable logs on stderr. `RUST_LOG` wins over `default_level`
/// (a directive string such as `"relay_engine=debug,warn"`). Only the first
/// call installs a subscriber.
pub fn init_logging(service_name: &str, default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    tracing::debug!(service = service_name, "logging initialised (human-readable)");
}

/// One JSON object per event, with file and line, for log shippers.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    tracing::debug!(service = service_name, "logging initialised (json)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_logging("relay-test", "debug");
        init_logging("relay-test", "debug");
        init_logging_json("relay-test", "info");
    }

    #[test]
    fn format_from_config() {
        assert_eq!(LogFormat::from_config("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_config("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_config(""), LogFormat::Pretty);
    }
}
