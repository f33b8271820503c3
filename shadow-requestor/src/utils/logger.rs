//! Logging configuration using tracing.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Pick the level: the command line wins over the configuration file.
pub fn level<'a>(cli: Option<&'a str>, configured: &'a str) -> &'a str {
    cli.filter(|l| !l.is_empty()).unwrap_or(configured)
}

/// Initialize logging with the specified level.
///
/// `RUST_LOG` takes precedence; an unparsable level falls back to `info`.
/// Calling this twice keeps the first subscriber.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_level_wins() {
        assert_eq!(level(Some("debug"), "warn"), "debug");
        assert_eq!(level(None, "warn"), "warn");
        assert_eq!(level(Some(""), "warn"), "warn");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init("not a level");
        init("debug");
    }
}
