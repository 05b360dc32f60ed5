use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Filter directives used when `RUST_LOG` is unset.
pub fn default_directives(level: &str) -> String {
    format!(
        "{level},rookery_session={level},rookery_xmpp={level},rookery_storage={}",
        quieter(level)
    )
}

fn quieter(level: &str) -> &'static str {
    match level {
        "trace" => "debug",
        "debug" => "info",
        "info" => "warn",
        _ => "error",
    }
}

pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)))
}

/// Install the process-wide subscriber. Front ends call this once at startup;
/// library crates never do.
pub fn init(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(fmt_layer)
        .try_init()?;

    tracing::info!(level = %config.level, "Logging initialized");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_quiet_the_store() {
        assert_eq!(
            default_directives("debug"),
            "debug,rookery_session=debug,rookery_xmpp=debug,rookery_storage=info"
        );
        assert!(default_directives("error").ends_with("rookery_storage=error"));
    }

    #[test]
    fn every_valid_level_builds_a_filter() {
        for level in crate::config::VALID_LOG_LEVELS {
            let directives = default_directives(level);
            assert!(directives.parse::<EnvFilter>().is_ok(), "{directives}");
        }
    }
}
