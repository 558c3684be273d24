use eyre::{Result, WrapErr, eyre};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter(default_level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_level)
            .wrap_err_with(|| format!("Invalid log level: {default_level}")),
    }
}

/// Structured JSON logging; `RUST_LOG` overrides `default_level`.
pub fn init_tracing(default_level: &str) -> Result<()> {
    Registry::default()
        .with(env_filter(default_level)?)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {e}"))?;

    tracing::info!("Switchyard structured logging initialized");
    Ok(())
}

/// Human readable logging for local runs.
pub fn init_console_tracing(default_level: &str) -> Result<()> {
    Registry::default()
        .with(env_filter(default_level)?)
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {e}"))?;

    tracing::info!("Switchyard console logging initialized");
    Ok(())
}

/// Span wrapping one inbound request.
pub fn request_span(method: &str, path: &str, client_ip: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        client.ip = client_ip,
        http.status_code = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        // only consulted when RUST_LOG is unset
        if std::env::var("RUST_LOG").is_err() {
            assert!(env_filter("switchyard=notalevel").is_err());
        }
    }

    #[test]
    fn test_second_init_fails_instead_of_panicking() {
        let first = init_tracing("debug");
        let second = init_console_tracing("debug");
        assert!(first.is_err() || second.is_err());
    }

    #[test]
    fn test_request_span() {
        let span = request_span("GET", "/svc/path", "127.0.0.1");
        // disabled spans carry no metadata when no subscriber is set
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "request");
        }
    }
}
