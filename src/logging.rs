//! Log setup for the relay and peer binaries

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogFormat;

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber for `format`. `RUST_LOG` overrides `default_level`.
pub fn init(default_level: &str, format: LogFormat) {
    match format {
        LogFormat::Text => init_log(default_level),
        LogFormat::Json => init_json_log(default_level),
    }
}

/// Human-readable logs.
pub fn init_log(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_line_number(true)
        .init();
}

/// JSON logs, one object per line.
pub fn init_json_log(default_level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(json_layer(std::io::stdout))
        .init();
}

fn json_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .with_writer(writer)
        .with_target(true)
        .with_line_number(true)
        .with_current_span(true)
        .with_span_list(false)
}


#[cfg(test)]
mod tests {
    use super::capture::{subscriber, LogBuffer};
    use super::json_layer;
    use tracing::{info_span, warn};
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_capture_keeps_span_fields() {
        let logs = LogBuffer::default();

        tracing::subscriber::with_default(subscriber(&logs), || {
            let span = info_span!("negotiator", session = 3);
            let _enter = span.enter();
            warn!(event = "chat", "Ignoring unrecognized envelope");
        });

        let contents = logs.contents();
        assert!(contents.contains("WARN"));
        assert!(contents.contains("session=3"));
        assert!(contents.contains("Ignoring unrecognized envelope"));
    }

    #[test]
    fn test_json_lines_carry_current_span() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::registry().with(json_layer(logs.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = info_span!("negotiator", session = 3);
            let _enter = span.enter();
            warn!(event = "chat", "Ignoring unrecognized envelope");
        });

        let contents = logs.contents();
        let line: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(line["level"], "WARN");
        assert_eq!(line["fields"]["message"], "Ignoring unrecognized envelope");
        assert_eq!(line["fields"]["event"], "chat");
        assert_eq!(line["span"]["name"], "negotiator");
        assert_eq!(line["span"]["session"], 3);
    }
}
