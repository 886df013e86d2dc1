//! Tracing subscriber setup for the binary.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the log filter.
///
/// `RUST_LOG` wins when set. Otherwise `PDFSERVE_LOG` picks the level for this
/// crate (`debug`, `warn`, `error`; anything else means `info`).
pub fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(filter_directive(std::env::var("PDFSERVE_LOG").ok().as_deref()))
}

fn filter_directive(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("warn,pdfserve={level}")
}

/// Install the global subscriber, writing to stderr.
///
/// `LOG_FORMAT=json` switches to one JSON object per line. Calling this twice
/// is harmless; the second call is ignored.
pub fn init_tracing() {
    let filter = env_filter();
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
