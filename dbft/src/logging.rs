use std::env;
use std::sync::Once;

use tracing_subscriber::EnvFilter;

static LOG_INIT: Once = Once::new();

/// Install the global `tracing` subscriber.
///
/// Filtering follows `RUST_LOG` (default `info`). Set `RUST_LOG_FORMAT=json`
/// for JSON lines, `NO_COLOR` to disable ANSI colours. Calling this more than
/// once has no effect.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let result = if json_format() {
            builder.json().try_init()
        } else {
            builder.with_ansi(use_color()).try_init()
        };
        if let Err(err) = result {
            eprintln!("logging already initialised: {err}")
        }
    });
}

fn json_format() -> bool {
    env::var("RUST_LOG_FORMAT").is_ok_and(|f| f == "json")
}

fn use_color() -> bool {
    env::var("NO_COLOR").map(|v| v.is_empty()).unwrap_or(true)
}
