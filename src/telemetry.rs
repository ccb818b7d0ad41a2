//! Tracing initialization for the binary

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` controls the filter (default `info`); setting
/// `VSM_LOG_JSON=1` switches to JSON output for log shippers.
pub fn init_tracing() -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("VSM_LOG_JSON").map(|v| v == "1").unwrap_or(false);

    let result = if json {
        tracing::subscriber::set_global_default(
            fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(false)
                .finish(),
        )
    } else {
        tracing::subscriber::set_global_default(fmt().with_env_filter(filter).finish())
    };

    result.map_err(|e| e.to_string())
}
