//! Tracing setup for the drift binary and tests.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize stderr logging from a verbosity count
/// (0=error, 1=warn, 2=info, 3=debug, 4+=trace). `RUST_LOG` overrides.
pub fn init_logging(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("driftsync={level},drift={level}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(verbosity >= 3)
                .with_line_number(verbosity >= 3),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("init logging: {}", e))?;
    Ok(())
}

/// Best-effort logging init for tests; ignores double-initialization.
pub fn init_test_logging() {
    let _ = init_logging(2);
}
