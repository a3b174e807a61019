use std::fs::{self, OpenOptions};
use std::io::Write;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Diagnostics go to stderr; stdout is reserved for macro output.
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

/* --- Echo log -------------------------------------------------------- */
fn output_log_enabled() -> bool {
    std::env::var("PCRAFT_OUTPUT_LOG")
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

/// Append one line to `logs/run_latest.log` when `PCRAFT_OUTPUT_LOG` is on.
pub fn append_output_log(line: &str) {
    if !output_log_enabled() {
        return;
    }
    let _ = fs::create_dir_all("logs");
    if let Ok(mut file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open("logs/run_latest.log")
    {
        let _ = writeln!(file, "{line}");
    }
}
