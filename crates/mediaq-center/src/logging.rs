//! Logging setup.
//!
//! [`TaskLogger`] writes per-task entries and is shared with the scheduler.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use mediaq_queue::TaskLogger;

/// Install the global tracing subscriber: colored output for dev, JSON when
/// `LOG_FORMAT=json`. `RUST_LOG` directives are honoured on top of
/// `mediaq=info`.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing() -> bool {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let mut env_filter = EnvFilter::from_default_env();
    for directive in ["mediaq=info", "rusqlite=warn"] {
        if let Ok(directive) = directive.parse() {
            env_filter = env_filter.add_directive(directive);
        }
    }

    let installed = if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .try_init()
    };
    installed.is_ok()
}
