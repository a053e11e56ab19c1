//! Tracing setup for embedding applications.

use tracing_subscriber::EnvFilter;

/// Install a default subscriber for applications that have not set one up.
///
/// `RUST_LOG` takes precedence when set. Otherwise the filter enables this
/// crate's events at the level named by `CORRAL_LOG` (info when unset), so
/// the per-take debug chatter stays off until asked for. Does nothing if a
/// global subscriber is already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CORRAL_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("corral={level}"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
