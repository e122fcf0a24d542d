//! Tracing setup for hosts embedding the coordination layer.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Filter resolution order: `RUST_LOG` when set, `default_filter`
/// otherwise. With `log_json` the subscriber emits structured JSON lines
/// instead of the human-readable format.
///
/// Returns whether this call installed the subscriber, so hosts and test
/// binaries that may already carry one can call it unconditionally.
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log_json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_refused() {
        assert!(init_tracing("buzzroom_core=debug", false));
        assert!(!init_tracing("buzzroom_core=debug", true));
    }
}
