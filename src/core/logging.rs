//! Logging setup on top of env_logger
//!
//! `RUST_LOG` always wins over the filter passed in, e.g.
//! `RUST_LOG=tilestream::residency=trace` prints every tile map and unmap.

/// Initialize logging with the default `info` filter
pub fn init() {
    init_with_filter("info");
}

/// Initialize logging with `filter` unless `RUST_LOG` is set.
/// Returns false if a logger was already installed.
pub fn init_with_filter(filter: &str) -> bool {
    let installed = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp_millis()
        .try_init()
        .is_ok();
    if !installed {
        log::debug!("Logger already initialized, keeping it");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        init_with_filter("warn");
        assert!(!init_with_filter("trace"));
    }
}
