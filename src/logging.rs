//! Logging setup for the binary
//!
//! Everything logs through the `log` facade; this only installs
//! `env_logger`. `RUST_LOG` always wins over the verbosity flag.

/// Install the global logger
///
/// `verbose` raises the default level from `info` to `debug`. Calling this
/// more than once is harmless; later calls are ignored.
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().default_filter_or(default_level);
    if env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init()
        .is_err()
    {
        log::debug!("Logger already initialised");
    }
}
