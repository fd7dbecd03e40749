//! Lightmon monitors outbound TCP connections on a host and attributes each
//! one to the container that made it.
//!
//! A `sys_enter_connect` tracepoint [probe] reports every connect attempt. Each
//! sample goes through the [pipeline]: it is enriched with the process path,
//! arguments and user, attributed to a container by the
//! [resolver](lightmon_core::attribution::AttributionResolver), filtered by the
//! exclusion rules and finally printed by an [output sink](output_sinks).
//!
//! ```sh
//! # Run the daemon, printing a table on the console
//! lightmon -f table --exclude "dport=53"
//!
//! # List the running containers
//! lightmon containers
//! ```
//!
//! Container attribution reads Docker's runtime and data directories. The
//! mapping between processes and containers is refreshed in background every
//! few seconds, see [`lightmon_core::attribution`].

pub mod cli;
pub mod config;
pub mod daemon;
pub mod pipeline;
pub mod probe;
pub mod term_print;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger. We log from info level and above.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: log::LevelFilter) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        env_logger::builder().filter_level(override_log_level).init();
    }
}
