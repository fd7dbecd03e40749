pub mod containers;
pub mod procfs;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// Utility function to pretty print an error with its sources.
///
/// We use this because by default Rust won't print the source of an error message,
/// making it much less useful. Instead of re-implementing that, we'll just use
/// anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

/// Same as [`log_error`], at warning level. Used where a failure is expected
/// during normal operation, like a process exiting while we inspect it.
pub fn log_warning<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::warn!("{}: {:#}", msg, anyhow::Error::from(err));
}

pub use nix::unistd::Pid;
