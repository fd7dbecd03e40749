//! Background refresh of the container store.

use std::time::Duration;

use tokio::{
    task::{self, JoinHandle},
    time,
};

use super::DEFAULT_REFRESH_INTERVAL;

/// Failures tolerated before the refresh loop gives up.
pub const MAX_REFRESH_FAILURES: usize = 5;

/// Periodically runs a refresh function, like [`super::ContainerLoader::load`].
///
/// A failed refresh is retried right away. Failures are counted over the whole
/// lifetime of the loop, successes don't reset the counter: once it exceeds
/// the maximum the loop stops for good.
#[derive(Debug, Clone)]
pub struct RefreshScheduler {
    interval: Duration,
    max_failures: usize,
}

impl Default for RefreshScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_INTERVAL)
    }
}

impl RefreshScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_failures: MAX_REFRESH_FAILURES,
        }
    }

    pub fn with_max_failures(mut self, max_failures: usize) -> Self {
        self.max_failures = max_failures;
        self
    }

    /// Runs `refresh` until it fails too many times. Returns the number of
    /// times it was called.
    ///
    /// `refresh` reads the filesystem, so every call happens on the blocking
    /// thread pool.
    pub async fn run<F, E>(&self, mut refresh: F) -> usize
    where
        F: FnMut() -> Result<usize, E> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut calls = 0;
        let mut failures = 0;

        loop {
            calls += 1;
            let result = match task::spawn_blocking(move || {
                let result = refresh();
                (refresh, result)
            })
            .await
            {
                Ok((returned, result)) => {
                    refresh = returned;
                    result
                }
                Err(err) => {
                    lightmon_common::log_error("Container refresh panicked", err);
                    return calls;
                }
            };

            match result {
                Ok(count) => {
                    log::trace!("refreshed {count} containers");
                    time::sleep(self.interval).await;
                }
                Err(err) => {
                    failures += 1;
                    lightmon_common::log_error(
                        &format!("Refreshing containers (failure {failures})"),
                        err,
                    );
                    if failures > self.max_failures {
                        log::error!(
                            "container refresh failed {failures} times, stopping background refresh"
                        );
                        return calls;
                    }
                }
            }
        }
    }

    /// Runs the refresh loop in a background task.
    pub fn spawn<F, E>(self, refresh: F) -> JoinHandle<usize>
    where
        F: FnMut() -> Result<usize, E> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        tokio::spawn(async move { self.run(refresh).await })
    }
}
