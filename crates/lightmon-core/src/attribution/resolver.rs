//! Process to container resolution on top of the attribution cache.

use std::{fmt, time::Duration};

use lightmon_common::{Pid, procfs::ProcFs};

use super::{AttributionCache, DEFAULT_NAME_TTL};

/// Name reported for processes which don't belong to any known container.
pub const UNKNOWN_CONTAINER: &str = "unknown";

/// Result of the attribution of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    Container(String),
    /// No container could be attributed to the process.
    Unknown,
}

impl Attribution {
    pub fn name(&self) -> &str {
        match self {
            Attribution::Container(name) => name,
            Attribution::Unknown => UNKNOWN_CONTAINER,
        }
    }
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the top process of a container is located in the host process tree.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, strum::EnumString, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum ResolveMode {
    /// The process directly parented by host init.
    #[default]
    Docker,
    /// One level below the process directly parented by host init, skipping
    /// the extra shim of orchestrated runtimes.
    K8s,
}

/// Maps process ids to container names.
///
/// Lookups go through the name store first, then the container store, and
/// finally walk `/proc` ancestry to find a root process which is indexed in
/// the container store. Every outcome is memoized in the name store.
#[derive(Clone)]
pub struct AttributionResolver {
    cache: AttributionCache,
    procfs: ProcFs,
    mode: ResolveMode,
    name_ttl: Duration,
    negative_ttl: Option<Duration>,
}

impl AttributionResolver {
    pub fn new(cache: AttributionCache, procfs: ProcFs, mode: ResolveMode) -> Self {
        Self {
            cache,
            procfs,
            mode,
            name_ttl: DEFAULT_NAME_TTL,
            negative_ttl: None,
        }
    }

    /// Lifetime of successful attributions.
    pub fn with_name_ttl(mut self, ttl: Duration) -> Self {
        self.name_ttl = ttl;
        self
    }

    /// Lifetime of failed attributions. By default they never expire.
    pub fn with_negative_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.negative_ttl = ttl;
        self
    }

    #[cfg(test)]
    fn cache(&self) -> &AttributionCache {
        &self.cache
    }

    /// Returns the container `pid` belongs to.
    ///
    /// Never fails: processes which can't be attributed are reported as
    /// [`Attribution::Unknown`].
    pub fn resolve(&self, pid: Pid) -> Attribution {
        // a hit doesn't refresh the entry, unknown ones included
        if let Some(attribution) = self.cache.get_name(&pid) {
            return attribution;
        }

        if let Some(record) = self.cache.get_container(&pid) {
            return self.remember(pid, record.name.clone());
        }

        if let Some(root) = self.root_of(pid) {
            if let Some(record) = self.cache.get_container(&root) {
                log::debug!("process {pid} attributed to {} through {root}", record.name);
                return self.remember(pid, record.name.clone());
            }
        }

        self.cache
            .put_name(pid, Attribution::Unknown, self.negative_ttl);
        Attribution::Unknown
    }

    fn remember(&self, pid: Pid, name: String) -> Attribution {
        let attribution = Attribution::Container(name);
        self.cache
            .put_name(pid, attribution.clone(), Some(self.name_ttl));
        attribution
    }

    fn root_of(&self, pid: Pid) -> Option<Pid> {
        let root = match self.mode {
            ResolveMode::Docker => self.procfs.root_ancestor(pid),
            ResolveMode::K8s => self.procfs.root_prev_ancestor(pid),
        };
        root.map_err(|err| {
            lightmon_common::log_warning(&format!("Finding root ancestor of {pid}"), err)
        })
        .ok()
    }
}
