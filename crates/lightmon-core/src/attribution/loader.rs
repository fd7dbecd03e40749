//! Bulk indexing of running containers into the container store.

use std::{sync::Arc, time::Duration};

use lightmon_common::containers::{ContainerError, ContainerMetadataReader};

use super::{AttributionCache, DEFAULT_CONTAINER_TTL};

/// Fills the container store from the container runtime metadata.
#[derive(Clone)]
pub struct ContainerLoader {
    reader: ContainerMetadataReader,
    cache: AttributionCache,
    ttl: Duration,
}

impl ContainerLoader {
    pub fn new(reader: ContainerMetadataReader, cache: AttributionCache) -> Self {
        Self {
            reader,
            cache,
            ttl: DEFAULT_CONTAINER_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Reads every running container and indexes it under its init process,
    /// its parent and all the descendants of the parent.
    ///
    /// Keys which still hold a valid entry are left untouched. Returns the
    /// number of containers read.
    pub fn load(&self) -> Result<usize, ContainerError> {
        let records = self.reader.read_all()?;
        let count = records.len();

        for record in records {
            let record = Arc::new(record);
            let descendants = self
                .reader
                .procfs()
                .descendants(record.parent_pid)
                .unwrap_or_else(|err| {
                    lightmon_common::log_error(
                        &format!("Listing descendants of container {}", record.id),
                        err,
                    );
                    Default::default()
                });

            let keys = [record.init_pid, record.parent_pid]
                .into_iter()
                .chain(descendants);
            for pid in keys {
                if !self.cache.contains_container(&pid) {
                    self.cache.put_container(pid, record.clone(), self.ttl);
                }
            }
            log::trace!("loaded container {record}");
        }

        log::debug!("loaded {count} containers");
        Ok(count)
    }
}
