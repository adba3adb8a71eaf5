//! Process and container context used to enrich outgoing events.
//!
//! The sensor consults a [`ProcessCache`] for a stable process identity and
//! container membership, and a [`ContainerLookup`] for container metadata.
//! Population of both is external to the dispatch core; the table-backed
//! implementations here are concurrent stores whose writers live elsewhere.

use std::sync::Arc;

use dashmap::DashMap;

/// Metadata about a known container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub image_id: String,
    pub image_name: String,
}

/// Per-pid process context consumed by event stamping.
pub trait ProcessCache: Send + Sync {
    /// Stable identity for the process, if the cache knows it.
    fn process_id(&self, pid: i32) -> Option<String>;

    /// Id of the container the process runs in, if any.
    fn container_id(&self, pid: i32) -> Option<String>;
}

/// Container metadata lookup keyed by container id.
pub trait ContainerLookup: Send + Sync {
    fn info(&self, container_id: &str) -> Option<ContainerInfo>;
}

#[derive(Debug, Clone, Default)]
struct ProcessEntry {
    process_id: String,
    container_id: Option<String>,
}

/// Concurrent in-memory process cache.
#[derive(Default)]
pub struct TableProcessCache {
    entries: DashMap<i32, ProcessEntry>,
}

impl TableProcessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for a pid.
    pub fn insert(&self, pid: i32, process_id: impl Into<String>, container_id: Option<String>) {
        self.entries.insert(
            pid,
            ProcessEntry {
                process_id: process_id.into(),
                container_id,
            },
        );
    }

    /// Drop the entry for a pid, typically on process exit.
    pub fn remove(&self, pid: i32) {
        self.entries.remove(&pid);
    }
}

impl ProcessCache for TableProcessCache {
    fn process_id(&self, pid: i32) -> Option<String> {
        self.entries.get(&pid).map(|e| e.process_id.clone())
    }

    fn container_id(&self, pid: i32) -> Option<String> {
        self.entries.get(&pid).and_then(|e| e.container_id.clone())
    }
}

/// Concurrent in-memory container metadata store.
#[derive(Default)]
pub struct TableContainerLookup {
    containers: DashMap<String, ContainerInfo>,
}

impl TableContainerLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, container_id: impl Into<String>, info: ContainerInfo) {
        self.containers.insert(container_id.into(), info);
    }

    pub fn remove(&self, container_id: &str) {
        self.containers.remove(container_id);
    }
}

impl ContainerLookup for TableContainerLookup {
    fn info(&self, container_id: &str) -> Option<ContainerInfo> {
        self.containers.get(container_id).map(|e| e.value().clone())
    }
}

/// A cache that knows nothing; events pass through unenriched.
pub struct EmptyProcessCache;

impl ProcessCache for EmptyProcessCache {
    fn process_id(&self, _pid: i32) -> Option<String> {
        None
    }

    fn container_id(&self, _pid: i32) -> Option<String> {
        None
    }
}

impl ContainerLookup for EmptyProcessCache {
    fn info(&self, _container_id: &str) -> Option<ContainerInfo> {
        None
    }
}

/// Shared handle to an empty cache, for setups without enrichment.
pub fn empty() -> Arc<EmptyProcessCache> {
    Arc::new(EmptyProcessCache)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_process_cache() {
        let cache = TableProcessCache::new();
        cache.insert(42, "proc-42", Some("c1".to_string()));
        cache.insert(43, "proc-43", None);

        assert_eq!(cache.process_id(42).as_deref(), Some("proc-42"));
        assert_eq!(cache.container_id(42).as_deref(), Some("c1"));
        assert_eq!(cache.container_id(43), None);
        assert_eq!(cache.process_id(99), None);

        cache.remove(42);
        assert_eq!(cache.process_id(42), None);
    }

    #[test]
    fn test_table_container_lookup() {
        let lookup = TableContainerLookup::new();
        lookup.insert(
            "c1",
            ContainerInfo {
                name: "web".to_string(),
                image_id: "sha256:abc".to_string(),
                image_name: "nginx:latest".to_string(),
            },
        );

        let info = lookup.info("c1").unwrap();
        assert_eq!(info.name, "web");
        assert!(lookup.info("c2").is_none());

        lookup.remove("c1");
        assert!(lookup.info("c1").is_none());
    }

    #[test]
    fn test_empty_cache() {
        let cache = empty();
        assert!(cache.process_id(1).is_none());
        assert!(cache.container_id(1).is_none());
        assert!(cache.info("c").is_none());
    }
}
