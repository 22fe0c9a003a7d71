//! Flow storage with file persistence.
//!
//! Flows live in memory for fast access, with optional JSON persistence so
//! the service can reload its library across restarts.

use crate::error::{Result, ServiceError};
use flow_engine::FlowGraph;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Metadata for a stored flow (for listing).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowMetadata {
    pub id: String,
    pub name: String,
    pub block_count: usize,
    pub variable_count: usize,
}

/// In-memory flow store with optional file persistence.
///
/// # Example
///
/// ```ignore
/// use canopy_automation_service::FlowStore;
///
/// let mut store = FlowStore::with_persistence(".canopy/flows");
/// let count = store.load_from_disk()?;
/// log::info!("Loaded {count} flows");
/// store.insert_flow(my_flow)?;
/// ```
#[derive(Debug, Default)]
pub struct FlowStore {
    flows: HashMap<String, FlowGraph>,
    persist_path: Option<PathBuf>,
}

impl FlowStore {
    /// Create a new in-memory store without persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that persists to the given directory.
    ///
    /// The directory is created on first save.
    pub fn with_persistence(path: impl AsRef<Path>) -> Self {
        Self {
            flows: HashMap::new(),
            persist_path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Load all flows from the persistence directory.
    ///
    /// Returns the number of flows loaded. Unparseable files are skipped
    /// with a warning rather than failing the whole load.
    pub fn load_from_disk(&mut self) -> Result<usize> {
        let Some(ref path) = self.persist_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let mut count = 0;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let file_path = entry.path();
            if file_path.extension().map_or(false, |e| e == "json") {
                let content = std::fs::read_to_string(&file_path)?;
                match serde_json::from_str::<FlowGraph>(&content) {
                    Ok(flow) => {
                        log::info!("Loaded flow '{}' from {:?}", flow.id, file_path);
                        self.flows.insert(flow.id.clone(), flow);
                        count += 1;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse flow from {:?}: {}", file_path, e);
                    }
                }
            }
        }
        Ok(count)
    }

    fn save_to_disk(&self, flow: &FlowGraph) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        std::fs::create_dir_all(path)?;
        let file_path = path.join(format!("{}.json", &flow.id));
        let content = serde_json::to_string_pretty(flow)?;
        std::fs::write(&file_path, content)?;
        log::debug!("Saved flow '{}' to {:?}", flow.id, file_path);
        Ok(())
    }

    fn delete_from_disk(&self, id: &str) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        let file_path = path.join(format!("{id}.json"));
        if file_path.exists() {
            std::fs::remove_file(&file_path)?;
            log::debug!("Deleted flow '{}' from {:?}", id, file_path);
        }
        Ok(())
    }

    /// Get a flow by id.
    pub fn get_flow(&self, id: &str) -> Option<&FlowGraph> {
        self.flows.get(id)
    }

    /// Get a flow by id, or a [`ServiceError::FlowNotFound`].
    pub fn require_flow(&self, id: &str) -> Result<&FlowGraph> {
        self.flows
            .get(id)
            .ok_or_else(|| ServiceError::FlowNotFound(id.to_string()))
    }

    /// Insert or update a flow, persisting it if persistence is enabled.
    pub fn insert_flow(&mut self, flow: FlowGraph) -> Result<()> {
        self.save_to_disk(&flow)?;
        self.flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    /// Remove a flow by id. Returns the removed flow if it existed.
    pub fn remove_flow(&mut self, id: &str) -> Result<Option<FlowGraph>> {
        self.delete_from_disk(id)?;
        Ok(self.flows.remove(id))
    }

    /// List all stored flows.
    pub fn list_flows(&self) -> Vec<FlowMetadata> {
        self.flows
            .values()
            .map(|f| FlowMetadata {
                id: f.id.clone(),
                name: f.name.clone(),
                block_count: f.blocks.len(),
                variable_count: f.variables.len(),
            })
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.flows.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_engine::FlowBuilder;
    use tempfile::TempDir;

    fn test_flow(id: &str, name: &str) -> FlowGraph {
        FlowBuilder::new(id, name).start("s", "e").end("e").build()
    }

    #[test]
    fn test_in_memory_store() {
        let mut store = FlowStore::new();
        store.insert_flow(test_flow("f1", "First")).unwrap();

        assert!(store.get_flow("f1").is_some());
        assert!(store.get_flow("nope").is_none());
        assert!(matches!(
            store.require_flow("nope"),
            Err(ServiceError::FlowNotFound(_))
        ));

        let list = store.list_flows();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].block_count, 2);

        let removed = store.remove_flow("f1").unwrap();
        assert!(removed.is_some());
        assert!(!store.contains("f1"));
    }

    #[test]
    fn test_persistent_store() {
        let temp_dir = TempDir::new().unwrap();
        let persist_path = temp_dir.path().join("flows");

        {
            let mut store = FlowStore::with_persistence(&persist_path);
            store.insert_flow(test_flow("persist-1", "Persisted")).unwrap();
        }

        {
            let mut store = FlowStore::with_persistence(&persist_path);
            let count = store.load_from_disk().unwrap();
            assert_eq!(count, 1);
            assert_eq!(store.require_flow("persist-1").unwrap().name, "Persisted");
        }
    }

    #[test]
    fn test_corrupt_file_skipped_on_load() {
        let temp_dir = TempDir::new().unwrap();
        let persist_path = temp_dir.path().join("flows");

        {
            let mut store = FlowStore::with_persistence(&persist_path);
            store.insert_flow(test_flow("good", "Good")).unwrap();
        }
        std::fs::write(persist_path.join("bad.json"), "{not json").unwrap();

        let mut store = FlowStore::with_persistence(&persist_path);
        assert_eq!(store.load_from_disk().unwrap(), 1);
        assert!(store.contains("good"));
    }
}
