use std::collections::HashMap;
use std::fs;
use std::path::Path;

use glob::glob;
use serde::de::DeserializeOwned;

use crate::error::{CostViewError, Result};
use crate::views::{BusinessMapping, CostView};

/// Read access to saved views and business mappings. Persistence lives
/// elsewhere; the engine only reads definitions for one request.
pub trait ViewStore: Send + Sync {
    fn view(&self, id: &str) -> Option<CostView>;
    fn business_mapping(&self, id: &str) -> Option<BusinessMapping>;
}

/// In-memory store, optionally loaded from a directory of YAML files:
///
/// ```text
/// root/
///   views/*.yml       one CostView per file
///   mappings/*.yml    one BusinessMapping per file
/// ```
#[derive(Debug, Default, Clone)]
pub struct ViewRegistry {
    pub views: HashMap<String, CostView>,
    pub mappings: HashMap<String, BusinessMapping>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(views: Vec<CostView>, mappings: Vec<BusinessMapping>) -> Self {
        let mut registry = ViewRegistry::new();
        for view in views {
            registry.insert_view(view);
        }
        for mapping in mappings {
            registry.insert_mapping(mapping);
        }
        registry
    }

    pub fn insert_view(&mut self, view: CostView) {
        self.views.insert(view.id.clone(), view);
    }

    pub fn insert_mapping(&mut self, mapping: BusinessMapping) {
        self.mappings.insert(mapping.id.clone(), mapping);
    }

    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(CostViewError::Config(format!(
                "view directory not found: {}",
                root.display()
            )));
        }
        let mut registry = ViewRegistry::new();
        for view in load_yaml_dir::<CostView>(&root.join("views"))? {
            registry.insert_view(view);
        }
        for mapping in load_yaml_dir::<BusinessMapping>(&root.join("mappings"))? {
            registry.insert_mapping(mapping);
        }
        tracing::info!(
            root = %root.display(),
            views = registry.views.len(),
            mappings = registry.mappings.len(),
            "loaded view registry"
        );
        Ok(registry)
    }
}

/// Parse every `*.yml`/`*.yaml` file in `dir`, sorted by path. A missing
/// directory yields nothing.
fn load_yaml_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    if !dir.exists() {
        tracing::debug!(dir = %dir.display(), "skipping missing directory");
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for ext in ["yml", "yaml"] {
        let pattern = format!("{}/*.{ext}", dir.display());
        paths.extend(
            glob(&pattern)
                .map_err(|e| CostViewError::Other(e.into()))?
                .flatten(),
        );
    }
    paths.sort();
    paths
        .iter()
        .map(|path| {
            let contents = fs::read_to_string(path)?;
            serde_yaml::from_str(&contents).map_err(|e| {
                CostViewError::Config(format!("failed to parse {}: {e}", path.display()))
            })
        })
        .collect()
}

impl ViewStore for ViewRegistry {
    fn view(&self, id: &str) -> Option<CostView> {
        self.views.get(id).cloned()
    }

    fn business_mapping(&self, id: &str) -> Option<BusinessMapping> {
        self.mappings.get(id).cloned()
    }
}
