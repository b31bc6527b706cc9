//! Namespaced parameter store.
//!
//! Parameters live in a JSON tree addressed by slash-separated paths
//! (`/robot/arm/max_speed`).  The store is an ordinary value: create one,
//! share it behind an `Arc` between the nodes that need it, persist it with
//! [`ParameterStore::save_to_file`].

use std::path::Path;
use std::sync::{PoisonError, RwLock};

use nodebus_types::BusError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Key holding a scalar that was displaced when its path became a namespace.
const DISPLACED_KEY: &str = "_value";

#[derive(Debug, Default)]
pub struct ParameterStore {
    root: RwLock<Map<String, Value>>,
}

fn segments(name: &str) -> Vec<&str> {
    name.split('/').filter(|s| !s.is_empty()).collect()
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`, creating intermediate namespaces as needed.
    ///
    /// # Errors
    ///
    /// [`BusError::Config`] for an empty name, [`BusError::Conversion`] when
    /// `value` cannot be represented as JSON.
    pub fn set<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), BusError> {
        let value = serde_json::to_value(value).map_err(|e| BusError::Conversion(e.to_string()))?;
        let parts = segments(name);
        let Some((leaf, parents)) = parts.split_last() else {
            return Err(BusError::Config(format!("invalid parameter name: {name:?}")));
        };

        let mut root = self.root.write().unwrap_or_else(PoisonError::into_inner);
        let mut current = &mut *root;
        for part in parents {
            let slot = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                let displaced = slot.take();
                let mut namespace = Map::new();
                namespace.insert(DISPLACED_KEY.to_string(), displaced);
                *slot = Value::Object(namespace);
            }
            current = match slot {
                Value::Object(next) => next,
                _ => return Err(BusError::Config(format!("cannot nest under {part:?}"))),
            };
        }
        current.insert(leaf.to_string(), value);
        debug!(param = name, "set parameter");
        Ok(())
    }

    /// Raw value at `name`.  Namespaces are returned as objects.
    pub fn get_value(&self, name: &str) -> Option<Value> {
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        let parts = segments(name);
        if parts.is_empty() {
            return Some(Value::Object(root.clone()));
        }
        let mut current = &*root;
        let (leaf, parents) = parts.split_last()?;
        for part in parents {
            current = current.get(*part)?.as_object()?;
        }
        current.get(*leaf).cloned()
    }

    /// Typed value at `name`, or `None` when absent.
    ///
    /// # Errors
    ///
    /// [`BusError::Conversion`] when the stored value does not match `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, BusError> {
        self.get_value(name)
            .map(|v| serde_json::from_value(v).map_err(|e| BusError::Conversion(format!("{name}: {e}"))))
            .transpose()
    }

    /// Typed value at `name`, or `default` when absent or mistyped.
    pub fn get_or<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        self.get(name).ok().flatten().unwrap_or(default)
    }

    pub fn has(&self, name: &str) -> bool {
        !segments(name).is_empty() && self.get_value(name).is_some()
    }

    /// Delete `name`, pruning namespaces left empty.  Returns whether
    /// anything was removed.
    pub fn delete(&self, name: &str) -> bool {
        let parts = segments(name);
        if parts.is_empty() {
            return false;
        }
        let mut root = self.root.write().unwrap_or_else(PoisonError::into_inner);
        let removed = remove_path(&mut root, &parts);
        if removed {
            debug!(param = name, "deleted parameter");
        }
        removed
    }

    /// Every leaf parameter as an absolute path, sorted.
    pub fn names(&self) -> Vec<String> {
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        let mut names = Vec::new();
        collect_names(&root, "", &mut names);
        names.sort();
        names
    }

    /// Merge the top-level entries of a JSON file into the store.
    ///
    /// # Errors
    ///
    /// [`BusError::Config`] when the file cannot be read or is not a JSON
    /// object.
    pub fn load_from_file(&self, path: &Path) -> Result<(), BusError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BusError::Config(format!("cannot read {}: {e}", path.display())))?;
        let loaded: Map<String, Value> = serde_json::from_str(&raw)
            .map_err(|e| BusError::Config(format!("cannot parse {}: {e}", path.display())))?;
        let count = loaded.len();
        self.root
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(loaded);
        info!(path = %path.display(), entries = count, "loaded parameters");
        Ok(())
    }

    /// Write the whole tree as pretty-printed JSON, creating parent
    /// directories as needed.
    pub fn save_to_file(&self, path: &Path) -> Result<(), BusError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BusError::Config(format!("cannot create {}: {e}", parent.display())))?;
        }
        let rendered = {
            let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string_pretty(&*root).map_err(|e| BusError::Config(e.to_string()))?
        };
        std::fs::write(path, rendered)
            .map_err(|e| BusError::Config(format!("cannot write {}: {e}", path.display())))?;
        info!(path = %path.display(), "saved parameters");
        Ok(())
    }
}

fn remove_path(map: &mut Map<String, Value>, parts: &[&str]) -> bool {
    match parts {
        [] => false,
        [leaf] => map.remove(*leaf).is_some(),
        [head, rest @ ..] => {
            let Some(Value::Object(child)) = map.get_mut(*head) else {
                return false;
            };
            let removed = remove_path(child, rest);
            if removed && child.is_empty() {
                map.remove(*head);
            }
            removed
        }
    }
}

fn collect_names(map: &Map<String, Value>, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in map {
        let path = format!("{prefix}/{key}");
        match value {
            Value::Object(child) if !child.is_empty() => collect_names(child, &path, out),
            _ => out.push(path),
        }
    }
}
